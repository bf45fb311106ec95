//! # LocalBootstrap：进程内地址交换
//!
//! ## 核心意图（Why）
//! - 以共享内存模拟 PMI 风格的键值服务，让以线程形式运行的多个 rank 互相发现引擎地址；
//!
//! ## 行为契约（What）
//! - `get` 在键未发布时阻塞，直到对应 rank 调用 `set`；
//! - `barrier` 需要全部 `size` 个 rank 到达才释放，可重复使用；
//! - `duplicate` 是集合操作：每个 rank 的句柄各自计数，第 `n` 次复制得到名为 `<父>/<n>` 的命名空间，
//!   因此各 rank 只要按相同顺序复制，就会落到同一个命名空间。
//!
//! ## 风险提示（Trade-offs）
//! - 没有超时：对端永不发布时 `get` 会永久阻塞，与真实 PMI 的行为一致；
//! - 键值永不回收，适用于生命周期与进程相同的部署。

use std::collections::HashMap;
use std::fmt;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use spark_p2p_transport::{AddressExchange, Domain, Rank, TransportError};
use tracing::trace;

const ROOT_NAMESPACE: &str = "world";

#[derive(Default)]
struct BarrierState {
    arrived: u32,
    generation: u64,
}

#[derive(Default)]
struct Store {
    values: DashMap<(Arc<str>, Rank, String), Bytes>,
    publish_lock: Mutex<()>,
    published: Condvar,
    barriers: Mutex<HashMap<Arc<str>, BarrierState>>,
    released: Condvar,
}

/// 单个 rank 持有的地址交换句柄。
pub struct LocalBootstrap {
    size: u32,
    namespace: Arc<str>,
    store: Arc<Store>,
    duplicates: AtomicU64,
}

impl LocalBootstrap {
    /// 为 `size` 个 rank 创建共享同一存储的域身份，下标即 rank。
    pub fn world(size: u32) -> Result<Vec<Domain>, TransportError> {
        let store = Arc::new(Store::default());
        (0..size)
            .map(|rank| {
                let handle = LocalBootstrap {
                    size,
                    namespace: Arc::from(ROOT_NAMESPACE),
                    store: Arc::clone(&store),
                    duplicates: AtomicU64::new(0),
                };
                Domain::new(rank, size, Arc::new(handle))
            })
            .collect()
    }

    /// 本句柄所在的命名空间。
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn check_rank(&self, rank: Rank) -> Result<(), TransportError> {
        if rank < self.size {
            Ok(())
        } else {
            Err(TransportError::InitFailed {
                reason: format!("rank {rank} is outside a domain of size {}", self.size),
            })
        }
    }

    fn key(&self, rank: Rank, key: &str) -> (Arc<str>, Rank, String) {
        (Arc::clone(&self.namespace), rank, key.to_owned())
    }
}

impl AddressExchange for LocalBootstrap {
    fn set(&self, rank: Rank, key: &str, value: Bytes) -> Result<(), TransportError> {
        self.check_rank(rank)?;
        self.store.values.insert(self.key(rank, key), value);
        let _guard = self.store.publish_lock.lock();
        self.store.published.notify_all();
        trace!(namespace = %self.namespace, rank, key, "address published");
        Ok(())
    }

    fn get(&self, peer: Rank, key: &str) -> Result<Bytes, TransportError> {
        self.check_rank(peer)?;
        let lookup = self.key(peer, key);
        loop {
            if let Some(value) = self.store.values.get(&lookup) {
                return Ok(value.value().clone());
            }
            let mut guard = self.store.publish_lock.lock();
            if self.store.values.contains_key(&lookup) {
                continue;
            }
            self.store.published.wait(&mut guard);
        }
    }

    fn barrier(&self, rank: Rank) -> Result<(), TransportError> {
        self.check_rank(rank)?;
        let mut barriers = self.store.barriers.lock();
        let state = barriers.entry(Arc::clone(&self.namespace)).or_default();
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.size {
            state.arrived = 0;
            state.generation += 1;
            self.store.released.notify_all();
            return Ok(());
        }
        while barriers
            .get(&self.namespace)
            .is_some_and(|state| state.generation == generation)
        {
            self.store.released.wait(&mut barriers);
        }
        Ok(())
    }

    fn duplicate(&self) -> Arc<dyn AddressExchange> {
        let index = self.duplicates.fetch_add(1, Ordering::Relaxed);
        Arc::new(LocalBootstrap {
            size: self.size,
            namespace: Arc::from(format!("{}/{index}", self.namespace)),
            store: Arc::clone(&self.store),
            duplicates: AtomicU64::new(0),
        })
    }
}

impl fmt::Debug for LocalBootstrap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalBootstrap")
            .field("size", &self.size)
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}
