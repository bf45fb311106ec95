//! # Worker：进度引擎与端点缓存
//!
//! ## 核心意图（Why）
//! - 一个 worker 独占一个后端进度引擎（或共享引擎的一个视图），以及从它出发能到达的全部对端端点；
//! - 端点按需建立：首次联系某个对端时才经地址交换服务取回其地址并建连，此后 O(1) 命中缓存。
//!
//! ## 行为契约（What）
//! - 地址在 worker 创建时以 `p2p/worker/<index>` 为键发布；
//! - `connect(peer)` 对同一对端至多执行一次地址查询与建连，端点在 worker 生命周期内永不淘汰；
//! - 线程模式为 `Serialized` 时，所有进入引擎的调用都经内部互斥锁串行化。
//!
//! ## 风险提示（Trade-offs）
//! - 缓存未命中时，`DashMap` 分片写锁在地址查询期间一直持有，同分片上的其他建连会短暂阻塞；
//!   这换来了“地址交换恰好一次”的保证。

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::{DashMap, mapref::entry::Entry};
use parking_lot::Mutex;
use spark_p2p_transport::{
    AddressExchange, BackendEndpoint, BackendRequest, BackendWorker, CompletionInfo, Domain,
    MessageBuffer, PostOutcome, Rank, RequestStatus, Tag, ThreadMode, WireMask, WireTag,
    WorkerAddress,
};
use tracing::{debug, trace};

use crate::error::{CommError, PostOp};
use crate::future::{Future, OpMeta, Outstanding};

/// 地址交换服务中 worker 地址的键。
pub fn address_key(index: usize) -> String {
    format!("p2p/worker/{index}")
}

/// 指向某个对端的已缓存端点。
#[derive(Clone)]
pub struct Endpoint {
    peer: Rank,
    address: WorkerAddress,
    handle: Arc<dyn BackendEndpoint>,
}

impl Endpoint {
    pub fn peer(&self) -> Rank {
        self.peer
    }

    /// 建连时使用的对端地址。
    pub fn address(&self) -> &WorkerAddress {
        &self.address
    }

    /// 两个端点是否为同一缓存条目。
    pub fn same_as(&self, other: &Endpoint) -> bool {
        Arc::ptr_eq(&self.handle, &other.handle)
    }
}

impl core::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Endpoint")
            .field("peer", &self.peer)
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// 对端 rank 到端点的缓存。
#[derive(Default)]
pub struct EndpointCache {
    entries: DashMap<Rank, Endpoint>,
}

impl EndpointCache {
    /// 命中时返回缓存端点。
    pub fn get(&self, peer: Rank) -> Option<Endpoint> {
        self.entries.get(&peer).map(|entry| entry.value().clone())
    }

    /// 命中直接返回；未命中时调用 `connect` 建连并插入。
    ///
    /// # 教案式注释
    /// - **契约 (What)**：并发调用同一 `peer` 时 `connect` 只会执行一次；`connect` 失败不会留下条目；
    /// - **逻辑 (How)**：借助 `DashMap::entry` 在分片写锁下完成“检查 + 插入”。
    pub fn get_or_connect(
        &self,
        peer: Rank,
        connect: impl FnOnce() -> Result<Endpoint, CommError>,
    ) -> Result<Endpoint, CommError> {
        match self.entries.entry(peer) {
            Entry::Occupied(occupied) => Ok(occupied.get().clone()),
            Entry::Vacant(vacant) => {
                let endpoint = connect()?;
                vacant.insert(endpoint.clone());
                Ok(endpoint)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// worker 统计量的快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// 已退役（完成）的发送数。
    pub sends: u64,
    /// 已退役（完成）的接收数。
    pub recvs: u64,
    /// 取消成功的操作数。
    pub cancels: u64,
}

#[derive(Default)]
struct StatCounters {
    sends: AtomicU64,
    recvs: AtomicU64,
    cancels: AtomicU64,
}

/// 进度引擎及其端点缓存。
pub struct Worker {
    index: usize,
    rank: Rank,
    size: u32,
    engine: Box<dyn BackendWorker>,
    serial: Option<Mutex<()>>,
    exchange: Arc<dyn AddressExchange>,
    address: WorkerAddress,
    endpoints: EndpointCache,
    stats: StatCounters,
    outstanding: Arc<Outstanding>,
    spin_yield_interval: u32,
}

impl Worker {
    /// 包装后端引擎并发布其地址。
    pub(crate) fn new(
        index: usize,
        domain: &Domain,
        engine: Box<dyn BackendWorker>,
        mode: ThreadMode,
        outstanding: Arc<Outstanding>,
        spin_yield_interval: u32,
    ) -> Result<Self, CommError> {
        let address = engine.address();
        domain
            .exchange()
            .set(domain.rank(), &address_key(index), address.to_bytes())
            .map_err(CommError::Bootstrap)?;
        debug!(rank = domain.rank(), worker = index, mode = %mode, "worker address published");
        Ok(Self {
            index,
            rank: domain.rank(),
            size: domain.size(),
            engine,
            serial: (mode == ThreadMode::Serialized).then(|| Mutex::new(())),
            exchange: Arc::clone(domain.exchange()),
            address,
            endpoints: EndpointCache::default(),
            stats: StatCounters::default(),
            outstanding,
            spin_yield_interval,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// 本引擎可发布的地址。
    pub fn address(&self) -> &WorkerAddress {
        &self.address
    }

    pub fn endpoints(&self) -> &EndpointCache {
        &self.endpoints
    }

    /// 解析对端端点，首次联系时建连。
    pub fn connect(&self, peer: Rank) -> Result<Endpoint, CommError> {
        if peer >= self.size {
            return Err(CommError::RankOutOfRange {
                rank: peer,
                size: self.size,
            });
        }
        if let Some(endpoint) = self.endpoints.get(peer) {
            return Ok(endpoint);
        }
        self.endpoints.get_or_connect(peer, || {
            let raw = self
                .exchange
                .get(peer, &address_key(self.index))
                .map_err(|source| CommError::Connect { peer, source })?;
            let address = WorkerAddress::from(raw);
            let handle = self
                .with_engine(|engine| engine.connect(peer, &address))
                .map_err(|source| CommError::Connect { peer, source })?;
            debug!(rank = self.rank, worker = self.index, peer, "endpoint established");
            Ok(Endpoint {
                peer,
                address,
                handle,
            })
        })
    }

    /// 推进一轮进度。
    pub fn progress(&self) -> usize {
        self.with_engine(|engine| engine.progress())
    }

    /// 统计量快照。
    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            sends: self.stats.sends.load(Ordering::Relaxed),
            recvs: self.stats.recvs.load(Ordering::Relaxed),
            cancels: self.stats.cancels.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn rank(&self) -> Rank {
        self.rank
    }

    pub(crate) fn size(&self) -> u32 {
        self.size
    }

    pub(crate) fn spin_yield_interval(&self) -> u32 {
        self.spin_yield_interval
    }

    pub(crate) fn post_send(
        &self,
        endpoint: &Endpoint,
        buffer: MessageBuffer,
        tag: Tag,
    ) -> Result<Future<'_>, CommError> {
        let meta = OpMeta {
            op: PostOp::Send,
            peer: endpoint.peer,
            tag,
        };
        let wire = WireTag::new(tag, self.rank);
        let len = buffer.len();
        let outcome = self
            .with_engine(|engine| engine.post_send(endpoint.handle.as_ref(), buffer, wire))
            .map_err(|source| CommError::Post {
                op: PostOp::Send,
                peer: endpoint.peer,
                tag,
                source,
            })?;
        trace!(rank = self.rank, dst = endpoint.peer, tag, len, "send posted");
        Ok(match outcome {
            PostOutcome::Completed(buffer) => {
                self.stats.sends.fetch_add(1, Ordering::Relaxed);
                Future::completed(
                    meta,
                    CompletionInfo {
                        wire_tag: wire,
                        len,
                        truncated: false,
                    },
                    buffer,
                )
            }
            PostOutcome::Pending(request) => {
                self.outstanding.register();
                Future::pending(self, meta, request)
            }
        })
    }

    pub(crate) fn post_recv(
        &self,
        buffer: MessageBuffer,
        src: Rank,
        tag: Tag,
    ) -> Result<Future<'_>, CommError> {
        let wire = WireTag::new(tag, src);
        let len = buffer.len();
        let request = self
            .with_engine(|engine| engine.post_recv(buffer, wire, WireMask::EXACT))
            .map_err(|source| CommError::Post {
                op: PostOp::Recv,
                peer: src,
                tag,
                source,
            })?;
        trace!(rank = self.rank, src, tag, len, "recv posted");
        self.outstanding.register();
        Ok(Future::pending(
            self,
            OpMeta {
                op: PostOp::Recv,
                peer: src,
                tag,
            },
            request,
        ))
    }

    /// 推进进度后读取请求状态。
    pub(crate) fn poll(&self, request: &mut dyn BackendRequest) -> RequestStatus {
        self.with_engine(|engine| {
            engine.progress();
            request.test()
        })
    }

    pub(crate) fn cancel(&self, request: &mut dyn BackendRequest) -> bool {
        self.with_engine(|_| request.cancel())
    }

    pub(crate) fn record_retired(&self, op: Option<PostOp>, cancelled: bool) {
        self.outstanding.retire();
        let counter = match (cancelled, op) {
            (true, _) => &self.stats.cancels,
            (false, Some(PostOp::Recv)) => &self.stats.recvs,
            (false, _) => &self.stats.sends,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn with_engine<R>(&self, f: impl FnOnce(&dyn BackendWorker) -> R) -> R {
        let _serial = self.serial.as_ref().map(|lock| lock.lock());
        f(self.engine.as_ref())
    }
}

impl core::fmt::Debug for Worker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Worker")
            .field("index", &self.index)
            .field("rank", &self.rank)
            .field("endpoints", &self.endpoints.len())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
