//! # Context：进程级通信域
//!
//! ## 核心意图（Why）
//! - 一个进程在一个通信域内只需要一个上下文：它持有后端运行时、全部 worker、令牌表与未退役请求计数；
//! - 调用方以值的方式持有上下文，不存在任何进程级全局注册表。
//!
//! ## 架构定位（Where）
//! - 上游：部署方提供 [`Domain`] 与 [`BackendFactory`]；
//! - 下游：线程凭 [`ThreadToken`] 换取 [`Communicator`]，通信器产出的 Future 借用上下文中的 worker。
//!
//! ## 行为契约（What）
//! - `create` 按“最弱充分”原则计算线程模式并初始化后端，失败返回 [`CommError::BackendInit`]；
//! - 令牌、通信器与 Future 的生命周期都借用自上下文，编译期保证上下文最后析构；
//! - 析构时仍有未退役请求属于编程错误：调试构建断言失败，发布构建记录 `error!` 日志。
//!
//! ## 风险提示（Trade-offs）
//! - `PerThread` 模式下令牌 `i` 连接对端的第 `i` 个 worker，要求各 rank 声明相同的线程数。

use std::sync::Arc;
use std::thread;

use spark_p2p_transport::{
    BackendFactory, BackendKind, CancelCapability, Domain, InitRequest, Rank, ThreadMode,
    TransportBackend, TransportError,
};
use tracing::{error, info};

use crate::communicator::Communicator;
use crate::config::{ContextConfig, WorkerMode};
use crate::error::CommError;
use crate::future::Outstanding;
use crate::token::{ThreadBarrier, ThreadToken, TokenRegistry};
use crate::worker::Worker;

/// 线程模式规划结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadPlan {
    /// 向后端初始化请求的线程模式。
    pub backend_mode: ThreadMode,
    /// 每个 worker 的线程模式。
    pub worker_mode: ThreadMode,
    /// 需要创建的 worker 数。
    pub worker_count: usize,
}

impl ThreadPlan {
    /// 计算最弱充分的线程模式。
    ///
    /// # 教案式说明
    /// - **契约 (What)**：
    ///   - 单线程：全部 `Single`；
    ///   - 消息传递式后端且多线程：全部 `Multi`（该后端每个上下文只有一个引擎，各线程并发进入）；
    ///   - `Shared` 多线程：`Serialized`，由 worker 内部互斥锁串行化；
    ///   - `PerThread` 多线程：每个 worker `Single`，后端整体 `Multi`；
    /// - **风险 (Trade-offs)**：从不请求强于所需的模式，避免在后端内部付出无谓的加锁成本。
    pub fn for_threads(kind: BackendKind, worker_mode: WorkerMode, thread_count: usize) -> Self {
        let worker_count = match worker_mode {
            WorkerMode::Shared => 1,
            WorkerMode::PerThread => thread_count.max(1),
        };
        let (backend_mode, worker_mode) = if thread_count <= 1 {
            (ThreadMode::Single, ThreadMode::Single)
        } else if kind == BackendKind::MessagePassing {
            (ThreadMode::Multi, ThreadMode::Multi)
        } else if worker_mode == WorkerMode::Shared {
            (ThreadMode::Serialized, ThreadMode::Serialized)
        } else {
            (ThreadMode::Multi, ThreadMode::Single)
        };
        Self {
            backend_mode,
            worker_mode,
            worker_count,
        }
    }
}

/// 进程级通信上下文。
pub struct Context {
    domain: Domain,
    config: ContextConfig,
    thread_count: usize,
    plan: ThreadPlan,
    // worker 必须先于后端析构
    workers: Vec<Worker>,
    backend: Box<dyn TransportBackend>,
    tokens: TokenRegistry,
    barrier: ThreadBarrier,
    outstanding: Arc<Outstanding>,
}

impl Context {
    /// 以默认配置创建上下文。
    pub fn create(
        domain: &Domain,
        thread_count: usize,
        factory: &dyn BackendFactory,
    ) -> Result<Self, CommError> {
        Self::create_with_config(domain, thread_count, factory, ContextConfig::default())
    }

    /// 创建上下文。
    ///
    /// # 教案式说明
    /// - **意图 (Why)**：一次性完成域复制、后端初始化、worker 创建与地址发布，之后的收发路径不再需要初始化；
    /// - **契约 (What)**：
    ///   - `thread_count` 至少为 1，否则返回 [`CommError::InvalidConfig`]；
    ///   - 后端不支持所需线程模式时返回 [`CommError::BackendInit`]；
    ///   - 成功后所有 worker 地址已发布，对端可以立即建连；
    /// - **逻辑 (How)**：先复制域，使上下文独立于调用方对原域的后续使用；再按 [`ThreadPlan`] 初始化后端。
    pub fn create_with_config(
        domain: &Domain,
        thread_count: usize,
        factory: &dyn BackendFactory,
        config: ContextConfig,
    ) -> Result<Self, CommError> {
        if thread_count == 0 {
            return Err(CommError::InvalidConfig(
                "a context needs at least one thread".to_owned(),
            ));
        }
        let domain = domain.duplicate();
        let plan = ThreadPlan::for_threads(factory.kind(), config.worker_mode, thread_count);
        let estimated_peers = match config.estimated_peers {
            0 => domain.size() as usize,
            hint => hint,
        };
        let backend = factory
            .init(
                &domain,
                &InitRequest {
                    thread_count,
                    worker_count: plan.worker_count,
                    thread_mode: plan.backend_mode,
                    estimated_peers,
                },
            )
            .map_err(CommError::BackendInit)?;
        if backend.max_thread_mode() < plan.backend_mode {
            return Err(CommError::BackendInit(
                TransportError::ThreadModeUnsupported {
                    requested: plan.backend_mode,
                    supported: backend.max_thread_mode(),
                },
            ));
        }

        let outstanding = Arc::new(Outstanding::default());
        let workers = (0..plan.worker_count)
            .map(|index| {
                let engine = backend
                    .create_worker(plan.worker_mode)
                    .map_err(CommError::BackendInit)?;
                Worker::new(
                    index,
                    &domain,
                    engine,
                    plan.worker_mode,
                    Arc::clone(&outstanding),
                    config.spin_yield_interval,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            rank = domain.rank(),
            size = domain.size(),
            threads = thread_count,
            backend = %backend.kind(),
            worker_mode = ?config.worker_mode,
            mode = %plan.backend_mode,
            workers = workers.len(),
            "context created"
        );
        Ok(Self {
            domain,
            config,
            thread_count,
            plan,
            workers,
            backend,
            tokens: TokenRegistry::new(thread_count),
            barrier: ThreadBarrier::new(thread_count),
            outstanding,
        })
    }

    pub fn rank(&self) -> Rank {
        self.domain.rank()
    }

    pub fn size(&self) -> u32 {
        self.domain.size()
    }

    /// 创建时声明的线程数。
    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn thread_plan(&self) -> ThreadPlan {
        self.plan
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn capabilities(&self) -> CancelCapability {
        self.backend.capabilities()
    }

    /// 第 `index` 个 worker。
    pub fn worker(&self, index: usize) -> Option<&Worker> {
        self.workers.get(index)
    }

    /// 为调用线程分配令牌。
    pub fn get_token(&self) -> Result<ThreadToken<'_>, CommError> {
        self.tokens.acquire()
    }

    /// 当前已发放的令牌数。
    pub fn tokens_in_use(&self) -> usize {
        self.tokens.in_use()
    }

    /// 令牌对应的通信器；廉价，可重复调用。
    pub fn get_communicator(&self, token: &ThreadToken<'_>) -> Communicator<'_> {
        Communicator::new(self.worker_for(token.id()), Some(token.id()))
    }

    /// 程序串行段使用的通信器，绑定第 0 个 worker。
    ///
    /// 与令牌通信器并发使用同一 worker 时不提供任何线程安全保证。
    pub fn serial_communicator(&self) -> Communicator<'_> {
        Communicator::new(self.worker_for(0), None)
    }

    /// 全域屏障：本地线程先汇合，最后到达者执行跨 rank 屏障后再一并释放。
    pub fn barrier(&self, _token: &ThreadToken<'_>) -> Result<(), CommError> {
        self.barrier.wait(|| self.domain.barrier())
    }

    /// 仅在令牌 0 上执行 `f`。
    pub fn master<R>(&self, token: &ThreadToken<'_>, f: impl FnOnce() -> R) -> Option<R> {
        (token.id() == 0).then(f)
    }

    /// 尚未退役的挂起请求数。
    pub fn outstanding_requests(&self) -> usize {
        self.outstanding.count()
    }

    fn worker_for(&self, token: usize) -> &Worker {
        // workers 至少有一个元素，且 PerThread 模式下数量等于线程数
        &self.workers[token.min(self.workers.len() - 1)]
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        let pending = self.outstanding.count();
        if pending > 0 {
            error!(
                rank = self.domain.rank(),
                pending, "context dropped with outstanding requests"
            );
            if !thread::panicking() {
                debug_assert_eq!(pending, 0, "context dropped with outstanding requests");
            }
        }
        info!(rank = self.domain.rank(), "context released");
    }
}

impl core::fmt::Debug for Context {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Context")
            .field("domain", &self.domain)
            .field("threads", &self.thread_count)
            .field("plan", &self.plan)
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weakest_sufficient_thread_mode() {
        let single = ThreadPlan::for_threads(BackendKind::RdmaTag, WorkerMode::Shared, 1);
        assert_eq!(single.backend_mode, ThreadMode::Single);
        assert_eq!(single.worker_count, 1);

        let shared = ThreadPlan::for_threads(BackendKind::RdmaTag, WorkerMode::Shared, 4);
        assert_eq!(shared.backend_mode, ThreadMode::Serialized);
        assert_eq!(shared.worker_mode, ThreadMode::Serialized);

        let per_thread = ThreadPlan::for_threads(BackendKind::RdmaTag, WorkerMode::PerThread, 4);
        assert_eq!(per_thread.backend_mode, ThreadMode::Multi);
        assert_eq!(per_thread.worker_mode, ThreadMode::Single);
        assert_eq!(per_thread.worker_count, 4);

        let mp = ThreadPlan::for_threads(BackendKind::MessagePassing, WorkerMode::Shared, 2);
        assert_eq!(mp.backend_mode, ThreadMode::Multi);
    }
}
