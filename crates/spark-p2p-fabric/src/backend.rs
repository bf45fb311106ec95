//! 两种参考后端与它们共享的进程内网络。

use std::fmt;
use std::sync::Arc;

use spark_p2p_transport::{
    BackendFactory, BackendKind, BackendWorker, CancelCapability, Domain, InitRequest, Rank,
    ThreadMode, TransportBackend, TransportError,
};
use tracing::info;

use crate::config::FabricConfig;
use crate::engine::{Engine, FabricWorker, Network, SendProtocol};

/// 进程内模拟网络。
///
/// # 教案式说明
/// - **意图 (Why)**：多个 rank 以线程形式跑在同一进程时，需要一个共享的“线路”承载它们之间的消息；
/// - **契约 (What)**：克隆共享同一网络；同一网络上不同 rank 的引擎可以互相连接；
/// - **逻辑 (How)**：内部只是引擎注册表与配置，真正的队列都在各引擎中。
#[derive(Clone)]
pub struct Fabric {
    network: Arc<Network>,
}

impl Fabric {
    pub fn new(config: FabricConfig) -> Self {
        Self {
            network: Arc::new(Network::new(config)),
        }
    }

    pub fn config(&self) -> &FabricConfig {
        &self.network.config
    }

    /// 指定家族的后端工厂。
    pub fn factory(&self, kind: BackendKind) -> FabricFactory {
        FabricFactory {
            network: Arc::clone(&self.network),
            kind,
        }
    }

    pub fn message_passing(&self) -> FabricFactory {
        self.factory(BackendKind::MessagePassing)
    }

    pub fn rdma_tag(&self) -> FabricFactory {
        self.factory(BackendKind::RdmaTag)
    }

    /// 当前仍存活的引擎数量。
    pub fn live_engines(&self) -> usize {
        self.network.live_engines()
    }
}

impl Default for Fabric {
    fn default() -> Self {
        Self::new(FabricConfig::default())
    }
}

impl fmt::Debug for Fabric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fabric")
            .field("config", &self.network.config)
            .field("live_engines", &self.network.live_engines())
            .finish()
    }
}

/// 模拟网络上的后端工厂。
#[derive(Clone)]
pub struct FabricFactory {
    network: Arc<Network>,
    kind: BackendKind,
}

impl BackendFactory for FabricFactory {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn init(
        &self,
        domain: &Domain,
        request: &InitRequest,
    ) -> Result<Box<dyn TransportBackend>, TransportError> {
        let supported = self.network.config.max_thread_mode;
        if request.thread_mode > supported {
            return Err(TransportError::ThreadModeUnsupported {
                requested: request.thread_mode,
                supported,
            });
        }
        if request.worker_count == 0 {
            return Err(TransportError::InitFailed {
                reason: "at least one worker is required".to_owned(),
            });
        }
        info!(
            rank = domain.rank(),
            size = domain.size(),
            kind = %self.kind,
            mode = %request.thread_mode,
            workers = request.worker_count,
            "fabric backend initialized"
        );
        Ok(match self.kind {
            BackendKind::MessagePassing => Box::new(MessagePassingBackend {
                engine: Engine::spawn(
                    &self.network,
                    domain.rank(),
                    BackendKind::MessagePassing,
                    request.thread_mode,
                ),
                mode: request.thread_mode,
                eager_threshold: self.network.config.eager_threshold,
            }),
            BackendKind::RdmaTag => Box::new(RdmaTagBackend {
                network: Arc::clone(&self.network),
                rank: domain.rank(),
                max_mode: supported,
            }),
        })
    }
}

/// 消息传递式后端：单引擎、eager 小消息、收发均可取消。
pub struct MessagePassingBackend {
    engine: Arc<Engine>,
    mode: ThreadMode,
    eager_threshold: usize,
}

impl TransportBackend for MessagePassingBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::MessagePassing
    }

    fn capabilities(&self) -> CancelCapability {
        CancelCapability {
            recv: true,
            send: true,
        }
    }

    fn max_thread_mode(&self) -> ThreadMode {
        self.mode
    }

    /// 返回共享引擎的新视图，所有视图地址相同。
    fn create_worker(&self, mode: ThreadMode) -> Result<Box<dyn BackendWorker>, TransportError> {
        if mode > self.mode {
            return Err(TransportError::ThreadModeUnsupported {
                requested: mode,
                supported: self.mode,
            });
        }
        Ok(Box::new(FabricWorker::new(
            Arc::clone(&self.engine),
            SendProtocol::Eager {
                threshold: self.eager_threshold,
            },
            true,
        )))
    }
}

/// RDMA 标签匹配式后端：每个 worker 独立引擎，发送不可取消。
pub struct RdmaTagBackend {
    network: Arc<Network>,
    rank: Rank,
    max_mode: ThreadMode,
}

impl TransportBackend for RdmaTagBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::RdmaTag
    }

    fn capabilities(&self) -> CancelCapability {
        CancelCapability {
            recv: true,
            send: false,
        }
    }

    fn max_thread_mode(&self) -> ThreadMode {
        self.max_mode
    }

    fn create_worker(&self, mode: ThreadMode) -> Result<Box<dyn BackendWorker>, TransportError> {
        if mode > self.max_mode {
            return Err(TransportError::ThreadModeUnsupported {
                requested: mode,
                supported: self.max_mode,
            });
        }
        let engine = Engine::spawn(&self.network, self.rank, BackendKind::RdmaTag, mode);
        Ok(Box::new(FabricWorker::new(
            engine,
            SendProtocol::Rendezvous,
            false,
        )))
    }
}
