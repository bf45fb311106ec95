//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义后端契约层的失败语义，让不同后端以同一组变体向上汇报；
//! - 每个变体对应一个稳定错误码，便于日志检索与告警规则长期保持不变。
//!
//! ## 设计要求（What）
//! - 通过 `thiserror::Error` 实现 `std::error::Error`；
//! - 错误码位于 `spark.p2p.transport.*` 命名空间，通过 [`TransportError::code`] 读取。

use thiserror::Error;

use crate::backend::ThreadMode;
use crate::tag::Rank;

const INIT_FAILED: &str = "spark.p2p.transport.init_failed";
const THREAD_MODE_UNSUPPORTED: &str = "spark.p2p.transport.thread_mode_unsupported";
const POST_REJECTED: &str = "spark.p2p.transport.post_rejected";
const CONNECT_FAILED: &str = "spark.p2p.transport.connect_failed";
const ADDRESS_MISSING: &str = "spark.p2p.transport.address_missing";
const DISCONNECTED: &str = "spark.p2p.transport.disconnected";

/// 后端契约层错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：覆盖初始化、建连、提交与地址交换四类失败，供核心层包装为带上下文的领域错误；
/// - **契约 (What)**：所有变体均为 `Send + Sync + 'static`，可以跨线程传播；
/// - **设计权衡 (Trade-offs)**：原因以 `String` 保存，牺牲少量分配换取可读性。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// 后端运行时无法初始化。
    #[error("backend initialization failed: {reason}")]
    InitFailed { reason: String },

    /// 请求的线程模式超出后端能力。
    #[error("thread mode {requested} requested but backend supports at most {supported}")]
    ThreadModeUnsupported {
        requested: ThreadMode,
        supported: ThreadMode,
    },

    /// 后端拒绝了一次发送或接收提交。
    #[error("post rejected by backend: {reason}")]
    PostRejected { reason: String },

    /// 无法依据对端地址建立端点。
    #[error("failed to connect to rank {peer}: {reason}")]
    ConnectFailed { peer: Rank, reason: String },

    /// 地址交换服务中缺少所需键。
    #[error("address `{key}` of rank {peer} is not published")]
    AddressMissing { peer: Rank, key: String },

    /// 对端引擎已经释放。
    #[error("peer engine of rank {peer} is gone")]
    Disconnected { peer: Rank },
}

impl TransportError {
    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            Self::InitFailed { .. } => INIT_FAILED,
            Self::ThreadModeUnsupported { .. } => THREAD_MODE_UNSUPPORTED,
            Self::PostRejected { .. } => POST_REJECTED,
            Self::ConnectFailed { .. } => CONNECT_FAILED,
            Self::AddressMissing { .. } => ADDRESS_MISSING,
            Self::Disconnected { .. } => DISCONNECTED,
        }
    }
}
