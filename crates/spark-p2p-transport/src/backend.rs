//! # backend 模块说明
//!
//! ## 角色定位（Why）
//! - 消息传递式运行时与 RDMA 标签匹配式运行时在 API 形态上差异巨大，但核心层只需要其中极小的公共子集：
//!   “创建引擎、发布地址、建连、提交非阻塞收发、推进进度、测试/取消请求”；
//! - 本模块把这个子集固化为 trait，核心层只面向 trait 编程。
//!
//! ## 行为契约（What）
//! - 所有非阻塞操作只在调用方显式调用 [`BackendWorker::progress`] 时推进，后端不得自行开启后台线程；
//! - 发送完成只能通过发送方自己的 `progress` 观察到；
//! - 请求对象对调用方完全不透明，调用方不得假设任何内存布局。
//!
//! ## 风险提示（Trade-offs）
//! - 端点以 `dyn BackendEndpoint` 传递，后端需要借助 [`BackendEndpoint::as_any`] 下转型取回自身类型；
//!   传入其他后端创建的端点属于调用方错误，后端应以 [`TransportError::PostRejected`] 拒绝。

use core::any::Any;
use core::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::address::WorkerAddress;
use crate::bootstrap::Domain;
use crate::buffer::MessageBuffer;
use crate::error::TransportError;
use crate::tag::{Rank, WireMask, WireTag};

/// 后端线程模式，强弱顺序为 `Single < Serialized < Multi`。
///
/// - `Single`：仅一个线程使用引擎；
/// - `Serialized`：多个线程使用，但调用互斥；
/// - `Multi`：多个线程并发调用。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadMode {
    Single,
    Serialized,
    Multi,
}

impl fmt::Display for ThreadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ThreadMode::Single => "single",
            ThreadMode::Serialized => "serialized",
            ThreadMode::Multi => "multi",
        })
    }
}

/// 后端家族。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// 消息传递式：进程级单引擎，小消息走 eager 协议。
    MessagePassing,
    /// RDMA 标签匹配式：每个 worker 一个引擎，发送一律等待匹配。
    RdmaTag,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendKind::MessagePassing => "message_passing",
            BackendKind::RdmaTag => "rdma_tag",
        })
    }
}

/// 后端对取消操作的支持情况。
///
/// 优雅关闭协议正是为 `send == false` 的后端设计的。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CancelCapability {
    pub recv: bool,
    pub send: bool,
}

/// 后端初始化参数。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InitRequest {
    /// 上下文声明的线程数。
    pub thread_count: usize,
    /// 上下文将要创建的 worker 数。
    pub worker_count: usize,
    /// 上下文要求的最弱充分线程模式。
    pub thread_mode: ThreadMode,
    /// 预计的对端数量，后端可用于预分配。
    pub estimated_peers: usize,
}

/// 请求完成时的元数据。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompletionInfo {
    /// 实际匹配到的发送方线标签；对发送请求即为其自身标签。
    pub wire_tag: WireTag,
    /// 写入（或发出）的字节数。
    pub len: usize,
    /// 接收缓冲区小于消息时为 `true`，此时只交付了前缀。
    pub truncated: bool,
}

/// 请求状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Completed(CompletionInfo),
    Cancelled,
}

/// 发送提交的结果。
///
/// 后端可以在提交时直接完成发送（eager），此时缓冲区立即交还，不产生请求对象。
pub enum PostOutcome {
    Completed(MessageBuffer),
    Pending(Box<dyn BackendRequest>),
}

/// 后端工厂：由部署方选择，交给核心层的 `Context::create`。
pub trait BackendFactory: Send + Sync {
    /// 工厂将创建的后端家族。
    fn kind(&self) -> BackendKind;

    /// 初始化后端运行时。
    ///
    /// # 教案式说明
    /// - **契约 (What)**：`request.thread_mode` 超出能力时必须返回
    ///   [`TransportError::ThreadModeUnsupported`]；其他失败返回 [`TransportError::InitFailed`]；
    /// - **前置条件**：`domain` 已由调用方复制，后端可自由使用其地址交换服务。
    fn init(
        &self,
        domain: &Domain,
        request: &InitRequest,
    ) -> Result<Box<dyn TransportBackend>, TransportError>;
}

/// 已初始化的后端运行时。
pub trait TransportBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn capabilities(&self) -> CancelCapability;

    /// 后端能够提供的最强线程模式。
    fn max_thread_mode(&self) -> ThreadMode;

    /// 创建一个进度引擎（或其视图）。
    fn create_worker(&self, mode: ThreadMode) -> Result<Box<dyn BackendWorker>, TransportError>;
}

/// 指向某个对端引擎的已连接端点。
pub trait BackendEndpoint: Send + Sync {
    /// 端点对应的对端 rank。
    fn peer(&self) -> Rank;

    /// 供后端下转型回自身端点类型。
    fn as_any(&self) -> &dyn Any;
}

/// 进度引擎。
///
/// # 教案式说明
/// - **意图 (Why)**：后端的全部异步行为都汇聚在引擎上：匹配、数据搬运与完成通知；
/// - **契约 (What)**：
///   - `post_send`/`post_recv` 取得缓冲区所有权，请求退役后经 [`BackendRequest::take_buffer`] 交还；
///   - `progress` 非阻塞，返回本轮推进的事件数（匹配数 + 完成通知数），0 表示没有可做的事；
///   - 线程安全等级由创建时的 [`ThreadMode`] 约定，调用方负责遵守。
pub trait BackendWorker: Send + Sync {
    /// 本引擎的不透明地址。
    fn address(&self) -> WorkerAddress;

    /// 依据对端地址建立端点。
    fn connect(
        &self,
        peer: Rank,
        address: &WorkerAddress,
    ) -> Result<Arc<dyn BackendEndpoint>, TransportError>;

    /// 提交非阻塞发送。
    fn post_send(
        &self,
        endpoint: &dyn BackendEndpoint,
        buffer: MessageBuffer,
        tag: WireTag,
    ) -> Result<PostOutcome, TransportError>;

    /// 提交非阻塞接收。
    fn post_recv(
        &self,
        buffer: MessageBuffer,
        tag: WireTag,
        mask: WireMask,
    ) -> Result<Box<dyn BackendRequest>, TransportError>;

    /// 推进一轮进度。
    fn progress(&self) -> usize;
}

/// 单个挂起操作的不透明句柄。
pub trait BackendRequest: Send {
    /// 读取当前状态，不推进进度。
    fn test(&mut self) -> RequestStatus;

    /// 尝试取消；仅当操作尚未匹配且后端支持该方向的取消时返回 `true`。
    fn cancel(&mut self) -> bool;

    /// 在请求完成或取消后取回缓冲区；至多返回一次 `Some`。
    fn take_buffer(&mut self) -> Option<MessageBuffer>;
}
