#![deny(unsafe_code)]
#![doc = "spark-p2p-transport: 点对点消息传输后端契约的统一抽象层。"]
#![doc = ""]
#![doc = "== 使命概述 =="]
#![doc = "- **Why**：让消息传递式（MPI 风格）与 RDMA 标签匹配式（UCX 风格）后端在同一套语义下被上层调度，替换后端时调用方无需改动。"]
#![doc = "- **What**：定义 `BackendFactory`/`TransportBackend`/`BackendWorker`/`BackendEndpoint`/`BackendRequest` 五个 trait，"]
#![doc = "  以及线标签编码、消息缓冲、线程模式与地址交换（`AddressExchange`/`Domain`）等基础结构。"]
#![doc = "- **How**：契约层不做任何调度；所有进度推进由上层显式调用 `BackendWorker::progress` 触发。"]

/// 契约层统一返回别名，错误类型固定为 [`TransportError`]。
pub type Result<T, E = TransportError> = core::result::Result<T, E>;

pub mod address;
pub mod backend;
pub mod bootstrap;
pub mod buffer;
pub mod error;
pub mod tag;

pub use address::WorkerAddress;
pub use backend::{
    BackendEndpoint, BackendFactory, BackendKind, BackendRequest, BackendWorker, CancelCapability,
    CompletionInfo, InitRequest, PostOutcome, RequestStatus, ThreadMode, TransportBackend,
};
pub use bootstrap::{AddressExchange, Domain};
pub use buffer::MessageBuffer;
pub use error::TransportError;
pub use tag::{Rank, SENTINEL_TAG, Tag, WireMask, WireTag};
