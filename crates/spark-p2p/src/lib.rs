#![deny(unsafe_code)]
#![doc = r#"
# spark-p2p

## 设计动机（Why）
- **定位**：多线程、多 rank 的点对点通信核心。应用以 `(对端 rank, 标签)` 投递非阻塞收发，
  而不关心底层是消息传递式运行时还是 RDMA 标签匹配引擎；
- **难点**：完成靠轮询发现而非调用栈返回，在途请求的生命周期必须显式管理；
  有的后端不能取消发送，关闭时需要专门的协议保证既不死锁也不丢消息。

## 核心契约（What）
- [`Context`]：每个进程每个通信域一个，持有后端、worker 与线程令牌表；
- [`ThreadToken`] → [`Communicator`]：每个参与线程凭令牌获得私有通信器；
- [`Future`]：每次收发返回的完成句柄，挂起期间独占缓冲区，退役至多一次；
- [`Worker`] + [`EndpointCache`]：进度引擎与按需建立的对端端点；
- [`Drain`]：优雅关闭协议，调和“接收可取消、发送不可取消”的不对称能力。

## 实现策略（How）
- 线标签 = 逻辑标签（高 32 位）‖ 源 rank（低 32 位），接收以全 64 位掩码精确匹配；
- 线程模式按“最弱充分”原则在创建上下文时一次性确定，之后不再改变；
- 库本身不安装任何 `tracing` 订阅者，日志由宿主程序决定如何输出。

## 风险与考量（Trade-offs）
- 同一有序 `(发送方, 接收方)` 对之间并发在途的操作必须保证 `(标签, 源 rank)` 唯一，否则接收匹配存在歧义；
  这是调用方的契约，运行时无法检测；
- 收发没有超时机制，对端挂起时 Future 会一直处于挂起状态，调用方需自行限制轮询次数。
"#]

mod communicator;
mod config;
mod context;
mod drain;
mod error;
mod future;
mod token;
mod worker;

pub use communicator::{Callback, Communicator};
pub use config::{ContextConfig, WorkerMode};
pub use context::{Context, ThreadPlan};
pub use drain::{Drain, DrainGate, DrainReport, RecvChannel};
pub use error::{CommError, ConfigError, PostOp};
pub use future::{Future, FutureStatus};
pub use token::ThreadToken;
pub use worker::{Endpoint, EndpointCache, Worker, WorkerStats, address_key};

pub use spark_p2p_transport::{
    BackendKind, CancelCapability, CompletionInfo, Domain, MessageBuffer, Rank, SENTINEL_TAG, Tag,
    ThreadMode, WireTag,
};
