#![deny(unsafe_code)]
#![doc = r#"
# spark-p2p-fabric

## 设计动机（Why）
- **定位**：在单个进程内模拟一张多 rank 的标签匹配网络，让核心层在没有真实 MPI/RDMA 运行时的
  环境里也能完整运行，包括多线程、多 rank 与优雅关闭流程；
- **架构角色**：实现 `spark-p2p-transport` 定义的全部契约，是契约的参考实现与测试底座。

## 核心契约（What）
- [`Fabric`] 是共享的“网络”，所有 rank 的引擎都注册在其中，通过不透明地址互相寻址；
- [`MessagePassingBackend`]：每个上下文一个引擎，小于等于 `eager_threshold` 的消息在提交时即完成，
  未匹配的收发均可取消；
- [`RdmaTagBackend`]：每个 worker 一个引擎，发送一律等待接收方匹配，且发送**不可取消**；
- [`LocalBootstrap`]：基于共享内存的地址交换、命名空间复制与 rank 屏障。

## 实现策略（How）
- 每个引擎维护“已提交接收”与“未预期消息”两条 FIFO 队列，只在 `progress` 中做匹配；
- 接收方匹配到会合协议的发送后，把发送请求推入发送方引擎的完成队列，发送方必须自己推进进度才能看到完成；
- `match_budget` 限制单轮匹配数量，用于在测试中打乱完成时机。

## 风险与考量（Trade-offs）
- 载荷在提交时被拷贝到“线路”上；真实会合协议在匹配时才读取缓冲区，但由于挂起期间缓冲区归请求独占，
  两者对调用方不可区分。
"#]

mod backend;
mod bootstrap;
mod config;
mod engine;

pub use backend::{Fabric, FabricFactory, MessagePassingBackend, RdmaTagBackend};
pub use bootstrap::LocalBootstrap;
pub use config::{FabricConfig, FabricConfigError};
