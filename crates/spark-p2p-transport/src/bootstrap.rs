//! # bootstrap 模块说明
//!
//! ## 角色定位（Why）
//! - 引擎地址只能在运行时得知，必须通过带外的键值服务在进程间交换（PMI 风格）；
//! - [`Domain`] 描述“我是谁、一共有几个进程、用哪个交换服务”，是创建上下文的唯一身份输入。
//!
//! ## 行为契约（What）
//! - `get` 阻塞直到对端发布该键；
//! - `barrier` 是所有 rank 参与的集合操作；
//! - `duplicate` 是集合操作：所有 rank 以相同顺序调用后得到彼此对应、且与父级隔离的命名空间。

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::TransportError;
use crate::tag::Rank;

/// 带外地址交换服务。
pub trait AddressExchange: Send + Sync {
    /// 发布本 rank 名下的键值。
    fn set(&self, rank: Rank, key: &str, value: Bytes) -> Result<(), TransportError>;

    /// 读取 `peer` 名下的键值，未发布时阻塞等待。
    fn get(&self, peer: Rank, key: &str) -> Result<Bytes, TransportError>;

    /// 全体 rank 参与的屏障。
    fn barrier(&self, rank: Rank) -> Result<(), TransportError>;

    /// 派生一个隔离的命名空间。
    fn duplicate(&self) -> Arc<dyn AddressExchange>;
}

/// 进程在通信域中的身份。
///
/// # 教案式说明
/// - **契约 (What)**：`rank < size` 由构造函数保证；克隆共享同一交换服务；
/// - **逻辑 (How)**：[`Domain::duplicate`] 等价于 `MPI_Comm_dup`，核心层据此与调用方后续对该域的使用隔离。
#[derive(Clone)]
pub struct Domain {
    rank: Rank,
    size: u32,
    exchange: Arc<dyn AddressExchange>,
}

impl Domain {
    /// 构造域身份；`rank >= size` 时返回 [`TransportError::InitFailed`]。
    pub fn new(
        rank: Rank,
        size: u32,
        exchange: Arc<dyn AddressExchange>,
    ) -> Result<Self, TransportError> {
        if rank >= size {
            return Err(TransportError::InitFailed {
                reason: format!("rank {rank} is outside a domain of size {size}"),
            });
        }
        Ok(Self {
            rank,
            size,
            exchange,
        })
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// 底层交换服务。
    pub fn exchange(&self) -> &Arc<dyn AddressExchange> {
        &self.exchange
    }

    /// 复制出一个命名空间隔离的域。
    pub fn duplicate(&self) -> Domain {
        Domain {
            rank: self.rank,
            size: self.size,
            exchange: self.exchange.duplicate(),
        }
    }

    /// 以本 rank 身份参与全体屏障。
    pub fn barrier(&self) -> Result<(), TransportError> {
        self.exchange.barrier(self.rank)
    }
}

impl fmt::Debug for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Domain")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}
