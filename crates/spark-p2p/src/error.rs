//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为上下文、令牌与通信器暴露的失败语义提供集中定义；
//! - 区分“致命、无法恢复”（后端初始化）、“编程错误”（令牌耗尽、保留标签）与“单次操作失败”（提交被拒）。
//!
//! ## 设计要求（What）
//! - 所有错误类型实现 `thiserror::Error`，并通过 `code()` 暴露 `spark.p2p.*` 稳定错误码；
//! - “尚未完成”从不是错误：`test`/`wait`/`progress` 不返回 `Result`；
//! - 取消不被支持也不是错误：`cancel()` 返回 `false` 属于正常结果。
//!
//! ## 匹配歧义（MatchAmbiguity）
//! - 同一 (发送方, 接收方) 之间若有两个并发在途操作使用相同 (逻辑标签, 来源 rank)，接收匹配即出现歧义；
//! - 这是契约层面的约束，运行时无法检测，因此没有对应变体；调用方需以“在同一槽位立即重新提交”的方式
//!   保证唯一性。

use spark_p2p_transport::{Rank, Tag, TransportError};
use thiserror::Error;

/// 提交的操作方向。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PostOp {
    Send,
    Recv,
}

impl core::fmt::Display for PostOp {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            PostOp::Send => "send",
            PostOp::Recv => "recv",
        })
    }
}

/// 通信核心错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：聚合上下文创建、令牌分配与收发提交三条路径上的异常，并保留底层
///   [`TransportError`] 作为 `source`，便于排障时追溯到具体后端；
/// - **契约 (What)**：所有变体 `Send + Sync + 'static`；[`CommError::code`] 给出稳定错误码；
/// - **设计权衡 (Trade-offs)**：配置错误以字符串描述，避免把 TOML 解析器类型泄漏到公共 API 之外的位置。
#[derive(Debug, Error)]
pub enum CommError {
    /// 后端无法初始化（包括所需线程模式不被支持）。致命，进程无法通信。
    #[error("backend initialization failed")]
    BackendInit(#[source] TransportError),

    /// 申请令牌的线程数超过了创建时声明的线程数。
    #[error("all {declared} declared thread tokens are in use")]
    ExhaustedTokens { declared: usize },

    /// 当前线程已经持有本上下文的令牌。
    #[error("calling thread already holds token {slot} of this context")]
    TokenAlreadyHeld { slot: usize },

    /// 后端拒绝了一次提交；不会自动重试。
    #[error("{op} to rank {peer} with tag {tag:#x} was rejected")]
    Post {
        op: PostOp,
        peer: Rank,
        tag: Tag,
        #[source]
        source: TransportError,
    },

    /// 与对端建立端点失败。
    #[error("cannot establish an endpoint to rank {peer}")]
    Connect {
        peer: Rank,
        #[source]
        source: TransportError,
    },

    /// 地址交换服务（屏障等集合操作）失败。
    #[error("bootstrap service failed")]
    Bootstrap(#[source] TransportError),

    /// 应用使用了保留给协议内部的标签。
    #[error("tag {0:#x} is reserved for internal signaling")]
    ReservedTag(Tag),

    /// 目标或来源 rank 越界。
    #[error("rank {rank} is outside a domain of size {size}")]
    RankOutOfRange { rank: Rank, size: u32 },

    /// 配置或参数非法。
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl CommError {
    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            Self::BackendInit(_) => "spark.p2p.backend_init",
            Self::ExhaustedTokens { .. } => "spark.p2p.exhausted_tokens",
            Self::TokenAlreadyHeld { .. } => "spark.p2p.token_already_held",
            Self::Post { .. } => "spark.p2p.post_rejected",
            Self::Connect { .. } => "spark.p2p.connect_failed",
            Self::Bootstrap(_) => "spark.p2p.bootstrap_failed",
            Self::ReservedTag(_) => "spark.p2p.reserved_tag",
            Self::RankOutOfRange { .. } => "spark.p2p.rank_out_of_range",
            Self::InvalidConfig(_) => "spark.p2p.invalid_config",
        }
    }

    /// 是否为致命错误（进程无法继续通信）。
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::BackendInit(_) | Self::Bootstrap(_))
    }
}

/// 配置载入失败。
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("context config is not valid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("environment variable `{key}` holds an invalid value `{value}`")]
    InvalidOverride { key: &'static str, value: String },
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Parse(_) => "spark.p2p.config.parse",
            Self::InvalidOverride { .. } => "spark.p2p.config.invalid_override",
        }
    }
}

impl From<ConfigError> for CommError {
    fn from(value: ConfigError) -> Self {
        CommError::InvalidConfig(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn post_error_keeps_backend_source() {
        let err = CommError::Post {
            op: PostOp::Recv,
            peer: 3,
            tag: 0x10,
            source: TransportError::PostRejected {
                reason: "queue full".to_owned(),
            },
        };
        assert_eq!(err.code(), "spark.p2p.post_rejected");
        assert_eq!(err.to_string(), "recv to rank 3 with tag 0x10 was rejected");
        let source = err.source().expect("应保留后端错误");
        assert_eq!(source.to_string(), "post rejected by backend: queue full");
        assert!(!err.is_fatal());
    }
}
