//! # config 模块说明
//!
//! ## 角色定位（Why）
//! - 上下文的可调参数：worker 拓扑、忙等让出频率、对端数量提示；
//! - 以 TOML 载入，再由环境变量覆盖，部署方无需改代码即可切换 worker 拓扑。
//!
//! ## 行为契约（What）
//! - 所有字段带默认值，空 TOML 即合法配置；
//! - 支持的环境变量：
//!   - `SPARK_P2P_WORKER_MODE` -> `worker_mode`（`shared` / `per_thread`）
//!   - `SPARK_P2P_SPIN_YIELD` -> `spin_yield_interval`
//!   - `SPARK_P2P_ESTIMATED_PEERS` -> `estimated_peers`

use std::env;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const WORKER_MODE_ENV: &str = "SPARK_P2P_WORKER_MODE";
const SPIN_YIELD_ENV: &str = "SPARK_P2P_SPIN_YIELD";
const ESTIMATED_PEERS_ENV: &str = "SPARK_P2P_ESTIMATED_PEERS";

/// worker 拓扑。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerMode {
    /// 全部令牌共享一个进度引擎。
    #[default]
    Shared,
    /// 每个令牌独占一个进度引擎；要求各 rank 的线程布局对称。
    PerThread,
}

impl WorkerMode {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "shared" => Some(Self::Shared),
            "per_thread" | "per-thread" | "perthread" => Some(Self::PerThread),
            _ => None,
        }
    }
}

/// 上下文配置。
///
/// # 教案式说明
/// - **契约 (What)**：
///   - `worker_mode`：默认 [`WorkerMode::Shared`]；
///   - `spin_yield_interval`：`Future::wait` 每空转该轮数调用一次 `thread::yield_now`，`0` 表示纯自旋；
///     默认 `64`；
///   - `estimated_peers`：传给后端的对端数量提示，`0` 表示取域大小；
/// - **风险 (Trade-offs)**：纯自旋在超额订阅的机器上会饿死同核线程，默认保留周期性让出。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub worker_mode: WorkerMode,
    pub spin_yield_interval: u32,
    pub estimated_peers: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            worker_mode: WorkerMode::Shared,
            spin_yield_interval: 64,
            estimated_peers: 0,
        }
    }
}

impl ContextConfig {
    /// 从 TOML 文本解析。
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// 链式设置 worker 拓扑。
    pub fn with_worker_mode(mut self, worker_mode: WorkerMode) -> Self {
        self.worker_mode = worker_mode;
        self
    }

    /// 以进程环境变量覆盖配置。
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|key| env::var(key).ok())
    }

    /// 以任意查找函数覆盖配置；任一覆盖值非法时整体不生效。
    pub fn apply_overrides_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let mut next = self.clone();
        if let Some(value) = lookup(WORKER_MODE_ENV) {
            next.worker_mode = WorkerMode::parse(&value).ok_or(ConfigError::InvalidOverride {
                key: WORKER_MODE_ENV,
                value,
            })?;
        }
        if let Some(value) = lookup(SPIN_YIELD_ENV) {
            next.spin_yield_interval =
                value
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidOverride {
                        key: SPIN_YIELD_ENV,
                        value: value.clone(),
                    })?;
        }
        if let Some(value) = lookup(ESTIMATED_PEERS_ENV) {
            next.estimated_peers =
                value
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidOverride {
                        key: ESTIMATED_PEERS_ENV,
                        value: value.clone(),
                    })?;
        }
        *self = next;
        Ok(())
    }
}
