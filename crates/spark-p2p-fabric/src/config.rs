//! 模拟网络的配置：TOML 载入 + 环境变量覆盖。

use std::env;

use serde::{Deserialize, Serialize};
use spark_p2p_transport::ThreadMode;
use thiserror::Error;

const EAGER_THRESHOLD_ENV: &str = "SPARK_P2P_FABRIC_EAGER_THRESHOLD";
const MATCH_BUDGET_ENV: &str = "SPARK_P2P_FABRIC_MATCH_BUDGET";

/// 配置载入失败。
#[derive(Debug, Error)]
pub enum FabricConfigError {
    #[error("fabric config is not valid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("environment variable `{key}` holds an invalid value `{value}`")]
    InvalidOverride { key: &'static str, value: String },
}

/// 模拟网络的可调参数。
///
/// # 教案式说明
/// - **契约 (What)**：
///   - `eager_threshold`：消息传递式后端中，长度不超过该值的消息在提交时即完成；
///   - `max_thread_mode`：后端可提供的最强线程模式，用于模拟能力不足的运行时；
///   - `match_budget`：单次 `progress` 最多完成的匹配数，`0` 表示不限；
/// - **默认值**：`1024` / `Multi` / `0`。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricConfig {
    pub eager_threshold: usize,
    pub max_thread_mode: ThreadMode,
    pub match_budget: usize,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            eager_threshold: 1024,
            max_thread_mode: ThreadMode::Multi,
            match_budget: 0,
        }
    }
}

impl FabricConfig {
    /// 从 TOML 文本解析，缺省字段取默认值。
    pub fn from_toml_str(raw: &str) -> Result<Self, FabricConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// 以进程环境变量覆盖配置。
    ///
    /// 支持的变量：
    /// - `SPARK_P2P_FABRIC_EAGER_THRESHOLD` -> `eager_threshold`
    /// - `SPARK_P2P_FABRIC_MATCH_BUDGET` -> `match_budget`
    pub fn apply_env_overrides(&mut self) -> Result<(), FabricConfigError> {
        self.apply_overrides_from(|key| env::var(key).ok())
    }

    /// 以任意查找函数覆盖配置，`apply_env_overrides` 的可测试形式；任一值非法时整体不生效。
    pub fn apply_overrides_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), FabricConfigError> {
        let mut next = self.clone();
        if let Some(value) = lookup(EAGER_THRESHOLD_ENV) {
            next.eager_threshold = parse_usize(EAGER_THRESHOLD_ENV, value)?;
        }
        if let Some(value) = lookup(MATCH_BUDGET_ENV) {
            next.match_budget = parse_usize(MATCH_BUDGET_ENV, value)?;
        }
        *self = next;
        Ok(())
    }
}

fn parse_usize(key: &'static str, value: String) -> Result<usize, FabricConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| FabricConfigError::InvalidOverride { key, value })
}
