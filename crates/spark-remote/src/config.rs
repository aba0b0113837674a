//! 运行时配置。
//!
//! ### 设计目的（Why）
//! - 流引擎本身不拥有重试、退避、保活等策略配置，这些由上层协作者解析后以不透明值传入；
//! - 这里只描述运行时管线的装配参数：工作线程名称与慢任务告警阈值。
//!
//! ### 契约说明（What）
//! - 所有字段均有默认值，TOML 中缺省的字段回落到 [`RuntimeConfig::default`]；
//! - 未知字段会被拒绝，避免拼写错误被静默忽略；
//! - [`RuntimeConfig::validate`] 拒绝空线程名。

use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// 串行队列与完成轮询线程的装配参数。
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// 串行队列工作线程名称。
    pub queue_name: String,
    /// 完成轮询线程名称。
    pub poller_name: String,
    /// 单个任务执行超过该毫秒数时记录 `warn` 日志；`0` 表示关闭检查。
    pub slow_task_threshold_ms: u64,
}

impl RuntimeConfig {
    /// 从 TOML 文本解析并校验配置。
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = name.into();
        self
    }

    pub fn with_poller_name(mut self, name: impl Into<String>) -> Self {
        self.poller_name = name.into();
        self
    }

    pub fn with_slow_task_threshold(mut self, threshold: Duration) -> Self {
        self.slow_task_threshold_ms = u64::try_from(threshold.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// 慢任务阈值；返回 `None` 表示关闭检查。
    pub fn slow_task_threshold(&self) -> Option<Duration> {
        (self.slow_task_threshold_ms > 0).then(|| Duration::from_millis(self.slow_task_threshold_ms))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "queue_name",
                reason: "thread name must not be empty".to_owned(),
            });
        }
        if self.poller_name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "poller_name",
                reason: "thread name must not be empty".to_owned(),
            });
        }
        Ok(())
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            queue_name: "spark-remote-queue".to_owned(),
            poller_name: "spark-remote-poller".to_owned(),
            slow_task_threshold_ms: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config = RuntimeConfig::from_toml_str("queue_name = \"listen-queue\"\n")
            .expect("partial configuration must parse");
        assert_eq!(config.queue_name, "listen-queue");
        assert_eq!(config.poller_name, RuntimeConfig::default().poller_name);
        assert_eq!(config.slow_task_threshold(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn zero_threshold_disables_slow_task_check() {
        let config = RuntimeConfig::from_toml_str("slow_task_threshold_ms = 0\n")
            .expect("threshold override must parse");
        assert_eq!(config.slow_task_threshold(), None);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = RuntimeConfig::from_toml_str("queue_nmae = \"typo\"\n")
            .expect_err("misspelled field must be rejected");
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn empty_thread_name_is_invalid() {
        let err = RuntimeConfig::default()
            .with_poller_name("  ")
            .validate()
            .expect_err("blank poller name must be rejected");
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "poller_name",
                ..
            }
        ));
    }
}
