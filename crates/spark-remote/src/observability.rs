//! 日志装配。
//!
//! # 教案式说明
//! - **意图（Why）**：引擎内部统一使用 `tracing` 宏输出结构化日志，宿主进程只需安装一次订阅者；
//! - **逻辑（How）**：`fmt_subscriber` 组装 `EnvFilter + fmt` 层，环境变量 `RUST_LOG` 优先，
//!   否则使用调用方给出的默认指令；`install` 把它设为全局订阅者；
//! - **契约（What）**：外部已设置全局订阅者时，`install` 返回 [`ObservabilityError::SubscriberAlreadySet`]。

use thiserror::Error;
use tracing::{Subscriber, dispatcher};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt};

#[derive(Debug, Error)]
pub enum ObservabilityError {
    #[error("a global tracing subscriber is already installed")]
    SubscriberAlreadySet,
    #[error("failed to install global tracing subscriber")]
    SetGlobalSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// 构造 `EnvFilter + fmt` 订阅者。
pub fn fmt_subscriber(default_directive: &str) -> impl Subscriber + Send + Sync + 'static {
    tracing_subscriber::registry()
        .with(build_env_filter(default_directive))
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
}

/// 安装全局订阅者。
pub fn install(default_directive: &str) -> Result<(), ObservabilityError> {
    if dispatcher::has_been_set() {
        return Err(ObservabilityError::SubscriberAlreadySet);
    }
    tracing::subscriber::set_global_default(fmt_subscriber(default_directive))?;
    Ok(())
}

fn build_env_filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive))
}
