//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义流引擎对外暴露的错误语义：传输失败状态（[`Status`]）、编程错误（[`StreamMisuse`]）、
//!   队列/运行时管线错误以及配置错误；
//! - 三类错误的处理方式不同：传输失败经 `on_stream_error` 通知一次；编程错误直接 panic；
//!   管线错误以 `Result` 返回。
//!
//! ## 设计要求（What）
//! - 所有错误类型派生 `thiserror::Error`，保证与 `std::error::Error` 生态兼容；
//! - 变体携带可读上下文（状态、调用名、线程名），便于日志直接定位。

use std::{fmt, io};

use thiserror::Error;

use crate::stream::StreamState;

/// 传输层状态码，沿用 gRPC 的标准码表。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum StatusCode {
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl StatusCode {
    /// 稳定的蛇形命名，用于日志字段。
    pub fn as_str(self) -> &'static str {
        match self {
            StatusCode::Ok => "ok",
            StatusCode::Cancelled => "cancelled",
            StatusCode::Unknown => "unknown",
            StatusCode::InvalidArgument => "invalid_argument",
            StatusCode::DeadlineExceeded => "deadline_exceeded",
            StatusCode::NotFound => "not_found",
            StatusCode::AlreadyExists => "already_exists",
            StatusCode::PermissionDenied => "permission_denied",
            StatusCode::ResourceExhausted => "resource_exhausted",
            StatusCode::FailedPrecondition => "failed_precondition",
            StatusCode::Aborted => "aborted",
            StatusCode::OutOfRange => "out_of_range",
            StatusCode::Unimplemented => "unimplemented",
            StatusCode::Internal => "internal",
            StatusCode::Unavailable => "unavailable",
            StatusCode::DataLoss => "data_loss",
            StatusCode::Unauthenticated => "unauthenticated",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 流终止时交给观察者的状态。
///
/// # 教案式说明
/// - **意图 (Why)**：`on_stream_error` 需要一个可跨线程移动、可打印的失败描述；
/// - **契约 (What)**：`code` 为标准状态码，`message` 面向排障人员；
/// - **来源 (How)**：优先取传输通过 [`StreamCall::final_status`](crate::transport::StreamCall::final_status)
///   给出的状态，否则由失败的操作类型推导为 `Unavailable`。
#[derive(Clone, Debug, Eq, Error, PartialEq)]
#[error("{code}: {message}")]
pub struct Status {
    code: StatusCode,
    message: String,
}

impl Status {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// 传输不可用时的默认状态。
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Unavailable, message)
    }

    pub fn code(&self) -> StatusCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }
}

/// 调用方违反流契约的编程错误。
///
/// # 教案式说明
/// - **意图 (Why)**：重复启动、未打开即写入、重复结束、在队列外调用等都说明上层存在缺陷，
///   不属于可重试的瞬态故障；
/// - **契约 (What)**：流在检测到这些情况时以本类型的 `Display` 作为 panic 消息，不会返回 `Err`；
/// - **风险 (Trade-offs)**：panic 发生在串行队列上；若通过 `enqueue_blocking` 调用，panic 会被
///   转交给阻塞的调用线程，否则工作线程终止。
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum StreamMisuse {
    #[error("stream {stream}: start() called twice (state {state:?})")]
    AlreadyStarted { stream: u64, state: StreamState },

    #[error("stream {stream}: {call}() requires an open stream (state {state:?})")]
    NotOpen {
        stream: u64,
        call: &'static str,
        state: StreamState,
    },

    #[error("stream {stream}: finish() called twice (state {state:?})")]
    AlreadyFinishing { stream: u64, state: StreamState },
}

/// 串行队列的管线错误。
#[derive(Debug, Error)]
pub enum QueueError {
    /// 队列已关闭，不再接受任务。
    #[error("serial queue `{queue}` is shut down")]
    ShutDown { queue: String },

    /// 工作线程因任务 panic 退出，队列不可再用。
    #[error("serial queue `{queue}` worker terminated")]
    WorkerTerminated { queue: String },

    /// 在队列自身的工作线程上请求关闭，无法等待自身退出。
    #[error("serial queue `{queue}` cannot be shut down from its own worker")]
    ShutdownFromWorker { queue: String },

    /// 关闭时发现工作线程曾经 panic。
    #[error("serial queue `{queue}` worker panicked")]
    WorkerPanicked { queue: String },

    #[error("failed to spawn serial queue worker `{queue}`")]
    Spawn {
        queue: String,
        #[source]
        source: io::Error,
    },
}

/// 运行时组合（队列 + 轮询线程）的错误。
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("failed to spawn completion poller `{thread}`")]
    SpawnPoller {
        thread: String,
        #[source]
        source: io::Error,
    },

    #[error("completion poller `{thread}` panicked")]
    PollerPanicked { thread: String },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// 运行时配置解析与校验错误。
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse runtime configuration")]
    Parse(#[from] toml::de::Error),

    #[error("invalid runtime configuration `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}
