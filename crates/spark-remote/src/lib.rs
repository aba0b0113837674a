#![deny(unsafe_code)]

//! # spark-remote
//!
//! ## 定位与职责（Why）
//! - 为数据库 SDK 的长连接双向流（监听流、写入流）提供客户端引擎：一个串行任务队列作为所有
//!   流状态变更与回调的唯一执行上下文，一个流状态机负责按方向逐个发起 Start/Read/Write/Finish
//!   异步操作，并把轮询线程上到达的完成事件关联回正确的流实例与纪元（epoch）。
//!
//! ## 架构嵌入（Where）
//! - `runtime`：[`SerialQueue`] 单车道执行器、[`CompletionPoller`] 完成队列桥接线程，以及二者的
//!   组合 [`StreamRuntime`]；
//! - `stream`：[`Stream`] 状态机、[`StreamOperation`] 在途操作、[`StreamObserver`] 观察者契约与
//!   [`Generation`] 纪元计数；
//! - `transport`：消费侧传输边界（`StreamCall` / `CompletionQueue`）；
//! - `error`、`config`、`observability`：错误域、运行时配置与日志装配；
//! - `test_stubs`：脚本化传输与记录型观察者，供单元测试与集成测试复用。
//!
//! ## 并发模型（What）
//! - 流的全部状态只在串行队列上读写；轮询线程只做“完成事件 → 入队”的转发；
//! - 两个线程唯一共享的结构是 tag → 操作的注册表（[`OperationRegistry`]，基于 `DashMap`）。

pub mod config;
pub mod error;
pub mod observability;
pub mod runtime;
pub mod stream;
/// 测试桩命名空间：脚本化传输、记录型观察者与驱动流完成事件的测试夹具。
pub mod test_stubs;
pub mod transport;

pub use config::RuntimeConfig;
pub use error::{ConfigError, QueueError, RuntimeError, Status, StatusCode, StreamMisuse};
pub use runtime::{
    CompletionPoller, OperationRegistry, SerialQueue, StreamRuntime, TimerId,
};
pub use stream::{
    EpochToken, FinishOrigin, FinishSignal, FinishStep, Generation, Stream, StreamId,
    OperationOutcome, StreamObserver, StreamOperation, StreamState,
};
pub use transport::{CompletionEvent, CompletionQueue, OperationKind, Request, StreamCall, Tag};
