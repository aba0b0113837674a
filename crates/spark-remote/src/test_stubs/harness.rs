//! 驱动单条流的测试夹具。
//!
//! # 使用方式（How）
//! - `on_queue` 在串行队列上对流执行一次调用并等待其返回；
//! - `force_finish` 按给定顺序完成在途操作，每完成一个都会等待对应的完成回调在队列上执行完毕；
//! - `keep_polling` 让除 Read 以外的操作自动成功，常用于驱动 Finish。
//!
//! # 契约说明（What）
//! - 每个驱动方法返回前都会调用 [`StreamHarness::settle`]：等待轮询线程转发完传输已交付的
//!   全部结果，再在队列上放一个空任务作为屏障；若回调期间又产生了新的结果（例如 `try_cancel`），
//!   继续等待直到稳定。

use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use bytes::Bytes;

use super::{
    observer::{ObservedEvent, RecordingObserver},
    transport::ScriptedTransport,
};
use crate::{
    config::RuntimeConfig,
    error::RuntimeError,
    runtime::StreamRuntime,
    stream::{Stream, StreamObserver, StreamState},
    transport::OperationKind,
};

const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

/// 一次强制完成的描述。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Forced {
    pub kind: OperationKind,
    pub ok: bool,
    pub message: Option<Bytes>,
}

impl Forced {
    pub fn ok(kind: OperationKind) -> Self {
        Self {
            kind,
            ok: true,
            message: None,
        }
    }

    pub fn failed(kind: OperationKind) -> Self {
        Self {
            kind,
            ok: false,
            message: None,
        }
    }

    /// 成功读到 `message`。
    pub fn read(message: impl Into<Bytes>) -> Self {
        Self {
            kind: OperationKind::Read,
            ok: true,
            message: Some(message.into()),
        }
    }
}

pub struct StreamHarness {
    runtime: StreamRuntime,
    transport: ScriptedTransport,
    observer: Arc<RecordingObserver>,
    stream: Stream,
}

impl StreamHarness {
    pub fn new() -> Result<Self, RuntimeError> {
        Self::with_config(
            &RuntimeConfig::default()
                .with_queue_name("harness-queue")
                .with_poller_name("harness-poller"),
        )
    }

    pub fn with_config(config: &RuntimeConfig) -> Result<Self, RuntimeError> {
        let transport = ScriptedTransport::new();
        let runtime = StreamRuntime::start(config, transport.completion_queue())?;
        let observer = Arc::new(RecordingObserver::new());
        let stream = runtime.new_stream(transport.new_call(), observer.clone());
        Ok(Self {
            runtime,
            transport,
            observer,
            stream,
        })
    }

    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    pub fn transport(&self) -> &ScriptedTransport {
        &self.transport
    }

    pub fn observer(&self) -> &RecordingObserver {
        &self.observer
    }

    pub fn runtime(&self) -> &StreamRuntime {
        &self.runtime
    }

    pub fn state(&self) -> StreamState {
        self.stream.state()
    }

    pub fn observed(&self) -> Vec<ObservedEvent> {
        self.observer.events()
    }

    /// 在串行队列上对流执行 `action`，等待回调稳定后返回其结果。
    ///
    /// `action` 内的 panic 会在调用线程上恢复。
    pub fn on_queue<F, R>(&self, action: F) -> R
    where
        F: FnOnce(&Stream) -> R + Send + 'static,
        R: Send + 'static,
    {
        let stream = self.stream.clone();
        let result = self.runtime.queue().enqueue_blocking(move || action(&stream));
        self.settle();
        result
    }

    /// 启动流并让 Start 成功，流进入 `Open`。
    pub fn start_stream(&self) {
        self.on_queue(|stream| stream.start());
        self.force_finish(&[Forced::ok(OperationKind::Start)]);
    }

    /// 依次完成最早的、类型匹配的在途操作。
    ///
    /// # Panics
    /// 某一项没有匹配的在途操作时 panic，并列出当前在途操作。
    pub fn force_finish(&self, forced: &[Forced]) {
        for entry in forced {
            let completed =
                self.transport
                    .complete(entry.kind, entry.ok, entry.message.clone());
            assert!(
                completed.is_some(),
                "expected an outstanding {} operation, outstanding: {:?}",
                entry.kind,
                self.transport.outstanding()
            );
            self.settle();
        }
    }

    /// 此后除 Read 外的操作自动成功。
    pub fn keep_polling(&self) {
        self.transport.keep_polling();
        self.settle();
    }

    /// 提升观察者纪元，返回新值。
    pub fn raise_generation(&self) -> u64 {
        self.observer.generation().raise()
    }

    /// 等待传输已交付的结果全部在串行队列上处理完毕。
    ///
    /// # Panics
    /// 超过五秒仍未稳定时 panic。
    pub fn settle(&self) {
        let deadline = Instant::now() + SETTLE_TIMEOUT;
        loop {
            let target = self.transport.delivered();
            while self.runtime.poller().polled_count() < target {
                assert!(
                    Instant::now() < deadline,
                    "completion poller did not forward {target} completions in time"
                );
                thread::sleep(Duration::from_millis(1));
            }
            self.runtime.queue().enqueue_blocking(|| {});
            if self.transport.delivered() == target {
                break;
            }
        }
    }

    pub fn shutdown(&self) -> Result<(), RuntimeError> {
        self.runtime.shutdown()
    }
}
