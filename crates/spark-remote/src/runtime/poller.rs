//! # CompletionPoller：完成队列到串行队列的桥
//!
//! ## 核心意图（Why）
//! - 传输的完成队列只能阻塞轮询，因此需要一条独立线程专门等待；
//! - 该线程不触碰任何流状态，只把 `(tag, ok)` 解析回注册的 [`StreamOperation`]，再把
//!   “执行完成回调”作为任务投递到 [`SerialQueue`]。
//!
//! ## 行为契约（What）
//! - [`OperationRegistry`] 是两条线程唯一共享的可变结构，基于 `DashMap` 实现；
//! - 未知 tag 只记录告警，不中断轮询；
//! - `shutdown` 先关闭注册表与完成队列，再等待轮询线程把剩余的失败结果全部转发后退出；
//! - 注册表关闭之后登记的操作不会交给传输，它们由 [`OperationRegistry::fail_outstanding`]
//!   在串行队列上以失败结果完成。

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use super::queue::SerialQueue;
use crate::{
    error::RuntimeError,
    stream::{OperationOutcome, StreamOperation},
    transport::{CompletionEvent, CompletionQueue, Tag},
};

/// tag → 在途操作的并发注册表。
#[derive(Clone, Default)]
pub struct OperationRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    operations: DashMap<Tag, StreamOperation>,
    next_tag: AtomicU64,
    closed: RwLock<bool>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记操作并分配唯一 tag。
    pub fn register(&self, operation: StreamOperation) -> Tag {
        let tag = Tag::new(self.inner.next_tag.fetch_add(1, Ordering::Relaxed) + 1);
        self.inner.operations.insert(tag, operation);
        tag
    }

    /// 登记操作，并在注册表未关闭时于同一临界区内调用 `issue` 把请求交给传输。
    ///
    /// 与 [`close`](Self::close) 互斥：要么操作在完成队列关闭前已交给传输，由传输的关闭流程失败；
    /// 要么只登记不发出，留给 [`fail_outstanding`](Self::fail_outstanding)。
    pub(crate) fn submit(&self, operation: StreamOperation, issue: impl FnOnce(Tag)) -> Tag {
        let closed = self.inner.closed.read();
        let kind = operation.kind();
        let tag = self.register(operation);
        if *closed {
            debug!(%tag, %kind, "registry closed; operation held for shutdown");
        } else {
            issue(tag);
        }
        tag
    }

    /// 此后登记的操作不再交给传输。
    pub fn close(&self) {
        *self.inner.closed.write() = true;
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.read()
    }

    /// 以失败结果完成全部仍登记的操作，直到注册表为空；返回完成的数量。
    ///
    /// 完成回调可能登记新的操作（例如排空后的 Finish），因此循环直到没有剩余。
    /// 必须在串行队列上、且完成队列已经排空之后调用。
    pub fn fail_outstanding(&self) -> usize {
        let mut failed = 0;
        loop {
            let tags: Vec<Tag> = self
                .inner
                .operations
                .iter()
                .map(|entry| *entry.key())
                .collect();
            if tags.is_empty() {
                return failed;
            }
            for tag in tags {
                let Some(operation) = self.take(tag) else {
                    continue;
                };
                debug!(
                    %tag,
                    stream = %operation.stream(),
                    kind = %operation.kind(),
                    epoch = operation.epoch().epoch(),
                    "failing operation orphaned by shutdown"
                );
                operation.complete(OperationOutcome {
                    ok: false,
                    message: None,
                });
                failed += 1;
            }
        }
    }

    /// 取走 tag 对应的操作；每个 tag 至多取走一次。
    pub fn take(&self, tag: Tag) -> Option<StreamOperation> {
        self.inner
            .operations
            .remove(&tag)
            .map(|(_, operation)| operation)
    }

    /// 当前在途操作数量。
    pub fn len(&self) -> usize {
        self.inner.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.operations.is_empty()
    }
}

impl std::fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationRegistry")
            .field("outstanding", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// 完成队列轮询线程。
pub struct CompletionPoller {
    thread_name: String,
    completion_queue: Arc<dyn CompletionQueue>,
    registry: OperationRegistry,
    polled: Arc<AtomicU64>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CompletionPoller {
    /// 启动轮询线程。
    pub fn spawn(
        thread_name: impl Into<String>,
        completion_queue: Arc<dyn CompletionQueue>,
        registry: OperationRegistry,
        queue: SerialQueue,
    ) -> Result<Self, RuntimeError> {
        let thread_name = thread_name.into();
        let polled = Arc::new(AtomicU64::new(0));

        let worker = PollLoop {
            completion_queue: Arc::clone(&completion_queue),
            registry: registry.clone(),
            queue,
            polled: Arc::clone(&polled),
        };
        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || worker.run())
            .map_err(|source| RuntimeError::SpawnPoller {
                thread: thread_name.clone(),
                source,
            })?;

        debug!(poller = %thread_name, "completion poller started");
        Ok(Self {
            thread_name,
            completion_queue,
            registry,
            polled,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// 已从完成队列取出的结果数（含未知 tag）。
    pub fn polled_count(&self) -> u64 {
        self.polled.load(Ordering::Acquire)
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    /// 关闭注册表与完成队列，等待轮询线程转发完剩余结果后退出；可重复调用。
    pub fn shutdown(&self) -> Result<(), RuntimeError> {
        let Some(handle) = self.handle.lock().take() else {
            return Ok(());
        };

        self.registry.close();
        self.completion_queue.shutdown();
        if handle.join().is_err() {
            return Err(RuntimeError::PollerPanicked {
                thread: self.thread_name.clone(),
            });
        }

        debug!(poller = %self.thread_name, "completion poller shut down");
        Ok(())
    }
}

struct PollLoop {
    completion_queue: Arc<dyn CompletionQueue>,
    registry: OperationRegistry,
    queue: SerialQueue,
    polled: Arc<AtomicU64>,
}

impl PollLoop {
    fn run(self) {
        while let Some(event) = self.completion_queue.next() {
            self.forward(event);
            self.polled.fetch_add(1, Ordering::AcqRel);
        }
        trace!("completion queue drained");
    }

    fn forward(&self, event: CompletionEvent) {
        let CompletionEvent { tag, ok, message } = event;
        let Some(operation) = self.registry.take(tag) else {
            warn!(%tag, ok, "completion for unknown tag");
            return;
        };

        trace!(%tag, stream = %operation.stream(), kind = %operation.kind(), ok, "forwarding completion");
        let outcome = OperationOutcome { ok, message };
        if let Err(err) = self
            .queue
            .enqueue(move || operation.complete(outcome))
        {
            warn!(%tag, error = %err, "dropping completion: serial queue unavailable");
        }
    }
}
