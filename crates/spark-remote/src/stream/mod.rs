//! # Stream：双向流状态机
//!
//! ## 核心意图（Why）
//! - 监听流与写入流共用同一套生命周期：发起 Start，成功后持续读取，写入按 FIFO 逐条发出，
//!   调用方结束时等待在途操作排空后发出 Finish；
//! - 每个方向同一时刻至多一个在途操作，多余的写入在内存中排队。
//!
//! ## 行为契约（What）
//! - 所有公开方法与完成回调都必须运行在所属 [`SerialQueue`] 上（调试构建下断言）；
//! - 前置条件被违反属于编程错误，直接以 [`StreamMisuse`] 的描述 panic；
//! - 纪元在创建流时捕获一次，流上的全部操作共用；观察者提升纪元后整条流失效，
//!   之后发起的操作同样不会再产生任何通知；
//! - 纪元过期的完成结果只释放操作槽位：不通知、不改状态、不再发起新的 Read/Write；
//!   Finish 的完成结果无论纪元如何都会被处理；
//! - 观察者通知在释放内部锁之后派发，并在派发前再次校验纪元。
//!
//! ## 风险提示（Trade-offs）
//! - 内部状态放在 `Mutex` 里只是为了让句柄满足 `Send + Sync`；所有访问都发生在串行队列上，
//!   这把锁从不发生竞争；
//! - 在途操作持有流内部状态的强引用，调用方丢弃所有 [`Stream`] 句柄后，状态会一直存活到
//!   最后一个操作完成为止；
//! - 调用方结束之后（`Finishing`）不会再发出 `on_stream_error`，失败只记录日志。

mod finish;
mod observer;
mod operation;
mod state;

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

pub use finish::FinishSignal;
pub use observer::{EpochToken, Generation, StreamObserver};
pub use operation::{OperationOutcome, StreamOperation};
pub use state::{FinishOrigin, FinishStep, StreamState};

use crate::{
    error::{Status, StreamMisuse},
    runtime::{OperationRegistry, SerialQueue},
    transport::{OperationKind, Request, StreamCall, Tag},
};

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// 进程内唯一的流编号，仅用于日志与诊断。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct StreamId(u64);

impl StreamId {
    fn next() -> Self {
        Self(NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

/// 双向流句柄，可克隆；克隆共享同一状态机。
#[derive(Clone)]
pub struct Stream {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    id: StreamId,
    queue: SerialQueue,
    registry: OperationRegistry,
    observer: Arc<dyn StreamObserver>,
    epoch: EpochToken,
    finished: FinishSignal,
    core: Mutex<StreamCore>,
}

struct StreamCore {
    state: StreamState,
    call: Box<dyn StreamCall>,
    slots: OperationSlots,
    pending_writes: VecDeque<Bytes>,
}

/// 每个方向的在途操作槽位；Start 与 Finish 共用控制槽。
#[derive(Debug, Default)]
struct OperationSlots {
    control: Option<Tag>,
    read: Option<Tag>,
    write: Option<Tag>,
}

impl OperationSlots {
    fn slot(&mut self, kind: OperationKind) -> &mut Option<Tag> {
        match kind {
            OperationKind::Start | OperationKind::Finish => &mut self.control,
            OperationKind::Read => &mut self.read,
            OperationKind::Write => &mut self.write,
        }
    }

    fn occupy(&mut self, kind: OperationKind, tag: Tag) {
        let slot = self.slot(kind);
        assert!(slot.is_none(), "{kind} operation already outstanding");
        *slot = Some(tag);
    }

    fn release(&mut self, kind: OperationKind) {
        *self.slot(kind) = None;
    }

    fn is_idle(&self) -> bool {
        self.control.is_none() && self.read.is_none() && self.write.is_none()
    }
}

enum Notification {
    Start,
    Read(Bytes),
    Error(Status),
}

impl Stream {
    /// 创建处于 `Initial` 状态的流；不发起任何传输操作。
    pub fn new(
        queue: SerialQueue,
        registry: OperationRegistry,
        call: Box<dyn StreamCall>,
        observer: Arc<dyn StreamObserver>,
    ) -> Self {
        let id = StreamId::next();
        let epoch = observer.generation().capture();
        trace!(stream = %id, queue = %queue.name(), epoch = epoch.epoch(), "stream created");
        Self {
            inner: Arc::new(StreamInner {
                id,
                queue,
                registry,
                observer,
                epoch,
                finished: FinishSignal::new(),
                core: Mutex::new(StreamCore {
                    state: StreamState::Initial,
                    call,
                    slots: OperationSlots::default(),
                    pending_writes: VecDeque::new(),
                }),
            }),
        }
    }

    pub fn id(&self) -> StreamId {
        self.inner.id
    }

    pub fn state(&self) -> StreamState {
        self.inner.core.lock().state
    }

    /// 尚未发出的排队写入数量。
    pub fn pending_writes(&self) -> usize {
        self.inner.core.lock().pending_writes.len()
    }

    pub fn finish_signal(&self) -> FinishSignal {
        self.inner.finished.clone()
    }

    /// 发起 Start；只能在 `Initial` 下调用一次。
    #[track_caller]
    pub fn start(&self) {
        self.inner.queue.verify_is_current_queue();
        let mut core = self.inner.core.lock();
        if core.state != StreamState::Initial {
            misuse(StreamMisuse::AlreadyStarted {
                stream: self.inner.id.get(),
                state: core.state,
            });
        }

        self.inner.transition(&mut core, StreamState::Started);
        self.inner.issue(&mut core, Request::Start);
    }

    /// 写入一条消息；写方向空闲时立即发出，否则排队。
    #[track_caller]
    pub fn write(&self, message: Bytes) {
        self.inner.queue.verify_is_current_queue();
        let mut core = self.inner.core.lock();
        self.inner.require_open(&core, "write");
        self.inner.write_or_enqueue(&mut core, message);
    }

    /// 写入最后一条消息并在全部写入完成后结束流。
    ///
    /// 返回消息是否被立即发出（`false` 表示排在其它写入之后）。
    #[track_caller]
    pub fn write_and_finish(&self, message: Bytes) -> bool {
        self.inner.queue.verify_is_current_queue();
        let mut core = self.inner.core.lock();
        self.inner.require_open(&core, "write_and_finish");

        let issued = self.inner.write_or_enqueue(&mut core, message);
        self.inner.transition(
            &mut core,
            StreamState::Finishing {
                origin: FinishOrigin::Caller,
                step: FinishStep::FlushingWrites,
            },
        );
        debug!(stream = %self.inner.id, issued, "write_and_finish: flushing writes before finish");
        issued
    }

    /// 结束流并释放传输调用。
    ///
    /// - `Initial`：直接进入 `Finished`，不发起任何传输操作；
    /// - `Started` / `Open`：丢弃排队写入，取消在途操作，排空后发出 Finish；
    /// - `Error`：排空后发出 Finish，不再通知观察者。
    #[track_caller]
    pub fn finish(&self) {
        self.inner.queue.verify_is_current_queue();
        let mut core = self.inner.core.lock();
        let state = core.state;
        match state {
            StreamState::Initial => {
                self.inner.transition(&mut core, StreamState::Finished);
                drop(core);
                debug!(stream = %self.inner.id, "finished before start");
                self.inner.finished.fire();
            }
            StreamState::Started | StreamState::Open => {
                let dropped = core.pending_writes.len();
                core.pending_writes.clear();
                self.inner.transition(
                    &mut core,
                    StreamState::Finishing {
                        origin: FinishOrigin::Caller,
                        step: FinishStep::AwaitingOperations,
                    },
                );
                debug!(stream = %self.inner.id, dropped_writes = dropped, "finish requested");
                self.inner.drive_finish(&mut core);
            }
            StreamState::Error => {
                self.inner.transition(
                    &mut core,
                    StreamState::Finishing {
                        origin: FinishOrigin::AfterError,
                        step: FinishStep::AwaitingOperations,
                    },
                );
                debug!(stream = %self.inner.id, "finish requested after error");
                self.inner.drive_finish(&mut core);
            }
            state @ (StreamState::Finishing { .. } | StreamState::Finished) => {
                misuse(StreamMisuse::AlreadyFinishing {
                    stream: self.inner.id.get(),
                    state,
                });
            }
        }
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.inner.core.lock();
        f.debug_struct("Stream")
            .field("id", &self.inner.id)
            .field("state", &core.state)
            .field("slots", &core.slots)
            .field("pending_writes", &core.pending_writes.len())
            .finish()
    }
}

#[track_caller]
fn misuse(err: StreamMisuse) -> ! {
    panic!("{err}")
}

impl StreamInner {
    #[track_caller]
    fn require_open(&self, core: &StreamCore, call: &'static str) {
        if core.state != StreamState::Open {
            misuse(StreamMisuse::NotOpen {
                stream: self.id.get(),
                call,
                state: core.state,
            });
        }
    }

    fn transition(&self, core: &mut StreamCore, next: StreamState) {
        assert!(
            core.state.can_transition_to(next),
            "{}: illegal transition {:?} -> {:?}",
            self.id,
            core.state,
            next
        );
        trace!(stream = %self.id, from = ?core.state, to = ?next, "state transition");
        core.state = next;
    }

    fn issue(self: &Arc<Self>, core: &mut StreamCore, request: Request) -> Tag {
        let kind = request.kind();
        let handle = Arc::clone(self);
        let operation = StreamOperation::new(
            self.id,
            kind,
            self.epoch.clone(),
            move |kind, _epoch, outcome| handle.on_completion(kind, outcome),
        );

        let tag = operation.execute(&self.registry, core.call.as_mut(), request);
        core.slots.occupy(kind, tag);
        trace!(stream = %self.id, %kind, %tag, epoch = self.epoch.epoch(), "operation issued");
        tag
    }

    /// 写方向空闲时发出队首消息，否则排队；返回 `message` 本身是否立即发出。
    ///
    /// 过期的写入完成不会续发队列，因此写方向空闲时队列可能非空，需先发出更早的消息。
    fn write_or_enqueue(self: &Arc<Self>, core: &mut StreamCore, message: Bytes) -> bool {
        let issued_now = core.slots.write.is_none() && core.pending_writes.is_empty();
        core.pending_writes.push_back(message);
        if core.slots.write.is_none()
            && let Some(next) = core.pending_writes.pop_front()
        {
            self.issue(core, Request::Write(next));
        }
        if !issued_now {
            trace!(stream = %self.id, pending = core.pending_writes.len(), "write queued");
        }
        issued_now
    }

    /// 推进 `Finishing`：写入排空后等待其它在途操作，全部排空后发出 Finish。
    fn drive_finish(self: &Arc<Self>, core: &mut StreamCore) {
        let StreamState::Finishing { origin, step } = core.state else {
            return;
        };

        match step {
            FinishStep::Issued => return,
            FinishStep::FlushingWrites => {
                if core.slots.write.is_some() || !core.pending_writes.is_empty() {
                    return;
                }
                self.transition(
                    core,
                    StreamState::Finishing {
                        origin,
                        step: FinishStep::AwaitingOperations,
                    },
                );
            }
            FinishStep::AwaitingOperations => {}
        }

        if core.slots.is_idle() {
            self.transition(
                core,
                StreamState::Finishing {
                    origin,
                    step: FinishStep::Issued,
                },
            );
            self.issue(core, Request::Finish);
        } else {
            core.call.try_cancel();
        }
    }

    fn on_completion(self: &Arc<Self>, kind: OperationKind, outcome: OperationOutcome) {
        self.queue.verify_is_current_queue();
        let OperationOutcome { ok, message } = outcome;

        let notification = {
            let mut core = self.core.lock();
            core.slots.release(kind);
            match (kind, ok) {
                (OperationKind::Finish, ok) => {
                    self.on_finish_completed(&mut core, ok);
                    None
                }
                _ if !self.epoch.is_current() => {
                    debug!(stream = %self.id, %kind, ok, epoch = self.epoch.epoch(), "stale completion dropped");
                    self.on_stale_completion(&mut core, kind);
                    None
                }
                (_, false) => self.on_failure(&mut core, kind),
                (OperationKind::Start, true) => self.on_start_completed(&mut core),
                (OperationKind::Read, true) => self.on_read_completed(&mut core, message),
                (OperationKind::Write, true) => {
                    self.on_write_completed(&mut core);
                    None
                }
            }
        };

        if kind == OperationKind::Finish {
            self.finished.fire();
        }
        if let Some(notification) = notification {
            self.notify(notification);
        }
    }

    fn on_finish_completed(&self, core: &mut StreamCore, ok: bool) {
        self.transition(core, StreamState::Finished);
        debug!(stream = %self.id, ok, "stream finished");
    }

    fn on_stale_completion(self: &Arc<Self>, core: &mut StreamCore, kind: OperationKind) {
        if kind == OperationKind::Write
            && matches!(
                core.state,
                StreamState::Finishing {
                    step: FinishStep::FlushingWrites,
                    ..
                }
            )
        {
            core.pending_writes.clear();
        }
        self.drive_finish(core);
    }

    fn on_failure(
        self: &Arc<Self>,
        core: &mut StreamCore,
        kind: OperationKind,
    ) -> Option<Notification> {
        let state = core.state;
        if !state.reports_failures() {
            debug!(stream = %self.id, %kind, ?state, "failure suppressed");
            if kind == OperationKind::Write {
                core.pending_writes.clear();
            }
            self.drive_finish(core);
            return None;
        }

        let dropped = core.pending_writes.len();
        core.pending_writes.clear();
        self.transition(core, StreamState::Error);
        let status = core
            .call
            .final_status()
            .unwrap_or_else(|| Status::unavailable(format!("{kind} operation failed")));
        warn!(stream = %self.id, %kind, %status, dropped_writes = dropped, "stream failed");

        if !core.slots.is_idle() {
            core.call.try_cancel();
        }
        Some(Notification::Error(status))
    }

    fn on_start_completed(self: &Arc<Self>, core: &mut StreamCore) -> Option<Notification> {
        if core.state != StreamState::Started {
            self.drive_finish(core);
            return None;
        }

        self.transition(core, StreamState::Open);
        self.issue(core, Request::Read);
        Some(Notification::Start)
    }

    fn on_read_completed(
        self: &Arc<Self>,
        core: &mut StreamCore,
        message: Option<Bytes>,
    ) -> Option<Notification> {
        if core.state != StreamState::Open {
            self.drive_finish(core);
            return None;
        }

        self.issue(core, Request::Read);
        Some(Notification::Read(message.unwrap_or_default()))
    }

    fn on_write_completed(self: &Arc<Self>, core: &mut StreamCore) {
        let flushing = matches!(
            core.state,
            StreamState::Open
                | StreamState::Finishing {
                    step: FinishStep::FlushingWrites,
                    ..
                }
        );
        if flushing && let Some(next) = core.pending_writes.pop_front() {
            self.issue(core, Request::Write(next));
        }
        self.drive_finish(core);
    }

    /// 锁外派发通知；派发前再次校验纪元。
    fn notify(&self, notification: Notification) {
        if !self.epoch.is_current() {
            debug!(stream = %self.id, epoch = self.epoch.epoch(), "generation raised before notification; dropped");
            return;
        }

        match notification {
            Notification::Start => self.observer.on_stream_start(),
            Notification::Read(message) => self.observer.on_stream_read(message),
            Notification::Error(status) => self.observer.on_stream_error(status),
        }
    }
}

impl Drop for StreamInner {
    fn drop(&mut self) {
        let state = self.core.get_mut().state;
        if !state.is_terminal() {
            warn!(stream = %self.id, ?state, "stream released without finishing");
        }
    }
}
