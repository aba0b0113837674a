//! # SerialQueue：单车道任务执行器
//!
//! ## 核心意图（Why）
//! - 流状态机没有任何内部锁竞争假设：所有公开调用、完成回调、观察者通知都必须在同一条
//!   严格 FIFO 的执行车道上依次运行；
//! - 本模块用“一个无界通道 + 一个消费线程”实现这条车道，并附带按标签可取消的延时任务。
//!
//! ## 行为契约（What）
//! - `enqueue`：追加到队尾，按入队顺序逐个执行，绝不并发；
//! - `enqueue_after` / `try_cancel`：延时任务与按标签取消（已执行或不存在时为空操作）；
//! - `enqueue_blocking`：调用线程阻塞到任务执行完毕并取回返回值；任务 panic 时在调用线程上恢复；
//! - `is_current_queue`：判断当前线程是否为本队列的工作线程，仅用于调试断言；
//! - `shutdown`：排空已入队的即时任务、丢弃未到期的延时任务、等待工作线程退出，可重复调用。
//!
//! ## 风险提示（Trade-offs）
//! - 非阻塞任务 panic 被视为致命错误：记录日志后工作线程退出，之后的 `enqueue` 返回
//!   [`QueueError::WorkerTerminated`]；
//! - 在工作线程上调用 `enqueue_blocking` 会自锁，因此直接 panic。

use std::{
    any::Any,
    cell::Cell,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use super::timer::{DelayedTasks, Task, TimerId};
use crate::{config::RuntimeConfig, error::QueueError};

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_QUEUE: Cell<u64> = const { Cell::new(0) };
}

enum Command {
    Run(Task),
    Wake,
    Shutdown,
}

/// 串行队列句柄，可廉价克隆并在线程间共享。
#[derive(Clone)]
pub struct SerialQueue {
    shared: Arc<QueueShared>,
}

struct QueueShared {
    id: u64,
    name: String,
    gate: Mutex<Gate>,
    timers: Arc<Mutex<DelayedTasks>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// 入队闸门：关闭标记与发送端放在同一把锁下，关闭之后不会再有任务越过 `Shutdown` 指令。
struct Gate {
    sender: Sender<Command>,
    open: bool,
}

impl SerialQueue {
    /// 按配置启动工作线程。
    pub fn new(config: &RuntimeConfig) -> Result<Self, QueueError> {
        let id = NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed);
        let name = config.queue_name.clone();
        let (sender, receiver) = unbounded();
        let timers = Arc::new(Mutex::new(DelayedTasks::default()));

        let worker = Worker {
            id,
            name: name.clone(),
            receiver,
            timers: Arc::clone(&timers),
            slow_task_threshold: config.slow_task_threshold(),
        };
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker.run())
            .map_err(|source| QueueError::Spawn {
                queue: name.clone(),
                source,
            })?;

        debug!(queue = %name, id, "serial queue started");
        Ok(Self {
            shared: Arc::new(QueueShared {
                id,
                name,
                gate: Mutex::new(Gate { sender, open: true }),
                timers,
                worker: Mutex::new(Some(handle)),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// 追加即时任务。
    pub fn enqueue<F>(&self, task: F) -> Result<(), QueueError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.send(Command::Run(Box::new(task)))
    }

    /// 追加延时任务，到期后在本队列上执行。
    pub fn enqueue_after<F>(
        &self,
        delay: Duration,
        timer_id: TimerId,
        task: F,
    ) -> Result<(), QueueError>
    where
        F: FnOnce() + Send + 'static,
    {
        let gate = self.shared.gate.lock();
        if !gate.open {
            return Err(self.shut_down_error());
        }
        self.shared
            .timers
            .lock()
            .schedule(Instant::now() + delay, timer_id, Box::new(task));
        trace!(queue = %self.shared.name, timer = %timer_id, ?delay, "delayed task scheduled");
        // 唤醒工作线程重新计算最近截止时间。
        gate.sender
            .send(Command::Wake)
            .map_err(|_| self.terminated_error())
    }

    /// 取消一个尚未执行的延时任务；返回是否确有任务被移除。
    pub fn try_cancel(&self, timer_id: TimerId) -> bool {
        let cancelled = self.shared.timers.lock().cancel(timer_id);
        if cancelled {
            trace!(queue = %self.shared.name, timer = %timer_id, "delayed task cancelled");
        }
        cancelled
    }

    pub fn is_scheduled(&self, timer_id: TimerId) -> bool {
        self.shared.timers.lock().contains(timer_id)
    }

    /// 立即按截止时间顺序执行延时任务，直到（含）第一个带 `timer_id` 的任务。
    ///
    /// 返回执行的任务数；表中不存在该标签时什么也不做。
    pub fn run_scheduled_until(&self, timer_id: TimerId) -> usize {
        let timers = Arc::clone(&self.shared.timers);
        self.enqueue_blocking(move || {
            let drained = timers.lock().drain_until(timer_id);
            let count = drained.len();
            for entry in drained {
                (entry.task)();
            }
            count
        })
    }

    /// 入队并阻塞到任务执行完毕，返回任务结果。
    ///
    /// # Panics
    /// - 在本队列的工作线程上调用；
    /// - 队列已关闭或工作线程已终止；
    /// - 任务本身 panic（在调用线程上恢复原始 panic）。
    #[track_caller]
    pub fn enqueue_blocking<F, R>(&self, task: F) -> R
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        assert!(
            !self.is_current_queue(),
            "enqueue_blocking() called from the worker of serial queue `{}`",
            self.shared.name
        );

        let (reply_tx, reply_rx) = bounded::<thread::Result<R>>(1);
        let wrapped = move || {
            let result = panic::catch_unwind(AssertUnwindSafe(task));
            let _ = reply_tx.send(result);
        };
        if let Err(err) = self.enqueue(wrapped) {
            panic!("enqueue_blocking(): {err}");
        }

        match reply_rx.recv() {
            Ok(Ok(value)) => value,
            Ok(Err(payload)) => panic::resume_unwind(payload),
            Err(_) => panic!(
                "serial queue `{}` dropped a blocking task before running it",
                self.shared.name
            ),
        }
    }

    /// 当前线程是否为本队列的工作线程。
    pub fn is_current_queue(&self) -> bool {
        CURRENT_QUEUE.with(|current| current.get() == self.shared.id)
    }

    /// 调试断言：调用方必须运行在本队列上。
    #[track_caller]
    pub fn verify_is_current_queue(&self) {
        debug_assert!(
            self.is_current_queue(),
            "must be called on serial queue `{}`",
            self.shared.name
        );
    }

    /// 关闭队列：排空即时任务，丢弃延时任务，等待工作线程退出。
    pub fn shutdown(&self) -> Result<(), QueueError> {
        if self.is_current_queue() {
            return Err(QueueError::ShutdownFromWorker {
                queue: self.shared.name.clone(),
            });
        }

        {
            let mut gate = self.shared.gate.lock();
            if gate.open {
                gate.open = false;
                let _ = gate.sender.send(Command::Shutdown);
            }
        }

        let handle = self.shared.worker.lock().take();
        let Some(handle) = handle else {
            return Ok(());
        };
        let joined = handle.join();

        let dropped = self.shared.timers.lock().clear();
        if dropped > 0 {
            debug!(queue = %self.shared.name, dropped, "discarded delayed tasks at shutdown");
        }

        match joined {
            Ok(()) => {
                debug!(queue = %self.shared.name, "serial queue shut down");
                Ok(())
            }
            Err(_) => Err(QueueError::WorkerPanicked {
                queue: self.shared.name.clone(),
            }),
        }
    }

    fn send(&self, command: Command) -> Result<(), QueueError> {
        let gate = self.shared.gate.lock();
        if !gate.open {
            return Err(self.shut_down_error());
        }
        gate.sender
            .send(command)
            .map_err(|_| self.terminated_error())
    }

    fn shut_down_error(&self) -> QueueError {
        QueueError::ShutDown {
            queue: self.shared.name.clone(),
        }
    }

    fn terminated_error(&self) -> QueueError {
        QueueError::WorkerTerminated {
            queue: self.shared.name.clone(),
        }
    }
}

impl std::fmt::Debug for SerialQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialQueue")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("scheduled", &self.shared.timers.lock().len())
            .finish()
    }
}

struct Worker {
    id: u64,
    name: String,
    receiver: Receiver<Command>,
    timers: Arc<Mutex<DelayedTasks>>,
    slow_task_threshold: Option<Duration>,
}

impl Worker {
    fn run(self) {
        CURRENT_QUEUE.with(|current| current.set(self.id));

        loop {
            let deadline = self.timers.lock().next_deadline();
            let received = match deadline {
                Some(deadline) => self.receiver.recv_deadline(deadline),
                None => self
                    .receiver
                    .recv()
                    .map_err(|_| RecvTimeoutError::Disconnected),
            };

            match received {
                Ok(Command::Run(task)) => self.execute(task),
                Ok(Command::Wake) | Err(RecvTimeoutError::Timeout) => {}
                Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            }

            self.run_due_timers();
        }

        debug!(queue = %self.name, "serial queue worker exiting");
    }

    fn run_due_timers(&self) {
        loop {
            // 取出后立即释放锁，任务内部可能再次调度或取消延时任务。
            let due = self.timers.lock().pop_due(Instant::now());
            let Some(entry) = due else {
                break;
            };
            trace!(queue = %self.name, timer = %entry.timer_id, "running delayed task");
            self.execute(entry.task);
        }
    }

    fn execute(&self, task: Task) {
        let started = Instant::now();
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
            error!(
                queue = %self.name,
                panic = %panic_message(payload.as_ref()),
                "task panicked on serial queue; terminating worker"
            );
            panic::resume_unwind(payload);
        }

        if let Some(threshold) = self.slow_task_threshold {
            let elapsed = started.elapsed();
            if elapsed > threshold {
                warn!(queue = %self.name, ?elapsed, ?threshold, "slow task on serial queue");
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "<non-string panic payload>"
    }
}
