//! # 运行时：串行队列 + 完成轮询线程
//!
//! ## 契约声明
//! * **两条执行上下文：** [`SerialQueue`] 的单一工作线程承载全部流状态变更与回调；
//!   [`CompletionPoller`] 的线程只做完成结果转发；
//! * **有序关闭：** [`StreamRuntime::shutdown`] 先关闭完成队列并等待轮询线程转发完所有在途结果，
//!   再在串行队列上以失败结果完成回调期间新登记的操作（例如排空后才发出的 Finish），
//!   最后关闭串行队列；返回时注册表为空，每条已发出 Finish 的流都已触发完成信号。

mod poller;
mod queue;
mod timer;

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

pub use poller::{CompletionPoller, OperationRegistry};
pub use queue::SerialQueue;
pub use timer::TimerId;

use crate::{
    config::RuntimeConfig,
    error::RuntimeError,
    stream::{Stream, StreamObserver},
    transport::{CompletionQueue, StreamCall},
};

/// 队列与轮询线程的组合，负责创建流并按顺序关闭。
pub struct StreamRuntime {
    queue: SerialQueue,
    poller: CompletionPoller,
    shut_down: Mutex<bool>,
}

impl StreamRuntime {
    /// 启动工作线程与轮询线程。
    pub fn start(
        config: &RuntimeConfig,
        completion_queue: Arc<dyn CompletionQueue>,
    ) -> Result<Self, RuntimeError> {
        config.validate()?;
        let queue = SerialQueue::new(config)?;
        let registry = OperationRegistry::new();
        let poller = match CompletionPoller::spawn(
            config.poller_name.clone(),
            completion_queue,
            registry,
            queue.clone(),
        ) {
            Ok(poller) => poller,
            Err(err) => {
                let _ = queue.shutdown();
                return Err(err);
            }
        };

        Ok(Self {
            queue,
            poller,
            shut_down: Mutex::new(false),
        })
    }

    pub fn queue(&self) -> &SerialQueue {
        &self.queue
    }

    pub fn poller(&self) -> &CompletionPoller {
        &self.poller
    }

    /// 在本运行时上创建一条处于 `Initial` 状态的流。
    pub fn new_stream(
        &self,
        call: Box<dyn StreamCall>,
        observer: Arc<dyn StreamObserver>,
    ) -> Stream {
        Stream::new(
            self.queue.clone(),
            self.poller.registry().clone(),
            call,
            observer,
        )
    }

    /// 有序关闭；可重复调用。
    pub fn shutdown(&self) -> Result<(), RuntimeError> {
        let mut shut_down = self.shut_down.lock();
        if *shut_down {
            return Ok(());
        }
        *shut_down = true;

        let poller = self.poller.shutdown();
        let registry = self.poller.registry().clone();
        let orphans = self.queue.enqueue(move || {
            let failed = registry.fail_outstanding();
            if failed > 0 {
                debug!(failed, "failed operations issued after the completion queue closed");
            }
        });
        let queue = self.queue.shutdown();

        let leaked = self.poller.registry().len();
        if leaked > 0 {
            warn!(leaked, "operations still registered after stream runtime shut down");
        }
        poller?;
        orphans?;
        queue?;
        Ok(())
    }
}

impl Drop for StreamRuntime {
    fn drop(&mut self) {
        if self.queue.is_current_queue() {
            warn!(queue = %self.queue.name(), "stream runtime dropped on its own queue; skipping shutdown");
            return;
        }
        if let Err(err) = self.shutdown() {
            warn!(error = %err, "stream runtime shutdown failed during drop");
        }
    }
}
