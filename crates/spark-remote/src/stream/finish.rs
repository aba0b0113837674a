//! Finish 完成信号。
//!
//! - Finish 操作的完成回调（或从 `Initial` 直接结束）会触发本信号；
//! - 外部线程可以等待它来确认传输调用已释放，但不得在串行队列上等待，否则会阻塞自身。

use std::{sync::Arc, time::Duration};

use parking_lot::{Condvar, Mutex};

#[derive(Clone, Debug, Default)]
pub struct FinishSignal {
    inner: Arc<SignalInner>,
}

#[derive(Debug, Default)]
struct SignalInner {
    finished: Mutex<bool>,
    condvar: Condvar,
}

impl FinishSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_finished(&self) -> bool {
        *self.inner.finished.lock()
    }

    /// 等待至多 `timeout`；返回流是否已结束。
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut finished = self.inner.finished.lock();
        if !*finished {
            let _ = self
                .inner
                .condvar
                .wait_while_for(&mut finished, |finished| !*finished, timeout);
        }
        *finished
    }

    pub(crate) fn fire(&self) {
        let mut finished = self.inner.finished.lock();
        *finished = true;
        self.inner.condvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn waiter_is_released_by_fire() {
        let signal = FinishSignal::new();
        let remote = signal.clone();
        let waiter = thread::spawn(move || remote.wait_timeout(Duration::from_secs(5)));

        signal.fire();
        assert!(waiter.join().expect("waiter must not panic"));
        assert!(signal.is_finished());
    }

    #[test]
    fn wait_times_out_when_never_fired() {
        let signal = FinishSignal::new();
        assert!(!signal.wait_timeout(Duration::from_millis(10)));
    }
}
