//! 串行队列的延时任务表。
//!
//! ### 契约说明（What）
//! - 任务按 `(截止时间, 入表序号)` 排序，同一截止时间按入表顺序执行；
//! - `cancel(id)` 移除截止时间最早的一个同标签任务；
//! - 表本身不执行任务，只负责排序与取出，由工作线程在释放锁后执行。

use std::{
    collections::BTreeMap,
    fmt,
    time::Instant,
};

/// 延时任务的取消标签。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TimerId {
    /// 监听流空闲关闭。
    ListenStreamIdle,
    /// 监听流重连退避。
    ListenStreamConnectionBackoff,
    /// 写入流空闲关闭。
    WriteStreamIdle,
    /// 写入流重连退避。
    WriteStreamConnectionBackoff,
    /// 在线状态判定超时。
    OnlineStateTimeout,
    /// 调用方自定义标签。
    Custom(u32),
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerId::ListenStreamIdle => f.write_str("listen_stream_idle"),
            TimerId::ListenStreamConnectionBackoff => f.write_str("listen_stream_backoff"),
            TimerId::WriteStreamIdle => f.write_str("write_stream_idle"),
            TimerId::WriteStreamConnectionBackoff => f.write_str("write_stream_backoff"),
            TimerId::OnlineStateTimeout => f.write_str("online_state_timeout"),
            TimerId::Custom(raw) => write!(f, "custom_{raw}"),
        }
    }
}

pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct DelayedTask {
    pub(crate) timer_id: TimerId,
    pub(crate) task: Task,
}

#[derive(Default)]
pub(crate) struct DelayedTasks {
    entries: BTreeMap<(Instant, u64), DelayedTask>,
    next_seq: u64,
}

impl DelayedTasks {
    pub(crate) fn schedule(&mut self, deadline: Instant, timer_id: TimerId, task: Task) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries
            .insert((deadline, seq), DelayedTask { timer_id, task });
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.entries.keys().next().map(|(deadline, _)| *deadline)
    }

    /// 取出一个已到期的任务。
    pub(crate) fn pop_due(&mut self, now: Instant) -> Option<DelayedTask> {
        let key = *self.entries.keys().next()?;
        if key.0 > now {
            return None;
        }
        self.entries.remove(&key)
    }

    pub(crate) fn cancel(&mut self, timer_id: TimerId) -> bool {
        let key = self
            .entries
            .iter()
            .find(|(_, entry)| entry.timer_id == timer_id)
            .map(|(key, _)| *key);
        match key {
            Some(key) => self.entries.remove(&key).is_some(),
            None => false,
        }
    }

    pub(crate) fn contains(&self, timer_id: TimerId) -> bool {
        self.entries
            .values()
            .any(|entry| entry.timer_id == timer_id)
    }

    /// 按截止时间顺序取出任务，直到（含）第一个带 `timer_id` 的任务。
    ///
    /// 表中没有该标签时不取出任何任务。
    pub(crate) fn drain_until(&mut self, timer_id: TimerId) -> Vec<DelayedTask> {
        if !self.contains(timer_id) {
            return Vec::new();
        }
        let mut drained = Vec::new();
        while let Some((_, entry)) = self.entries.pop_first() {
            let reached = entry.timer_id == timer_id;
            drained.push(entry);
            if reached {
                break;
            }
        }
        drained
    }

    pub(crate) fn clear(&mut self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        dropped
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
