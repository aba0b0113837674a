//! 观察者契约与纪元（generation）。
//!
//! # 设计背景（Why）
//! - 上层在放弃一条流（例如用新启动的流替换它）时，旧流的在途操作仍会陆续完成；
//!   这些完成事件不得再通知观察者；
//! - [`Generation`] 是观察者持有的原子计数句柄，[`EpochToken`] 是流创建时捕获的
//!   “句柄 + 当时取值”，完成时原子比较即可判定整条流是否过期。
//!
//! # 契约说明（What）
//! - `Generation::raise` 使此前捕获的全部令牌失效，不取消底层传输操作；
//! - 观察者回调全部在串行队列上执行，且调用时流内部不持有锁，回调中可以再次调用流的公开方法。

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use bytes::Bytes;

use crate::error::Status;

/// 观察者持有的纪元计数，可克隆共享。
#[derive(Clone, Debug, Default)]
pub struct Generation {
    value: Arc<AtomicU64>,
}

impl Generation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// 提升纪元并返回新值。
    pub fn raise(&self) -> u64 {
        self.value.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// 捕获当前纪元。
    pub fn capture(&self) -> EpochToken {
        EpochToken {
            generation: self.clone(),
            epoch: self.current(),
        }
    }
}

/// 流创建时捕获的纪元。
#[derive(Clone, Debug)]
pub struct EpochToken {
    generation: Generation,
    epoch: u64,
}

impl EpochToken {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// 捕获的纪元是否仍是观察者的当前纪元。
    pub fn is_current(&self) -> bool {
        self.generation.current() == self.epoch
    }
}

/// 流生命周期通知的接收方。
pub trait StreamObserver: Send + Sync + 'static {
    /// Start 成功，流进入 `Open`。
    fn on_stream_start(&self);

    /// 读到一条入站消息。
    fn on_stream_read(&self, message: Bytes);

    /// 流因传输失败终止；每条流至多一次。
    fn on_stream_error(&self, status: Status);

    /// 观察者当前纪元。
    fn generation(&self) -> &Generation;
}
