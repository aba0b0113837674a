//! 在途传输操作。
//!
//! # 教案式说明
//! - **意图 (Why)**：每次 Start/Read/Write/Finish 都需要一个可以跨线程移动、完成时恰好回调一次的载体；
//! - **契约 (What)**：
//!   - `execute` 先登记到 [`OperationRegistry`] 再交给传输，保证完成事件到达时一定能解析到本操作；
//!   - `complete` 按值消费 `self`，因此完成回调至多执行一次，且只能在串行队列上调用；
//!   - 操作携带所属流的 [`EpochToken`]，由流的完成回调决定是否丢弃过期结果；
//!   - 完成队列关闭后登记的操作不再交给传输，留在注册表里由关闭流程以失败结果完成。

use std::fmt;

use bytes::Bytes;

use super::{StreamId, observer::EpochToken};
use crate::{
    runtime::OperationRegistry,
    transport::{OperationKind, Request, StreamCall, Tag},
};

/// 完成队列交付给操作的结果。
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct OperationOutcome {
    pub ok: bool,
    pub message: Option<Bytes>,
}

type CompletionHandler = Box<dyn FnOnce(OperationKind, EpochToken, OperationOutcome) + Send + Sync>;

pub struct StreamOperation {
    stream: StreamId,
    kind: OperationKind,
    epoch: EpochToken,
    handler: CompletionHandler,
}

impl StreamOperation {
    pub fn new<F>(stream: StreamId, kind: OperationKind, epoch: EpochToken, handler: F) -> Self
    where
        F: FnOnce(OperationKind, EpochToken, OperationOutcome) + Send + Sync + 'static,
    {
        Self {
            stream,
            kind,
            epoch,
            handler: Box::new(handler),
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn stream(&self) -> StreamId {
        self.stream
    }

    pub fn epoch(&self) -> &EpochToken {
        &self.epoch
    }

    /// 登记并把请求交给传输；注册表已关闭时只登记。
    pub(crate) fn execute(
        self,
        registry: &OperationRegistry,
        call: &mut dyn StreamCall,
        request: Request,
    ) -> Tag {
        debug_assert_eq!(request.kind(), self.kind, "request does not match operation kind");
        registry.submit(self, move |tag| call.issue(tag, request))
    }

    /// 交付完成结果。
    pub fn complete(self, outcome: OperationOutcome) {
        let StreamOperation {
            kind,
            epoch,
            handler,
            ..
        } = self;
        handler(kind, epoch, outcome);
    }
}

impl fmt::Debug for StreamOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamOperation")
            .field("stream", &self.stream)
            .field("kind", &self.kind)
            .field("epoch", &self.epoch.epoch())
            .finish()
    }
}
