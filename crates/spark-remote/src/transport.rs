//! # 传输边界
//!
//! ## 契约声明
//! * **消费侧接口：** 引擎只依赖两个能力：在某个调用对象上以不透明 tag 发起异步操作
//!   （[`StreamCall::issue`]），以及阻塞轮询完成队列取回 `(tag, ok)`（[`CompletionQueue::next`]）；
//! * **载荷不透明：** 写入与读取的消息均为 [`Bytes`]，编码格式不在本层约定；
//! * **关闭语义：** [`CompletionQueue::shutdown`] 之后，所有在途 tag 必须以失败结果交付一次，
//!   交付完毕后 `next` 返回 `None`。

use std::fmt;

use bytes::Bytes;

use crate::error::Status;

/// 完成队列上标识一次在途操作的不透明标签。
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Tag(u64);

impl Tag {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 在途操作类型。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum OperationKind {
    Start,
    Read,
    Write,
    Finish,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Start => "start",
            OperationKind::Read => "read",
            OperationKind::Write => "write",
            OperationKind::Finish => "finish",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 交给传输执行的请求。
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Request {
    Start,
    Read,
    Write(Bytes),
    Finish,
}

impl Request {
    pub fn kind(&self) -> OperationKind {
        match self {
            Request::Start => OperationKind::Start,
            Request::Read => OperationKind::Read,
            Request::Write(_) => OperationKind::Write,
            Request::Finish => OperationKind::Finish,
        }
    }
}

/// 完成队列交付的一条结果。
///
/// - `ok == false` 表示操作失败或被取消；
/// - `message` 仅对成功的读取有意义，承载本次读到的消息。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CompletionEvent {
    pub tag: Tag,
    pub ok: bool,
    pub message: Option<Bytes>,
}

impl CompletionEvent {
    pub fn new(tag: Tag, ok: bool) -> Self {
        Self {
            tag,
            ok,
            message: None,
        }
    }

    pub fn with_message(mut self, message: Bytes) -> Self {
        self.message = Some(message);
        self
    }
}

/// 单个双向流调用对象，由一个 [`Stream`](crate::stream::Stream) 独占。
///
/// # 契约说明（What）
/// - `issue` 不得阻塞，也不得同步回调引擎；结果只能经由完成队列交付；
/// - `try_cancel` 请求尽快以失败结果结束该调用上的所有在途操作，可重复调用；
/// - `final_status` 在失败后给出传输侧的终止状态，未知时返回 `None`。
pub trait StreamCall: Send + 'static {
    fn issue(&mut self, tag: Tag, request: Request);

    fn try_cancel(&mut self);

    fn final_status(&mut self) -> Option<Status> {
        None
    }
}

/// 传输的完成队列，由 [`CompletionPoller`](crate::runtime::CompletionPoller) 独占轮询。
pub trait CompletionQueue: Send + Sync + 'static {
    /// 阻塞直到下一条完成结果；关闭且排空后返回 `None`。
    fn next(&self) -> Option<CompletionEvent>;

    /// 关闭完成队列，在途操作以失败结果交付。
    fn shutdown(&self);
}
