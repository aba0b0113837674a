//! 脚本化传输：由测试决定每个在途操作的完成结果。
//!
//! # 契约说明（What）
//! - 每次 `issue` 都记入历史，并作为在途操作保存，直到测试、`try_cancel`、`keep_polling`
//!   或完成队列关闭将其完成；
//! - `delivered` 统计推入完成队列的结果数，夹具据此判断轮询线程是否已全部转发；
//! - 完成队列关闭后，在途操作全部以失败结果交付，随后 `next` 返回 `None`；关闭之后再发起的
//!   操作只记入历史，永远不会完成。

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;

use crate::{
    error::Status,
    transport::{CompletionEvent, CompletionQueue, OperationKind, Request, StreamCall, Tag},
};

/// 历史中的一条已发起请求。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IssuedRequest {
    pub call: u64,
    pub tag: Tag,
    pub request: Request,
}

#[derive(Clone, Copy, Debug)]
struct Outstanding {
    call: u64,
    tag: Tag,
    kind: OperationKind,
}

enum Delivery {
    Event(CompletionEvent),
    Closed,
}

#[derive(Default)]
struct TransportState {
    next_call: u64,
    history: Vec<IssuedRequest>,
    outstanding: VecDeque<Outstanding>,
    keep_polling: bool,
    shut_down: bool,
    final_status: Option<Status>,
    cancel_requests: u64,
}

struct TransportShared {
    state: Mutex<TransportState>,
    sender: Sender<Delivery>,
    receiver: Receiver<Delivery>,
    delivered: AtomicU64,
}

impl TransportShared {
    /// 推入一条完成结果；调用方必须持有 `state` 锁，保证与在途表的修改原子。
    fn deliver(&self, event: CompletionEvent) {
        if self.sender.send(Delivery::Event(event)).is_ok() {
            self.delivered.fetch_add(1, Ordering::AcqRel);
        }
    }
}

/// 脚本化传输句柄，可克隆。
#[derive(Clone)]
pub struct ScriptedTransport {
    shared: Arc<TransportShared>,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedTransport {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self {
            shared: Arc::new(TransportShared {
                state: Mutex::new(TransportState::default()),
                sender,
                receiver,
                delivered: AtomicU64::new(0),
            }),
        }
    }

    /// 供 [`CompletionPoller`](crate::runtime::CompletionPoller) 轮询的完成队列。
    pub fn completion_queue(&self) -> Arc<dyn CompletionQueue> {
        Arc::new(ScriptedCompletionQueue {
            shared: Arc::clone(&self.shared),
        })
    }

    /// 创建一个新的调用对象。
    pub fn new_call(&self) -> Box<dyn StreamCall> {
        let mut state = self.shared.state.lock();
        state.next_call += 1;
        Box::new(ScriptedCall {
            id: state.next_call,
            shared: Arc::clone(&self.shared),
        })
    }

    pub fn history(&self) -> Vec<IssuedRequest> {
        self.shared.state.lock().history.clone()
    }

    /// 历史中各请求的类型，按发起顺序。
    pub fn issued_kinds(&self) -> Vec<OperationKind> {
        self.shared
            .state
            .lock()
            .history
            .iter()
            .map(|issued| issued.request.kind())
            .collect()
    }

    /// 历史中全部写入的载荷，按发起顺序。
    pub fn written(&self) -> Vec<Bytes> {
        self.shared
            .state
            .lock()
            .history
            .iter()
            .filter_map(|issued| match &issued.request {
                Request::Write(message) => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    /// 当前在途操作的类型，按发起顺序。
    pub fn outstanding(&self) -> Vec<OperationKind> {
        self.shared
            .state
            .lock()
            .outstanding
            .iter()
            .map(|op| op.kind)
            .collect()
    }

    pub fn delivered(&self) -> u64 {
        self.shared.delivered.load(Ordering::Acquire)
    }

    pub fn cancel_requests(&self) -> u64 {
        self.shared.state.lock().cancel_requests
    }

    /// 设置失败后调用对象报告的终止状态。
    pub fn set_final_status(&self, status: Status) {
        self.shared.state.lock().final_status = Some(status);
    }

    /// 以给定结果完成最早发起的、类型为 `kind` 的在途操作；不存在时返回 `None`。
    pub fn complete(&self, kind: OperationKind, ok: bool, message: Option<Bytes>) -> Option<Tag> {
        let mut state = self.shared.state.lock();
        let index = state.outstanding.iter().position(|op| op.kind == kind)?;
        let op = state.outstanding.remove(index)?;
        let mut event = CompletionEvent::new(op.tag, ok);
        event.message = message;
        self.shared.deliver(event);
        Some(op.tag)
    }

    /// 此后除 Read 外的所有操作发起即成功完成，已在途的同样立即完成。
    pub fn keep_polling(&self) {
        let mut state = self.shared.state.lock();
        state.keep_polling = true;
        let outstanding = std::mem::take(&mut state.outstanding);
        for op in outstanding {
            if op.kind == OperationKind::Read {
                state.outstanding.push_back(op);
            } else {
                self.shared.deliver(CompletionEvent::new(op.tag, true));
            }
        }
    }
}

struct ScriptedCall {
    id: u64,
    shared: Arc<TransportShared>,
}

impl StreamCall for ScriptedCall {
    fn issue(&mut self, tag: Tag, request: Request) {
        let mut state = self.shared.state.lock();
        let kind = request.kind();
        state.history.push(IssuedRequest {
            call: self.id,
            tag,
            request,
        });
        if state.shut_down {
            return;
        }
        if state.keep_polling && kind != OperationKind::Read {
            self.shared.deliver(CompletionEvent::new(tag, true));
        } else {
            state.outstanding.push_back(Outstanding {
                call: self.id,
                tag,
                kind,
            });
        }
    }

    fn try_cancel(&mut self) {
        let mut state = self.shared.state.lock();
        state.cancel_requests += 1;
        let id = self.id;
        let outstanding = std::mem::take(&mut state.outstanding);
        for op in outstanding {
            if op.call == id && op.kind != OperationKind::Finish {
                self.shared.deliver(CompletionEvent::new(op.tag, false));
            } else {
                state.outstanding.push_back(op);
            }
        }
    }

    fn final_status(&mut self) -> Option<Status> {
        self.shared.state.lock().final_status.clone()
    }
}

struct ScriptedCompletionQueue {
    shared: Arc<TransportShared>,
}

impl CompletionQueue for ScriptedCompletionQueue {
    fn next(&self) -> Option<CompletionEvent> {
        match self.shared.receiver.recv() {
            Ok(Delivery::Event(event)) => Some(event),
            Ok(Delivery::Closed) | Err(_) => None,
        }
    }

    fn shutdown(&self) {
        let mut state = self.shared.state.lock();
        if state.shut_down {
            return;
        }
        state.shut_down = true;
        for op in std::mem::take(&mut state.outstanding) {
            self.shared.deliver(CompletionEvent::new(op.tag, false));
        }
        let _ = self.shared.sender.send(Delivery::Closed);
    }
}
