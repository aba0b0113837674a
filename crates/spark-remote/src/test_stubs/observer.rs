//! 记录型观察者。

use bytes::Bytes;
use parking_lot::Mutex;

use crate::{
    error::Status,
    stream::{Generation, StreamObserver},
};

/// 观察者收到的一条通知。
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ObservedEvent {
    Start,
    Read(Bytes),
    Error(Status),
}

/// 按到达顺序记录全部通知，并持有自己的 [`Generation`]。
#[derive(Debug, Default)]
pub struct RecordingObserver {
    generation: Generation,
    events: Mutex<Vec<ObservedEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ObservedEvent> {
        self.events.lock().clone()
    }

    pub fn errors(&self) -> Vec<Status> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                ObservedEvent::Error(status) => Some(status.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl StreamObserver for RecordingObserver {
    fn on_stream_start(&self) {
        self.events.lock().push(ObservedEvent::Start);
    }

    fn on_stream_read(&self, message: Bytes) {
        self.events.lock().push(ObservedEvent::Read(message));
    }

    fn on_stream_error(&self, status: Status) {
        self.events.lock().push(ObservedEvent::Error(status));
    }

    fn generation(&self) -> &Generation {
        &self.generation
    }
}
