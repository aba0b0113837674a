//! 流生命周期场景测试。
//!
//! # 教案级注释概览
//! - **核心目标 (Why)**：以脚本化传输逐个完成在途操作，验证状态机的前置条件、通知序列、
//!   失败处理与纪元抑制；
//! - **结构说明 (How)**：每个用例创建独立的 [`StreamHarness`]，通过 `on_queue` 在串行队列上调用流，
//!   通过 `force_finish` 决定完成结果；前置条件违反以 panic 表达，用 `catch_unwind` 捕获；
//! - **合同与边界 (What)**：用例只断言可观察行为（通知序列、流状态、传输历史），不依赖内部字段。

use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    time::Duration,
};

use bytes::Bytes;
use spark_remote::{
    FinishOrigin, FinishStep, OperationKind, Status, StatusCode, Stream, StreamState,
    test_stubs::{
        harness::{Forced, StreamHarness},
        observer::ObservedEvent,
    },
};

fn harness() -> StreamHarness {
    StreamHarness::new().expect("harness runtime must start")
}

fn panic_text(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else {
        String::from("<non-string panic payload>")
    }
}

/// 在队列上执行 `action`，断言其 panic 并返回 panic 消息。
fn expect_misuse<F>(harness: &StreamHarness, action: F) -> String
where
    F: FnOnce(&Stream) + Send + 'static,
{
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| harness.on_queue(action)));
    match outcome {
        Ok(()) => panic!("expected the call to be rejected"),
        Err(payload) => panic_text(payload),
    }
}

fn msg(text: &'static str) -> Bytes {
    Bytes::from_static(text.as_bytes())
}

#[test]
fn cannot_start_twice() {
    let harness = harness();
    harness.on_queue(|stream| stream.start());

    let message = expect_misuse(&harness, |stream| stream.start());
    assert!(message.contains("start() called twice"), "{message}");
    assert_eq!(harness.transport().issued_kinds(), vec![OperationKind::Start]);
}

#[test]
fn cannot_write_before_stream_is_open() {
    let harness = harness();
    let message = expect_misuse(&harness, |stream| stream.write(Bytes::new()));
    assert!(message.contains("write() requires an open stream"), "{message}");

    harness.on_queue(|stream| stream.start());
    let message = expect_misuse(&harness, |stream| stream.write(Bytes::new()));
    assert!(message.contains("Started"), "{message}");
    assert!(harness.transport().written().is_empty());
}

#[test]
fn can_finish_before_starting() {
    let harness = harness();
    harness.on_queue(|stream| stream.finish());

    assert_eq!(harness.state(), StreamState::Finished);
    assert!(harness.stream().finish_signal().is_finished());
    assert!(harness.transport().history().is_empty());
    assert!(harness.observed().is_empty());
}

#[test]
fn can_finish_after_starting() {
    let harness = harness();
    harness.start_stream();
    harness.keep_polling();

    harness.on_queue(|stream| stream.finish());

    assert_eq!(harness.state(), StreamState::Finished);
    assert_eq!(
        harness.transport().issued_kinds(),
        vec![OperationKind::Start, OperationKind::Read, OperationKind::Finish]
    );
    assert!(harness.transport().cancel_requests() >= 1);
    assert!(
        harness
            .stream()
            .finish_signal()
            .wait_timeout(Duration::from_secs(1))
    );
}

#[test]
fn finish_waits_for_outstanding_operations() {
    let harness = harness();
    harness.on_queue(|stream| stream.start());
    harness.on_queue(|stream| stream.finish());

    // 脚本化传输的 try_cancel 已让 Start 失败，Finish 随即发出。
    assert_eq!(
        harness.state(),
        StreamState::Finishing {
            origin: FinishOrigin::Caller,
            step: FinishStep::Issued,
        }
    );
    assert_eq!(harness.transport().outstanding(), vec![OperationKind::Finish]);
    assert!(!harness.stream().finish_signal().is_finished());

    harness.force_finish(&[Forced::ok(OperationKind::Finish)]);
    assert_eq!(harness.state(), StreamState::Finished);
    assert!(harness.stream().finish_signal().is_finished());
    assert!(harness.observed().is_empty());
}

#[test]
fn cannot_finish_twice() {
    let harness = harness();
    let message = expect_misuse(&harness, |stream| {
        stream.finish();
        stream.finish();
    });
    assert!(message.contains("finish() called twice"), "{message}");
}

#[test]
fn cannot_finish_twice_while_finishing() {
    let harness = harness();
    harness.start_stream();
    harness.on_queue(|stream| stream.finish());

    let message = expect_misuse(&harness, |stream| stream.finish());
    assert!(message.contains("Finishing"), "{message}");
}

#[test]
fn cannot_write_and_finish_before_starting() {
    let harness = harness();
    let message = expect_misuse(&harness, |stream| {
        stream.write_and_finish(Bytes::new());
    });
    assert!(message.contains("write_and_finish() requires an open stream"), "{message}");
}

#[test]
fn can_write_and_finish_after_starting() {
    let harness = harness();
    harness.start_stream();
    harness.keep_polling();

    let issued = harness.on_queue(|stream| stream.write_and_finish(msg("last")));

    assert!(issued);
    assert_eq!(harness.transport().written(), vec![msg("last")]);
    assert_eq!(harness.state(), StreamState::Finished);
    assert_eq!(harness.observed(), vec![ObservedEvent::Start]);
}

#[test]
fn write_and_finish_reports_queued_message() {
    let harness = harness();
    harness.start_stream();

    let issued = harness.on_queue(|stream| {
        stream.write(msg("first"));
        stream.write_and_finish(msg("last"))
    });

    assert!(!issued);
    assert_eq!(harness.stream().pending_writes(), 1);
    assert_eq!(
        harness.state(),
        StreamState::Finishing {
            origin: FinishOrigin::Caller,
            step: FinishStep::FlushingWrites,
        }
    );

    harness.force_finish(&[Forced::ok(OperationKind::Write), Forced::ok(OperationKind::Write)]);
    assert_eq!(harness.transport().written(), vec![msg("first"), msg("last")]);

    // 写入排空后取消读取，随后发出 Finish。
    harness.force_finish(&[Forced::ok(OperationKind::Finish)]);
    assert_eq!(harness.state(), StreamState::Finished);
    assert_eq!(harness.observed(), vec![ObservedEvent::Start]);
}

#[test]
fn observer_receives_on_start() {
    let harness = harness();
    harness.start_stream();

    assert_eq!(harness.observed(), vec![ObservedEvent::Start]);
    assert_eq!(harness.state(), StreamState::Open);
    assert_eq!(harness.transport().outstanding(), vec![OperationKind::Read]);
}

#[test]
fn can_write_after_stream_is_open() {
    let harness = harness();
    harness.start_stream();
    harness.on_queue(|stream| stream.write(msg("payload")));

    assert_eq!(harness.transport().written(), vec![msg("payload")]);
}

#[test]
fn observer_receives_on_read() {
    let harness = harness();
    harness.start_stream();
    harness.force_finish(&[Forced::read(msg("hello"))]);

    assert_eq!(
        harness.observed(),
        vec![ObservedEvent::Start, ObservedEvent::Read(msg("hello"))]
    );
}

#[test]
fn read_is_automatically_readded() {
    let harness = harness();
    harness.start_stream();

    harness.force_finish(&[Forced::read(msg("one"))]);
    assert_eq!(harness.transport().outstanding(), vec![OperationKind::Read]);

    harness.force_finish(&[Forced::read(msg("two"))]);
    assert_eq!(
        harness.observed(),
        vec![
            ObservedEvent::Start,
            ObservedEvent::Read(msg("one")),
            ObservedEvent::Read(msg("two")),
        ]
    );
    assert_eq!(
        harness.transport().issued_kinds(),
        vec![
            OperationKind::Start,
            OperationKind::Read,
            OperationKind::Read,
            OperationKind::Read,
        ]
    );
}

#[test]
fn several_writes_are_issued_one_at_a_time_in_order() {
    let harness = harness();
    harness.start_stream();

    harness.on_queue(|stream| {
        stream.write(msg("a"));
        stream.write(msg("b"));
        stream.write(msg("c"));
    });
    assert_eq!(harness.transport().written(), vec![msg("a")]);
    assert_eq!(harness.stream().pending_writes(), 2);

    harness.force_finish(&[
        Forced::read(msg("r1")),
        Forced::ok(OperationKind::Write),
        Forced::read(msg("r2")),
        Forced::ok(OperationKind::Write),
        Forced::read(msg("r3")),
        Forced::ok(OperationKind::Write),
    ]);

    assert_eq!(harness.transport().written(), vec![msg("a"), msg("b"), msg("c")]);
    assert_eq!(harness.stream().pending_writes(), 0);
    assert_eq!(
        harness.observed(),
        vec![
            ObservedEvent::Start,
            ObservedEvent::Read(msg("r1")),
            ObservedEvent::Read(msg("r2")),
            ObservedEvent::Read(msg("r3")),
        ]
    );
}

#[test]
fn observer_receives_on_error() {
    let harness = harness();
    harness.start_stream();

    harness.force_finish(&[Forced::failed(OperationKind::Read)]);
    harness.keep_polling();

    assert_eq!(
        harness.observed(),
        vec![
            ObservedEvent::Start,
            ObservedEvent::Error(Status::unavailable("read operation failed")),
        ]
    );
    assert_eq!(harness.state(), StreamState::Error);

    harness.on_queue(|stream| stream.finish());
    assert_eq!(harness.state(), StreamState::Finished);
    assert_eq!(harness.observer().errors().len(), 1);
}

#[test]
fn error_carries_final_status_from_call() {
    let harness = harness();
    harness
        .transport()
        .set_final_status(Status::new(StatusCode::PermissionDenied, "denied"));
    harness.on_queue(|stream| stream.start());

    harness.force_finish(&[Forced::failed(OperationKind::Start)]);

    assert_eq!(
        harness.observer().errors(),
        vec![Status::new(StatusCode::PermissionDenied, "denied")]
    );
}

#[test]
fn observer_does_not_receive_error_if_finished_by_caller() {
    let harness = harness();
    harness.start_stream();
    harness.keep_polling();

    harness.on_queue(|stream| stream.finish());

    assert!(harness.observer().errors().is_empty());
    assert_eq!(harness.state(), StreamState::Finished);
}

#[test]
fn error_on_start() {
    let harness = harness();
    harness.on_queue(|stream| stream.start());

    harness.force_finish(&[Forced::failed(OperationKind::Start)]);
    assert_eq!(
        harness.observed(),
        vec![ObservedEvent::Error(Status::unavailable("start operation failed"))]
    );
    assert_eq!(harness.state(), StreamState::Error);

    harness.on_queue(|stream| stream.finish());
    harness.force_finish(&[Forced::ok(OperationKind::Finish)]);
    assert_eq!(harness.state(), StreamState::Finished);
    assert!(harness.stream().finish_signal().is_finished());
    assert_eq!(harness.observed().len(), 1);
}

#[test]
fn error_on_write() {
    let harness = harness();
    harness.start_stream();
    harness.on_queue(|stream| stream.write(msg("w")));

    harness.force_finish(&[Forced::read(msg("r")), Forced::failed(OperationKind::Write)]);
    harness.keep_polling();

    assert_eq!(
        harness.observed().last(),
        Some(&ObservedEvent::Error(Status::unavailable(
            "write operation failed"
        )))
    );
    assert_eq!(harness.state(), StreamState::Error);
    // 失败后未完成的读取被取消，且不会再次发起。
    assert!(harness.transport().outstanding().is_empty());
}

#[test]
fn error_with_pending_writes_discards_them() {
    let harness = harness();
    harness.start_stream();
    harness.on_queue(|stream| {
        stream.write(msg("first"));
        stream.write(msg("second"));
    });

    harness.force_finish(&[Forced::read(msg("r")), Forced::failed(OperationKind::Write)]);
    harness.keep_polling();

    assert!(matches!(
        harness.observed().last(),
        Some(ObservedEvent::Error(_))
    ));
    assert_eq!(harness.stream().pending_writes(), 0);
    assert_eq!(harness.transport().written(), vec![msg("first")]);
}

#[test]
fn failure_after_write_and_finish_is_not_reported() {
    let harness = harness();
    harness.start_stream();
    harness.on_queue(|stream| {
        stream.write_and_finish(msg("last"));
    });

    harness.force_finish(&[Forced::failed(OperationKind::Write)]);
    harness.force_finish(&[Forced::ok(OperationKind::Finish)]);

    assert_eq!(harness.observed(), vec![ObservedEvent::Start]);
    assert_eq!(harness.state(), StreamState::Finished);
}

#[test]
fn raising_generation_stops_notifications() {
    let harness = harness();
    harness.start_stream();
    harness.force_finish(&[Forced::read(msg("before"))]);
    let before = harness.observed();

    harness.raise_generation();
    harness.on_queue(|stream| stream.write(msg("after")));
    harness.force_finish(&[
        Forced::read(msg("stale")),
        Forced::failed(OperationKind::Write),
    ]);

    // 提升之后发起的写入同样属于过期的流，失败也不会报告。
    assert_eq!(harness.observed(), before);
    assert!(harness.observer().errors().is_empty());
    assert_eq!(harness.transport().written(), vec![msg("after")]);
    // 过期的完成只释放槽位：不再续读，状态保持不变。
    assert!(harness.transport().outstanding().is_empty());
    assert_eq!(harness.state(), StreamState::Open);

    harness.on_queue(|stream| stream.finish());
    harness.force_finish(&[Forced::ok(OperationKind::Finish)]);
    assert_eq!(harness.observed(), before);
    assert_eq!(harness.state(), StreamState::Finished);
}

#[test]
fn operations_issued_after_raise_never_notify() {
    let harness = harness();
    harness.on_queue(|stream| stream.start());
    harness.raise_generation();
    harness.force_finish(&[Forced::ok(OperationKind::Start)]);
    assert_eq!(harness.state(), StreamState::Started);

    harness.on_queue(|stream| stream.finish());
    harness.force_finish(&[Forced::failed(OperationKind::Finish)]);

    assert!(harness.observed().is_empty());
    assert_eq!(harness.state(), StreamState::Finished);
}

#[cfg(debug_assertions)]
#[test]
fn calling_off_the_queue_panics() {
    let harness = harness();

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| harness.stream().start()));

    let message = panic_text(outcome.expect_err("off-queue call must be rejected"));
    assert!(message.contains("must be called on serial queue"), "{message}");
    assert_eq!(harness.state(), StreamState::Initial);
    assert!(harness.transport().history().is_empty());
}

#[test]
fn stale_start_completion_leaves_stream_started() {
    let harness = harness();
    harness.on_queue(|stream| stream.start());
    harness.raise_generation();

    harness.force_finish(&[Forced::ok(OperationKind::Start)]);

    assert!(harness.observed().is_empty());
    assert_eq!(harness.state(), StreamState::Started);
    assert!(harness.transport().outstanding().is_empty());

    harness.on_queue(|stream| stream.finish());
    harness.force_finish(&[Forced::ok(OperationKind::Finish)]);
    assert_eq!(harness.state(), StreamState::Finished);
}
