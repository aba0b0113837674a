//! # 流状态机
//!
//! ## 状态机约束（What）
//! - 合法跃迁：`Initial → Started → Open → Error → Finishing → Finished`，其中
//!   `Initial`、`Started`、`Open` 均可直接进入 `Finishing`（调用方主动结束），
//!   `Initial` 还可直接进入 `Finished`（尚未发起任何传输操作）；
//! - `Finishing` 内部以 [`FinishStep`] 推进，步骤之间的切换视为 `Finishing → Finishing`；
//! - `Finished` 为终态，不接受任何跃迁。
//!
//! ## 结束原因（Why）
//! - [`FinishOrigin`] 记录进入 `Finishing` 的原因：调用方主动结束，或失败之后调用方释放传输；
//!   两种情况下都不会再向观察者发出 `on_stream_error`。

/// 进入 `Finishing` 的原因。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum FinishOrigin {
    /// 调用方在流健康时主动结束（`finish` 或 `write_and_finish`）。
    Caller,
    /// 流已经失败并通知过观察者，调用方结束以释放传输。
    AfterError,
}

/// `Finishing` 内部的推进步骤。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum FinishStep {
    /// `write_and_finish` 之后，等待排队写入全部发出并完成。
    FlushingWrites,
    /// 等待在途操作排空后发起 Finish。
    AwaitingOperations,
    /// Finish 已发出，等待其完成。
    Issued,
}

/// 流生命周期状态。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum StreamState {
    Initial,
    Started,
    Open,
    Finishing {
        origin: FinishOrigin,
        step: FinishStep,
    },
    Error,
    Finished,
}

impl StreamState {
    /// 判断状态是否允许跃迁至 `target`。
    pub fn can_transition_to(self, target: StreamState) -> bool {
        use StreamState::*;

        matches!(
            (self, target),
            (Initial, Started)
                | (Initial, Finished)
                | (
                    Initial | Started | Open,
                    Finishing {
                        origin: FinishOrigin::Caller,
                        ..
                    }
                )
                | (Started, Open)
                | (Started | Open, Error)
                | (
                    Error,
                    Finishing {
                        origin: FinishOrigin::AfterError,
                        ..
                    }
                )
                | (Finishing { .. }, Finishing { .. })
                | (Finishing { .. }, Finished)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, StreamState::Finished)
    }

    pub fn is_finishing(self) -> bool {
        matches!(self, StreamState::Finishing { .. })
    }

    /// 失败是否仍需通知观察者：只有 `Started` 与 `Open` 下的失败会产生 `on_stream_error`。
    pub fn reports_failures(self) -> bool {
        matches!(self, StreamState::Started | StreamState::Open)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CALLER_DRAIN: StreamState = StreamState::Finishing {
        origin: FinishOrigin::Caller,
        step: FinishStep::AwaitingOperations,
    };
    const ERROR_DRAIN: StreamState = StreamState::Finishing {
        origin: FinishOrigin::AfterError,
        step: FinishStep::AwaitingOperations,
    };

    #[test]
    fn forward_path_is_allowed() {
        use StreamState::*;
        assert!(Initial.can_transition_to(Started));
        assert!(Started.can_transition_to(Open));
        assert!(Open.can_transition_to(Error));
        assert!(Error.can_transition_to(ERROR_DRAIN));
        assert!(ERROR_DRAIN.can_transition_to(Finished));
        assert!(Initial.can_transition_to(Finished));
    }

    #[test]
    fn backwards_and_terminal_transitions_are_rejected() {
        use StreamState::*;
        assert!(!Open.can_transition_to(Started));
        assert!(!Started.can_transition_to(Initial));
        assert!(!Error.can_transition_to(Open));
        assert!(!Error.can_transition_to(CALLER_DRAIN));
        assert!(!Open.can_transition_to(ERROR_DRAIN));
        assert!(!CALLER_DRAIN.can_transition_to(Error));
        for target in [Initial, Started, Open, Error, CALLER_DRAIN, Finished] {
            assert!(!Finished.can_transition_to(target));
        }
        assert!(Finished.is_terminal());
    }

    #[test]
    fn only_live_states_report_failures() {
        use StreamState::*;
        assert!(Started.reports_failures());
        assert!(Open.reports_failures());
        for state in [Initial, Error, CALLER_DRAIN, ERROR_DRAIN, Finished] {
            assert!(!state.reports_failures(), "{state:?} must stay silent");
        }
    }
}
