//! 流引擎的测试桩集合。
//!
//! # 设计定位（Why）
//! - 流状态机的行为完全由“何时、以何种结果完成哪个在途操作”决定；真实传输无法在测试中
//!   精确控制这一点，因此提供一个脚本化传输，由测试逐个决定完成结果；
//! - 观察者回调发生在串行队列上，测试线程需要一个记录型实现来事后断言通知序列。
//!
//! # 使用方式（How）
//! - 大多数场景直接使用 [`harness::StreamHarness`]：它装配运行时、脚本化传输、记录型观察者与
//!   一条流，并提供 `force_finish`、`keep_polling` 等驱动方法；
//! - 需要自定义装配时，可单独使用 [`transport::ScriptedTransport`] 与
//!   [`observer::RecordingObserver`]。
//!
//! # 风险与权衡（Trade-offs）
//! - 脚本化传输的 `try_cancel` 会立即以失败结果交付该调用上除 Finish 之外的全部在途操作，
//!   比真实传输更“急切”；依赖取消时序的断言需要留意这一点。

pub mod harness;
pub mod observer;
pub mod transport;
