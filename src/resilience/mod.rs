//! 弹性调用层：重试退避、熔断器、执行器事件

pub mod circuit;
pub mod events;
pub mod executor;

pub use circuit::{CircuitKey, CircuitRegistry, CircuitSnapshot, CircuitState, CircuitStatus};
pub use events::{ExecutorEvent, Subscription};
pub use executor::{CallContext, FailureRecord, FailureStats, ResilientExecutor, RetryConfig};
