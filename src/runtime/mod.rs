/// Runtime Execution Engine
///
/// Everything between "this widget is due" and "its viewers saw the result":
/// - Recurring per-widget scheduling without overlap
/// - The bounded worker pool running sandboxed scripts
/// - Timeout-bounded awaiting of pending executions
/// - Outcome persistence and REFRESH_WIDGET publishing

// Per-widget recurring scheduler
pub mod scheduler;

// Bounded worker pool for sandboxed invocations
pub mod pool;

// Timeout and retry handling around one pending execution
pub mod awaiter;

// Health state transitions and client notification
pub mod outcome;

// Re-export main types
pub use awaiter::{AwaitVerdict, ResultAwaiter, TIMEOUT_MESSAGE};
pub use outcome::{next_state, OutcomeHandling, OutcomeProcessor};
pub use pool::{ExecutionError, ExecutionPool, PendingExecution};
pub use scheduler::{ExecutionScheduling, WidgetScheduler};
