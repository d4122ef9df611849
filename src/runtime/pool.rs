/// Bounded worker pool for script invocations
///
/// A semaphore caps concurrent interpreters at `worker_pool_size` no matter how
/// many widgets are scheduled. Each invocation runs on a blocking thread since
/// scripts block on network I/O.

use crate::sandbox::SandboxRunner;
use crate::widget::{ExecutionDescriptor, ExecutionOutcome};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

/// Why a pending execution produced no outcome
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("execution was cancelled")]
    Cancelled,

    #[error("execution crashed: {0}")]
    Crashed(String),

    #[error("execution pool is closed")]
    PoolClosed,
}

fn join_failure(error: JoinError) -> ExecutionError {
    if !error.is_panic() {
        return ExecutionError::Cancelled;
    }
    let payload = error.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "worker panicked".to_string());
    ExecutionError::Crashed(message)
}

/// Handle to a submitted invocation
///
/// Cancelling sets the token the injected interrupt checks observe; the
/// interpreter stops at its next block entry.
#[derive(Debug)]
pub struct PendingExecution {
    handle: JoinHandle<Result<ExecutionOutcome, ExecutionError>>,
    token: CancellationToken,
}

impl PendingExecution {
    /// Drive `future` on the runtime as a pending execution
    pub fn from_future<F>(future: F, token: CancellationToken) -> Self
    where
        F: Future<Output = Result<ExecutionOutcome, ExecutionError>> + Send + 'static,
    {
        Self {
            handle: tokio::spawn(future),
            token,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait for the invocation to finish
    pub async fn wait(&mut self) -> Result<ExecutionOutcome, ExecutionError> {
        match (&mut self.handle).await {
            Ok(result) => result,
            Err(e) => Err(join_failure(e)),
        }
    }
}

/// Fixed-size pool running sandboxed scripts on blocking threads
pub struct ExecutionPool {
    runner: Arc<SandboxRunner>,
    permits: Arc<Semaphore>,
    size: usize,
}

impl ExecutionPool {
    pub fn new(runner: Arc<SandboxRunner>, size: usize) -> Self {
        let size = size.max(1);
        tracing::info!("🧵 Execution pool ready with {} workers", size);
        Self {
            runner,
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Workers currently idle
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Queue one invocation; the permit wait is part of the pending time
    pub fn submit(&self, descriptor: ExecutionDescriptor, token: CancellationToken) -> PendingExecution {
        let runner = Arc::clone(&self.runner);
        let permits = Arc::clone(&self.permits);
        let run_token = token.clone();

        PendingExecution::from_future(
            async move {
                let permit = tokio::select! {
                    _ = run_token.cancelled() => return Err(ExecutionError::Cancelled),
                    permit = permits.acquire_owned() => permit.map_err(|_| ExecutionError::PoolClosed)?,
                };

                let blocking_token = run_token.clone();
                let outcome = tokio::task::spawn_blocking(move || {
                    let _permit = permit;
                    runner.execute(&descriptor, &blocking_token)
                })
                .await
                .map_err(join_failure)?;

                // A result that arrives after cancellation belongs to nobody
                if run_token.is_cancelled() {
                    return Err(ExecutionError::Cancelled);
                }
                Ok(outcome)
            },
            token,
        )
    }

    /// Refuse further submissions
    pub fn close(&self) {
        self.permits.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{PassthroughCodec, SandboxCapabilities};
    use crate::widget::{FailureKind, HealthState, Properties};

    fn pool(size: usize) -> ExecutionPool {
        let runner = SandboxRunner::new(Arc::new(PassthroughCodec), SandboxCapabilities::offline());
        ExecutionPool::new(Arc::new(runner), size)
    }

    fn descriptor(script: &str) -> ExecutionDescriptor {
        ExecutionDescriptor {
            project_id: 1,
            widget_instance_id: 3,
            script: script.to_string(),
            properties: Properties::new(),
            params: Vec::new(),
            previous_result: None,
            delay_seconds: 10,
            timeout_seconds: None,
            prior_outcome_was_success: false,
            current_health_state: HealthState::Stopped,
        }
    }

    #[tokio::test]
    async fn runs_scripts_on_workers() {
        let pool = pool(2);
        let mut pending = pool.submit(descriptor("function run() return '[1,2]' end"), CancellationToken::new());
        let outcome = pending.wait().await.unwrap();
        assert_eq!(outcome.failure_kind, FailureKind::None);
        assert_eq!(outcome.data.as_deref(), Some("[1,2]"));
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn cancelled_while_queued() {
        let pool = pool(1);
        let held = Arc::clone(&pool.permits).acquire_owned().await.unwrap();

        let token = CancellationToken::new();
        let mut pending = pool.submit(descriptor("function run() return '{}' end"), token.clone());
        token.cancel();

        assert_eq!(pending.wait().await, Err(ExecutionError::Cancelled));
        drop(held);
    }

    #[tokio::test]
    async fn cancelling_a_running_script_resolves_as_cancelled() {
        let pool = pool(1);
        let token = CancellationToken::new();
        let mut pending = pool.submit(descriptor("function run() while true do end end"), token.clone());

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        pending.cancel();

        assert_eq!(pending.wait().await, Err(ExecutionError::Cancelled));
        assert!(pending.is_cancelled());
    }

    #[tokio::test]
    async fn closed_pool_rejects_work() {
        let pool = pool(1);
        pool.close();
        let mut pending = pool.submit(descriptor("function run() return '{}' end"), CancellationToken::new());
        assert_eq!(pending.wait().await, Err(ExecutionError::PoolClosed));
    }

    async fn explode() -> Result<ExecutionOutcome, ExecutionError> {
        panic!("interpreter exploded")
    }

    #[tokio::test]
    async fn panics_surface_as_crashes() {
        let mut pending = PendingExecution::from_future(explode(), CancellationToken::new());
        assert_eq!(
            pending.wait().await,
            Err(ExecutionError::Crashed("interpreter exploded".to_string()))
        );
    }
}
