/// Execution Result Awaiter
///
/// Waits on one pending execution under a floored timeout and resolves it into
/// exactly one terminal effect: the outcome processed, a no-result failure
/// recorded, or a verdict telling the owning schedule to fire again now.

use crate::runtime::outcome::OutcomeHandling;
use crate::runtime::pool::{ExecutionError, PendingExecution};
use crate::widget::{ExecutionDescriptor, ExecutionOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Message recorded when an execution runs past its bound
pub const TIMEOUT_MESSAGE: &str = "execution exceeded the configured timeout";

/// How one awaited execution ended, from the scheduler's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwaitVerdict {
    /// Outcome or failure recorded; continue at the normal cadence
    Completed,
    /// Recording failed; fire again immediately
    RescheduleNow,
    /// Execution was cancelled from elsewhere; nothing recorded
    Cancelled,
    /// Engine is shutting down; nothing recorded
    Interrupted,
}

pub struct ResultAwaiter {
    outcomes: Arc<dyn OutcomeHandling>,
    min_timeout: Duration,
    max_process_attempts: u32,
    shutdown: CancellationToken,
}

impl ResultAwaiter {
    pub fn new(
        outcomes: Arc<dyn OutcomeHandling>,
        min_timeout: Duration,
        max_process_attempts: u32,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            outcomes,
            min_timeout,
            max_process_attempts: max_process_attempts.max(1),
            shutdown,
        }
    }

    /// Configured timeout, never below the floor
    pub fn effective_timeout(&self, descriptor: &ExecutionDescriptor) -> Duration {
        let configured = Duration::from_secs(descriptor.timeout_seconds.unwrap_or(0).max(0) as u64);
        configured.max(self.min_timeout)
    }

    pub async fn await_outcome(&self, descriptor: &ExecutionDescriptor, mut pending: PendingExecution) -> AwaitVerdict {
        let timeout = self.effective_timeout(descriptor);
        let execution = pending.token().clone();
        let shutdown = self.shutdown.clone();
        let id = descriptor.widget_instance_id;

        let waited = tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::debug!("🛑 Stopped awaiting widget instance {} (shutdown)", id);
                return AwaitVerdict::Interrupted;
            }
            _ = execution.cancelled() => {
                tracing::debug!("⏭️ Execution of widget instance {} was cancelled", id);
                return AwaitVerdict::Cancelled;
            }
            waited = tokio::time::timeout(timeout, pending.wait()) => waited,
        };

        match waited {
            Ok(Ok(outcome)) => self.process_with_retries(outcome).await,
            Ok(Err(ExecutionError::Cancelled)) => AwaitVerdict::Cancelled,
            Ok(Err(error)) => {
                execution.cancel();
                tracing::error!("❌ Execution of widget instance {} failed: {}", id, error);
                self.report(descriptor, &error.to_string()).await
            }
            Err(_) => {
                execution.cancel();
                tracing::warn!("⏰ Widget instance {} exceeded {:?}, cancelling", id, timeout);
                self.report(descriptor, TIMEOUT_MESSAGE).await
            }
        }
    }

    async fn process_with_retries(&self, outcome: ExecutionOutcome) -> AwaitVerdict {
        for attempt in 1..=self.max_process_attempts {
            match self.outcomes.process(&outcome).await {
                Ok(()) => return AwaitVerdict::Completed,
                Err(e) => tracing::warn!(
                    "🔁 Processing outcome of widget instance {} failed (attempt {}/{}): {}",
                    outcome.widget_instance_id,
                    attempt,
                    self.max_process_attempts,
                    e
                ),
            }
        }

        tracing::error!(
            "❌ Giving up on outcome of widget instance {}, rescheduling now",
            outcome.widget_instance_id
        );
        AwaitVerdict::RescheduleNow
    }

    async fn report(&self, descriptor: &ExecutionDescriptor, message: &str) -> AwaitVerdict {
        match self
            .outcomes
            .report_no_result(message, descriptor.project_id, descriptor.widget_instance_id)
            .await
        {
            Ok(()) => AwaitVerdict::Completed,
            Err(e) => {
                tracing::error!(
                    "❌ Recording no-result for widget instance {} failed: {}",
                    descriptor.widget_instance_id,
                    e
                );
                AwaitVerdict::RescheduleNow
            }
        }
    }
}
