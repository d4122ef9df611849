/// Outcome Processor
///
/// Turns a finished invocation into persisted health state and a
/// REFRESH_WIDGET push to the widget's viewers.

use crate::presence::events::{channels, ClientEvent, EventBus, EventKind};
use crate::sandbox::SandboxError;
use crate::store::WidgetStore;
use crate::widget::{ExecutionOutcome, FailureKind, HealthState};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;

/// What the result awaiter needs from outcome handling
#[async_trait]
pub trait OutcomeHandling: Send + Sync {
    /// Persist an outcome and notify viewers
    async fn process(&self, outcome: &ExecutionOutcome) -> Result<()>;

    /// Record an invocation that produced no outcome (timeout, crash)
    async fn report_no_result(&self, message: &str, project_id: i64, widget_instance_id: i64) -> Result<()>;
}

/// Health state a failure kind leads to
pub fn next_state(failure_kind: FailureKind) -> HealthState {
    match failure_kind {
        FailureKind::None => HealthState::Running,
        FailureKind::Recoverable => HealthState::Warning,
        FailureKind::Fatal => HealthState::Stopped,
    }
}

pub struct OutcomeProcessor {
    store: Arc<dyn WidgetStore>,
    events: Arc<EventBus>,
}

impl OutcomeProcessor {
    pub fn new(store: Arc<dyn WidgetStore>, events: Arc<EventBus>) -> Self {
        Self { store, events }
    }

    /// Push the current widget payload without running its script
    pub async fn notify_widget_updated(&self, project_id: i64, widget_instance_id: i64) -> Result<()> {
        let Some(view) = self.store.widget_view(widget_instance_id).await? else {
            tracing::debug!("⏭️ Widget instance {} vanished before publishing", widget_instance_id);
            return Ok(());
        };
        let Some(token) = self.store.project_token(project_id).await? else {
            tracing::warn!("⚠️ No token for project {}, skipping refresh of {}", project_id, widget_instance_id);
            return Ok(());
        };

        let event = ClientEvent::new(EventKind::RefreshWidget, serde_json::to_value(&view)?);
        let on_dashboard = self.events.publish(&channels::dashboard(&token), event.clone());
        let on_widget = self.events.publish(&channels::widget(&token, widget_instance_id), event);

        tracing::debug!(
            "📤 Published widget {} ({:?}) to {} viewers",
            widget_instance_id,
            view.state,
            on_dashboard + on_widget
        );
        Ok(())
    }
}

#[async_trait]
impl OutcomeHandling for OutcomeProcessor {
    async fn process(&self, outcome: &ExecutionOutcome) -> Result<()> {
        let id = outcome.widget_instance_id;

        let state = match (outcome.failure_kind, outcome.data.clone()) {
            (FailureKind::None, Some(data)) => {
                let state = next_state(FailureKind::None);
                self.store
                    .persist_success(id, outcome.launched_at, outcome.log.clone(), data, state)
                    .await?;
                state
            }
            (FailureKind::None, None) => {
                // Retrying cannot produce the missing payload
                let message = SandboxError::InvalidResult("no data was produced".to_string()).to_string();
                tracing::warn!("⚠️ Successful outcome of widget instance {} carries no data", id);
                let state = next_state(FailureKind::Fatal);
                self.store
                    .persist_failure(id, outcome.launched_at, Some(message), state)
                    .await?;
                state
            }
            (kind, _) => {
                let state = next_state(kind);
                self.store
                    .persist_failure(id, outcome.launched_at, outcome.log.clone(), state)
                    .await?;
                state
            }
        };

        tracing::info!("✅ Widget instance {} is now {}", id, state.as_str());
        self.notify_widget_updated(outcome.project_id, id).await
    }

    async fn report_no_result(&self, message: &str, project_id: i64, widget_instance_id: i64) -> Result<()> {
        tracing::warn!("⏰ Widget instance {} produced no result: {}", widget_instance_id, message);
        self.store
            .persist_failure(
                widget_instance_id,
                Utc::now(),
                Some(message.to_string()),
                HealthState::Stopped,
            )
            .await?;
        self.notify_widget_updated(project_id, widget_instance_id).await
    }
}
