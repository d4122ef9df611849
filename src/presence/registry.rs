/// Viewer Presence Registry
///
/// Tracks which client sessions watch which dashboards. The first viewer of a
/// dashboard starts its widgets, the last one leaving stops them.

use crate::presence::events::{channels, ClientEvent, EventBus, EventKind};
use crate::runtime::ExecutionScheduling;
use crate::store::WidgetStore;
use anyhow::Result;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;

/// One client subscription to one dashboard
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub session_id: String,
    pub subscription_id: String,
    pub project_token: String,
}

impl Subscription {
    pub fn new(
        session_id: impl Into<String>,
        subscription_id: impl Into<String>,
        project_token: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            subscription_id: subscription_id.into(),
            project_token: project_token.into(),
        }
    }

    fn is(&self, session_id: &str, subscription_id: &str) -> bool {
        self.session_id == session_id && self.subscription_id == subscription_id
    }
}

#[derive(Debug)]
struct DashboardPresence {
    project_id: i64,
    subscriptions: Vec<Subscription>,
}

/// Subscriptions keyed by dashboard token
pub struct PresenceRegistry {
    dashboards: DashMap<String, DashboardPresence>,
    store: Arc<dyn WidgetStore>,
    scheduler: Arc<dyn ExecutionScheduling>,
    events: Arc<EventBus>,
}

impl PresenceRegistry {
    pub fn new(store: Arc<dyn WidgetStore>, scheduler: Arc<dyn ExecutionScheduling>, events: Arc<EventBus>) -> Self {
        Self {
            dashboards: DashMap::new(),
            store,
            scheduler,
            events,
        }
    }

    /// Register a subscription; returns true when it was the dashboard's first
    ///
    /// A first subscription loads every widget of the dashboard and schedules
    /// it to fire immediately. If loading fails the subscription is rolled back.
    pub async fn subscribe(&self, project_id: i64, subscription: Subscription) -> Result<bool> {
        let token = subscription.project_token.clone();
        let session_id = subscription.session_id.clone();
        let subscription_id = subscription.subscription_id.clone();

        let first = {
            let mut presence = self
                .dashboards
                .entry(token.clone())
                .or_insert_with(|| DashboardPresence {
                    project_id,
                    subscriptions: Vec::new(),
                });
            let first = presence.subscriptions.is_empty();
            if !presence.subscriptions.iter().any(|s| s.is(&session_id, &subscription_id)) {
                presence.subscriptions.push(subscription);
            }
            first
        };

        tracing::info!("👀 Session {} subscribed to dashboard {} ({})", session_id, token, subscription_id);
        if !first {
            return Ok(false);
        }

        match self.store.execution_descriptors_for_project(project_id).await {
            Ok(descriptors) => {
                let scheduled = self.scheduler.schedule_bulk(&descriptors, true);
                tracing::info!("▶️ First viewer on project {}, started {} widgets", project_id, scheduled);
                self.stop_if_unwatched(&token, project_id);
                Ok(true)
            }
            Err(e) => {
                tracing::error!("❌ Could not load widgets of project {}: {}", project_id, e);
                self.unsubscribe(&session_id, &subscription_id);
                Err(e)
            }
        }
    }

    /// Undo a bulk schedule whose viewers all left while widgets were loading
    ///
    /// Runs under the entry lock, so a viewer arriving meanwhile either is
    /// seen here or becomes a new first subscriber that schedules afterwards.
    fn stop_if_unwatched(&self, token: &str, project_id: i64) {
        match self.dashboards.entry(token.to_string()) {
            Entry::Occupied(presence) if !presence.get().subscriptions.is_empty() => {}
            _ => {
                let cancelled = self.scheduler.cancel_all_for_project(project_id);
                tracing::info!(
                    "⏹️ Viewers of project {} left during start-up, stopped {} widgets",
                    project_id,
                    cancelled
                );
            }
        }
    }

    /// Subscribe through a public dashboard token
    pub async fn subscribe_token(&self, session_id: &str, subscription_id: &str, project_token: &str) -> Result<bool> {
        let project_id = self
            .store
            .project_id_for_token(project_token)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Unknown dashboard token: {}", project_token))?;
        self.subscribe(project_id, Subscription::new(session_id, subscription_id, project_token))
            .await
    }

    /// Drop one subscription; the last one of a dashboard stops its widgets
    pub fn unsubscribe(&self, session_id: &str, subscription_id: &str) -> bool {
        let Some(token) = self.token_of(session_id, subscription_id) else {
            return false;
        };

        let removed = match self.dashboards.get_mut(&token) {
            Some(mut presence) => {
                let before = presence.subscriptions.len();
                presence.subscriptions.retain(|s| !s.is(session_id, subscription_id));
                presence.subscriptions.len() != before
            }
            None => false,
        };
        if !removed {
            return false;
        }

        // Cancel under the shard lock; `stop_if_unwatched` re-checks under the same lock
        self.dashboards.remove_if(&token, |_, presence| {
            if !presence.subscriptions.is_empty() {
                return false;
            }
            let cancelled = self.scheduler.cancel_all_for_project(presence.project_id);
            tracing::info!(
                "⏹️ Last viewer left project {}, stopped {} widgets",
                presence.project_id,
                cancelled
            );
            true
        });

        tracing::info!("👋 Session {} unsubscribed from {} ({})", session_id, token, subscription_id);
        true
    }

    /// Drop every subscription of a closed session
    pub fn unsubscribe_session(&self, session_id: &str) -> usize {
        self.subscriptions_for_session(session_id)
            .iter()
            .filter(|s| self.unsubscribe(session_id, &s.subscription_id))
            .count()
    }

    pub fn count_subscribers(&self) -> usize {
        self.dashboards.iter().map(|presence| presence.subscriptions.len()).sum()
    }

    pub fn subscriptions_for_session(&self, session_id: &str) -> Vec<Subscription> {
        self.dashboards
            .iter()
            .flat_map(|presence| {
                presence
                    .subscriptions
                    .iter()
                    .filter(|s| s.session_id == session_id)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub fn find_subscription(&self, session_id: &str, subscription_id: &str) -> Option<Subscription> {
        self.dashboards.iter().find_map(|presence| {
            presence
                .subscriptions
                .iter()
                .find(|s| s.is(session_id, subscription_id))
                .cloned()
        })
    }

    /// Dashboards with at least one viewer
    pub fn watched_dashboards(&self) -> Vec<String> {
        self.dashboards.iter().map(|presence| presence.key().clone()).collect()
    }

    fn token_of(&self, session_id: &str, subscription_id: &str) -> Option<String> {
        self.find_subscription(session_id, subscription_id)
            .map(|s| s.project_token)
    }

    /// Ask every viewer of every dashboard to reload
    pub async fn reload_all_dashboards(&self) -> Result<usize> {
        let mut delivered = 0;
        for token in self.watched_dashboards() {
            delivered += self.reload_dashboard(&token).await?;
        }
        tracing::info!("🔁 Reload pushed to {} viewers", delivered);
        Ok(delivered)
    }

    /// Ask the viewers of one dashboard to reload
    pub async fn reload_dashboard(&self, project_token: &str) -> Result<usize> {
        let Some(project_id) = self.store.project_id_for_token(project_token).await? else {
            tracing::warn!("⚠️ Reload requested for unknown dashboard {}", project_token);
            return Ok(0);
        };
        let Some(view) = self.store.project_view(project_id).await? else {
            return Ok(0);
        };

        let event = ClientEvent::new(EventKind::Reload, serde_json::to_value(&view)?);
        Ok(self.events.publish(&channels::dashboard(project_token), event))
    }

    /// Tell one client session to drop its connection
    pub fn disconnect_client(&self, session_id: &str) -> usize {
        let event = ClientEvent::new(EventKind::Disconnect, json!({ "sessionId": session_id }));
        let delivered = self.events.publish(&channels::client(session_id), event);
        tracing::info!("🔌 Disconnect sent to session {} ({} listeners)", session_id, delivered);
        delivered
    }

    /// Pair a waiting screen with a dashboard
    pub async fn connect_screen(&self, code: &str, project_id: i64) -> Result<usize> {
        let view = self
            .store
            .project_view(project_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Project {} not found", project_id))?;

        let event = ClientEvent::new(EventKind::ConnectDashboard, serde_json::to_value(&view)?);
        let delivered = self.events.publish(&channels::screen(code), event);
        tracing::info!("📺 Screen {} connected to project {}", code, project_id);
        Ok(delivered)
    }
}
