/// Client events and the in-process publish primitive
///
/// Every channel is a `tokio::sync::broadcast` sender created on first
/// subscription. Publishing to a channel nobody listens on is a no-op.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Event types understood by dashboard clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    ConnectDashboard,
    Disconnect,
    Reload,
    RefreshWidget,
}

/// `{type, date, content}` frame pushed to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub date: DateTime<Utc>,
    pub content: serde_json::Value,
}

impl ClientEvent {
    pub fn new(kind: EventKind, content: serde_json::Value) -> Self {
        Self {
            kind,
            date: Utc::now(),
            content,
        }
    }
}

/// Channel naming
pub mod channels {
    /// Every viewer of a dashboard
    pub fn dashboard(project_token: &str) -> String {
        format!("/dashboards/{}", project_token)
    }

    /// Viewers interested in a single widget instance
    pub fn widget(project_token: &str, widget_instance_id: i64) -> String {
        format!("/dashboards/{}/widgets/{}", project_token, widget_instance_id)
    }

    /// One connected client session
    pub fn client(session_id: &str) -> String {
        format!("/clients/{}", session_id)
    }

    /// A TV screen waiting to be paired with a dashboard
    pub fn screen(code: &str) -> String {
        format!("/screens/{}", code)
    }
}

/// Fan-out of client events by channel name
#[derive(Debug)]
pub struct EventBus {
    channels: DashMap<String, broadcast::Sender<ClientEvent>>,
    capacity: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<ClientEvent> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Deliver to current listeners; returns how many received it
    pub fn publish(&self, channel: &str, event: ClientEvent) -> usize {
        let delivered = match self.channels.get(channel) {
            Some(sender) => sender.send(event).ok(),
            None => return 0,
        };

        match delivered {
            Some(count) => {
                tracing::debug!("📣 Published to {} ({} listeners)", channel, count);
                count
            }
            None => {
                self.channels.remove_if(channel, |_, sender| sender.receiver_count() == 0);
                0
            }
        }
    }

    /// Drop channels whose listeners are all gone
    pub fn prune(&self) -> usize {
        let before = self.channels.len();
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
        before - self.channels.len()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serialises_with_type_tag() {
        let event = ClientEvent::new(EventKind::RefreshWidget, json!({"id": 4}));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "REFRESH_WIDGET");
        assert_eq!(value["content"]["id"], 4);
        assert!(value["date"].is_string());
    }

    #[tokio::test]
    async fn delivers_to_subscribers_only() {
        let bus = EventBus::default();
        let mut dashboard = bus.subscribe(&channels::dashboard("tok"));

        assert_eq!(bus.publish(&channels::dashboard("tok"), ClientEvent::new(EventKind::Reload, json!({}))), 1);
        assert_eq!(bus.publish(&channels::dashboard("other"), ClientEvent::new(EventKind::Reload, json!({}))), 0);

        let received = dashboard.recv().await.unwrap();
        assert_eq!(received.kind, EventKind::Reload);
    }

    #[test]
    fn idle_channels_are_pruned() {
        let bus = EventBus::default();
        let receiver = bus.subscribe(&channels::widget("tok", 9));
        let _kept = bus.subscribe(&channels::client("session"));
        assert_eq!(bus.channel_count(), 2);

        drop(receiver);
        assert_eq!(bus.publish(&channels::widget("tok", 9), ClientEvent::new(EventKind::RefreshWidget, json!(null))), 0);
        assert_eq!(bus.channel_count(), 1);
        assert_eq!(bus.prune(), 0);
    }
}
