/// WebSocket transport for dashboard viewers
///
/// Every connection is one client session. Text frames carry JSON actions that
/// drive the presence registry; events for the session's channels are
/// forwarded back as `{type, date, content}` frames.

use crate::api::dashboards::AppState;
use crate::presence::{channels, ClientEvent};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Frames a client may send
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientAction {
    /// Watch a dashboard, or a single widget of it
    #[serde(rename_all = "camelCase")]
    Subscribe {
        subscription_id: String,
        project_token: String,
        #[serde(default)]
        widget_instance_id: Option<i64>,
    },
    #[serde(rename_all = "camelCase")]
    Unsubscribe { subscription_id: String },
    /// A screen waiting for a CONNECT_DASHBOARD pairing
    #[serde(rename_all = "camelCase")]
    WatchScreen { code: String },
}

/// Create the WebSocket route
pub fn create_socket_routes() -> Router<AppState> {
    Router::new().route("/ws", get(ws_handler))
}

/// GET /ws
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| run_connection(socket, state))
}

/// Per-connection loop, lives for the whole session
async fn run_connection(socket: WebSocket, state: AppState) {
    let session_id = uuid::Uuid::new_v4().to_string();
    tracing::info!("🔌 New viewer session {}", session_id);

    let (mut sink, mut stream) = socket.split();
    let (outgoing, mut queue) = mpsc::channel::<String>(64);

    let writer = tokio::spawn(async move {
        while let Some(frame) = queue.recv().await {
            if sink.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    let mut forwarders: HashMap<String, JoinHandle<()>> = HashMap::new();
    let client_channel = state.events.subscribe(&channels::client(&session_id));
    let client_forwarder = forward(client_channel, outgoing.clone());

    let hello = json!({ "action": "CONNECTED", "sessionId": session_id }).to_string();
    if outgoing.send(hello).await.is_ok() {
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    let reply = handle_frame(&state, &session_id, text.as_str(), &mut forwarders, &outgoing).await;
                    if outgoing.send(reply.to_string()).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    }

    for (_, forwarder) in forwarders.drain() {
        forwarder.abort();
    }
    client_forwarder.abort();
    writer.abort();

    let dropped = state.presence.unsubscribe_session(&session_id);
    state.events.prune();
    tracing::info!("👋 Viewer session {} closed ({} subscriptions dropped)", session_id, dropped);
}

async fn handle_frame(
    state: &AppState,
    session_id: &str,
    text: &str,
    forwarders: &mut HashMap<String, JoinHandle<()>>,
    outgoing: &mpsc::Sender<String>,
) -> serde_json::Value {
    let action: ClientAction = match serde_json::from_str(text) {
        Ok(action) => action,
        Err(e) => {
            tracing::warn!("❌ Invalid frame from session {}: {}", session_id, e);
            return json!({ "action": "ERROR", "message": format!("invalid frame: {}", e) });
        }
    };

    match action {
        ClientAction::Subscribe {
            subscription_id,
            project_token,
            widget_instance_id,
        } => {
            if let Err(e) = state
                .presence
                .subscribe_token(session_id, &subscription_id, &project_token)
                .await
            {
                tracing::warn!("❌ Subscription {} of session {} refused: {}", subscription_id, session_id, e);
                return json!({ "action": "ERROR", "subscriptionId": subscription_id, "message": e.to_string() });
            }

            let channel = match widget_instance_id {
                Some(id) => channels::widget(&project_token, id),
                None => channels::dashboard(&project_token),
            };
            let forwarder = forward(state.events.subscribe(&channel), outgoing.clone());
            if let Some(previous) = forwarders.insert(subscription_id.clone(), forwarder) {
                previous.abort();
            }
            json!({ "action": "SUBSCRIBED", "subscriptionId": subscription_id })
        }
        ClientAction::Unsubscribe { subscription_id } => {
            if let Some(forwarder) = forwarders.remove(&subscription_id) {
                forwarder.abort();
            }
            let removed = state.presence.unsubscribe(session_id, &subscription_id);
            json!({ "action": "UNSUBSCRIBED", "subscriptionId": subscription_id, "removed": removed })
        }
        ClientAction::WatchScreen { code } => {
            let key = format!("screen:{}", code);
            let forwarder = forward(state.events.subscribe(&channels::screen(&code)), outgoing.clone());
            if let Some(previous) = forwarders.insert(key, forwarder) {
                previous.abort();
            }
            json!({ "action": "WATCHING", "code": code })
        }
    }
}

/// Pump one bus channel into the connection's outgoing queue
fn forward(mut events: broadcast::Receiver<ClientEvent>, outgoing: mpsc::Sender<String>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let frame = match serde_json::to_string(&event) {
                        Ok(frame) => frame,
                        Err(e) => {
                            tracing::error!("❌ Could not serialise event: {}", e);
                            continue;
                        }
                    };
                    if outgoing.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("⚠️ Slow viewer skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subscribe_frames() {
        let action: ClientAction =
            serde_json::from_str(r#"{"action":"SUBSCRIBE","subscriptionId":"sub-1","projectToken":"lobby"}"#).unwrap();
        assert_eq!(
            action,
            ClientAction::Subscribe {
                subscription_id: "sub-1".into(),
                project_token: "lobby".into(),
                widget_instance_id: None,
            }
        );

        let action: ClientAction = serde_json::from_str(
            r#"{"action":"SUBSCRIBE","subscriptionId":"sub-2","projectToken":"lobby","widgetInstanceId":7}"#,
        )
        .unwrap();
        assert!(matches!(action, ClientAction::Subscribe { widget_instance_id: Some(7), .. }));
    }

    #[test]
    fn parses_unsubscribe_and_screen_frames() {
        let action: ClientAction = serde_json::from_str(r#"{"action":"UNSUBSCRIBE","subscriptionId":"sub-1"}"#).unwrap();
        assert_eq!(action, ClientAction::Unsubscribe { subscription_id: "sub-1".into() });

        let action: ClientAction = serde_json::from_str(r#"{"action":"WATCH_SCREEN","code":"X7K2"}"#).unwrap();
        assert_eq!(action, ClientAction::WatchScreen { code: "X7K2".into() });
    }

    #[test]
    fn rejects_unknown_actions() {
        assert!(serde_json::from_str::<ClientAction>(r#"{"action":"DANCE"}"#).is_err());
    }

    #[tokio::test]
    async fn forwards_bus_events_as_json_frames() {
        use crate::presence::{EventBus, EventKind};

        let bus = EventBus::default();
        let (outgoing, mut queue) = mpsc::channel(4);
        let forwarder = forward(bus.subscribe(&channels::client("s1")), outgoing);

        bus.publish(&channels::client("s1"), ClientEvent::new(EventKind::Disconnect, json!({"sessionId": "s1"})));
        let frame: serde_json::Value = serde_json::from_str(&queue.recv().await.unwrap()).unwrap();
        assert_eq!(frame["type"], "DISCONNECT");
        assert_eq!(frame["content"]["sessionId"], "s1");
        forwarder.abort();
    }
}
