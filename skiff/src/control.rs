//! The control plane.
//!
//! A JSON-over-websocket endpoint for the GUI and CLI clients: inbound
//! commands (add/remove folder, config updates, shutdown), outbound
//! notifications about config and folder state. Connections are gated by an
//! origin allow-list; non-browser clients simply send no Origin header.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, info, warn};

const NOTIFICATION_CAP: usize = 256;

/// Inbound control commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlCommand {
    /// Start synchronizing a folder.
    AddFolder {
        /// Folder secret, textual form.
        secret: String,
        /// Root of the tree to synchronize.
        path: String,
    },
    /// Stop synchronizing a folder.
    RemoveFolder {
        /// Folder id, hex.
        folder_id: String,
    },
    /// Update one global config key.
    SetConfig {
        /// Top-level config key.
        key: String,
        /// New value.
        value: serde_json::Value,
    },
    /// Stop the daemon.
    Shutdown,
    /// Restart the daemon.
    Restart,
}

/// Outbound notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ControlNotification {
    /// A global config key changed.
    GlobalConfigChanged {
        /// The key.
        key: String,
        /// Its new value.
        value: serde_json::Value,
    },
    /// Global daemon state changed.
    GlobalStateChanged {
        /// State key.
        key: String,
        /// New value.
        value: serde_json::Value,
    },
    /// Per-folder state changed.
    FolderStateChanged {
        /// The folder, hex.
        folder_id: String,
        /// State key.
        key: String,
        /// New value.
        value: serde_json::Value,
    },
    /// A folder was added.
    FolderAdded {
        /// The folder, hex.
        folder_id: String,
        /// Its configuration.
        config: serde_json::Value,
    },
    /// A folder was removed.
    FolderRemoved {
        /// The folder, hex.
        folder_id: String,
    },
}

/// Handle for publishing notifications to connected control clients.
#[derive(Debug, Clone)]
pub struct ControlPublisher {
    tx: broadcast::Sender<ControlNotification>,
}

impl Default for ControlPublisher {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(NOTIFICATION_CAP);
        Self { tx }
    }
}

impl ControlPublisher {
    /// Publish a notification to every connected client.
    pub fn notify(&self, notification: ControlNotification) {
        // no receivers just means no clients are connected
        self.tx.send(notification).ok();
    }
}

#[derive(Clone)]
struct ControlState {
    commands: mpsc::Sender<ControlCommand>,
    notifications: broadcast::Sender<ControlNotification>,
    allowed_origins: Vec<String>,
}

/// The running control server.
#[derive(Debug)]
pub struct ControlServer {
    publisher: ControlPublisher,
    local_addr: SocketAddr,
    _task: AbortOnDropHandle<()>,
}

impl ControlServer {
    /// Serve the control websocket on `listen`.
    pub async fn spawn(
        listen: SocketAddr,
        allowed_origins: Vec<String>,
        commands: mpsc::Sender<ControlCommand>,
    ) -> Result<Self> {
        let publisher = ControlPublisher::default();
        let state = ControlState {
            commands,
            notifications: publisher.tx.clone(),
            allowed_origins,
        };
        let app = Router::new()
            .route("/v1/ws", get(ws_handler))
            .with_state(state);
        let listener = tokio::net::TcpListener::bind(listen)
            .await
            .with_context(|| format!("failed to bind control socket {listen}"))?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "control plane listening");
        let task = tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                warn!("control server stopped: {err}");
            }
        });
        Ok(Self {
            publisher,
            local_addr,
            _task: AbortOnDropHandle::new(task),
        })
    }

    /// Where the server actually listens.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Publisher side for daemon notifications.
    pub fn publisher(&self) -> ControlPublisher {
        self.publisher.clone()
    }
}

fn origin_allowed(headers: &HeaderMap, allowed: &[String]) -> bool {
    match headers.get("origin") {
        // non-browser clients send no origin
        None => true,
        Some(value) => match value.to_str() {
            Ok(origin) => allowed.iter().any(|entry| entry == origin),
            Err(_) => false,
        },
    }
}

async fn ws_handler(
    upgrade: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<ControlState>,
) -> impl IntoResponse {
    if !origin_allowed(&headers, &state.allowed_origins) {
        debug!("rejecting control connection from disallowed origin");
        return StatusCode::FORBIDDEN.into_response();
    }
    upgrade
        .on_upgrade(move |socket| client_loop(socket, state))
        .into_response()
}

async fn client_loop(socket: WebSocket, state: ControlState) {
    let (mut sink, mut stream) = socket.split();
    let mut notifications = state.notifications.subscribe();
    loop {
        tokio::select! {
            notification = notifications.recv() => {
                let Ok(notification) = notification else {
                    continue;
                };
                let Ok(text) = serde_json::to_string(&notification) else {
                    continue;
                };
                if sink.send(WsMessage::Text(text.into())).await.is_err() {
                    break;
                }
            },
            message = stream.next() => {
                let Some(Ok(message)) = message else {
                    break;
                };
                let WsMessage::Text(text) = message else {
                    continue;
                };
                match serde_json::from_str::<ControlCommand>(&text) {
                    Ok(command) => {
                        if state.commands.send(command).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => debug!("undecodable control command: {err}"),
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_json_shape() {
        let parsed: ControlCommand = serde_json::from_str(
            r#"{"command": "add_folder", "secret": "B1abc", "path": "/sync"}"#,
        )
        .unwrap();
        assert!(matches!(parsed, ControlCommand::AddFolder { .. }));

        let parsed: ControlCommand = serde_json::from_str(r#"{"command": "shutdown"}"#).unwrap();
        assert!(matches!(parsed, ControlCommand::Shutdown));
    }

    #[test]
    fn notification_json_shape() {
        let text = serde_json::to_string(&ControlNotification::FolderStateChanged {
            folder_id: "ab".into(),
            key: "state".into(),
            value: serde_json::json!("degraded"),
        })
        .unwrap();
        assert!(text.contains(r#""event":"folder_state_changed""#));
        assert!(text.contains("degraded"));
    }

    #[test]
    fn origin_rules() {
        let allowed = vec!["http://localhost:9090".to_string()];
        let mut headers = HeaderMap::new();
        assert!(origin_allowed(&headers, &allowed));
        headers.insert("origin", "http://localhost:9090".parse().unwrap());
        assert!(origin_allowed(&headers, &allowed));
        headers.insert("origin", "http://evil.example".parse().unwrap());
        assert!(!origin_allowed(&headers, &allowed));
    }
}
