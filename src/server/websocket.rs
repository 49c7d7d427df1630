// Real-time socket server. Clients authenticate with their API token in the
// first frame, then receive the order and chat events addressed to them.
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_tungstenite::{WebSocketStream, tungstenite::Message};
use futures_util::{SinkExt, StreamExt};
use serde::{Serialize, Deserialize};
use uuid::Uuid;
use log::{debug, error, info, warn};

use crate::common::models::{Role, User};
use crate::server::app::SharedState;
use crate::server::auth::resolve_token;
use crate::server::chat::{self, NewChatMessage};
use crate::server::events::Topic;

const AUTH_TIMEOUT: Duration = Duration::from_secs(30);

/// Frames accepted from clients.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientFrame {
    #[serde(rename = "auth")]
    Auth { token: String },
    #[serde(rename = "joinRoom")]
    JoinRoom {
        #[serde(rename = "roomId")]
        room_id: String,
    },
    #[serde(rename = "leaveRoom")]
    LeaveRoom {
        #[serde(rename = "roomId")]
        room_id: String,
    },
    #[serde(rename = "sendMessage")]
    SendMessage {
        #[serde(rename = "roomId")]
        room_id: String,
        message: String,
    },
}

/// Frames the server sends outside of the event stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum ControlFrame {
    #[serde(rename = "authResponse", rename_all = "camelCase")]
    AuthResponse {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename = "error")]
    Error { message: String },
}

impl ControlFrame {
    fn auth_failed(error: impl Into<String>) -> Self {
        ControlFrame::AuthResponse { success: false, user_id: None, error: Some(error.into()) }
    }

    fn to_message(&self) -> Option<Message> {
        serde_json::to_string(self).ok().map(Message::Text)
    }
}

/// Topics a freshly authenticated connection listens on.
pub fn initial_topics(user: &User) -> HashSet<Topic> {
    let mut topics = HashSet::new();
    topics.insert(Topic::User(user.id.clone()));
    topics.insert(Topic::Role(user.role));
    if user.role == Role::Chef {
        topics.insert(Topic::Chef(user.id.clone()));
    }
    topics
}

pub type ClientId = String;

/// Accepts socket connections and tracks who is connected.
pub struct SocketServer {
    state: SharedState,
    connections: Arc<Mutex<HashMap<ClientId, String>>>,
}

impl SocketServer {
    pub fn new(state: SharedState) -> Arc<Self> {
        Arc::new(Self { state, connections: Arc::new(Mutex::new(HashMap::new())) })
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        info!("[WS] Listening on {}", listener.local_addr()?);
        loop {
            let (stream, addr) = listener.accept().await?;
            debug!("[WS] New connection from {}", addr);
            let server = self.clone();
            tokio::spawn(async move {
                match tokio_tungstenite::accept_async(stream).await {
                    Ok(ws_stream) => {
                        if let Err(e) = server.handle_connection(ws_stream).await {
                            warn!("[WS] Connection from {} ended with error: {}", addr, e);
                        }
                    }
                    Err(e) => error!("[WS] Handshake with {} failed: {}", addr, e),
                }
            });
        }
    }

    async fn authenticate(&self, ws_stream: &mut WebSocketStream<TcpStream>) -> anyhow::Result<Option<User>> {
        let first = tokio::time::timeout(AUTH_TIMEOUT, ws_stream.next()).await;
        let token = match first {
            Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(ClientFrame::Auth { token }) => token,
                Ok(_) | Err(_) => {
                    send_control(ws_stream, &ControlFrame::auth_failed("Expected an auth frame first")).await;
                    return Ok(None);
                }
            },
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                debug!("[WS:AUTH] Client left before authenticating");
                return Ok(None);
            }
            Ok(Some(Ok(_))) => {
                send_control(ws_stream, &ControlFrame::auth_failed("Expected text message for authentication")).await;
                return Ok(None);
            }
            Ok(Some(Err(e))) => return Err(e.into()),
            Err(_) => {
                info!("[WS:AUTH] Authentication timeout");
                send_control(ws_stream, &ControlFrame::auth_failed("Authentication timeout")).await;
                return Ok(None);
            }
        };

        match resolve_token(&self.state, &token).await {
            Ok(user) => {
                let ok = ControlFrame::AuthResponse { success: true, user_id: Some(user.id.clone()), error: None };
                send_control(ws_stream, &ok).await;
                Ok(Some(user))
            }
            Err(e) => {
                info!("[WS:AUTH] Rejected token: {}", e);
                send_control(ws_stream, &ControlFrame::auth_failed("Invalid or expired token")).await;
                Ok(None)
            }
        }
    }

    pub async fn handle_connection(&self, mut ws_stream: WebSocketStream<TcpStream>) -> anyhow::Result<()> {
        let user = match self.authenticate(&mut ws_stream).await? {
            Some(user) => user,
            None => {
                let _ = ws_stream.close(None).await;
                return Ok(());
            }
        };

        let client_id = Uuid::new_v4().to_string();
        self.connections.lock().await.insert(client_id.clone(), user.id.clone());
        info!("[WS] {} {} connected as client {}", user.role, user.id, client_id);

        let subscriptions = Arc::new(Mutex::new(initial_topics(&user)));
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        // Drain outgoing frames to the socket
        let mut send_task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if ws_sender.send(message).await.is_err() {
                    break;
                }
            }
        });

        // Forward bus events this connection is subscribed to
        let mut events = self.state.events.subscribe();
        let forward_subs = subscriptions.clone();
        let forward_tx = tx.clone();
        let forward_client = client_id.clone();
        let mut forward_task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(envelope) => {
                        if !envelope.is_for(forward_subs.lock().await.iter()) {
                            continue;
                        }
                        let Ok(text) = serde_json::to_string(&envelope.event) else { continue };
                        if forward_tx.send(Message::Text(text)).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("[WS] Client {} lagged, {} events dropped", forward_client, missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        // Handle frames from the client
        let state = self.state.clone();
        let recv_client = client_id.clone();
        let mut receive_task = tokio::spawn(async move {
            while let Some(message) = ws_receiver.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if let Some(reply) = handle_frame(&state, &user, &subscriptions, &text).await {
                            if let Some(msg) = reply.to_message() {
                                let _ = tx.send(msg);
                            }
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!("[WS] Read error on client {}: {}", recv_client, e);
                        break;
                    }
                }
            }
        });

        tokio::select! {
            _ = &mut send_task => {},
            _ = &mut forward_task => {},
            _ = &mut receive_task => {},
        }
        send_task.abort();
        forward_task.abort();
        receive_task.abort();

        self.connections.lock().await.remove(&client_id);
        info!("[WS] Client {} disconnected", client_id);
        Ok(())
    }
}

async fn send_control(ws_stream: &mut WebSocketStream<TcpStream>, frame: &ControlFrame) {
    if let Some(msg) = frame.to_message() {
        let _ = ws_stream.send(msg).await;
    }
}

/// Applies one client frame; returns a frame to send back, if any.
async fn handle_frame(
    state: &SharedState,
    user: &User,
    subscriptions: &Mutex<HashSet<Topic>>,
    text: &str,
) -> Option<ControlFrame> {
    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(e) => return Some(ControlFrame::Error { message: format!("Malformed frame: {}", e) }),
    };
    match frame {
        ClientFrame::Auth { .. } => Some(ControlFrame::Error { message: "Already authenticated".to_string() }),
        ClientFrame::JoinRoom { room_id } => {
            debug!("[WS] {} joined room {}", user.id, room_id);
            subscriptions.lock().await.insert(Topic::Room(room_id));
            None
        }
        ClientFrame::LeaveRoom { room_id } => {
            subscriptions.lock().await.remove(&Topic::Room(room_id));
            None
        }
        ClientFrame::SendMessage { room_id, message } => {
            let new_message = NewChatMessage {
                room_id,
                sender: user.name.clone(),
                message,
                sender_role: user.role.to_string(),
            };
            match chat::post_message(state, new_message).await {
                Ok(_) => None,
                Err(e) => Some(ControlFrame::Error { message: e.to_string() }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::models::from_timestamp;

    #[test]
    fn client_frames_parse() {
        let frame: ClientFrame = serde_json::from_str(r#"{"event":"joinRoom","data":{"roomId":"r1"}}"#).unwrap();
        assert_eq!(frame, ClientFrame::JoinRoom { room_id: "r1".into() });
        let frame: ClientFrame =
            serde_json::from_str(r#"{"event":"sendMessage","data":{"roomId":"r1","message":"hi"}}"#).unwrap();
        assert_eq!(frame, ClientFrame::SendMessage { room_id: "r1".into(), message: "hi".into() });
        assert!(serde_json::from_str::<ClientFrame>(r#"{"event":"shout","data":{}}"#).is_err());
    }

    #[test]
    fn auth_response_shape() {
        let json = serde_json::to_value(ControlFrame::auth_failed("nope")).unwrap();
        assert_eq!(json["event"], "authResponse");
        assert_eq!(json["data"]["success"], false);
        assert_eq!(json["data"]["error"], "nope");
        assert!(json["data"].get("userId").is_none());
    }

    #[test]
    fn chefs_also_listen_on_their_chef_topic() {
        let mut user = User {
            id: "u1".into(),
            name: "Lata".into(),
            email: "lata@example.com".into(),
            password_hash: String::new(),
            role: Role::Customer,
            verified: true,
            phone: None,
            address: None,
            created_at: from_timestamp(0),
        };
        assert!(!initial_topics(&user).contains(&Topic::Chef("u1".into())));
        user.role = Role::Chef;
        let topics = initial_topics(&user);
        assert!(topics.contains(&Topic::Chef("u1".into())));
        assert!(topics.contains(&Topic::Role(Role::Chef)));
        assert!(topics.contains(&Topic::User("u1".into())));
    }
}
