// Audience-scoped event bus feeding the real-time socket server.
//
// Every event carries the set of topics it is addressed to. Connections keep
// their own topic subscriptions and drop envelopes that do not match. With a
// redis url configured, envelopes travel through redis pub/sub so sockets held
// by other server instances see them too.
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use serde::{Serialize, Deserialize};
use tokio::sync::{Mutex, broadcast};
use log::{debug, info, warn, error};

use crate::common::models::{ChatMessage, OrderStatus, Role};

const REDIS_CHANNEL: &str = "homechef:events";
const LOCAL_CAPACITY: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "key", rename_all = "lowercase")]
pub enum Topic {
    User(String),
    Chef(String),
    Role(Role),
    Room(String),
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::User(id) => write!(f, "user:{}", id),
            Topic::Chef(id) => write!(f, "chef:{}", id),
            Topic::Role(role) => write!(f, "role:{}", role),
            Topic::Room(room) => write!(f, "room:{}", room),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "orderCreated")]
    OrderCreated { id: String },
    #[serde(rename = "orderUpdated")]
    OrderUpdated {
        #[serde(rename = "orderId")]
        order_id: String,
        status: OrderStatus,
    },
    #[serde(rename = "receiveMessage")]
    ReceiveMessage(ChatMessage),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub audience: Vec<Topic>,
    pub event: ServerEvent,
}

impl Envelope {
    pub fn is_for<'a>(&self, mut subscriptions: impl Iterator<Item = &'a Topic>) -> bool {
        subscriptions.any(|topic| self.audience.contains(topic))
    }
}

struct RedisRelay {
    manager: Mutex<ConnectionManager>,
}

#[derive(Clone)]
pub struct EventBus {
    local: broadcast::Sender<Envelope>,
    relay: Option<Arc<RedisRelay>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Single-instance bus, delivering only to sockets held by this process.
    pub fn new() -> Self {
        let (local, _) = broadcast::channel(LOCAL_CAPACITY);
        Self { local, relay: None }
    }

    /// Bus relayed through redis pub/sub. Starts the subscriber task.
    pub async fn with_redis(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let manager = ConnectionManager::new(client).await?;
        let bus = Self {
            local: broadcast::channel(LOCAL_CAPACITY).0,
            relay: Some(Arc::new(RedisRelay { manager: Mutex::new(manager) })),
        };
        bus.start_redis_subscriber(redis_url.to_string());
        info!("[EVENTS] Redis relay enabled on channel {}", REDIS_CHANNEL);
        Ok(bus)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.local.subscribe()
    }

    /// Fire-and-forget publication. Never waits on subscribers.
    pub fn publish(&self, audience: Vec<Topic>, event: ServerEvent) {
        let envelope = Envelope { audience, event };
        match &self.relay {
            Some(relay) => {
                let relay = relay.clone();
                let local = self.local.clone();
                tokio::spawn(async move {
                    let payload = match serde_json::to_string(&envelope) {
                        Ok(p) => p,
                        Err(e) => {
                            error!("[EVENTS] Failed to serialise envelope: {}", e);
                            return;
                        }
                    };
                    let mut conn = relay.manager.lock().await;
                    let published: redis::RedisResult<i64> = redis::cmd("PUBLISH")
                        .arg(REDIS_CHANNEL)
                        .arg(&payload)
                        .query_async(&mut *conn)
                        .await;
                    if let Err(e) = published {
                        warn!("[EVENTS] Redis publish failed ({}), delivering locally only", e);
                        let _ = local.send(envelope);
                    }
                });
            }
            None => self.deliver_local(envelope),
        }
    }

    fn deliver_local(&self, envelope: Envelope) {
        // An error only means nobody is connected right now
        match self.local.send(envelope) {
            Ok(receivers) => debug!("[EVENTS] Delivered to {} local receivers", receivers),
            Err(_) => debug!("[EVENTS] No connected receivers, event dropped"),
        }
    }

    fn start_redis_subscriber(&self, redis_url: String) {
        let local = self.local.clone();
        tokio::spawn(async move {
            loop {
                match subscribe_once(&redis_url, &local).await {
                    Ok(()) => warn!("[EVENTS] Redis subscription stream ended, reconnecting"),
                    Err(e) => error!("[EVENTS] Redis subscriber error: {}", e),
                }
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });
    }
}

async fn subscribe_once(redis_url: &str, local: &broadcast::Sender<Envelope>) -> anyhow::Result<()> {
    let client = redis::Client::open(redis_url)?;
    let conn = client.get_async_connection().await?;
    let mut pubsub = conn.into_pubsub();
    pubsub.subscribe(REDIS_CHANNEL).await?;
    info!("[EVENTS] Subscribed to redis channel {}", REDIS_CHANNEL);

    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(_) => continue,
        };
        match serde_json::from_str::<Envelope>(&payload) {
            Ok(envelope) => {
                let _ = local.send(envelope);
            }
            Err(e) => warn!("[EVENTS] Ignoring malformed relay payload: {}", e),
        }
    }
    Ok(())
}
