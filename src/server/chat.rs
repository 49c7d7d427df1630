// Room chat history. Messages posted over REST or the socket end up here and
// are fanned out to everyone who joined the room.
use crate::common::models::{from_timestamp, ChatMessage, Role};
use crate::server::app::SharedState;
use crate::server::error::{ApiError, ApiResult};
use crate::server::events::{ServerEvent, Topic};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use sqlx::{sqlite::SqliteRow, Row};
use log::debug;

fn row_to_message(row: &SqliteRow) -> Result<ChatMessage, sqlx::Error> {
    let role: String = row.try_get("sender_role")?;
    Ok(ChatMessage {
        id: row.try_get("id")?,
        room_id: row.try_get("room_id")?,
        sender: row.try_get("sender")?,
        message: row.try_get("message")?,
        sender_role: role.parse().map_err(|e: String| sqlx::Error::Decode(e.into()))?,
        created_at: from_timestamp(row.try_get("created_at")?),
    })
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct NewChatMessage {
    pub room_id: String,
    pub sender: String,
    pub message: String,
    pub sender_role: String,
}

pub fn validate(msg: &NewChatMessage, max_len: usize) -> ApiResult<Role> {
    if msg.room_id.trim().is_empty() || msg.sender.trim().is_empty() || msg.message.trim().is_empty() {
        return Err(ApiError::validation("roomId, sender and message are required"));
    }
    if msg.message.chars().count() > max_len {
        return Err(ApiError::validation(format!("Message exceeds {} characters", max_len)));
    }
    match msg.sender_role.parse::<Role>() {
        Ok(role @ (Role::Customer | Role::Community)) => Ok(role),
        _ => Err(ApiError::validation("senderRole must be customer or community")),
    }
}

/// Validates, persists and broadcasts one message to its room.
pub async fn post_message(state: &SharedState, msg: NewChatMessage) -> ApiResult<ChatMessage> {
    let sender_role = validate(&msg, state.config.max_message_length)?;
    let saved = ChatMessage {
        id: uuid::Uuid::new_v4().to_string(),
        room_id: msg.room_id.trim().to_string(),
        sender: msg.sender.trim().to_string(),
        message: msg.message,
        sender_role,
        created_at: from_timestamp(Utc::now().timestamp()),
    };

    sqlx::query("INSERT INTO chat_messages (id, room_id, sender, message, sender_role, created_at) VALUES (?, ?, ?, ?, ?, ?)")
        .bind(&saved.id)
        .bind(&saved.room_id)
        .bind(&saved.sender)
        .bind(&saved.message)
        .bind(saved.sender_role.as_str())
        .bind(saved.created_at.timestamp())
        .execute(&state.db.pool)
        .await?;

    debug!("[CHAT] {} -> room {}", saved.sender, saved.room_id);
    state.events.publish(
        vec![Topic::Room(saved.room_id.clone())],
        ServerEvent::ReceiveMessage(saved.clone()),
    );
    Ok(saved)
}

async fn room_history(
    State(state): State<SharedState>,
    Path(room_id): Path<String>,
) -> ApiResult<Json<Vec<ChatMessage>>> {
    let rows = sqlx::query(
        "SELECT id, room_id, sender, message, sender_role, created_at FROM chat_messages WHERE room_id = ? ORDER BY created_at, rowid",
    )
    .bind(&room_id)
    .fetch_all(&state.db.pool)
    .await?;
    let messages = rows.iter().map(row_to_message).collect::<Result<Vec<_>, _>>()?;
    Ok(Json(messages))
}

async fn send_message(
    State(state): State<SharedState>,
    Json(msg): Json<NewChatMessage>,
) -> ApiResult<(StatusCode, Json<ChatMessage>)> {
    let saved = post_message(&state, msg).await?;
    Ok((StatusCode::CREATED, Json(saved)))
}

/// Routes mounted at /api/chat
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/", post(send_message))
        .route("/{room_id}", get(room_history))
}
