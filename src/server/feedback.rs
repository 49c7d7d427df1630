use crate::common::models::{from_timestamp, Feedback};
use crate::server::app::SharedState;
use crate::server::auth::{require_auth, require_role, OptionalUser, ADMIN_ONLY, ADMIN_OR_CHEF};
use crate::server::error::{ApiError, ApiResult};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware::from_fn_with_state,
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::{sqlite::SqliteRow, Row};
use log::info;

fn row_to_feedback(row: &SqliteRow) -> Result<Feedback, sqlx::Error> {
    Ok(Feedback {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        customer_name: row.try_get("customer_name")?,
        rating: row.try_get("rating")?,
        message: row.try_get("message")?,
        created_at: from_timestamp(row.try_get("created_at")?),
    })
}

fn check_rating(rating: Option<i64>) -> ApiResult<Option<i64>> {
    match rating {
        Some(r) if !(1..=5).contains(&r) => Err(ApiError::validation("Rating must be between 1 and 5")),
        other => Ok(other),
    }
}

#[derive(Debug, Deserialize)]
pub struct FeedbackRequest {
    #[serde(default)]
    pub message: String,
    pub rating: Option<i64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct UpdateFeedbackRequest {
    pub message: Option<String>,
    pub rating: Option<i64>,
}

async fn post_feedback(
    State(state): State<SharedState>,
    OptionalUser(user): OptionalUser,
    Json(req): Json<FeedbackRequest>,
) -> ApiResult<(StatusCode, Json<Feedback>)> {
    let message = req.message.trim();
    if message.is_empty() {
        return Err(ApiError::validation("Feedback message is required"));
    }
    let feedback = Feedback {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: user.as_ref().map(|u| u.id.clone()),
        customer_name: user.as_ref().map(|u| u.name.clone()).unwrap_or_else(|| "Anonymous".to_string()),
        rating: check_rating(req.rating)?,
        message: message.to_string(),
        created_at: from_timestamp(Utc::now().timestamp()),
    };

    sqlx::query("INSERT INTO feedback (id, user_id, customer_name, rating, message, created_at) VALUES (?, ?, ?, ?, ?, ?)")
        .bind(&feedback.id)
        .bind(&feedback.user_id)
        .bind(&feedback.customer_name)
        .bind(feedback.rating)
        .bind(&feedback.message)
        .bind(feedback.created_at.timestamp())
        .execute(&state.db.pool)
        .await?;

    info!("[FEEDBACK] New feedback {} from {}", feedback.id, feedback.customer_name);
    Ok((StatusCode::CREATED, Json(feedback)))
}

async fn list_feedback(State(state): State<SharedState>) -> ApiResult<Json<Vec<Feedback>>> {
    let rows = sqlx::query(
        "SELECT id, user_id, customer_name, rating, message, created_at FROM feedback ORDER BY created_at DESC, rowid DESC",
    )
    .fetch_all(&state.db.pool)
    .await?;
    let feedback = rows.iter().map(row_to_feedback).collect::<Result<Vec<_>, _>>()?;
    Ok(Json(feedback))
}

async fn update_feedback(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateFeedbackRequest>,
) -> ApiResult<Json<Feedback>> {
    let row = sqlx::query("SELECT id, user_id, customer_name, rating, message, created_at FROM feedback WHERE id = ?")
        .bind(&id)
        .fetch_optional(&state.db.pool)
        .await?
        .ok_or_else(|| ApiError::not_found("Feedback not found"))?;
    let mut feedback = row_to_feedback(&row)?;

    if let Some(message) = req.message {
        let message = message.trim();
        if message.is_empty() {
            return Err(ApiError::validation("Feedback message is required"));
        }
        feedback.message = message.to_string();
    }
    if req.rating.is_some() {
        feedback.rating = check_rating(req.rating)?;
    }

    sqlx::query("UPDATE feedback SET message = ?, rating = ? WHERE id = ?")
        .bind(&feedback.message)
        .bind(feedback.rating)
        .bind(&feedback.id)
        .execute(&state.db.pool)
        .await?;
    Ok(Json(feedback))
}

async fn delete_feedback(State(state): State<SharedState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    let res = sqlx::query("DELETE FROM feedback WHERE id = ?")
        .bind(&id)
        .execute(&state.db.pool)
        .await?;
    if res.rows_affected() == 0 {
        return Err(ApiError::not_found("Feedback not found"));
    }
    info!("[FEEDBACK] Deleted feedback {}", id);
    Ok(Json(json!({ "message": "Feedback deleted" })))
}

/// Routes mounted at /api/feedback
pub fn router(state: SharedState) -> Router<SharedState> {
    let viewers = Router::new()
        .route("/", get(list_feedback))
        .route_layer(from_fn_with_state(ADMIN_OR_CHEF, require_role));

    let admin = Router::new()
        .route("/{id}", put(update_feedback).delete(delete_feedback))
        .route_layer(from_fn_with_state(ADMIN_ONLY, require_role));

    let protected = viewers
        .merge(admin)
        .route_layer(from_fn_with_state(state, require_auth));

    Router::new()
        .route("/", post(post_feedback))
        .merge(protected)
}
