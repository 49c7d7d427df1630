use crate::common::models::{from_timestamp, Post};
use crate::server::app::SharedState;
use crate::server::auth::{require_auth, CurrentUser};
use crate::server::database::Database;
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

const POST_COLUMNS: &str = "id, title, content, author, image, created_at, updated_at";

fn row_to_post(row: &SqliteRow) -> Result<Post, sqlx::Error> {
    Ok(Post {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        content: row.try_get("content")?,
        author: row.try_get("author")?,
        image: row.try_get("image")?,
        created_at: from_timestamp(row.try_get("created_at")?),
        updated_at: from_timestamp(row.try_get("updated_at")?),
    })
}

async fn find_post(db: &Database, id: &str) -> Result<Option<Post>, sqlx::Error> {
    let sql = format!("SELECT {} FROM posts WHERE id = ?", POST_COLUMNS);
    let row = sqlx::query(&sql).bind(id).fetch_optional(&db.pool).await?;
    row.as_ref().map(row_to_post).transpose()
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct CreatePostRequest {
    pub title: String,
    pub content: String,
    pub image: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct UpdatePostRequest {
    pub title: Option<String>,
    pub content: Option<String>,
    pub author: Option<String>,
    pub image: Option<String>,
}

async fn list_posts(State(state): State<SharedState>) -> ApiResult<Json<Vec<Post>>> {
    let sql = format!("SELECT {} FROM posts ORDER BY created_at DESC, rowid DESC", POST_COLUMNS);
    let rows = sqlx::query(&sql).fetch_all(&state.db.pool).await?;
    let posts = rows.iter().map(row_to_post).collect::<Result<Vec<_>, _>>()?;
    Ok(Json(posts))
}

async fn create_post(
    State(state): State<SharedState>,
    CurrentUser(author): CurrentUser,
    Json(req): Json<CreatePostRequest>,
) -> ApiResult<(StatusCode, Json<Post>)> {
    let title = req.title.trim();
    let content = req.content.trim();
    if title.is_empty() || content.is_empty() {
        return Err(ApiError::validation("Title and content are required"));
    }

    let now = from_timestamp(Utc::now().timestamp());
    let post = Post {
        id: uuid::Uuid::new_v4().to_string(),
        title: title.to_string(),
        content: content.to_string(),
        author: author.name.clone(),
        image: req.image.filter(|i| !i.trim().is_empty()),
        created_at: now,
        updated_at: now,
    };

    sqlx::query("INSERT INTO posts (id, title, content, author, image, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?)")
        .bind(&post.id)
        .bind(&post.title)
        .bind(&post.content)
        .bind(&post.author)
        .bind(&post.image)
        .bind(now.timestamp())
        .bind(now.timestamp())
        .execute(&state.db.pool)
        .await?;

    info!("[POSTS] {} published post {}", author.id, post.id);
    Ok((StatusCode::CREATED, Json(post)))
}

async fn update_post(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<UpdatePostRequest>,
) -> ApiResult<Json<Post>> {
    let mut post = find_post(&state.db, &id)
        .await?
        .ok_or_else(|| ApiError::not_found("Post not found"))?;

    if let Some(title) = req.title.filter(|t| !t.trim().is_empty()) {
        post.title = title.trim().to_string();
    }
    if let Some(content) = req.content.filter(|c| !c.trim().is_empty()) {
        post.content = content.trim().to_string();
    }
    if let Some(author) = req.author.filter(|a| !a.trim().is_empty()) {
        post.author = author.trim().to_string();
    }
    if req.image.is_some() {
        post.image = req.image;
    }
    post.updated_at = from_timestamp(Utc::now().timestamp());

    sqlx::query("UPDATE posts SET title = ?, content = ?, author = ?, image = ?, updated_at = ? WHERE id = ?")
        .bind(&post.title)
        .bind(&post.content)
        .bind(&post.author)
        .bind(&post.image)
        .bind(post.updated_at.timestamp())
        .bind(&post.id)
        .execute(&state.db.pool)
        .await?;
    Ok(Json(post))
}

async fn delete_post(State(state): State<SharedState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    let res = sqlx::query("DELETE FROM posts WHERE id = ?")
        .bind(&id)
        .execute(&state.db.pool)
        .await?;
    if res.rows_affected() == 0 {
        return Err(ApiError::not_found("Post not found"));
    }
    info!("[POSTS] Deleted post {}", id);
    Ok(Json(json!({ "message": "Post deleted" })))
}

/// Routes mounted at /api/posts
pub fn router(state: SharedState) -> Router<SharedState> {
    let protected = Router::new()
        .route("/", post(create_post))
        .route("/{id}", put(update_post).delete(delete_post))
        .route_layer(from_fn_with_state(state, require_auth));

    Router::new().route("/", get(list_posts)).merge(protected)
}
