use crate::common::crypto::CryptoManager;
use crate::common::models::{from_timestamp, Role, User};
use crate::server::app::SharedState;
use crate::server::auth::{require_auth, require_role, CurrentUser, ADMIN_ONLY, CHEF_ONLY};
use crate::server::database::Database;
use crate::server::error::{is_unique_violation, ApiError, ApiResult};
use crate::server::orders;
use crate::server::stats::{self, ChefEarnings};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware::from_fn_with_state,
    routing::{get, put},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::{sqlite::SqliteRow, Row};
use log::info;

const USER_COLUMNS: &str =
    "id, name, email, password_hash, role, verified, phone, address, created_at";

pub struct NewUser<'a> {
    pub name: &'a str,
    pub email: &'a str,
    pub password: &'a str,
    pub role: Role,
    pub verified: bool,
    pub phone: Option<&'a str>,
    pub address: Option<&'a str>,
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

pub fn looks_like_email(email: &str) -> bool {
    let email = email.trim();
    match email.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.'),
        None => false,
    }
}

fn row_to_user(row: &SqliteRow) -> Result<User, sqlx::Error> {
    let role: String = row.try_get("role")?;
    Ok(User {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        password_hash: row.try_get("password_hash")?,
        role: role.parse().map_err(|e: String| sqlx::Error::Decode(e.into()))?,
        verified: row.try_get::<i64, _>("verified")? != 0,
        phone: row.try_get("phone")?,
        address: row.try_get("address")?,
        created_at: from_timestamp(row.try_get("created_at")?),
    })
}

pub async fn find_active_by_id(db: &Database, id: &str) -> Result<Option<User>, sqlx::Error> {
    let sql = format!("SELECT {} FROM users WHERE id = ? AND deleted_at IS NULL", USER_COLUMNS);
    let row = sqlx::query(&sql).bind(id).fetch_optional(&db.pool).await?;
    row.as_ref().map(row_to_user).transpose()
}

pub async fn find_active_by_email(db: &Database, email: &str) -> Result<Option<User>, sqlx::Error> {
    let sql = format!("SELECT {} FROM users WHERE email = ? AND deleted_at IS NULL", USER_COLUMNS);
    let row = sqlx::query(&sql).bind(normalize_email(email)).fetch_optional(&db.pool).await?;
    row.as_ref().map(row_to_user).transpose()
}

/// Registered addresses stay reserved after a soft delete.
pub async fn email_taken(db: &Database, email: &str) -> Result<bool, sqlx::Error> {
    let row = sqlx::query("SELECT 1 FROM users WHERE email = ?")
        .bind(normalize_email(email))
        .fetch_optional(&db.pool)
        .await?;
    Ok(row.is_some())
}

pub async fn list_active(db: &Database, role: Option<Role>) -> Result<Vec<User>, sqlx::Error> {
    let rows = match role {
        Some(role) => {
            let sql = format!(
                "SELECT {} FROM users WHERE deleted_at IS NULL AND role = ? ORDER BY created_at, rowid",
                USER_COLUMNS
            );
            sqlx::query(&sql).bind(role.as_str()).fetch_all(&db.pool).await?
        }
        None => {
            let sql = format!("SELECT {} FROM users WHERE deleted_at IS NULL ORDER BY created_at, rowid", USER_COLUMNS);
            sqlx::query(&sql).fetch_all(&db.pool).await?
        }
    };
    rows.iter().map(row_to_user).collect()
}

pub async fn create_user(db: &Database, new_user: NewUser<'_>, salt_length: usize) -> ApiResult<User> {
    let name = new_user.name.trim();
    let email = normalize_email(new_user.email);
    if name.is_empty() || email.is_empty() || new_user.password.is_empty() {
        return Err(ApiError::validation("Name, email and password are required"));
    }
    if !looks_like_email(&email) {
        return Err(ApiError::validation("Invalid email address"));
    }

    let password_hash = CryptoManager::hash_password(new_user.password, salt_length)
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("password hashing failed: {}", e)))?;
    let user = User {
        id: uuid::Uuid::new_v4().to_string(),
        name: name.to_string(),
        email,
        password_hash,
        role: new_user.role,
        verified: new_user.verified,
        phone: new_user.phone.map(str::to_string),
        address: new_user.address.map(str::to_string),
        created_at: from_timestamp(Utc::now().timestamp()),
    };

    let res = sqlx::query(
        "INSERT INTO users (id, name, email, password_hash, role, verified, phone, address, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&user.id)
    .bind(&user.name)
    .bind(&user.email)
    .bind(&user.password_hash)
    .bind(user.role.as_str())
    .bind(user.verified as i64)
    .bind(&user.phone)
    .bind(&user.address)
    .bind(user.created_at.timestamp())
    .execute(&db.pool)
    .await;

    match res {
        Ok(_) => {
            info!("[USERS] Created {} account {} ({})", user.role, user.id, user.email);
            Ok(user)
        }
        Err(e) if is_unique_violation(&e) => Err(ApiError::Conflict("User already exists".to_string())),
        Err(e) => Err(e.into()),
    }
}

/// Writes the mutable profile fields of `user` back to the store.
pub async fn save_user(db: &Database, user: &User) -> ApiResult<()> {
    let res = sqlx::query(
        "UPDATE users SET name = ?, email = ?, password_hash = ?, role = ?, verified = ?, phone = ?, address = ? WHERE id = ? AND deleted_at IS NULL",
    )
    .bind(&user.name)
    .bind(normalize_email(&user.email))
    .bind(&user.password_hash)
    .bind(user.role.as_str())
    .bind(user.verified as i64)
    .bind(&user.phone)
    .bind(&user.address)
    .bind(&user.id)
    .execute(&db.pool)
    .await;

    match res {
        Ok(r) if r.rows_affected() == 0 => Err(ApiError::not_found("User not found")),
        Ok(_) => Ok(()),
        Err(e) if is_unique_violation(&e) => Err(ApiError::Conflict("Email already registered".to_string())),
        Err(e) => Err(e.into()),
    }
}

/// Soft-deletes a user and, in the same transaction, every dish they own.
pub async fn soft_delete_user(db: &Database, user_id: &str) -> ApiResult<()> {
    let now = Utc::now().timestamp();
    let mut tx = db.pool.begin().await?;
    let res = sqlx::query("UPDATE users SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL")
        .bind(now)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
    if res.rows_affected() == 0 {
        return Err(ApiError::not_found("User not found"));
    }
    let dishes = sqlx::query("UPDATE dishes SET deleted_at = ?, available = 0 WHERE chef_id = ? AND deleted_at IS NULL")
        .bind(now)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    info!("[USERS] Deleted user {} (cascaded to {} dishes)", user_id, dishes.rows_affected());
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateUserRequest {
    pub name: String,
    pub email: String,
    pub password: String,
    pub role: Option<Role>,
    pub phone: Option<String>,
    pub address: Option<String>,
    #[serde(default)]
    pub verified: bool,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AdminUpdateUserRequest {
    pub name: Option<String>,
    pub email: Option<String>,
    pub role: Option<Role>,
    pub verified: Option<bool>,
    pub phone: Option<String>,
    pub address: Option<String>,
}

async fn list_users(State(state): State<SharedState>) -> ApiResult<Json<Vec<User>>> {
    Ok(Json(list_active(&state.db, None).await?))
}

async fn create_user_handler(
    State(state): State<SharedState>,
    Json(req): Json<CreateUserRequest>,
) -> ApiResult<(StatusCode, Json<User>)> {
    let user = create_user(
        &state.db,
        NewUser {
            name: &req.name,
            email: &req.email,
            password: &req.password,
            role: req.role.unwrap_or(Role::Customer),
            verified: req.verified,
            phone: req.phone.as_deref(),
            address: req.address.as_deref(),
        },
        state.config.argon2_salt_length,
    )
    .await?;
    Ok((StatusCode::CREATED, Json(user)))
}

async fn update_user_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<AdminUpdateUserRequest>,
) -> ApiResult<Json<User>> {
    let mut user = find_active_by_id(&state.db, &id)
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))?;

    if let Some(name) = req.name.filter(|n| !n.trim().is_empty()) {
        user.name = name.trim().to_string();
    }
    if let Some(email) = req.email.filter(|e| !e.trim().is_empty()) {
        if !looks_like_email(&email) {
            return Err(ApiError::validation("Invalid email address"));
        }
        user.email = normalize_email(&email);
    }
    if let Some(role) = req.role {
        user.role = role;
    }
    if let Some(verified) = req.verified {
        user.verified = verified;
    }
    if req.phone.is_some() {
        user.phone = req.phone;
    }
    if req.address.is_some() {
        user.address = req.address;
    }

    save_user(&state.db, &user).await?;
    info!("[USERS] Admin updated user {}", user.id);
    Ok(Json(user))
}

async fn delete_user_handler(
    State(state): State<SharedState>,
    CurrentUser(admin): CurrentUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    if admin.id == id {
        return Err(ApiError::validation("Admins cannot delete their own account here"));
    }
    soft_delete_user(&state.db, &id).await?;
    Ok(Json(json!({ "message": "User deleted successfully" })))
}

async fn list_chefs(State(state): State<SharedState>) -> ApiResult<Json<Vec<User>>> {
    Ok(Json(list_active(&state.db, Some(Role::Chef)).await?))
}

async fn verify_chef(State(state): State<SharedState>, Path(id): Path<String>) -> ApiResult<Json<User>> {
    let mut chef = find_active_by_id(&state.db, &id)
        .await?
        .filter(|u| u.role == Role::Chef)
        .ok_or_else(|| ApiError::not_found("Chef not found"))?;
    chef.verified = true;
    save_user(&state.db, &chef).await?;
    info!("[USERS] Chef {} verified", chef.id);
    Ok(Json(chef))
}

async fn chef_earnings(
    State(state): State<SharedState>,
    CurrentUser(chef): CurrentUser,
) -> ApiResult<Json<ChefEarnings>> {
    let orders = orders::orders_for_chef(&state.db, &chef.id).await?;
    Ok(Json(stats::chef_earnings(&orders)))
}

/// Routes mounted at /api/chefs
pub fn chefs_router(state: SharedState) -> Router<SharedState> {
    let admin = Router::new()
        .route("/", get(list_chefs))
        .route("/{id}/verify", put(verify_chef))
        .route_layer(from_fn_with_state(ADMIN_ONLY, require_role));

    let chef = Router::new()
        .route("/earnings", get(chef_earnings))
        .route_layer(from_fn_with_state(CHEF_ONLY, require_role));

    admin.merge(chef).route_layer(from_fn_with_state(state, require_auth))
}

/// Routes mounted at /api/users (admin only)
pub fn router(state: SharedState) -> Router<SharedState> {
    Router::new()
        .route("/", get(list_users).post(create_user_handler))
        .route("/{id}", put(update_user_handler).delete(delete_user_handler))
        .route_layer(from_fn_with_state(ADMIN_ONLY, require_role))
        .route_layer(from_fn_with_state(state, require_auth))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> Database {
        Database::open("sqlite::memory:").await.unwrap()
    }

    fn new_user<'a>(email: &'a str, role: Role) -> NewUser<'a> {
        NewUser {
            name: "Meera",
            email,
            password: "pw-123456",
            role,
            verified: false,
            phone: None,
            address: None,
        }
    }

    #[tokio::test]
    async fn duplicate_email_is_conflict() {
        let db = test_db().await;
        create_user(&db, new_user("meera@example.com", Role::Customer), 16).await.unwrap();
        let err = create_user(&db, new_user(" Meera@Example.com", Role::Chef), 16).await.unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));
    }

    #[tokio::test]
    async fn soft_delete_cascades_to_dishes() {
        let db = test_db().await;
        let chef = create_user(&db, new_user("chef@example.com", Role::Chef), 16).await.unwrap();
        sqlx::query("INSERT INTO dishes (id, chef_id, name, price, created_at) VALUES ('d1', ?, 'Thali', 120.0, 0)")
            .bind(&chef.id)
            .execute(&db.pool)
            .await
            .unwrap();

        soft_delete_user(&db, &chef.id).await.unwrap();

        assert!(find_active_by_id(&db, &chef.id).await.unwrap().is_none());
        let deleted: Option<i64> = sqlx::query_scalar("SELECT deleted_at FROM dishes WHERE id = 'd1'")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert!(deleted.is_some());
        assert!(email_taken(&db, "chef@example.com").await.unwrap());
    }

    #[tokio::test]
    async fn deleting_twice_is_not_found() {
        let db = test_db().await;
        let user = create_user(&db, new_user("x@example.com", Role::Customer), 16).await.unwrap();
        soft_delete_user(&db, &user.id).await.unwrap();
        let err = soft_delete_user(&db, &user.id).await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[test]
    fn email_shape() {
        assert!(looks_like_email("a@b.co"));
        assert!(!looks_like_email("a@b"));
        assert!(!looks_like_email("@b.co"));
        assert!(!looks_like_email("plain"));
    }
}
