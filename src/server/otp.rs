// Email verification codes for account registration.
//
// Only a digest of each code is stored, keyed by email, next to its expiry.
// Entries live in SQLite by default or in redis (with a native TTL) when a
// redis url is configured.
use crate::common::crypto::CryptoManager;
use crate::common::models::{Role, User};
use crate::server::app::SharedState;
use crate::server::auth::self_service_role;
use crate::server::database::Database;
use crate::server::error::{ApiError, ApiResult};
use crate::server::mailer::otp_email;
use crate::server::users::{self, looks_like_email, normalize_email, NewUser};
use async_trait::async_trait;
use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use chrono::Utc;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::Row;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use log::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtpEntry {
    pub code_digest: String,
    pub expires_at: i64,
}

#[async_trait]
pub trait OtpStore: Send + Sync {
    /// Stores `entry` for `email`, replacing any earlier code.
    async fn put(&self, email: &str, entry: OtpEntry) -> anyhow::Result<()>;
    async fn get(&self, email: &str) -> anyhow::Result<Option<OtpEntry>>;
    async fn remove(&self, email: &str) -> anyhow::Result<()>;
    /// Drops entries that expired before `now`; returns how many were removed.
    async fn purge_expired(&self, now: i64) -> anyhow::Result<u64>;
}

pub struct SqliteOtpStore {
    db: Arc<Database>,
}

impl SqliteOtpStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl OtpStore for SqliteOtpStore {
    async fn put(&self, email: &str, entry: OtpEntry) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO otp_codes (email, code_digest, expires_at) VALUES (?, ?, ?) \
             ON CONFLICT(email) DO UPDATE SET code_digest = excluded.code_digest, expires_at = excluded.expires_at",
        )
        .bind(email)
        .bind(&entry.code_digest)
        .bind(entry.expires_at)
        .execute(&self.db.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, email: &str) -> anyhow::Result<Option<OtpEntry>> {
        let row = sqlx::query("SELECT code_digest, expires_at FROM otp_codes WHERE email = ?")
            .bind(email)
            .fetch_optional(&self.db.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(OtpEntry {
                code_digest: row.try_get("code_digest")?,
                expires_at: row.try_get("expires_at")?,
            })),
            None => Ok(None),
        }
    }

    async fn remove(&self, email: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM otp_codes WHERE email = ?")
            .bind(email)
            .execute(&self.db.pool)
            .await?;
        Ok(())
    }

    async fn purge_expired(&self, now: i64) -> anyhow::Result<u64> {
        let res = sqlx::query("DELETE FROM otp_codes WHERE expires_at < ?")
            .bind(now)
            .execute(&self.db.pool)
            .await?;
        Ok(res.rows_affected())
    }
}

pub struct RedisOtpStore {
    redis_manager: Arc<Mutex<ConnectionManager>>,
}

impl RedisOtpStore {
    pub async fn new(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let redis_manager = ConnectionManager::new(client).await?;
        Ok(Self { redis_manager: Arc::new(Mutex::new(redis_manager)) })
    }

    fn key(email: &str) -> String {
        format!("otp:{}", email)
    }
}

#[async_trait]
impl OtpStore for RedisOtpStore {
    async fn put(&self, email: &str, entry: OtpEntry) -> anyhow::Result<()> {
        let ttl = (entry.expires_at - Utc::now().timestamp()).max(1);
        let payload = serde_json::to_string(&entry)?;
        let mut conn = self.redis_manager.lock().await;
        let _: () = redis::cmd("SETEX")
            .arg(Self::key(email))
            .arg(ttl)
            .arg(payload)
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn get(&self, email: &str) -> anyhow::Result<Option<OtpEntry>> {
        let mut conn = self.redis_manager.lock().await;
        let payload: Option<String> = redis::cmd("GET")
            .arg(Self::key(email))
            .query_async(&mut *conn)
            .await?;
        match payload {
            Some(p) => Ok(Some(serde_json::from_str(&p)?)),
            None => Ok(None),
        }
    }

    async fn remove(&self, email: &str) -> anyhow::Result<()> {
        let mut conn = self.redis_manager.lock().await;
        let _: i64 = redis::cmd("DEL")
            .arg(Self::key(email))
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn purge_expired(&self, _now: i64) -> anyhow::Result<u64> {
        // redis expires keys itself
        Ok(0)
    }
}

/// Why a submitted code was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtpRejection {
    Missing,
    Expired,
    Mismatch,
}

impl OtpRejection {
    pub fn message(&self) -> &'static str {
        match self {
            OtpRejection::Missing => "No OTP request found for this email",
            OtpRejection::Expired => "OTP expired",
            OtpRejection::Mismatch => "Invalid OTP",
        }
    }
}

pub fn check_code(entry: Option<&OtpEntry>, email: &str, code: &str, now: i64) -> Result<(), OtpRejection> {
    let entry = entry.ok_or(OtpRejection::Missing)?;
    if now > entry.expires_at {
        return Err(OtpRejection::Expired);
    }
    if CryptoManager::otp_digest(email, code) != entry.code_digest {
        return Err(OtpRejection::Mismatch);
    }
    Ok(())
}

/// Periodically clears expired codes that were never verified.
pub fn start_purge_task(store: Arc<dyn OtpStore>, every: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            match store.purge_expired(Utc::now().timestamp()).await {
                Ok(0) => {}
                Ok(n) => info!("[OTP] Purged {} expired codes", n),
                Err(e) => warn!("[OTP] Purge failed: {}", e),
            }
        }
    });
}

fn store_error(e: anyhow::Error) -> ApiError {
    ApiError::Internal(e.context("otp store"))
}

#[derive(Debug, Deserialize)]
pub struct SendOtpRequest {
    #[serde(default)]
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct VerifyOtpRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
    pub role: Option<Role>,
    #[serde(default)]
    pub otp: Value,
}

/// Clients send the code either as a JSON string or a number.
fn code_from(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

async fn send_otp(
    State(state): State<SharedState>,
    Json(req): Json<SendOtpRequest>,
) -> ApiResult<Json<Value>> {
    let email = normalize_email(&req.email);
    if !looks_like_email(&email) {
        return Err(ApiError::validation("A valid email is required"));
    }
    if users::email_taken(&state.db, &email).await? {
        return Err(ApiError::Conflict("Email already registered".to_string()));
    }

    let code = CryptoManager::generate_otp_code();
    let entry = OtpEntry {
        code_digest: CryptoManager::otp_digest(&email, &code),
        expires_at: Utc::now().timestamp() + state.config.otp_ttl.as_secs() as i64,
    };
    state.otp.put(&email, entry).await.map_err(store_error)?;

    if let Err(e) = state.mailer.send(otp_email(&email, &code, state.config.otp_ttl)).await {
        error!("[OTP] Could not deliver code to {}: {}", email, e);
        if let Err(e) = state.otp.remove(&email).await {
            warn!("[OTP] Could not discard undelivered code for {}: {}", email, e);
        }
        return Err(ApiError::Upstream("Failed to send OTP".to_string()));
    }

    info!("[OTP] Code issued for {}", email);
    Ok(Json(json!({ "message": "OTP sent successfully" })))
}

#[derive(Debug, Serialize)]
struct VerifyResponse {
    message: &'static str,
    user: User,
}

async fn verify_otp(
    State(state): State<SharedState>,
    Json(req): Json<VerifyOtpRequest>,
) -> ApiResult<(StatusCode, Json<VerifyResponse>)> {
    let email = normalize_email(&req.email);
    let code = code_from(&req.otp).unwrap_or_default();
    let role = self_service_role(req.role)?;

    let entry = state.otp.get(&email).await.map_err(store_error)?;
    match check_code(entry.as_ref(), &email, &code, Utc::now().timestamp()) {
        Ok(()) => {}
        Err(OtpRejection::Expired) => {
            state.otp.remove(&email).await.map_err(store_error)?;
            info!("[OTP] Expired code presented for {}", email);
            return Err(ApiError::validation(OtpRejection::Expired.message()));
        }
        Err(rejection) => {
            info!("[OTP] Rejected code for {}: {:?}", email, rejection);
            return Err(ApiError::validation(rejection.message()));
        }
    }

    let user = users::create_user(
        &state.db,
        NewUser {
            name: &req.name,
            email: &email,
            password: &req.password,
            role,
            verified: true,
            phone: None,
            address: None,
        },
        state.config.argon2_salt_length,
    )
    .await?;
    state.otp.remove(&email).await.map_err(store_error)?;

    info!("[OTP] Registration completed for {}", email);
    Ok((StatusCode::CREATED, Json(VerifyResponse { message: "Registration successful", user })))
}

/// Routes mounted at /api/otp
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/send", post(send_otp))
        .route("/verify", post(verify_otp))
}
