// Token issue/verification, the authentication and role middleware, and the
// /api/auth handlers (register, login, profile).
use crate::common::crypto::CryptoManager;
use crate::common::models::{Role, User};
use crate::server::app::SharedState;
use crate::server::error::{ApiError, ApiResult};
use crate::server::users::{self, looks_like_email, normalize_email, NewUser};
use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderMap, StatusCode},
    middleware::{from_fn_with_state, Next},
    response::Response,
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use log::{info, warn};

pub const ADMIN_ONLY: &[Role] = &[Role::Admin];
pub const CHEF_ONLY: &[Role] = &[Role::Chef];
pub const CUSTOMER_ONLY: &[Role] = &[Role::Customer];
pub const DELIVERY_ONLY: &[Role] = &[Role::Delivery];
pub const ADMIN_OR_CHEF: &[Role] = &[Role::Admin, Role::Chef];
pub const ORDER_HANDLERS: &[Role] = &[Role::Delivery, Role::Admin, Role::Chef];
pub const ORDER_VIEWERS: &[Role] = &[Role::Customer, Role::Delivery, Role::Chef, Role::Admin];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claims {
    pub sub: String,
    pub role: Role,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Clone)]
pub struct TokenKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    lifetime: Duration,
}

impl TokenKeys {
    pub fn new(secret: &[u8], lifetime: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            lifetime,
        }
    }

    pub fn issue(&self, user: &User) -> Result<String, jsonwebtoken::errors::Error> {
        self.issue_at(&user.id, user.role, Utc::now().timestamp())
    }

    pub fn issue_at(&self, user_id: &str, role: Role, issued_at: i64) -> Result<String, jsonwebtoken::errors::Error> {
        let claims = Claims {
            sub: user_id.to_string(),
            role,
            iat: issued_at,
            exp: issued_at.saturating_add(i64::try_from(self.lifetime.as_secs()).unwrap_or(i64::MAX)),
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
    }

    pub fn verify(&self, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        jsonwebtoken::decode::<Claims>(token, &self.decoding, &validation).map(|data| data.claims)
    }
}

fn issue_token(state: &SharedState, user: &User) -> ApiResult<String> {
    state
        .tokens
        .issue(user)
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("token signing failed: {}", e)))
}

/// Identity resolved by [`require_auth`] and stored in the request extensions.
#[derive(Debug, Clone)]
pub struct CurrentUser(pub User);

impl<S: Send + Sync> FromRequestParts<S> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CurrentUser>()
            .cloned()
            .ok_or_else(|| ApiError::Unauthorized("Not authorized, no token".to_string()))
    }
}

/// Identity for routes open to anonymous callers. A header that is present
/// but does not verify is still rejected.
#[derive(Debug, Clone)]
pub struct OptionalUser(pub Option<User>);

impl FromRequestParts<SharedState> for OptionalUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &SharedState) -> Result<Self, Self::Rejection> {
        if !parts.headers.contains_key(header::AUTHORIZATION) {
            return Ok(OptionalUser(None));
        }
        authenticate(state, &parts.headers).await.map(|user| OptionalUser(Some(user)))
    }
}

pub fn bearer_token(headers: &HeaderMap) -> ApiResult<&str> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or_else(|| ApiError::Unauthorized("Not authorized, no token".to_string()))?;
    let value = value
        .to_str()
        .map_err(|_| ApiError::Unauthorized("Invalid Authorization header".to_string()))?;
    value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::Unauthorized("Invalid Authorization header format".to_string()))
}

/// Verifies a raw token and loads the identity it names.
pub async fn resolve_token(state: &SharedState, token: &str) -> ApiResult<User> {
    let claims = state.tokens.verify(token).map_err(|e| {
        info!("[AUTH] Token rejected: {}", e);
        ApiError::Unauthorized("Not authorized, token failed".to_string())
    })?;
    users::find_active_by_id(&state.db, &claims.sub)
        .await?
        .ok_or_else(|| ApiError::Unauthorized("User not found".to_string()))
}

pub async fn authenticate(state: &SharedState, headers: &HeaderMap) -> ApiResult<User> {
    let token = bearer_token(headers)?;
    resolve_token(state, token).await
}

/// Middleware: fails closed with 401 unless the request carries a valid token
/// for an existing user.
pub async fn require_auth(
    State(state): State<SharedState>,
    mut request: Request,
    next: Next,
) -> ApiResult<Response> {
    let user = authenticate(&state, request.headers()).await?;
    request.extensions_mut().insert(CurrentUser(user));
    Ok(next.run(request).await)
}

/// Middleware: 403 unless the authenticated role is in the route's allow-list.
pub async fn require_role(
    State(allowed): State<&'static [Role]>,
    request: Request,
    next: Next,
) -> ApiResult<Response> {
    let role = request
        .extensions()
        .get::<CurrentUser>()
        .map(|CurrentUser(user)| user.role)
        .ok_or_else(|| ApiError::Unauthorized("Not authorized, no token".to_string()))?;
    if !allowed.contains(&role) {
        warn!("[AUTH] Role {} denied on {}", role, request.uri().path());
        return Err(ApiError::forbidden("Access denied"));
    }
    Ok(next.run(request).await)
}

/// Roles a caller may pick for themselves; admin accounts are only created by admins.
pub fn self_service_role(requested: Option<Role>) -> ApiResult<Role> {
    match requested.unwrap_or(Role::Customer) {
        Role::Admin => Err(ApiError::forbidden("Admin accounts cannot be self-registered")),
        role => Ok(role),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub name: String,
    pub email: String,
    pub password: String,
    pub role: Option<Role>,
    pub phone: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub token: String,
    pub user: User,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpdateProfileRequest {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePasswordRequest {
    pub old_password: String,
    pub new_password: String,
}

pub async fn register(
    State(state): State<SharedState>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<AuthResponse>)> {
    info!("[AUTH] Register attempt: {}", req.email);
    let role = self_service_role(req.role)?;
    let user = users::create_user(
        &state.db,
        NewUser {
            name: &req.name,
            email: &req.email,
            password: &req.password,
            role,
            verified: false,
            phone: req.phone.as_deref(),
            address: req.address.as_deref(),
        },
        state.config.argon2_salt_length,
    )
    .await?;
    let token = issue_token(&state, &user)?;
    Ok((StatusCode::CREATED, Json(AuthResponse { token, user })))
}

pub async fn login(
    State(state): State<SharedState>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Json<AuthResponse>> {
    let email = normalize_email(&req.email);
    let invalid = || ApiError::Unauthorized("Invalid email or password".to_string());

    let user = users::find_active_by_email(&state.db, &email).await?.ok_or_else(|| {
        info!("[AUTH] Login failed for {}: user not found", email);
        invalid()
    })?;
    if !CryptoManager::verify_password(&user.password_hash, &req.password) {
        info!("[AUTH] Login failed for {}: wrong password", email);
        return Err(invalid());
    }

    let token = issue_token(&state, &user)?;
    info!("[AUTH] Login success for {} (id={})", email, user.id);
    Ok(Json(AuthResponse { token, user }))
}

async fn get_profile(CurrentUser(user): CurrentUser) -> Json<User> {
    Json(user)
}

async fn update_profile(
    State(state): State<SharedState>,
    CurrentUser(mut user): CurrentUser,
    Json(req): Json<UpdateProfileRequest>,
) -> ApiResult<Json<Value>> {
    if let Some(name) = req.name.filter(|n| !n.trim().is_empty()) {
        user.name = name.trim().to_string();
    }
    if let Some(email) = req.email.filter(|e| !e.trim().is_empty()) {
        if !looks_like_email(&email) {
            return Err(ApiError::validation("Invalid email address"));
        }
        user.email = normalize_email(&email);
    }
    if req.phone.is_some() {
        user.phone = req.phone;
    }
    if req.address.is_some() {
        user.address = req.address;
    }
    users::save_user(&state.db, &user).await?;
    Ok(Json(json!({ "message": "Profile updated successfully", "user": user })))
}

async fn delete_profile(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
) -> ApiResult<Json<Value>> {
    users::soft_delete_user(&state.db, &user.id).await?;
    Ok(Json(json!({ "message": "Account deleted successfully" })))
}

async fn change_password(
    State(state): State<SharedState>,
    CurrentUser(mut user): CurrentUser,
    Json(req): Json<ChangePasswordRequest>,
) -> ApiResult<Json<Value>> {
    if !CryptoManager::verify_password(&user.password_hash, &req.old_password) {
        return Err(ApiError::validation("Old password is incorrect"));
    }
    if req.new_password.is_empty() {
        return Err(ApiError::validation("New password is required"));
    }
    user.password_hash = CryptoManager::hash_password(&req.new_password, state.config.argon2_salt_length)
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("password hashing failed: {}", e)))?;
    users::save_user(&state.db, &user).await?;
    info!("[AUTH] Password changed for {}", user.id);
    Ok(Json(json!({ "message": "Password updated successfully" })))
}

/// Routes mounted at /api/auth
pub fn router(state: SharedState) -> Router<SharedState> {
    let protected = Router::new()
        .route("/profile", get(get_profile).put(update_profile).delete(delete_profile))
        .route("/profile/password", put(change_password))
        .route_layer(from_fn_with_state(state, require_auth));

    Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .merge(protected)
}
