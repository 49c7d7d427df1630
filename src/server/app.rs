// Shared state and router assembly for the HTTP API.
use crate::server::auth::TokenKeys;
use crate::server::config::ServerConfig;
use crate::server::database::Database;
use crate::server::events::EventBus;
use crate::server::mailer::Mailer;
use crate::server::otp::{OtpStore, SqliteOtpStore};
use crate::server::{auth, chat, contact, dishes, feedback, orders, otp, posts, users};
use axum::{
    extract::{MatchedPath, Request},
    http::{HeaderValue, Method},
    middleware::{self, Next},
    response::Response,
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use log::{error, info, warn};

pub struct AppState {
    pub config: ServerConfig,
    pub db: Arc<Database>,
    pub tokens: TokenKeys,
    pub events: EventBus,
    pub otp: Arc<dyn OtpStore>,
    pub mailer: Arc<dyn Mailer>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(
        config: ServerConfig,
        db: Arc<Database>,
        events: EventBus,
        otp: Arc<dyn OtpStore>,
        mailer: Arc<dyn Mailer>,
    ) -> SharedState {
        let tokens = TokenKeys::new(&config.jwt_secret, config.token_lifetime);
        Arc::new(Self { config, db, tokens, events, otp, mailer })
    }

    /// Fully wired state over an in-memory database with a local event bus.
    pub async fn in_memory(config: ServerConfig, mailer: Arc<dyn Mailer>) -> anyhow::Result<SharedState> {
        let db = Arc::new(Database::open(&config.database_url).await?);
        let otp: Arc<dyn OtpStore> = Arc::new(SqliteOtpStore::new(db.clone()));
        Ok(Self::new(config, db, EventBus::new(), otp, mailer))
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "service": "homechef" }))
}

/// Logs method, matched route, status and latency of every request.
async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let started = Instant::now();

    let response = next.run(request).await;

    let status = response.status().as_u16();
    let latency_ms = started.elapsed().as_millis();
    if status >= 500 {
        error!("[HTTP] {} {} -> {} ({} ms)", method, path, status, latency_ms);
    } else if status >= 400 {
        warn!("[HTTP] {} {} -> {} ({} ms)", method, path, status, latency_ms);
    } else {
        info!("[HTTP] {} {} -> {} ({} ms)", method, path, status, latency_ms);
    }
    response
}

fn cors_layer(origin: Option<&str>) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);
    match origin.and_then(|o| HeaderValue::from_str(o).ok()) {
        Some(origin) => layer.allow_origin(AllowOrigin::exact(origin)),
        None => layer.allow_origin(Any),
    }
}

pub fn build_router(state: SharedState) -> Router {
    let api = Router::new()
        .route("/health", get(health))
        .nest("/auth", auth::router(state.clone()))
        .nest("/users", users::router(state.clone()))
        .nest("/chefs", users::chefs_router(state.clone()))
        .nest("/dishes", dishes::router(state.clone()))
        .nest("/orders", orders::router(state.clone()))
        .nest("/feedback", feedback::router(state.clone()))
        .nest("/posts", posts::router(state.clone()))
        .nest("/otp", otp::router())
        .nest("/contact", contact::contact_router())
        .nest("/order-email", contact::receipt_router())
        .nest("/chat", chat::router());

    let cors = cors_layer(state.config.cors_origin.as_deref());
    Router::new()
        .nest("/api", api)
        .with_state(state)
        .layer(middleware::from_fn(log_requests))
        .layer(cors)
}
