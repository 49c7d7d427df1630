// src/server/main.rs
// Entry point for the Home Chef API server
use homechef::server::{app, config::ServerConfig, database::Database, events::EventBus, mailer, otp};
use homechef::server::otp::{OtpStore, RedisOtpStore, SqliteOtpStore};
use homechef::server::websocket::SocketServer;
use homechef::utils::performance;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use log::{info, error, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(config.log_level.as_str())).init();

    let database = Arc::new(Database::connect(&config.database_url).await?);
    info!("[DB] Running database migrations...");
    database.migrate().await.map_err(|e| {
        error!("[DB] Database migration failed: {}", e);
        e
    })?;
    info!("[DB] Database migrations completed");

    let (events, otp_store): (EventBus, Arc<dyn OtpStore>) = match &config.redis_url {
        Some(url) => {
            let events = match EventBus::with_redis(url).await {
                Ok(bus) => bus,
                Err(e) => {
                    warn!("[EVENTS] Redis relay unavailable ({}), delivering to local sockets only", e);
                    EventBus::new()
                }
            };
            let store: Arc<dyn OtpStore> = match RedisOtpStore::new(url).await {
                Ok(store) => {
                    info!("[OTP] Storing codes in redis");
                    Arc::new(store)
                }
                Err(e) => {
                    warn!("[OTP] Redis unavailable ({}), storing codes in SQLite", e);
                    Arc::new(SqliteOtpStore::new(database.clone()))
                }
            };
            (events, store)
        }
        None => (EventBus::new(), Arc::new(SqliteOtpStore::new(database.clone()))),
    };
    otp::start_purge_task(otp_store.clone(), Duration::from_secs(60));

    let mailer = mailer::from_config(&config.email);
    let state = app::AppState::new(config.clone(), database.clone(), events, otp_store, mailer);

    // Socket server on its own port
    let sockets = SocketServer::new(state.clone());
    let ws_addr = format!("{}:{}", config.host, config.websocket_port);
    let ws_listener = TcpListener::bind(&ws_addr).await?;
    let ws_server = sockets.clone();
    tokio::spawn(async move {
        if let Err(e) = ws_server.serve(ws_listener).await {
            error!("[WS] WebSocket server error: {}", e);
        }
    });

    let perf_log_path = std::env::var("PERFORMANCE_LOG_PATH")
        .unwrap_or_else(|_| "data/homechef_performance.log".to_string());
    let perf_db = database.clone();
    let perf_sockets = sockets.clone();
    tokio::spawn(async move {
        info!("[PERF] Logging every 120 seconds to: {}", perf_log_path);
        performance::start_performance_logger(perf_db, perf_sockets, &perf_log_path).await;
    });

    let http_addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&http_addr).await?;
    info!("[HTTP] Home Chef API listening on {}", http_addr);
    axum::serve(listener, app::build_router(state)).await?;
    Ok(())
}
