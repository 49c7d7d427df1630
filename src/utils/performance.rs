use chrono::Utc;
use sysinfo::System;
use std::{fs::OpenOptions, io::Write, sync::Arc, time::Duration};
use tokio::time;
use crate::server::database::Database;
use crate::server::websocket::SocketServer;
use log::{info, error, warn};

const INTERVAL: Duration = Duration::from_secs(120);

async fn count(db: &Database, sql: &str, what: &str) -> i64 {
    match sqlx::query_scalar::<_, i64>(sql).fetch_one(&db.pool).await {
        Ok(n) => n,
        Err(e) => {
            warn!("[PERF] Failed to count {}: {}", what, e);
            -1
        }
    }
}

/// Appends a line of platform activity and CPU load to `log_path` every two minutes.
pub async fn start_performance_logger(db: Arc<Database>, sockets: Arc<SocketServer>, log_path: &str) {
    let mut system = System::new_all();

    if let Some(parent) = std::path::Path::new(log_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }
    let mut file = match OpenOptions::new().create(true).append(true).open(log_path) {
        Ok(f) => f,
        Err(e) => {
            error!("[PERF] Unable to open performance log file '{}': {}", log_path, e);
            return;
        }
    };

    if file.metadata().map(|m| m.len()).unwrap_or(0) == 0 {
        if let Err(e) = writeln!(file, "# Home Chef Server Performance Log")
            .and_then(|_| writeln!(file, "# Timestamp, Users, Active_Dishes, Open_Orders, Total_Orders, Sockets, CPU_Usage"))
        {
            error!("[PERF] Failed to write header to performance log: {}", e);
            return;
        }
        info!("[PERF] Performance log initialized: {}", log_path);
    }

    loop {
        system.refresh_cpu();
        let cpus = system.cpus();
        let cpu_usage = if cpus.is_empty() {
            0.0
        } else {
            cpus.iter().map(|c| c.cpu_usage()).sum::<f32>() / cpus.len() as f32
        };
        let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S UTC");

        let users = count(&db, "SELECT COUNT(*) FROM users WHERE deleted_at IS NULL", "users").await;
        let dishes = count(&db, "SELECT COUNT(*) FROM dishes WHERE deleted_at IS NULL", "dishes").await;
        let open_orders = count(
            &db,
            "SELECT COUNT(*) FROM orders WHERE status NOT IN ('Delivered', 'Cancelled')",
            "open orders",
        )
        .await;
        let total_orders = count(&db, "SELECT COUNT(*) FROM orders", "orders").await;
        let socket_count = sockets.connection_count().await;

        info!(
            "[PERF] Users: {}, Dishes: {}, Open orders: {}/{}, Sockets: {}, CPU: {:.1}%",
            users, dishes, open_orders, total_orders, socket_count, cpu_usage
        );

        if let Err(e) = writeln!(
            file,
            "{}, {}, {}, {}, {}, {}, {:.1}%",
            timestamp, users, dishes, open_orders, total_orders, socket_count, cpu_usage
        ) {
            error!("[PERF] Failed to write to performance log: {}", e);
        } else if let Err(e) = file.flush() {
            error!("[PERF] Failed to flush performance log: {}", e);
        }

        time::sleep(INTERVAL).await;
    }
}
