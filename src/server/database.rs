use sqlx::{SqlitePool, sqlite::{SqliteConnectOptions, SqlitePoolOptions}};
use std::str::FromStr;
use log::{info, debug};

#[derive(Debug, Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        info!("[DB] Connecting to database: {}", database_url);
        let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");

        if !in_memory {
            // Extract file path from database URL to create directory if needed
            let path_part = database_url
                .strip_prefix("sqlite://")
                .or_else(|| database_url.strip_prefix("sqlite:"))
                .unwrap_or(database_url);
            let file_path = path_part.split('?').next().unwrap_or(path_part);

            if let Some(parent) = std::path::Path::new(file_path).parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| sqlx::Error::Configuration(Box::new(e)))?;
                    info!("[DB] Created directory: {:?}", parent);
                }
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);

        // Every connection to :memory: opens its own database, so keep exactly one
        // and never recycle it
        let mut pool_options = SqlitePoolOptions::new().max_connections(if in_memory { 1 } else { 5 });
        if in_memory {
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }
        let pool = pool_options.connect_with(options).await?;

        info!("[DB] Connection pool ready");
        Ok(Self { pool })
    }

    /// Connects and migrates in one step.
    pub async fn open(database_url: &str) -> Result<Self, sqlx::Error> {
        let db = Self::connect(database_url).await?;
        db.migrate().await?;
        Ok(db)
    }

    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        // Users (customers, chefs, admins, delivery partners, community members)
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                email TEXT UNIQUE NOT NULL,
                password_hash TEXT NOT NULL,
                role TEXT NOT NULL,
                verified INTEGER NOT NULL DEFAULT 0,
                phone TEXT,
                address TEXT,
                created_at INTEGER NOT NULL,
                deleted_at INTEGER
            );
        "#).execute(&self.pool).await?;

        // Dishes
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS dishes (
                id TEXT PRIMARY KEY,
                chef_id TEXT NOT NULL REFERENCES users(id),
                name TEXT NOT NULL,
                description TEXT,
                price REAL NOT NULL,
                quantity INTEGER NOT NULL DEFAULT 0,
                available INTEGER NOT NULL DEFAULT 1,
                images TEXT NOT NULL DEFAULT '[]',
                created_at INTEGER NOT NULL,
                deleted_at INTEGER
            );
        "#).execute(&self.pool).await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_dishes_chef ON dishes(chef_id);")
            .execute(&self.pool).await?;

        // Orders
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS orders (
                id TEXT PRIMARY KEY,
                customer_id TEXT NOT NULL REFERENCES users(id),
                customer_name TEXT NOT NULL,
                customer_email TEXT NOT NULL,
                delivery_address TEXT NOT NULL,
                dish_id TEXT NOT NULL REFERENCES dishes(id),
                quantity INTEGER NOT NULL,
                total_price REAL NOT NULL,
                status TEXT NOT NULL,
                delivery_partner_id TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
        "#).execute(&self.pool).await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_orders_customer ON orders(customer_id);")
            .execute(&self.pool).await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_orders_dish ON orders(dish_id);")
            .execute(&self.pool).await?;

        // Feedback
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS feedback (
                id TEXT PRIMARY KEY,
                user_id TEXT,
                customer_name TEXT NOT NULL,
                rating INTEGER,
                message TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
        "#).execute(&self.pool).await?;

        // Community posts
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS posts (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                content TEXT NOT NULL,
                author TEXT NOT NULL,
                image TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
        "#).execute(&self.pool).await?;

        // Chat messages, append-only
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS chat_messages (
                id TEXT PRIMARY KEY,
                room_id TEXT NOT NULL,
                sender TEXT NOT NULL,
                message TEXT NOT NULL,
                sender_role TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
        "#).execute(&self.pool).await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chat_room ON chat_messages(room_id, created_at);")
            .execute(&self.pool).await?;

        // Pending OTP codes (digest only), expiring
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS otp_codes (
                email TEXT PRIMARY KEY,
                code_digest TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            );
        "#).execute(&self.pool).await?;

        debug!("[DB] Schema migration complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_pool_keeps_its_only_connection() {
        let db = Database::open("sqlite::memory:").await.unwrap();
        let options = db.pool.options();
        assert_eq!(options.get_max_connections(), 1);
        assert_eq!(options.get_idle_timeout(), None);
        assert_eq!(options.get_max_lifetime(), None);

        sqlx::query("INSERT INTO posts (id, title, content, author, created_at, updated_at) VALUES ('p1', 't', 'c', 'a', 0, 0)")
            .execute(&db.pool)
            .await
            .unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM posts").fetch_one(&db.pool).await.unwrap();
        assert_eq!(count, 1);
    }
}
