use std::env;
use std::time::Duration;
use crate::common::crypto::CryptoManager;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub websocket_port: u16,
    pub database_url: String,
    pub redis_url: Option<String>,
    pub log_level: String,
    pub jwt_secret: Vec<u8>,
    pub token_lifetime: Duration,
    pub argon2_salt_length: usize,
    pub otp_ttl: Duration,
    pub max_message_length: usize,
    pub cors_origin: Option<String>,
    pub email: EmailConfig,
}

/// Transactional email provider settings. Without an API url, mail is only logged.
#[derive(Debug, Clone, Default)]
pub struct EmailConfig {
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub from: String,
    pub contact_inbox: String,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let jwt_secret = if let Some(secret) = CryptoManager::load_secret_from_env() {
            log::info!("[CONFIG] Loaded JWT_SECRET from environment");
            secret
        } else {
            log::warn!("[CONFIG] No JWT_SECRET set, generating an ephemeral one; tokens will not survive a restart");
            CryptoManager::generate_secret().to_vec()
        };

        let port = env::var("SERVER_PORT").ok().and_then(|p| p.parse().ok()).unwrap_or(5000);
        let token_lifetime = env::var("JWT_EXPIRES_IN")
            .ok()
            .and_then(|v| parse_lifetime(&v))
            .unwrap_or(Duration::from_secs(7 * 24 * 60 * 60));
        let email_user = env::var("EMAIL_USER").unwrap_or_else(|_| "no-reply@homechef.local".to_string());

        Self {
            host: env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port,
            websocket_port: env::var("WEBSOCKET_PORT").ok().and_then(|p| p.parse().ok()).unwrap_or(port.saturating_add(1)),
            database_url: env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:data/homechef.db".to_string()),
            redis_url: env::var("REDIS_URL").ok().filter(|v| !v.trim().is_empty()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            jwt_secret,
            token_lifetime,
            argon2_salt_length: env::var("ARGON2_SALT_LENGTH").ok().and_then(|v| v.parse().ok()).unwrap_or(16),
            otp_ttl: Duration::from_secs(env::var("OTP_TTL_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(300)),
            max_message_length: env::var("MAX_MESSAGE_LENGTH").ok().and_then(|v| v.parse().ok()).unwrap_or(2048),
            cors_origin: env::var("CORS_ORIGIN").ok().filter(|v| !v.trim().is_empty()),
            email: EmailConfig {
                api_url: env::var("EMAIL_API_URL").ok().filter(|v| !v.trim().is_empty()),
                api_key: env::var("EMAIL_API_KEY").ok(),
                from: env::var("EMAIL_FROM").unwrap_or_else(|_| format!("Home Chef <{}>", email_user)),
                contact_inbox: env::var("CONTACT_INBOX").unwrap_or(email_user),
            },
        }
    }

    /// Configuration for tests and tooling: in-memory database, fixed secret, no redis.
    pub fn for_tests() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            websocket_port: 0,
            database_url: "sqlite::memory:".to_string(),
            redis_url: None,
            log_level: "debug".to_string(),
            jwt_secret: b"test-secret-test-secret-test-secret".to_vec(),
            token_lifetime: Duration::from_secs(60 * 60),
            argon2_salt_length: 16,
            otp_ttl: Duration::from_secs(300),
            max_message_length: 2048,
            cors_origin: None,
            email: EmailConfig {
                api_url: None,
                api_key: None,
                from: "Home Chef <no-reply@homechef.local>".to_string(),
                contact_inbox: "inbox@homechef.local".to_string(),
            },
        }
    }
}

/// Parses lifetimes like `7d`, `12h`, `30m`, `45s` or a bare number of seconds.
pub fn parse_lifetime(value: &str) -> Option<Duration> {
    let value = value.trim();
    let (digits, unit) = match value.char_indices().last()? {
        (idx, c) if c.is_ascii_alphabetic() => (&value[..idx], c),
        _ => (value, 's'),
    };
    let amount: u64 = digits.parse().ok()?;
    let unit_secs: u64 = match unit {
        's' => 1,
        'm' => 60,
        'h' => 60 * 60,
        'd' => 24 * 60 * 60,
        _ => return None,
    };
    let secs = amount.checked_mul(unit_secs)?;
    (secs > 0).then(|| Duration::from_secs(secs))
}
