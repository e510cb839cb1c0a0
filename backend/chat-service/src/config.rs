use dotenvy::dotenv;
use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// When unset the service runs on the in-memory store.
    pub database_url: Option<String>,
    pub jwt_secret: Option<String>,
    /// Accept bare user-id tokens instead of signed JWTs. Dev/test only.
    pub dev_allow_uuid_tokens: bool,
    /// Per-user bound on queued best-effort pushes while offline.
    pub offline_queue_capacity: usize,
    pub heartbeat_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
    /// Per-conversation cap on a single catch-up batch.
    pub catchup_batch_limit: i64,
    pub max_message_length: usize,
    /// Bound on remembered (conversation, dedup_key) pairs.
    pub dedup_memo_capacity: usize,
}

impl Config {
    pub fn from_env() -> Result<Self, crate::error::AppError> {
        dotenv().ok();
        let port = env::var("PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(3000);
        let database_url = env::var("DATABASE_URL").ok().filter(|s| !s.trim().is_empty());
        let jwt_secret = env::var("JWT_SECRET").ok().filter(|s| !s.trim().is_empty());
        let dev_allow_uuid_tokens = env::var("AUTH_DEV_ALLOW_UUID_TOKENS")
            .unwrap_or_else(|_| "false".into())
            .eq_ignore_ascii_case("true");

        if jwt_secret.is_none() && !dev_allow_uuid_tokens {
            return Err(crate::error::AppError::Config(
                "JWT_SECRET missing (or set AUTH_DEV_ALLOW_UUID_TOKENS=true)".into(),
            ));
        }

        let offline_queue_capacity = Self::parse_var("OFFLINE_QUEUE_CAPACITY", 256)?;
        let heartbeat_interval_secs = Self::parse_var("HEARTBEAT_INTERVAL_SECS", 15)?;
        let heartbeat_timeout_secs = Self::parse_var("HEARTBEAT_TIMEOUT_SECS", 60)?;
        let catchup_batch_limit = Self::parse_var("CATCHUP_BATCH_LIMIT", 200)?;
        let max_message_length = Self::parse_var("MAX_MESSAGE_LENGTH", 4096)?;
        let dedup_memo_capacity = Self::parse_var("DEDUP_MEMO_CAPACITY", 4096)?;

        if heartbeat_timeout_secs <= heartbeat_interval_secs {
            return Err(crate::error::AppError::Config(
                "HEARTBEAT_TIMEOUT_SECS must exceed HEARTBEAT_INTERVAL_SECS".into(),
            ));
        }

        Ok(Self {
            port,
            database_url,
            jwt_secret,
            dev_allow_uuid_tokens,
            offline_queue_capacity,
            heartbeat_interval_secs,
            heartbeat_timeout_secs,
            catchup_batch_limit,
            max_message_length,
            dedup_memo_capacity,
        })
    }

    fn parse_var<T: std::str::FromStr>(
        name: &str,
        default: T,
    ) -> Result<T, crate::error::AppError> {
        match env::var(name) {
            Ok(raw) => raw
                .parse()
                .map_err(|_| crate::error::AppError::Config(format!("{name} invalid: {raw}"))),
            Err(_) => Ok(default),
        }
    }

    pub fn test_defaults() -> Self {
        Self {
            port: 3000,
            database_url: None,
            jwt_secret: None,
            dev_allow_uuid_tokens: true,
            offline_queue_capacity: 8,
            heartbeat_interval_secs: 1,
            heartbeat_timeout_secs: 3,
            catchup_batch_limit: 50,
            max_message_length: 4096,
            dedup_memo_capacity: 64,
        }
    }
}
