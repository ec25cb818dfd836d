use crate::error::{AppError, Result};
use crate::hub::{ConnectionSettings, HubConfig, SlowConsumerPolicy};
use std::env;
use std::time::Duration;

/// One year; keeps token expiry arithmetic far from overflow
const MAX_JWT_EXPIRY_HOURS: i64 = 24 * 365;
const MAX_QUEUE_CAPACITY: usize = 1 << 20;
/// One day
const MAX_WS_TIMING_SECS: u64 = 24 * 60 * 60;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// API server configuration
    pub api: ApiServerConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Post listing configuration
    pub posts: PostsConfig,
    /// Real-time hub configuration
    pub hub: HubSettings,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Port for the API server (default: 5050)
    pub port: u16,
    /// Host to bind to (default: 0.0.0.0)
    pub host: String,
    /// Allowed CORS origins (comma-separated, empty = localhost only)
    pub cors_origins: Vec<String>,
    /// JWT secret for token generation
    pub jwt_secret: String,
    /// Token lifetime in hours
    pub jwt_expiry_hours: i64,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Full connection URL; overrides the individual parts when set
    pub url: Option<String>,
    /// Database host
    pub host: String,
    /// Database port
    pub port: u16,
    /// Database user
    pub user: String,
    /// Database password
    pub password: String,
    /// Database name
    pub name: String,
    /// SSL mode (disable, require, prefer)
    pub ssl_mode: String,
    /// Maximum connections in pool
    pub max_connections: u32,
    /// Minimum connections in pool
    pub min_connections: u32,
    /// Max seconds to wait for a pooled connection
    pub acquire_timeout_secs: u64,
    /// Seconds an idle connection is kept before being closed (0 = forever)
    pub idle_timeout_secs: u64,
    /// Seconds before any connection is recycled (0 = never)
    pub max_lifetime_secs: u64,
}

impl DatabaseConfig {
    /// Connection URL, either `DATABASE_URL` or one built from the parts
    pub fn connection_url(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }

        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            self.user, self.password, self.host, self.port, self.name, self.ssl_mode
        )
    }
}

#[derive(Debug, Clone)]
pub struct PostsConfig {
    /// Posts per page when listing
    pub page_size: i64,
}

#[derive(Debug, Clone)]
pub struct HubSettings {
    /// Capacity of each dispatcher input channel
    pub channel_capacity: usize,
    /// Per-connection outbound queue capacity
    pub outbound_capacity: usize,
    /// What happens to a connection whose queue is full
    pub slow_consumer_policy: SlowConsumerPolicy,
    /// Max seconds for a single websocket write
    pub write_timeout_secs: u64,
    /// Seconds between heartbeat pings
    pub ping_interval_secs: u64,
    /// Seconds without inbound frames before a client is considered gone
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// A `.env` file in the working directory is read first if present.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_current_env()
    }

    fn from_current_env() -> Result<Self> {
        let policy = get_env_or("HUB_SLOW_CONSUMER_POLICY", "disconnect");

        Ok(Config {
            api: ApiServerConfig {
                port: get_env_or("API_PORT", "5050").parse().map_err(|_| {
                    AppError::InvalidConfig("API_PORT must be a valid port number".into())
                })?,
                host: get_env_or("API_HOST", "0.0.0.0"),
                cors_origins: get_env_or("CORS_ORIGINS", "")
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
                jwt_secret: get_env_or("JWT_SECRET", ""),
                jwt_expiry_hours: parse_bounded("JWT_EXPIRY_HOURS", "48", 1, MAX_JWT_EXPIRY_HOURS)?,
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").ok().filter(|s| !s.trim().is_empty()),
                host: get_env_or("DB_HOST", "localhost"),
                port: get_env_or("DB_PORT", "5432").parse().map_err(|_| {
                    AppError::InvalidConfig("DB_PORT must be a valid port number".into())
                })?,
                user: get_env_or("DB_USER", "postfeed"),
                password: get_env_or("DB_PASSWORD", "postfeed"),
                name: get_env_or("DB_NAME", "postfeed"),
                ssl_mode: get_env_or("DB_SSLMODE", "disable"),
                max_connections: parse_bounded("DB_MAX_CONNECTIONS", "20", 1, 10_000)?,
                min_connections: parse_env("DB_MIN_CONNECTIONS", "2")?,
                acquire_timeout_secs: parse_bounded("DB_ACQUIRE_TIMEOUT_SECS", "10", 1, 3600)?,
                idle_timeout_secs: parse_env("DB_IDLE_TIMEOUT_SECS", "1800")?,
                max_lifetime_secs: parse_env("DB_MAX_LIFETIME_SECS", "3600")?,
            },
            posts: PostsConfig {
                page_size: get_env_or("PAGE", "2")
                    .parse::<i64>()
                    .ok()
                    .filter(|size| *size > 0)
                    .ok_or_else(|| {
                        AppError::InvalidConfig("PAGE must be a positive number".into())
                    })?,
            },
            hub: HubSettings {
                channel_capacity: parse_bounded("HUB_CHANNEL_CAPACITY", "1024", 1, MAX_QUEUE_CAPACITY)?,
                outbound_capacity: parse_bounded("HUB_OUTBOUND_CAPACITY", "256", 1, MAX_QUEUE_CAPACITY)?,
                slow_consumer_policy: SlowConsumerPolicy::from_str(&policy).ok_or_else(|| {
                    AppError::InvalidConfig(format!(
                        "HUB_SLOW_CONSUMER_POLICY must be 'disconnect' or 'drop_message', got '{}'",
                        policy
                    ))
                })?,
                write_timeout_secs: parse_bounded("WS_WRITE_TIMEOUT_SECS", "10", 1, MAX_WS_TIMING_SECS)?,
                ping_interval_secs: parse_bounded("WS_PING_INTERVAL_SECS", "30", 1, MAX_WS_TIMING_SECS)?,
                idle_timeout_secs: parse_bounded("WS_IDLE_TIMEOUT_SECS", "60", 1, MAX_WS_TIMING_SECS)?,
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "json"),
            },
        })
    }

    /// Built-in defaults without reading the environment
    #[cfg(test)]
    pub(crate) fn test_default() -> Self {
        Config {
            api: ApiServerConfig {
                port: 5050,
                host: "127.0.0.1".to_string(),
                cors_origins: Vec::new(),
                jwt_secret: String::new(),
                jwt_expiry_hours: 48,
            },
            database: DatabaseConfig {
                url: None,
                host: "127.0.0.1".to_string(),
                port: 5432,
                user: "postfeed".to_string(),
                password: "postfeed".to_string(),
                name: "postfeed".to_string(),
                ssl_mode: "disable".to_string(),
                max_connections: 2,
                min_connections: 0,
                acquire_timeout_secs: 1,
                idle_timeout_secs: 0,
                max_lifetime_secs: 0,
            },
            posts: PostsConfig { page_size: 2 },
            hub: HubSettings {
                channel_capacity: 1024,
                outbound_capacity: 256,
                slow_consumer_policy: SlowConsumerPolicy::Disconnect,
                write_timeout_secs: 10,
                ping_interval_secs: 30,
                idle_timeout_secs: 60,
            },
            log: LogConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }

    /// Get the database connection URL
    pub fn database_url(&self) -> String {
        self.database.connection_url()
    }

    /// Get the API server address
    pub fn api_addr(&self) -> String {
        format!("{}:{}", self.api.host, self.api.port)
    }

    /// Hub configuration derived from the environment settings
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            channel_capacity: self.hub.channel_capacity,
            slow_consumer_policy: self.hub.slow_consumer_policy,
            connection: ConnectionSettings {
                outbound_capacity: self.hub.outbound_capacity,
                write_timeout: Duration::from_secs(self.hub.write_timeout_secs),
                ping_interval: Duration::from_secs(self.hub.ping_interval_secs),
                idle_timeout: Duration::from_secs(self.hub.idle_timeout_secs),
            },
        }
    }
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Parse a numeric environment variable, failing on garbage
fn parse_env<T: std::str::FromStr>(key: &str, default: &str) -> Result<T> {
    get_env_or(key, default)
        .trim()
        .parse()
        .map_err(|_| AppError::InvalidConfig(format!("{} must be a valid number", key)))
}

/// Parse a numeric environment variable and require `min..=max`
fn parse_bounded<T>(key: &str, default: &str, min: T, max: T) -> Result<T>
where
    T: std::str::FromStr + PartialOrd + std::fmt::Display,
{
    let value: T = parse_env(key, default)?;
    if value < min || value > max {
        return Err(AppError::InvalidConfig(format!(
            "{} must be between {} and {}, got {}",
            key, min, max, value
        )));
    }
    Ok(value)
}
