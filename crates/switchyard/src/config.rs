//! Switchyard configuration.
//!
//! Configuration is loaded from environment variables. Worker processes
//! inherit the primary's environment, plus `SWITCHYARD_WORKER_ID` (and the
//! primary's node id). All sensitive fields are redacted in Debug output.

use common::jwt::{DEFAULT_CLOCK_SKEW, MAX_CLOCK_SKEW, MIN_HMAC_SECRET_BYTES};
use common::secret::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default HTTP/WebSocket bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Default query parameter carrying the bearer token.
pub const DEFAULT_TOKEN_QUERY_PARAM: &str = "token";

/// Default lifecycle shutdown timeout in milliseconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 10_000;

/// Default interval between warnings about workers that ignore shutdown.
pub const DEFAULT_WORKER_SHUTDOWN_GRACE_SECONDS: u64 = 30;

/// Default idle threshold in seconds.
pub const DEFAULT_IDLE_TIMEOUT_SECONDS: u64 = 300;

/// Default idle sweep interval in seconds.
pub const DEFAULT_IDLE_SWEEP_INTERVAL_SECONDS: u64 = 30;

/// Default per-connection outbound queue length.
pub const DEFAULT_SEND_QUEUE_CAPACITY: usize = 256;

/// Default pub/sub channel prefix.
pub const DEFAULT_CHANNEL_PREFIX: &str = "switchyard:";

/// Default rate limit: messages per window per connection.
pub const DEFAULT_RATE_LIMIT_MAX_MESSAGES: u32 = 100;

/// Default rate limit window in milliseconds.
pub const DEFAULT_RATE_LIMIT_WINDOW_MS: u64 = 1000;

/// Environment variable carrying the node id to worker processes.
pub const NODE_ID_ENV: &str = "SWITCHYARD_NODE_ID";

/// Set by the primary on the workers it spawns: their stdin is the control
/// pipe, and shutdown comes through it rather than from terminal signals.
pub const SUPERVISED_ENV: &str = "SWITCHYARD_SUPERVISED";

/// Switchyard configuration.
///
/// Sensitive fields are redacted in Debug output.
#[derive(Clone)]
pub struct Config {
    /// HTTP/WebSocket bind address, shared by every worker (`SO_REUSEPORT`).
    pub bind_address: SocketAddr,

    /// Redis URL for the broadcast bus. `None` selects the in-memory bus.
    /// Protected by `SecretString` since it may embed a password.
    pub redis_url: Option<SecretString>,

    /// Number of worker processes the primary keeps alive.
    pub worker_count: usize,

    /// Slot of this worker; `None` in the primary.
    pub worker_id: Option<usize>,

    /// Identifier of this node, shared by its workers.
    pub node_id: String,

    /// Whether connections must pass the auth gate.
    pub auth_enabled: bool,

    /// HS256 signing secret for bearer tokens.
    pub jwt_secret: Option<SecretString>,

    /// Admit connections that present no token.
    pub allow_anonymous: bool,

    pub token_query_param: String,

    /// Allowed clock skew for token `iat`.
    pub clock_skew: Duration,

    /// Deadline for the lifecycle shutdown sequence.
    pub shutdown_timeout: Duration,

    /// Interval between warnings about workers that ignore the sentinel.
    pub worker_shutdown_grace: Duration,

    pub idle_timeout: Duration,

    pub idle_sweep_interval: Duration,

    /// Outbound frames queued per connection before it is disconnected.
    pub send_queue_capacity: usize,

    pub channel_prefix: String,

    pub rate_limit_max_messages: u32,

    pub rate_limit_window: Duration,

    /// Emit logs as JSON.
    pub log_json: bool,

    /// Spawned by a primary; SIGINT is left to the primary.
    pub supervised: bool,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("redis_url", &self.redis_url.as_ref().map(|_| "[REDACTED]"))
            .field("worker_count", &self.worker_count)
            .field("worker_id", &self.worker_id)
            .field("node_id", &self.node_id)
            .field("auth_enabled", &self.auth_enabled)
            .field("jwt_secret", &self.jwt_secret.as_ref().map(|_| "[REDACTED]"))
            .field("allow_anonymous", &self.allow_anonymous)
            .field("token_query_param", &self.token_query_param)
            .field("clock_skew", &self.clock_skew)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("worker_shutdown_grace", &self.worker_shutdown_grace)
            .field("idle_timeout", &self.idle_timeout)
            .field("idle_sweep_interval", &self.idle_sweep_interval)
            .field("send_queue_capacity", &self.send_queue_capacity)
            .field("channel_prefix", &self.channel_prefix)
            .field("rate_limit_max_messages", &self.rate_limit_max_messages)
            .field("rate_limit_window", &self.rate_limit_window)
            .field("log_json", &self.log_json)
            .field("supervised", &self.supervised)
            .finish()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let bind_address = parse_or(vars, "SWITCHYARD_BIND_ADDRESS", || {
            DEFAULT_BIND_ADDRESS.parse().map_err(|_| {
                ConfigError::InvalidValue("default bind address".to_string())
            })
        })?;

        let redis_url = non_empty(vars, "REDIS_URL").map(|url| SecretString::from(url.to_string()));

        let worker_count: usize = parse_or(vars, "SWITCHYARD_WORKER_COUNT", || {
            Ok(std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get))
        })?;
        if worker_count == 0 {
            return Err(ConfigError::InvalidValue(
                "SWITCHYARD_WORKER_COUNT must be at least 1".to_string(),
            ));
        }
        if worker_count > 1 && redis_url.is_none() {
            return Err(ConfigError::MissingEnvVar(
                "REDIS_URL (required when SWITCHYARD_WORKER_COUNT > 1)".to_string(),
            ));
        }

        let worker_id = match non_empty(vars, "SWITCHYARD_WORKER_ID") {
            Some(raw) => Some(raw.parse::<usize>().map_err(|_| {
                ConfigError::InvalidValue(format!(
                    "SWITCHYARD_WORKER_ID is not a slot number: {raw}"
                ))
            })?),
            None => None,
        };

        let node_id = non_empty(vars, NODE_ID_ENV)
            .map(str::to_string)
            .unwrap_or_else(generate_node_id);

        let auth_enabled = parse_bool(vars, "SWITCHYARD_AUTH_ENABLED", true)?;
        let jwt_secret = non_empty(vars, "SWITCHYARD_JWT_SECRET")
            .map(|secret| SecretString::from(secret.to_string()));
        if auth_enabled {
            let secret = jwt_secret.as_ref().ok_or_else(|| {
                ConfigError::MissingEnvVar("SWITCHYARD_JWT_SECRET".to_string())
            })?;
            if secret.expose_secret().len() < MIN_HMAC_SECRET_BYTES {
                return Err(ConfigError::InvalidValue(format!(
                    "SWITCHYARD_JWT_SECRET must be at least {MIN_HMAC_SECRET_BYTES} bytes"
                )));
            }
        }

        let allow_anonymous = parse_bool(vars, "SWITCHYARD_ALLOW_ANONYMOUS", false)?;

        let token_query_param = non_empty(vars, "SWITCHYARD_TOKEN_QUERY_PARAM")
            .unwrap_or(DEFAULT_TOKEN_QUERY_PARAM)
            .to_string();

        let clock_skew = Duration::from_secs(parse_or(vars, "SWITCHYARD_CLOCK_SKEW_SECONDS", || {
            Ok(DEFAULT_CLOCK_SKEW.as_secs())
        })?);
        if clock_skew > MAX_CLOCK_SKEW {
            return Err(ConfigError::InvalidValue(format!(
                "SWITCHYARD_CLOCK_SKEW_SECONDS must be at most {}",
                MAX_CLOCK_SKEW.as_secs()
            )));
        }

        let shutdown_timeout = Duration::from_millis(parse_or(
            vars,
            "SWITCHYARD_SHUTDOWN_TIMEOUT_MS",
            || Ok(DEFAULT_SHUTDOWN_TIMEOUT_MS),
        )?);

        let worker_shutdown_grace = Duration::from_secs(parse_or(
            vars,
            "SWITCHYARD_WORKER_SHUTDOWN_GRACE_SECONDS",
            || Ok(DEFAULT_WORKER_SHUTDOWN_GRACE_SECONDS),
        )?);

        let idle_timeout = Duration::from_secs(parse_or(
            vars,
            "SWITCHYARD_IDLE_TIMEOUT_SECONDS",
            || Ok(DEFAULT_IDLE_TIMEOUT_SECONDS),
        )?);

        let idle_sweep_interval = Duration::from_secs(parse_or(
            vars,
            "SWITCHYARD_IDLE_SWEEP_INTERVAL_SECONDS",
            || Ok(DEFAULT_IDLE_SWEEP_INTERVAL_SECONDS),
        )?);
        if idle_sweep_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "SWITCHYARD_IDLE_SWEEP_INTERVAL_SECONDS must be positive".to_string(),
            ));
        }

        let send_queue_capacity: usize = parse_or(vars, "SWITCHYARD_SEND_QUEUE_CAPACITY", || {
            Ok(DEFAULT_SEND_QUEUE_CAPACITY)
        })?;
        if send_queue_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "SWITCHYARD_SEND_QUEUE_CAPACITY must be positive".to_string(),
            ));
        }

        let channel_prefix = vars
            .get("SWITCHYARD_CHANNEL_PREFIX")
            .cloned()
            .unwrap_or_else(|| DEFAULT_CHANNEL_PREFIX.to_string());

        let rate_limit_max_messages = parse_or(vars, "SWITCHYARD_RATE_LIMIT_MAX_MESSAGES", || {
            Ok(DEFAULT_RATE_LIMIT_MAX_MESSAGES)
        })?;

        let rate_limit_window = Duration::from_millis(parse_or(
            vars,
            "SWITCHYARD_RATE_LIMIT_WINDOW_MS",
            || Ok(DEFAULT_RATE_LIMIT_WINDOW_MS),
        )?);

        let log_json = parse_bool(vars, "SWITCHYARD_LOG_JSON", false)?;
        let supervised = parse_bool(vars, SUPERVISED_ENV, false)?;

        Ok(Config {
            bind_address,
            redis_url,
            worker_count,
            worker_id,
            node_id,
            auth_enabled,
            jwt_secret,
            allow_anonymous,
            token_query_param,
            clock_skew,
            shutdown_timeout,
            worker_shutdown_grace,
            idle_timeout,
            idle_sweep_interval,
            send_queue_capacity,
            channel_prefix,
            rate_limit_max_messages,
            rate_limit_window,
            log_json,
            supervised,
        })
    }

    /// True when running as a worker process.
    pub fn is_worker(&self) -> bool {
        self.worker_id.is_some()
    }

    /// Cluster-unique worker identifier used as the envelope origin.
    pub fn worker_label(&self) -> String {
        match self.worker_id {
            Some(slot) => format!("{}-w{slot}", self.node_id),
            None => format!("{}-primary", self.node_id),
        }
    }
}

fn non_empty<'a>(vars: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    vars.get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn parse_or<T, F>(vars: &HashMap<String, String>, key: &str, default: F) -> Result<T, ConfigError>
where
    T: FromStr,
    F: FnOnce() -> Result<T, ConfigError>,
{
    match non_empty(vars, key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{key}: {raw}"))),
        None => default(),
    }
}

fn parse_bool(
    vars: &HashMap<String, String>,
    key: &str,
    default: bool,
) -> Result<bool, ConfigError> {
    match non_empty(vars, key).map(str::to_ascii_lowercase).as_deref() {
        None => Ok(default),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some("0" | "false" | "no" | "off") => Ok(false),
        Some(other) => Err(ConfigError::InvalidValue(format!("{key}: {other}"))),
    }
}

fn generate_node_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("node-{}", id.chars().take(8).collect::<String>())
}
