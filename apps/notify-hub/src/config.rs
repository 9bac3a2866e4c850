use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Bounds for the number of hex characters kept from a session hash.
const MIN_HASH_LEN: usize = 4;
const MAX_HASH_LEN: usize = 64;

/// Notification hub configuration, loaded from environment variables.
///
/// Every option has a default so the hub starts with an empty environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the WebSocket/HTTP server binds to.
    pub port: u16,
    /// External bus host and port.
    pub bus: BusSettings,
    /// Directory holding fallback notification/session files.
    pub spool_dir: PathBuf,
    /// How often the notification spool is drained.
    pub spool_poll_interval: Duration,
    /// How often the session spool is drained.
    pub session_spool_poll_interval: Duration,
    /// Interval between `server_ping` keepalive broadcasts.
    pub keepalive_interval: Duration,
    /// Interval between entity room activity pings.
    pub room_ping_interval: Duration,
    /// Entity room members idle longer than this are swept.
    pub inactivity_threshold: Duration,
    /// Interval between inactivity sweeps.
    pub sweep_interval: Duration,
    /// WebSocket-level ping interval on each connection.
    pub protocol_ping_interval: Duration,
    /// Hex characters kept from the session hash in `session_<hash>` ids.
    pub session_room_hash_len: usize,
    /// Cookie carrying the primary (booking) session.
    pub primary_session_cookie: String,
    /// Generic framework session cookie used as fallback.
    pub fallback_session_cookie: String,
    /// Directory of JSON session records. `None` disables identity lookup.
    pub session_store_dir: Option<PathBuf>,
    /// Base URL of the application data service.
    pub applications_url: Option<String>,
    /// Optional extra log destination.
    pub log_file: Option<PathBuf>,
}

/// Connection settings for the external pub/sub bus.
#[derive(Debug, Clone)]
pub struct BusSettings {
    pub host: String,
    pub port: u16,
    /// Handshake timeout for connect and publish.
    pub connect_timeout: Duration,
    /// Minimum delay between reconnect attempts.
    pub retry_delay: Duration,
}

impl BusSettings {
    pub fn url(&self) -> String {
        format!("redis://{}:{}/", self.host, self.port)
    }

    /// Bus settings read from the environment on their own, for
    /// out-of-process producers that don't need the full hub config.
    pub fn from_env() -> Self {
        Self {
            host: string_var("REDIS_HOST", "redis"),
            port: parsed_var("REDIS_PORT", 6379),
            connect_timeout: Duration::from_millis(parsed_var("BUS_CONNECT_TIMEOUT_MS", 2000)),
            retry_delay: Duration::from_secs(parsed_var("BUS_RETRY_SECS", 5)),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Unparseable values fall back to their default with a warning.
    pub fn from_env() -> Self {
        Self {
            port: parsed_var("PORT", 8080),
            bus: BusSettings::from_env(),
            spool_dir: PathBuf::from(string_var("SPOOL_DIR", "/tmp")),
            spool_poll_interval: Duration::from_millis(parsed_var("SPOOL_POLL_INTERVAL_MS", 1000)),
            session_spool_poll_interval: Duration::from_millis(parsed_var(
                "SESSION_SPOOL_POLL_INTERVAL_MS",
                2000,
            )),
            keepalive_interval: Duration::from_secs(parsed_var("KEEPALIVE_INTERVAL_SECS", 240)),
            room_ping_interval: Duration::from_secs(parsed_var("ROOM_PING_INTERVAL_SECS", 240)),
            inactivity_threshold: Duration::from_secs(parsed_var("INACTIVITY_THRESHOLD_SECS", 480)),
            sweep_interval: Duration::from_secs(parsed_var("SWEEP_INTERVAL_SECS", 480)),
            protocol_ping_interval: Duration::from_secs(parsed_var(
                "PROTOCOL_PING_INTERVAL_SECS",
                30,
            )),
            session_room_hash_len: clamp_hash_len(parsed_var("SESSION_ROOM_HASH_LEN", 10)),
            primary_session_cookie: string_var("PRIMARY_SESSION_COOKIE", "bookingfrontendsession"),
            fallback_session_cookie: string_var("FALLBACK_SESSION_COOKIE", "PHPSESSID"),
            session_store_dir: optional_var("SESSION_STORE_DIR").map(PathBuf::from),
            applications_url: optional_var("APPLICATIONS_URL"),
            log_file: log_file_from_env(),
        }
    }
}

/// `LOG_FILE` on its own, so logging can be set up before the rest of the
/// configuration is parsed.
pub fn log_file_from_env() -> Option<PathBuf> {
    optional_var("LOG_FILE").map(PathBuf::from)
}

impl Default for Config {
    /// The same values `from_env` yields for an empty environment.
    fn default() -> Self {
        Self {
            port: 8080,
            bus: BusSettings {
                host: "redis".to_string(),
                port: 6379,
                connect_timeout: Duration::from_millis(2000),
                retry_delay: Duration::from_secs(5),
            },
            spool_dir: PathBuf::from("/tmp"),
            spool_poll_interval: Duration::from_millis(1000),
            session_spool_poll_interval: Duration::from_millis(2000),
            keepalive_interval: Duration::from_secs(240),
            room_ping_interval: Duration::from_secs(240),
            inactivity_threshold: Duration::from_secs(480),
            sweep_interval: Duration::from_secs(480),
            protocol_ping_interval: Duration::from_secs(30),
            session_room_hash_len: 10,
            primary_session_cookie: "bookingfrontendsession".to_string(),
            fallback_session_cookie: "PHPSESSID".to_string(),
            session_store_dir: None,
            applications_url: None,
            log_file: None,
        }
    }
}

pub fn clamp_hash_len(len: usize) -> usize {
    len.clamp(MIN_HASH_LEN, MAX_HASH_LEN)
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.trim().is_empty())
}

fn string_var(name: &str, default: &str) -> String {
    optional_var(name).unwrap_or_else(|| default.to_string())
}

fn parsed_var<T>(name: &str, default: T) -> T
where
    T: FromStr + Copy + std::fmt::Display,
{
    match optional_var(name) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(var = name, value = %raw, %default, "invalid value, using default");
            default
        }),
        None => default,
    }
}
