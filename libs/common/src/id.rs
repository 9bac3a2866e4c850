use ulid::Ulid;

/// Generates a new ULID-based ID with the given prefix.
///
/// ULIDs sort by creation time, so the ids double as monotonically
/// informative tokens (spool file names, ping ids).
///
/// # Examples
/// ```
/// let id = notify_common::id::prefixed_ulid("ping");
/// assert!(id.starts_with("ping_"));
/// ```
pub fn prefixed_ulid(prefix: &str) -> String {
    format!("{}_{}", prefix, Ulid::new())
}

/// Well-known ID prefixes.
pub mod prefix {
    /// Server reply to a client `ping`.
    pub const PONG: &str = "pong";
    /// Keepalive `server_ping` broadcast.
    pub const SERVER_PING: &str = "sping";
    /// Per-room activity probe.
    pub const ROOM_PING: &str = "rping";
    /// Spool file token.
    pub const SPOOL: &str = "spl";
}

/// Microseconds since the Unix epoch, used as the leading, sortable part
/// of spool file names.
pub fn unix_micros() -> i64 {
    chrono::Utc::now().timestamp_micros()
}
