/// Default HTTP API port (server)
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Events buffered per live connection before pushes start being dropped
pub const DEFAULT_OUTBOUND_QUEUE: usize = 64;

/// Upper bound on credential resolution during a live-connection handshake
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 5;

/// Server-initiated ping interval on live connections
pub const DEFAULT_PING_INTERVAL_SECS: u64 = 30;

/// HTTP header carrying the bearer credential
pub const TOKEN_HEADER: &str = "token";
