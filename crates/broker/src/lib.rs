pub mod checker;
pub mod domains;
pub mod exec;
pub mod nginx;
pub mod permits;
pub mod ports;

use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

/// Broker failures, surfaced with a discriminant so the HTTP layer can map
/// them onto status codes and the duplex surface onto error envelopes.
#[derive(Debug)]
pub enum Error {
    MalformedRequest(String),
    AccessDenied(String),
    NotFound,
    Conflict(String),
    ExternallyManaged(String),
    Transient(String),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedRequest(reason) => write!(f, "malformed request: {reason}"),
            Self::AccessDenied(reason) => write!(f, "access denied: {reason}"),
            Self::NotFound => write!(f, "not found"),
            Self::Conflict(reason) => write!(f, "conflict: {reason}"),
            Self::ExternallyManaged(name) => write!(f, "externally managed: {name}"),
            Self::Transient(reason) => write!(f, "transient failure: {reason}"),
        }
    }
}

/// Milliseconds since the unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|it| it.as_millis() as u64)
        .unwrap_or(0)
}

/// generate an opaque lowercase hex token from `bytes` random bytes.
///
/// # Unit Test
///
/// ```
/// use openlink_server_broker::hex_token;
///
/// assert_eq!(hex_token(16).len(), 32);
/// assert_eq!(hex_token(8).len(), 16);
/// ```
pub fn hex_token(bytes: usize) -> String {
    let mut rng = rand::rng();
    (0..bytes)
        .map(|_| format!("{:02x}", rng.random_range(0..=u8::MAX)))
        .collect()
}
