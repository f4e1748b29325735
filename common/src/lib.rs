// Copyright 2024 Oxide Computer Company
use std::hash::Hasher;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use slog::{o, Drain, Logger};

mod properties;
pub use properties::Properties;

#[derive(thiserror::Error, Debug, PartialEq, Clone, Serialize, Deserialize)]
pub enum FerriteError {
    #[error("Error: {0}")]
    GenericError(String),

    #[error("IO Error: {0}")]
    IoError(String),

    #[error("chunk {0} is missing")]
    ChunkMissing(i64),

    #[error("chunk {0} version mismatch")]
    ChunkVersionMismatch(i64),

    #[error("out of chunk space")]
    OutOfSpace,

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl From<std::io::Error> for FerriteError {
    fn from(e: std::io::Error) -> Self {
        FerriteError::IoError(format!("{:?}", e))
    }
}

#[macro_export]
macro_rules! ferrite_bail {
    ($i:ident) => { return Err(FerriteError::$i) };
    ($i:ident, $str:expr) => { return Err(FerriteError::$i($str.to_string())) };
    ($i:ident, $fmt:expr, $($arg:tt)*) => { return Err(FerriteError::$i(format!($fmt, $($arg)*))) };
}

/// Status codes reported back to clients in response headers.
///
/// These are stored negated in an op's `status` field; `0` means success.
/// The first few match their errno namesakes so that client-side handling
/// can stay conventional.
pub mod status {
    pub const EAGAIN: i32 = 11;
    pub const EIO: i32 = 5;
    pub const ENOSPC: i32 = 28;
    pub const EBADRPC: i32 = 72;
    pub const EHOSTUNREACH: i32 = 113;
    /// Not an errno; reported when an op would exceed its max wait budget.
    pub const ESERVERBUSY: i32 = 1005;
}

/// Computes a hash for the given input buffers, suitable for protecting
/// payload integrity on the wire.
pub fn integrity_hash(args: &[&[u8]]) -> u64 {
    let mut hasher = twox_hash::XxHash64::with_seed(0);
    for arg in args {
        hasher.write(arg);
    }
    hasher.finish()
}

/// Wall clock time in microseconds since the epoch.
///
/// Op start times and wait budgets are tracked at this resolution.
pub fn microseconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

pub fn deadline_secs(secs: u64) -> tokio::time::Instant {
    tokio::time::Instant::now() + Duration::from_secs(secs)
}

/// Builds the process-wide logger: a terminal drain behind an async worker.
pub fn build_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain)
        .chan_size(0x2000)
        .build()
        .fuse();
    Logger::root(drain, o!())
}

/// Synchronous plain logger for tests, where the async drain would reorder
/// output across panics.
pub fn plain_logger() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(slog_term::FullFormat::new(plain).build().fuse(), o!())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integrity_hash_composes() {
        // Hashing one buffer or the same bytes split in two must agree.
        let whole = integrity_hash(&[b"some chunk payload"]);
        let split = integrity_hash(&[b"some chunk ", b"payload"]);
        assert_eq!(whole, split);
        assert_ne!(whole, integrity_hash(&[b"some chunk payloaX"]));
    }

    #[test]
    fn microseconds_is_plausible() {
        let a = microseconds();
        let b = microseconds();
        assert!(b >= a);
        // Sanity: we are well past 2001 in usecs.
        assert!(a > 1_000_000_000_000_000);
    }
}
