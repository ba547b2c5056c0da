use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Global counter mixed into every connection id
static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Opaque unique token identifying one tunnel in the registry
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generate a new unique connection id
    ///
    /// The id is composed of:
    /// - Current timestamp (lower 48 bits of nanoseconds since UNIX epoch)
    /// - Monotonic counter (lower 32 bits)
    ///
    /// The counter keeps ids unique even when many tunnels open within the
    /// same clock tick.
    pub fn generate() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();

        let counter = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);

        Self(format!(
            "{:x}{:08x}",
            now.as_nanos() & 0xffffffffffff,
            counter & 0xffffffff
        ))
    }

}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
