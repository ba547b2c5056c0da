use crate::rules::RoutingDecision;
use crate::session::ConnectionId;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// One live tunnel
#[derive(Clone, Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub source_identity: Option<String>,
    pub target_host: String,
    pub target_port: u16,
    pub decision: RoutingDecision,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub start_time: SystemTime,
}

impl Connection {
    pub fn new(
        source_identity: Option<String>,
        target_host: String,
        target_port: u16,
        decision: RoutingDecision,
    ) -> Self {
        Self {
            id: ConnectionId::generate(),
            source_identity,
            target_host,
            target_port,
            decision,
            bytes_sent: 0,
            bytes_received: 0,
            start_time: SystemTime::now(),
        }
    }
}

/// Point-in-time copy of a [`Connection`] for observers
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConnectionSnapshot {
    pub id: ConnectionId,
    pub source_identity: Option<String>,
    pub target_host: String,
    pub target_port: u16,
    pub route: String,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Seconds since UNIX epoch
    pub started_at: u64,
}

impl From<&Connection> for ConnectionSnapshot {
    fn from(conn: &Connection) -> Self {
        Self {
            id: conn.id.clone(),
            source_identity: conn.source_identity.clone(),
            target_host: conn.target_host.clone(),
            target_port: conn.target_port,
            route: conn.decision.to_string(),
            bytes_sent: conn.bytes_sent,
            bytes_received: conn.bytes_received,
            started_at: conn
                .start_time
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        }
    }
}

/// Table of live tunnels.
///
/// Every mutation goes through the single table mutex, so counter updates from
/// many relay tasks never lose increments. Snapshots are copies taken under
/// the same lock.
#[derive(Debug, Default)]
pub struct Registry {
    connections: Mutex<HashMap<ConnectionId, Connection>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection. Returns `false` if the id is already tracked.
    pub fn track(&self, connection: Connection) -> bool {
        let mut map = self.connections.lock();
        if map.contains_key(&connection.id) {
            return false;
        }
        map.insert(connection.id.clone(), connection);
        true
    }

    /// Track a connection and return a guard that removes it when dropped
    pub fn register(self: &Arc<Self>, connection: Connection) -> TunnelGuard {
        let id = connection.id.clone();
        let tracked = self.track(connection);
        debug_assert!(tracked, "connection {} registered twice", id);
        TunnelGuard {
            registry: Arc::clone(self),
            id,
        }
    }

    pub fn remove(&self, id: &ConnectionId) -> Option<Connection> {
        self.connections.lock().remove(id)
    }

    /// Add byte deltas to a connection. Unknown ids are ignored.
    pub fn update_stats(&self, id: &ConnectionId, sent: u64, received: u64) {
        if let Some(conn) = self.connections.lock().get_mut(id) {
            conn.bytes_sent = conn.bytes_sent.saturating_add(sent);
            conn.bytes_received = conn.bytes_received.saturating_add(received);
        }
    }

    pub fn snapshot(&self) -> Vec<ConnectionSnapshot> {
        self.connections
            .lock()
            .values()
            .map(ConnectionSnapshot::from)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }

    /// Write the current snapshot as JSON, replacing `path` atomically
    pub fn save_snapshot(&self, path: &Path) -> io::Result<()> {
        let snapshot = self.snapshot();
        let json = serde_json::to_vec_pretty(&snapshot)?;
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        let mut tmp = PathBuf::from(path);
        tmp.set_extension("tmp");
        let mut f = File::create(&tmp)?;
        f.write_all(&json)?;
        f.flush()?;
        drop(f);
        fs::rename(tmp, path)?;
        Ok(())
    }
}

/// RAII handle for a tracked connection; removes it from the registry on drop
#[derive(Debug)]
pub struct TunnelGuard {
    registry: Arc<Registry>,
    id: ConnectionId,
}

impl TunnelGuard {
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn add_sent(&self, n: u64) {
        self.registry.update_stats(&self.id, n, 0);
    }

    pub fn add_received(&self, n: u64) {
        self.registry.update_stats(&self.id, 0, n);
    }
}

impl Drop for TunnelGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(host: &str) -> Connection {
        Connection::new(None, host.to_string(), 443, RoutingDecision::Direct)
    }

    #[test]
    fn test_track_and_remove() {
        let registry = Registry::new();
        let c = conn("example.com");
        let id = c.id.clone();

        assert!(registry.track(c.clone()));
        assert!(!registry.track(c));
        assert_eq!(registry.len(), 1);

        let removed = registry.remove(&id).expect("tracked connection");
        assert_eq!(removed.target_host, "example.com");
        assert!(registry.is_empty());
        assert!(registry.remove(&id).is_none());
    }

    #[test]
    fn test_update_stats_unknown_id_is_noop() {
        let registry = Registry::new();
        registry.update_stats(&ConnectionId::generate(), 10, 20);
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn test_snapshot_reflects_updates() {
        let registry = Registry::new();
        let c = conn("example.com");
        let id = c.id.clone();
        registry.track(c);

        registry.update_stats(&id, 100, 0);
        registry.update_stats(&id, 0, 250);

        let snap = registry.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].id, id);
        assert_eq!(snap[0].bytes_sent, 100);
        assert_eq!(snap[0].bytes_received, 250);
        assert_eq!(snap[0].route, "direct");
        assert_eq!(snap[0].target_port, 443);
    }

    #[test]
    fn test_guard_removes_on_drop() {
        let registry = Arc::new(Registry::new());
        {
            let guard = registry.register(conn("example.com"));
            guard.add_sent(5);
            guard.add_received(7);
            let snap = registry.snapshot();
            assert_eq!(snap[0].bytes_sent, 5);
            assert_eq!(snap[0].bytes_received, 7);
        }
        assert!(registry.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_sum_correctly() {
        let registry = Arc::new(Registry::new());
        let c = conn("example.com");
        let id = c.id.clone();
        registry.track(c);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..1000 {
                    registry.update_stats(&id, 3, 5);
                    tokio::task::yield_now().await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let snap = registry.snapshot();
        assert_eq!(snap[0].bytes_sent, 16 * 1000 * 3);
        assert_eq!(snap[0].bytes_received, 16 * 1000 * 5);
    }

    #[test]
    fn test_save_snapshot_writes_json() {
        let registry = Registry::new();
        let c = conn("example.com");
        registry.track(c);

        let dir = std::env::temp_dir().join(format!("ruleproxy-test-{}", ConnectionId::generate()));
        let path = dir.join("connections.json");
        registry.save_snapshot(&path).unwrap();

        let data = fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&data).unwrap();
        assert_eq!(parsed[0]["target_host"], "example.com");
        assert_eq!(parsed[0]["route"], "direct");
        assert!(!path.with_extension("tmp").exists());

        fs::remove_dir_all(dir).unwrap();
    }
}
