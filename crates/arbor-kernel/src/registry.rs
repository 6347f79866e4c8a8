//! Registry of connected children.
//!
//! Each child is reachable by its id and by its server address. Both indexes
//! live under one lock, so every lookup sees them agree: every id maps to
//! exactly one entry and that entry's server address maps back to it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use arbor_types::{NodeEntry, VitalData};

use crate::nodespec::WILDCARD;
use crate::rpc::RpcChannel;

/// A registered child.
#[derive(Debug, Clone)]
pub struct SlaveInfo {
    pub id: String,
    /// Where the parent saw the registration come from.
    pub host_addr: String,
    /// Where the child accepts delegated commands.
    pub server: String,
    /// The registration connection, held open for liveness.
    pub channel: Arc<RpcChannel>,
}

impl SlaveInfo {
    pub fn entry(&self) -> NodeEntry {
        NodeEntry {
            id: self.id.clone(),
            host_addr: self.host_addr.clone(),
            server_addr: self.server.clone(),
        }
    }
}

#[derive(Default)]
struct Tables {
    by_id: HashMap<String, SlaveInfo>,
    by_server: HashMap<String, String>,
}

impl Tables {
    fn remove_id(&mut self, id: &str) -> Option<SlaveInfo> {
        let info = self.by_id.remove(id)?;
        if self.by_server.get(&info.server).is_some_and(|owner| owner == id) {
            self.by_server.remove(&info.server);
        }
        Some(info)
    }
}

/// Thread-safe child registry shared by the accept loop, the delegator and
/// the per-child liveness watchers.
pub struct SlaveRegistry {
    tables: Mutex<Tables>,
    next_id: AtomicU64,
}

impl SlaveRegistry {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        // A panic while holding the lock leaves the maps intact; keep going.
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a child and return its entry.
    ///
    /// A child without a self-reported id gets the next free number. Any
    /// previous entry holding the same id or the same server address is
    /// evicted first, so a restarted child simply replaces its old self.
    pub fn add(&self, vital: &VitalData, host_addr: &str, channel: Arc<RpcChannel>) -> SlaveInfo {
        let mut tables = self.lock();

        let id = if vital.id.is_empty() {
            loop {
                let candidate = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
                if !tables.by_id.contains_key(&candidate) {
                    break candidate;
                }
            }
        } else {
            vital.id.clone()
        };

        if tables.remove_id(&id).is_some() {
            tracing::info!("child {} re-registered, replacing old entry", id);
        }
        if let Some(old) = tables.by_server.get(&vital.server_addr).cloned() {
            tables.remove_id(&old);
            tracing::info!("child {} evicted: {} now belongs to {}", old, vital.server_addr, id);
        }

        let info = SlaveInfo {
            id: id.clone(),
            host_addr: host_addr.to_string(),
            server: vital.server_addr.clone(),
            channel,
        };
        tables.by_server.insert(info.server.clone(), id.clone());
        tables.by_id.insert(id, info.clone());
        info
    }

    /// Remove by id or server address.
    pub fn remove(&self, key: &str) -> Option<SlaveInfo> {
        let mut tables = self.lock();
        if tables.by_id.contains_key(key) {
            return tables.remove_id(key);
        }
        let id = tables.by_server.get(key).cloned()?;
        tables.remove_id(&id)
    }

    /// Remove `id` only if it is still backed by `channel`.
    ///
    /// Liveness watchers call this when their connection drops; by then the
    /// child may have re-registered on a new connection that must survive.
    pub fn remove_if_channel(&self, id: &str, channel: &Arc<RpcChannel>) -> Option<SlaveInfo> {
        let mut tables = self.lock();
        let current = tables.by_id.get(id)?;
        if Arc::ptr_eq(&current.channel, channel) {
            tables.remove_id(id)
        } else {
            None
        }
    }

    /// Look up by id first, then by server address.
    pub fn get(&self, key: &str) -> Option<SlaveInfo> {
        let tables = self.lock();
        if let Some(info) = tables.by_id.get(key) {
            return Some(info.clone());
        }
        let id = tables.by_server.get(key)?;
        tables.by_id.get(id).cloned()
    }

    /// Children matching any of `tokens`, each at most once.
    ///
    /// The wildcard selects every child. Unknown tokens are dropped.
    pub fn intersect(&self, tokens: &[String]) -> Vec<SlaveInfo> {
        self.intersect_reporting(tokens).0
    }

    /// Like [`intersect`](Self::intersect), also returning the tokens that matched nothing.
    pub fn intersect_reporting(&self, tokens: &[String]) -> (Vec<SlaveInfo>, Vec<String>) {
        let tables = self.lock();

        if tokens.iter().any(|t| t == WILDCARD) {
            let mut all: Vec<SlaveInfo> = tables.by_id.values().cloned().collect();
            all.sort_by(|a, b| node_order(&a.id, &b.id));
            return (all, Vec::new());
        }

        let mut seen = HashSet::new();
        let mut found = Vec::new();
        let mut unknown = Vec::new();
        for token in tokens {
            let info = tables
                .by_id
                .get(token)
                .or_else(|| tables.by_server.get(token).and_then(|id| tables.by_id.get(id)));
            match info {
                Some(info) => {
                    if seen.insert(info.id.clone()) {
                        found.push(info.clone());
                    }
                }
                None => unknown.push(token.clone()),
            }
        }
        (found, unknown)
    }

    /// Every child, ordered by id.
    pub fn snapshot(&self) -> Vec<NodeEntry> {
        let tables = self.lock();
        let mut entries: Vec<NodeEntry> = tables.by_id.values().map(SlaveInfo::entry).collect();
        entries.sort_by(|a, b| node_order(&a.id, &b.id));
        entries
    }

    pub fn len(&self) -> usize {
        self.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().by_id.is_empty()
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        let tables = self.lock();
        assert_eq!(tables.by_id.len(), tables.by_server.len());
        for (server, id) in &tables.by_server {
            let info = tables.by_id.get(id).expect("server index points at a live id");
            assert_eq!(&info.server, server);
        }
    }
}

impl Default for SlaveRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Numeric ids sort as numbers, everything else after them as text.
fn node_order(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => std::cmp::Ordering::Less,
        (Err(_), Ok(_)) => std::cmp::Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> Arc<RpcChannel> {
        let (a, _b) = tokio::io::duplex(64);
        Arc::new(RpcChannel::new(Box::new(a), "test"))
    }

    fn tokens(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_assigns_numeric_ids() {
        let reg = SlaveRegistry::new();
        let a = reg.add(&VitalData::new("", "10.0.0.1:7000"), "10.0.0.1:1", channel());
        let b = reg.add(&VitalData::new("", "10.0.0.2:7000"), "10.0.0.2:1", channel());
        assert_eq!(a.id, "1");
        assert_eq!(b.id, "2");
        reg.assert_consistent();
    }

    #[tokio::test]
    async fn test_assigned_id_skips_taken() {
        let reg = SlaveRegistry::new();
        reg.add(&VitalData::new("1", "h1:1"), "", channel());
        let b = reg.add(&VitalData::new("", "h2:1"), "", channel());
        assert_eq!(b.id, "2");
    }

    #[tokio::test]
    async fn test_same_id_replaces_entry() {
        let reg = SlaveRegistry::new();
        reg.add(&VitalData::new("7", "old:1"), "", channel());
        reg.add(&VitalData::new("7", "new:1"), "", channel());

        assert_eq!(reg.len(), 1);
        assert!(reg.get("old:1").is_none());
        assert_eq!(reg.get("new:1").unwrap().id, "7");
        reg.assert_consistent();
    }

    #[tokio::test]
    async fn test_same_server_evicts_other_id() {
        let reg = SlaveRegistry::new();
        reg.add(&VitalData::new("3", "h:1"), "", channel());
        reg.add(&VitalData::new("4", "h:1"), "", channel());

        assert_eq!(reg.len(), 1);
        assert!(reg.get("3").is_none());
        assert_eq!(reg.get("h:1").unwrap().id, "4");
        reg.assert_consistent();
    }

    #[tokio::test]
    async fn test_remove_by_either_key() {
        let reg = SlaveRegistry::new();
        reg.add(&VitalData::new("1", "h1:1"), "", channel());
        reg.add(&VitalData::new("2", "h2:1"), "", channel());

        assert_eq!(reg.remove("1").unwrap().server, "h1:1");
        assert_eq!(reg.remove("h2:1").unwrap().id, "2");
        assert!(reg.remove("1").is_none());
        assert!(reg.is_empty());
        reg.assert_consistent();
    }

    #[tokio::test]
    async fn test_remove_if_channel_spares_new_registration() {
        let reg = SlaveRegistry::new();
        let old = channel();
        reg.add(&VitalData::new("5", "h:1"), "", old.clone());
        reg.add(&VitalData::new("5", "h:1"), "", channel());

        assert!(reg.remove_if_channel("5", &old).is_none());
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test]
    async fn test_intersect() {
        let reg = SlaveRegistry::new();
        for id in ["1", "2", "3", "10"] {
            reg.add(&VitalData::new(id, format!("h{id}:1")), "", channel());
        }

        let ids = |v: Vec<SlaveInfo>| v.into_iter().map(|i| i.id).collect::<Vec<_>>();

        assert_eq!(ids(reg.intersect(&tokens(&["3", "1", "3"]))), vec!["3", "1"]);
        assert_eq!(ids(reg.intersect(&tokens(&["."]))), vec!["1", "2", "3", "10"]);
        assert_eq!(ids(reg.intersect(&tokens(&["h2:1"]))), vec!["2"]);
        assert!(reg.intersect(&tokens(&["99"])).is_empty());

        let (found, unknown) = reg.intersect_reporting(&tokens(&["1", "99", "x"]));
        assert_eq!(ids(found), vec!["1"]);
        assert_eq!(unknown, vec!["99", "x"]);
    }

    #[tokio::test]
    async fn test_snapshot_sorted() {
        let reg = SlaveRegistry::new();
        for id in ["10", "2", "b", "a"] {
            reg.add(&VitalData::new(id, format!("{id}:1")), "", channel());
        }
        let order: Vec<String> = reg.snapshot().into_iter().map(|e| e.id).collect();
        assert_eq!(order, vec!["2", "10", "a", "b"]);
    }

    #[tokio::test]
    async fn test_consistent_under_churn() {
        let reg = Arc::new(SlaveRegistry::new());
        let mut tasks = Vec::new();
        for t in 0..8u32 {
            let reg = reg.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..50u32 {
                    let id = ((t * 7 + i) % 5).to_string();
                    let server = format!("h{}:1", (t + i) % 4);
                    reg.add(&VitalData::new(id.clone(), server), "", channel());
                    if i % 3 == 0 {
                        reg.remove(&id);
                    }
                    tokio::task::yield_now().await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        reg.assert_consistent();
    }
}
