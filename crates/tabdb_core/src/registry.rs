//! Per-context registries: reference-counted electors and open instances.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tabdb_channel::{ChannelHub, LeaderElector};

#[derive(Debug)]
struct ElectorEntry {
    elector: Arc<LeaderElector>,
    ref_count: usize,
}

/// Shares one [`LeaderElector`] per database name among the instances of
/// a context.
///
/// The first [`acquire`](Self::acquire) for a name opens a channel endpoint
/// and starts an elector; the matching last [`release`](Self::release)
/// closes it, which makes a leading context step down.
#[derive(Debug)]
pub struct ElectorRegistry {
    hub: ChannelHub,
    channel_prefix: String,
    entries: Mutex<HashMap<String, ElectorEntry>>,
}

impl ElectorRegistry {
    /// Creates an empty registry opening channels on `hub`.
    pub fn new(hub: ChannelHub, channel_prefix: impl Into<String>) -> Self {
        Self {
            hub,
            channel_prefix: channel_prefix.into(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the elector for `database_name`, starting it if needed, and
    /// takes a reference.
    ///
    /// Must be called inside a tokio runtime.
    pub fn acquire(&self, database_name: &str) -> Arc<LeaderElector> {
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(database_name.to_string())
            .or_insert_with(|| {
                let channel = self
                    .hub
                    .open(&format!("{}{}", self.channel_prefix, database_name));
                tracing::debug!(database = database_name, "starting leader elector");
                ElectorEntry {
                    elector: Arc::new(LeaderElector::start(channel)),
                    ref_count: 0,
                }
            });
        entry.ref_count += 1;
        tracing::trace!(database = database_name, ref_count = entry.ref_count, "elector acquired");
        Arc::clone(&entry.elector)
    }

    /// Drops a reference. The last one closes the elector.
    pub async fn release(&self, database_name: &str) {
        let closing = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(database_name) else {
                tracing::warn!(database = database_name, "released an elector that was not acquired");
                return;
            };
            entry.ref_count = entry.ref_count.saturating_sub(1);
            tracing::trace!(database = database_name, ref_count = entry.ref_count, "elector released");
            if entry.ref_count == 0 {
                entries.remove(database_name).map(|entry| entry.elector)
            } else {
                None
            }
        };

        if let Some(elector) = closing {
            tracing::debug!(database = database_name, "closing leader elector");
            elector.close().await;
        }
    }

    /// Returns the number of references held for `database_name`.
    pub fn ref_count(&self, database_name: &str) -> usize {
        self.entries
            .lock()
            .get(database_name)
            .map_or(0, |entry| entry.ref_count)
    }

    /// Returns the elector for `database_name` without taking a reference.
    pub fn get(&self, database_name: &str) -> Option<Arc<LeaderElector>> {
        self.entries
            .lock()
            .get(database_name)
            .map(|entry| Arc::clone(&entry.elector))
    }

    /// Returns the number of running electors.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if no elector is running.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Ids of the instances of a context that are not closed yet.
#[derive(Debug, Default)]
pub(crate) struct OpenInstances {
    next_id: AtomicU64,
    ids: Mutex<HashSet<u64>>,
}

impl OpenInstances {
    /// Registers a new instance and returns its id.
    pub(crate) fn insert(&self) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.ids.lock().insert(id);
        id
    }

    /// Unregisters an instance. Returns false if it was not registered.
    pub(crate) fn remove(&self, id: u64) -> bool {
        self.ids.lock().remove(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.ids.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn electors_are_shared_and_counted() {
        let registry = ElectorRegistry::new(ChannelHub::new(), "tabdb-");
        let first = registry.acquire("app");
        let second = registry.acquire("app");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.ref_count("app"), 2);
        assert_eq!(first.channel().name(), "tabdb-app");

        registry.release("app").await;
        assert_eq!(registry.ref_count("app"), 1);
        assert!(!first.channel().is_closed());

        registry.release("app").await;
        assert_eq!(registry.ref_count("app"), 0);
        assert!(registry.is_empty());
        assert!(first.channel().is_closed());
    }

    #[tokio::test]
    async fn databases_have_separate_electors() {
        let registry = ElectorRegistry::new(ChannelHub::new(), "tabdb-");
        let a = registry.acquire("a");
        let b = registry.acquire("b");
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 2);
        timeout(Duration::from_secs(5), a.await_leadership())
            .await
            .unwrap()
            .unwrap();
        timeout(Duration::from_secs(5), b.await_leadership())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn releasing_unknown_name_is_harmless() {
        let registry = ElectorRegistry::new(ChannelHub::new(), "tabdb-");
        registry.release("ghost").await;
        assert_eq!(registry.ref_count("ghost"), 0);
    }

    #[test]
    fn open_instances_track_ids() {
        let open = OpenInstances::default();
        let a = open.insert();
        let b = open.insert();
        assert_ne!(a, b);
        assert_eq!(open.len(), 2);
        assert!(open.remove(a));
        assert!(!open.remove(a));
        assert_eq!(open.len(), 1);
    }
}
