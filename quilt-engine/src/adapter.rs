//! Store adapter contract plus an in-memory reference implementation.
//!
//! The engine never talks to a concrete store; it drives this trait. A
//! real backend wraps whatever quota'd key-value medium the host has
//! (browser profile storage, a cloud KV namespace, a file). The bundled
//! [`MemoryStore`] backs the test suites and doubles as a template for
//! writing adapters.
//!
//! Change notifications are delivered as batches over an unbounded
//! channel; delivery is asynchronous and may be coalesced by a backend.
//! Writes that would exceed the store's total budget must fail with
//! [`StoreError::QuotaExceeded`] - that dedicated error kind is the only
//! signal the engine's collect-and-retry path reacts to.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::mpsc;

use quilt_types::StoreError;

/// One committed mutation of a store key, as seen by subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyChange {
    /// The mutated key.
    pub key: String,
    /// Value before the mutation, if the key existed.
    pub old: Option<String>,
    /// Value after the mutation; `None` for a removal.
    pub new: Option<String>,
}

/// Contract between the engine and the shared key-value store.
///
/// Values are the JSON text of the records in `quilt-types`. The store
/// is shared by every peer with last-writer-wins semantics per key; the
/// engine's key partitioning guarantees peers never contend on a key.
/// A multi-key `set` does not have to be transactional - the protocol
/// tolerates partial writes because every missing or stale record is
/// rediscovered on the next scan.
#[async_trait]
pub trait StoreAdapter: Send + Sync + 'static {
    /// Read one value.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a batch of values.
    ///
    /// On success every entry is durable. Fails with
    /// [`StoreError::QuotaExceeded`] if the batch would push the store
    /// past its total budget, in which case nothing is written.
    async fn set(&self, entries: BTreeMap<String, String>) -> Result<(), StoreError>;

    /// Remove a batch of keys. Removing an absent key is not an error.
    async fn remove(&self, keys: &[String]) -> Result<(), StoreError>;

    /// Return every current entry whose key matches the pattern.
    async fn scan(&self, pattern: &Regex) -> Result<BTreeMap<String, String>, StoreError>;

    /// Subscribe to committed mutations, including those of other peers.
    ///
    /// Batches arrive asynchronously and may coalesce several mutations.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<Vec<KeyChange>>;

    /// Drop every subscription made through this adapter handle.
    fn unsubscribe_all(&self);
}

struct Subscriber {
    handle: u64,
    tx: mpsc::UnboundedSender<Vec<KeyChange>>,
}

struct Shared {
    entries: Mutex<HashMap<String, String>>,
    subscribers: Mutex<Vec<Subscriber>>,
    next_handle: AtomicU64,
    quota_bytes: Option<usize>,
}

impl Shared {
    fn notify(&self, changes: Vec<KeyChange>) {
        if changes.is_empty() {
            return;
        }
        self.subscribers
            .lock()
            .unwrap()
            .retain(|sub| sub.tx.send(changes.clone()).is_ok());
    }

    fn total_bytes(map: &HashMap<String, String>) -> usize {
        map.iter().map(|(k, v)| k.len() + v.len()).sum()
    }
}

/// In-memory store for tests and embedding.
///
/// All handles created with [`MemoryStore::handle`] share the same
/// entries and see each other's mutations, modelling several devices
/// attached to one shared store. Subscriptions are tracked per handle so
/// that `unsubscribe_all` on one device does not silence the others.
/// An optional quota makes `set` fail with
/// [`StoreError::QuotaExceeded`] once the total of key and value bytes
/// would exceed it.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
    handle_id: u64,
}

impl MemoryStore {
    /// Create a new empty store without a quota.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create a new empty store with a total byte budget.
    pub fn with_quota(quota_bytes: usize) -> Self {
        Self::build(Some(quota_bytes))
    }

    fn build(quota_bytes: Option<usize>) -> Self {
        Self {
            shared: Arc::new(Shared {
                entries: Mutex::new(HashMap::new()),
                subscribers: Mutex::new(Vec::new()),
                next_handle: AtomicU64::new(1),
                quota_bytes,
            }),
            handle_id: 0,
        }
    }

    /// A new adapter handle over the same shared entries.
    ///
    /// Use one handle per simulated device.
    pub fn handle(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            handle_id: self.shared.next_handle.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Number of entries currently stored.
    pub fn len(&self) -> usize {
        self.shared.entries.lock().unwrap().len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.shared.entries.lock().unwrap().is_empty()
    }

    /// Total key plus value bytes currently stored.
    pub fn used_bytes(&self) -> usize {
        Shared::total_bytes(&self.shared.entries.lock().unwrap())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoreAdapter for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.shared.entries.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, entries: BTreeMap<String, String>) -> Result<(), StoreError> {
        let changes = {
            let mut map = self.shared.entries.lock().unwrap();
            if let Some(quota) = self.shared.quota_bytes {
                let mut total = Shared::total_bytes(&map);
                for (key, value) in &entries {
                    match map.get(key) {
                        Some(old) => total = total - old.len() + value.len(),
                        None => total += key.len() + value.len(),
                    }
                }
                if total > quota {
                    return Err(StoreError::QuotaExceeded);
                }
            }
            let mut changes = Vec::with_capacity(entries.len());
            for (key, value) in entries {
                let old = map.insert(key.clone(), value.clone());
                changes.push(KeyChange {
                    key,
                    old,
                    new: Some(value),
                });
            }
            changes
        };
        self.shared.notify(changes);
        Ok(())
    }

    async fn remove(&self, keys: &[String]) -> Result<(), StoreError> {
        let changes = {
            let mut map = self.shared.entries.lock().unwrap();
            keys.iter()
                .filter_map(|key| {
                    map.remove(key).map(|old| KeyChange {
                        key: key.clone(),
                        old: Some(old),
                        new: None,
                    })
                })
                .collect()
        };
        self.shared.notify(changes);
        Ok(())
    }

    async fn scan(&self, pattern: &Regex) -> Result<BTreeMap<String, String>, StoreError> {
        Ok(self
            .shared
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, _)| pattern.is_match(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<Vec<KeyChange>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.subscribers.lock().unwrap().push(Subscriber {
            handle: self.handle_id,
            tx,
        });
        rx
    }

    fn unsubscribe_all(&self) {
        self.shared
            .subscribers
            .lock()
            .unwrap()
            .retain(|sub| sub.handle != self.handle_id);
    }
}
