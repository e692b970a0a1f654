//! Shared fixtures for the integration suites.
//!
//! Simulates several devices attached to one shared store: every peer
//! gets its own `MemoryStore` handle and a [`TodoApplier`] that both
//! folds events into a todo list and remembers every event it applied.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};

use quilt_engine::{Applier, Engine, EngineConfig, KeyChange, MemoryStore, StoreAdapter};
use quilt_types::{
    encode_events, keys, BaselineRecord, EventOp, EventRecord, PeerId, PeerMeta, SeenRecord,
    StoreError, PROTOCOL_VERSION,
};

/// Applier maintaining a todo list and a log of every applied event.
pub struct TodoApplier {
    todos: Mutex<BTreeMap<String, String>>,
    applied: Mutex<Vec<EventRecord>>,
    snapshots: bool,
}

impl TodoApplier {
    /// An applier that advertises baselines.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            todos: Mutex::new(BTreeMap::new()),
            applied: Mutex::new(Vec::new()),
            snapshots: true,
        })
    }

    /// An applier without a snapshot hook (never writes baselines).
    pub fn without_snapshots() -> Arc<Self> {
        Arc::new(Self {
            todos: Mutex::new(BTreeMap::new()),
            applied: Mutex::new(Vec::new()),
            snapshots: false,
        })
    }

    pub fn todos(&self) -> BTreeMap<String, String> {
        self.todos.lock().unwrap().clone()
    }

    pub fn todo_count(&self) -> usize {
        self.todos.lock().unwrap().len()
    }

    pub fn applied(&self) -> Vec<EventRecord> {
        self.applied.lock().unwrap().clone()
    }

    pub fn applied_count(&self) -> usize {
        self.applied.lock().unwrap().len()
    }

    /// Host-side mutation: the application updates its own state before
    /// recording, so local events never flow back through `apply_event`.
    pub fn add_local(&self, id: &str, title: &str) {
        self.todos
            .lock()
            .unwrap()
            .insert(id.to_string(), title.to_string());
    }
}

#[async_trait]
impl Applier for TodoApplier {
    async fn apply_event(&self, event: &EventRecord) {
        match event.op.kind.as_str() {
            "todo_add" => {
                let id = event.op.data["id"].as_str().unwrap_or_default().to_string();
                let title = event.op.data["title"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                self.todos.lock().unwrap().insert(id, title);
            }
            "todo_remove" => {
                if let Some(id) = event.op.data["id"].as_str() {
                    self.todos.lock().unwrap().remove(id);
                }
            }
            _ => {}
        }
        self.applied.lock().unwrap().push(event.clone());
    }

    async fn snapshot(&self) -> Option<Value> {
        if !self.snapshots {
            return None;
        }
        Some(json!(self.todos.lock().unwrap().clone()))
    }

    async fn load_snapshot(&self, state: Value) {
        let todos: BTreeMap<String, String> = serde_json::from_value(state).unwrap_or_default();
        *self.todos.lock().unwrap() = todos;
    }
}

/// One simulated device.
pub struct Peer {
    pub engine: Arc<Engine<MemoryStore>>,
    pub applier: Arc<TodoApplier>,
    pub store: MemoryStore,
}

impl Peer {
    /// Apply a todo locally and record the matching event.
    pub async fn add_todo(&self, id: &str, title: &str) -> EventRecord {
        self.applier.add_local(id, title);
        self.engine
            .record("todo_add", todo(id, title))
            .await
            .unwrap()
    }
}

/// Payload of a `todo_add` event.
pub fn todo(id: &str, title: &str) -> Value {
    json!({ "id": id, "title": title })
}

/// Initialize a peer and detach its change watcher, so tests drive every
/// sync explicitly.
pub async fn spawn_peer(store: &MemoryStore, id: &str, config: EngineConfig) -> Peer {
    let peer = spawn_live_peer(store, id, config).await;
    peer.engine.shutdown();
    peer
}

/// Initialize a peer and leave its change watcher running.
pub async fn spawn_live_peer(store: &MemoryStore, id: &str, config: EngineConfig) -> Peer {
    spawn_peer_with(store, id, config, TodoApplier::new(), false).await
}

/// Initialize a peer with a specific applier; `quiet` detaches the
/// change watcher.
pub async fn spawn_peer_with(
    store: &MemoryStore,
    id: &str,
    config: EngineConfig,
    applier: Arc<TodoApplier>,
    quiet: bool,
) -> Peer {
    let handle = store.handle();
    let engine = Engine::new(
        PeerId::new(id),
        Arc::new(handle.clone()),
        applier.clone(),
        config,
    );
    engine.initialize().await.unwrap();
    if quiet {
        engine.shutdown();
    }
    Peer {
        engine,
        applier,
        store: handle,
    }
}

/// Write one raw value into the store.
pub async fn put(store: &MemoryStore, key: String, value: String) {
    store.set(BTreeMap::from([(key, value)])).await.unwrap();
}

/// Read and decode a peer meta straight from the store.
pub async fn read_meta(store: &MemoryStore, peer: &str) -> Option<PeerMeta> {
    let text = store
        .get(&keys::meta_key(&PeerId::new(peer)))
        .await
        .unwrap()?;
    Some(PeerMeta::from_json(&text).unwrap())
}

/// Read and decode a shard straight from the store.
pub async fn read_shard(store: &MemoryStore, peer: &str, index: u32) -> Option<Vec<EventRecord>> {
    let text = store
        .get(&keys::shard_key(&PeerId::new(peer), index))
        .await
        .unwrap()?;
    Some(quilt_types::decode_events(&text).unwrap())
}

/// Read and decode a seen vector straight from the store.
pub async fn read_seen(store: &MemoryStore, peer: &str) -> Option<SeenRecord> {
    let text = store
        .get(&keys::seen_key(&PeerId::new(peer)))
        .await
        .unwrap()?;
    Some(SeenRecord::from_json(&text).unwrap())
}

/// Read and decode a baseline straight from the store.
pub async fn read_baseline(store: &MemoryStore, peer: &str) -> Option<BaselineRecord> {
    let text = store
        .get(&keys::baseline_key(&PeerId::new(peer)))
        .await
        .unwrap()?;
    Some(BaselineRecord::from_json(&text).unwrap())
}

/// Build a `todo_add` event with explicit increment and clock reading.
pub fn make_event(increment: u64, hlc_time: u64, id: &str, title: &str) -> EventRecord {
    EventRecord {
        increment,
        hlc_time,
        hlc_counter: 0,
        op: EventOp::new("todo_add", todo(id, title)),
    }
}

/// Seed a peer's full record set directly into the store, bypassing any
/// engine: one shard of events, a meta, a seen vector and optionally a
/// baseline.
pub async fn seed_peer(
    store: &MemoryStore,
    peer: &str,
    events: Vec<EventRecord>,
    baseline: Option<BaselineRecord>,
    last_active: u64,
) {
    let peer = PeerId::new(peer);
    let last_increment = events.iter().map(|e| e.increment).max().unwrap_or(0);
    let mut batch = BTreeMap::new();
    batch.insert(
        keys::meta_key(&peer),
        PeerMeta {
            version: PROTOCOL_VERSION,
            last_increment,
            shards: vec![0],
        }
        .to_json()
        .unwrap(),
    );
    batch.insert(
        keys::shard_key(&peer, 0),
        encode_events(&events).unwrap(),
    );
    batch.insert(
        keys::seen_key(&peer),
        SeenRecord {
            increments: BTreeMap::new(),
            last_active,
        }
        .to_json()
        .unwrap(),
    );
    if let Some(baseline) = baseline {
        batch.insert(keys::baseline_key(&peer), baseline.to_json().unwrap());
    }
    store.set(batch).await.unwrap();
}

/// Every key currently in the store.
pub async fn all_keys(store: &MemoryStore) -> Vec<String> {
    store
        .scan(&Regex::new(".").unwrap())
        .await
        .unwrap()
        .into_keys()
        .collect()
}

/// Poll until `check` passes or two seconds elapse.
pub async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Store wrapper whose operations genuinely suspend, so that two
/// concurrently polled engine operations really overlap.
pub struct SlowStore {
    inner: MemoryStore,
}

impl SlowStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self { inner }
    }

    async fn pause() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[async_trait]
impl StoreAdapter for SlowStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Self::pause().await;
        self.inner.get(key).await
    }

    async fn set(&self, entries: BTreeMap<String, String>) -> Result<(), StoreError> {
        Self::pause().await;
        self.inner.set(entries).await
    }

    async fn remove(&self, keys: &[String]) -> Result<(), StoreError> {
        Self::pause().await;
        self.inner.remove(keys).await
    }

    async fn scan(&self, pattern: &Regex) -> Result<BTreeMap<String, String>, StoreError> {
        Self::pause().await;
        self.inner.scan(pattern).await
    }

    fn subscribe(&self) -> tokio::sync::mpsc::UnboundedReceiver<Vec<KeyChange>> {
        self.inner.subscribe()
    }

    fn unsubscribe_all(&self) {
        self.inner.unsubscribe_all()
    }
}
