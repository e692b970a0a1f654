//! The replication engine.
//!
//! One [`Engine`] runs per device. Local writes enter through
//! [`Engine::record`]; remote writes are pulled in by [`Engine::sync`],
//! which the change watcher triggers automatically whenever another
//! peer's meta key mutates. Baselines and garbage collection keep the
//! store inside its quota.
//!
//! A single busy flag serializes `initialize`, `record` and `sync`: a
//! second call while one is in flight fails immediately with
//! [`EngineError::Busy`] - there is no queue. The flag is a scoped guard,
//! so it is released on every exit path including errors.

mod bootstrap;
mod debug;
mod gc;
mod sync;
mod watch;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex as StdMutex, Weak};

use regex::Regex;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use quilt_core::{wall_clock_ms, HybridClock, ShardError, ShardManager};
use quilt_types::{
    decode_events, encode_events, keys, BaselineRecord, EngineError, EventOp, EventRecord, PeerId,
    PeerMeta, SeenRecord, StoreError, PROTOCOL_VERSION,
};

use crate::adapter::StoreAdapter;
use crate::applier::Applier;
use crate::config::EngineConfig;

pub use debug::{DebugEvent, DebugReport, PeerSummary};
pub use sync::SyncOutcome;

pub(crate) static META_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(keys::META_SCAN).expect("static scan pattern"));
pub(crate) static META_OR_SHARD_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(keys::META_OR_SHARD_SCAN).expect("static scan pattern"));
pub(crate) static BASELINE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(keys::BASELINE_SCAN).expect("static scan pattern"));
pub(crate) static SEEN_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(keys::SEEN_SCAN).expect("static scan pattern"));

/// Mutable engine state, guarded by the state mutex.
pub(crate) struct EngineState {
    pub(crate) clock: HybridClock,
    pub(crate) shards: ShardManager,
    pub(crate) last_increment: u64,
    pub(crate) events_since_baseline: u32,
    pub(crate) syncs_since_gc: u32,
    pub(crate) known_increments: BTreeMap<PeerId, u64>,
    pub(crate) last_active: u64,
}

impl EngineState {
    fn fresh(now_ms: u64) -> Self {
        Self {
            clock: HybridClock::new(now_ms),
            shards: ShardManager::default(),
            last_increment: 0,
            events_since_baseline: 0,
            syncs_since_gc: 0,
            known_increments: BTreeMap::new(),
            last_active: now_ms,
        }
    }
}

/// Scoped acquisition of the busy flag.
struct BusyGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, EngineError> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| EngineError::Busy)?;
        Ok(Self { flag })
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Event-sourced multi-writer replication engine over a shared
/// key-value store.
///
/// Construct with [`Engine::new`], then call [`Engine::initialize`]
/// exactly once before recording or syncing.
pub struct Engine<S: StoreAdapter> {
    pub(crate) peer_id: PeerId,
    pub(crate) store: Arc<S>,
    pub(crate) applier: Arc<dyn Applier>,
    pub(crate) config: EngineConfig,
    busy: AtomicBool,
    pub(crate) state: Mutex<EngineState>,
    watcher: StdMutex<Option<JoinHandle<()>>>,
    weak_self: Weak<Self>,
}

impl<S: StoreAdapter> Engine<S> {
    /// Create an engine for this device.
    ///
    /// Returns an `Arc` because the change watcher keeps a weak
    /// reference back to the engine.
    pub fn new(
        peer_id: PeerId,
        store: Arc<S>,
        applier: Arc<dyn Applier>,
        config: EngineConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            peer_id,
            store,
            applier,
            config,
            busy: AtomicBool::new(false),
            state: Mutex::new(EngineState::fresh(wall_clock_ms())),
            watcher: StdMutex::new(None),
            weak_self: weak.clone(),
        })
    }

    /// The peer id this engine writes under.
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Join the sync group.
    ///
    /// Exactly one of three paths runs, depending on what the store
    /// already holds: first-ever peer (seed fresh records), restart
    /// (restore counters from own records) or bootstrap (adopt a
    /// baseline and catch up on events after it). Afterwards the change
    /// watcher is subscribed so remote meta mutations trigger syncs.
    pub async fn initialize(&self) -> Result<(), EngineError> {
        {
            let _busy = BusyGuard::acquire(&self.busy)?;
            let mut state = self.state.lock().await;
            let metas = self.store.scan(&META_PATTERN).await?;
            let own_meta = keys::meta_key(&self.peer_id);
            if let Some(text) = metas.get(&own_meta) {
                self.restart(&mut state, text).await?;
            } else if metas.is_empty() {
                self.initialize_first(&mut state).await?;
            } else {
                self.bootstrap(&mut state, &metas).await?;
            }
        }
        self.start_watcher();
        Ok(())
    }

    /// Seed the store as the very first peer of the group.
    async fn initialize_first(&self, state: &mut EngineState) -> Result<(), EngineError> {
        let now = wall_clock_ms();
        let mut batch = BTreeMap::new();
        batch.insert(keys::meta_key(&self.peer_id), PeerMeta::new().to_json()?);
        batch.insert(
            keys::seen_key(&self.peer_id),
            SeenRecord {
                increments: BTreeMap::new(),
                last_active: now,
            }
            .to_json()?,
        );
        if let Some(snapshot) = self.applier.snapshot().await {
            batch.insert(
                keys::baseline_key(&self.peer_id),
                BaselineRecord {
                    includes: BTreeMap::new(),
                    state: snapshot,
                }
                .to_json()?,
            );
        }
        self.store.set(batch).await?;
        state.last_active = now;
        tracing::info!(peer = %self.peer_id, "initialized as first peer of the group");
        Ok(())
    }

    /// Restore state from our own records after a process restart.
    async fn restart(&self, state: &mut EngineState, meta_text: &str) -> Result<(), EngineError> {
        let meta = PeerMeta::from_json(meta_text)?;
        if meta.version < PROTOCOL_VERSION {
            return Err(EngineError::UnsupportedVersion {
                peer: self.peer_id.to_string(),
                found: meta.version,
                required: PROTOCOL_VERSION,
            });
        }
        state.shards = ShardManager::from_indices(&meta.shards);
        state.last_increment = meta.last_increment;
        if let Some(text) = self.store.get(&keys::seen_key(&self.peer_id)).await? {
            match SeenRecord::from_json(&text) {
                Ok(seen) => {
                    state.known_increments = seen.increments;
                    state.last_active = seen.last_active;
                }
                Err(err) => {
                    tracing::warn!(peer = %self.peer_id, error = %err, "own seen vector unreadable, starting from an empty one");
                }
            }
        }
        tracing::info!(
            peer = %self.peer_id,
            last_increment = meta.last_increment,
            shards = meta.shards.len(),
            "restarted from existing records"
        );
        Ok(())
    }

    /// Record a local event.
    ///
    /// Stamps the event with the hybrid logical clock, appends it to the
    /// current shard (rolling to a new shard when the append would cross
    /// the per-key size budget), and updates the own meta. Fails with
    /// [`EngineError::EventTooLarge`] if the event could never fit a
    /// store value on its own; nothing is written in that case.
    pub async fn record(
        &self,
        kind: impl Into<String>,
        data: Value,
    ) -> Result<EventRecord, EngineError> {
        let _busy = BusyGuard::acquire(&self.busy)?;
        let mut state = self.state.lock().await;

        let stamp = state.clock.advance(wall_clock_ms());
        let increment = state.last_increment + 1;
        let event = EventRecord {
            increment,
            hlc_time: stamp.time_ms,
            hlc_counter: stamp.counter,
            op: EventOp::new(kind, data),
        };
        state.shards.validate_event_size(&event).map_err(|err| {
            let ShardError::EventTooLarge { size, max } = err;
            EngineError::EventTooLarge { size, max }
        })?;

        let mut shard_key = keys::shard_key(&self.peer_id, state.shards.current());
        let mut events = match self.store.get(&shard_key).await? {
            Some(text) => decode_events(&text)?,
            None => Vec::new(),
        };
        if !events.is_empty() {
            // A shard we found content in must stay listed even if this
            // append rolls away from it.
            state.shards.touch_current();
        }
        events.push(event.clone());
        if events.len() > 1 && state.shards.should_roll(&events) {
            let index = state.shards.open_new_shard();
            shard_key = keys::shard_key(&self.peer_id, index);
            events = vec![event.clone()];
            tracing::debug!(peer = %self.peer_id, shard = index, "rolled to a new shard");
        } else {
            state.shards.touch_current();
        }

        let meta = PeerMeta {
            version: PROTOCOL_VERSION,
            last_increment: increment,
            shards: state.shards.active_sorted(),
        };
        let mut batch = BTreeMap::new();
        batch.insert(shard_key, encode_events(&events)?);
        batch.insert(keys::meta_key(&self.peer_id), meta.to_json()?);
        self.set_with_gc_retry(&mut state, batch).await?;

        state.last_increment = increment;
        state.events_since_baseline += 1;
        tracing::debug!(
            peer = %self.peer_id,
            increment,
            kind = %event.op.kind,
            "recorded event"
        );

        if state.events_since_baseline >= self.config.baseline_threshold {
            self.update_baseline(&mut state).await?;
        }
        Ok(event)
    }

    /// Rewrite the own baseline from a fresh application snapshot.
    ///
    /// Silently skipped when the applier does not register a snapshot
    /// hook; such a peer never advertises a baseline.
    pub(crate) async fn update_baseline(&self, state: &mut EngineState) -> Result<(), EngineError> {
        let Some(snapshot) = self.applier.snapshot().await else {
            return Ok(());
        };
        let mut includes = state.known_increments.clone();
        includes.insert(self.peer_id.clone(), state.last_increment);
        let baseline = BaselineRecord {
            includes,
            state: snapshot,
        };
        let mut batch = BTreeMap::new();
        batch.insert(keys::baseline_key(&self.peer_id), baseline.to_json()?);
        self.set_with_gc_retry(state, batch).await?;
        state.events_since_baseline = 0;
        tracing::debug!(peer = %self.peer_id, up_to = state.last_increment, "baseline refreshed");
        Ok(())
    }

    /// Write a batch, reclaiming quota once if the store rejects it.
    ///
    /// On [`QuotaExceeded`](quilt_types::StoreError::QuotaExceeded) runs
    /// garbage collection and retries exactly once; a second failure
    /// surfaces to the caller.
    pub(crate) async fn set_with_gc_retry(
        &self,
        state: &mut EngineState,
        batch: BTreeMap<String, String>,
    ) -> Result<(), EngineError> {
        match self.store.set(batch.clone()).await {
            Ok(()) => Ok(()),
            Err(StoreError::QuotaExceeded) => {
                tracing::warn!(peer = %self.peer_id, "store quota exceeded, collecting garbage and retrying");
                self.run_gc(state).await?;
                self.store.set(batch).await.map_err(EngineError::from)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Stop reacting to store changes.
    ///
    /// Aborts the change watcher and drops every subscription made
    /// through this engine's adapter handle. Explicit `record` and
    /// `sync` calls keep working.
    pub fn shutdown(&self) {
        if let Some(handle) = self.watcher.lock().unwrap().take() {
            handle.abort();
        }
        self.store.unsubscribe_all();
    }

    fn start_watcher(&self) {
        let Some(engine) = self.weak_self.upgrade() else {
            return;
        };
        let handle = watch::spawn_change_watcher(&engine);
        if let Some(previous) = self.watcher.lock().unwrap().replace(handle) {
            previous.abort();
        }
    }
}

impl<S: StoreAdapter> Drop for Engine<S> {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.watcher.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}
