//! # quilt-engine
//!
//! Event-sourced multi-writer replication over a shared key-value blob
//! store with tight per-key and total size budgets.
//!
//! Peers never talk to each other; the store is the only rendezvous.
//! Each peer appends its events to sharded log keys, advertises progress
//! in a meta record, snapshots its state into a baseline, and pulls
//! everyone else's unseen events by scanning the store. A hybrid logical
//! clock gives all replicas the same total order, so every peer
//! converges on the same application state.
//!
//! ## Architecture
//!
//! ```text
//! Application → Engine → StoreAdapter → shared KV store
//!                  ↓
//!             quilt-core (pure clock + shard logic)
//! ```
//!
//! The host plugs in two things: a [`StoreAdapter`] wrapping the actual
//! store, and an [`Applier`] that folds replicated events into the
//! application state.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use quilt_engine::{Engine, EngineConfig, MemoryStore, NullApplier};
//! use quilt_types::PeerId;
//!
//! let store = Arc::new(MemoryStore::new());
//! let engine = Engine::new(
//!     PeerId::new("desk-1"),
//!     store,
//!     Arc::new(NullApplier),
//!     EngineConfig::default(),
//! );
//! engine.initialize().await?;
//! engine.record("todo_add", serde_json::json!({"id": "t1"})).await?;
//! let outcome = engine.sync().await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod adapter;
pub mod applier;
pub mod config;
mod engine;

pub use adapter::{KeyChange, MemoryStore, StoreAdapter};
pub use applier::{Applier, NullApplier};
pub use config::{
    EngineConfig, DEFAULT_BASELINE_THRESHOLD, DEFAULT_GC_FREQUENCY, DEFAULT_INACTIVE_TIMEOUT_MS,
    SEEN_REFRESH_INTERVAL_MS,
};
pub use engine::{DebugEvent, DebugReport, Engine, PeerSummary, SyncOutcome};
