//! Application contract: how replicated events reach the host.
//!
//! The engine is parametric over the application's state and event
//! payloads; both are opaque JSON values. The host implements whichever
//! of the three hooks it needs - all have default bodies, so a peer that
//! only observes (or only records) implements nothing it does not use.

use async_trait::async_trait;
use serde_json::Value;

use quilt_types::EventRecord;

/// Callbacks through which the engine hands replicated data to the host.
///
/// `apply_event` must be idempotent over the event identity: after a
/// restart the same event may be replayed again if the author's baseline
/// does not yet include it. `snapshot` must be safe to call at any
/// engine suspension point; returning `None` means the hook is
/// unregistered and baseline updates are skipped for this peer.
/// `load_snapshot` is invoked at most once, during bootstrap.
#[async_trait]
pub trait Applier: Send + Sync {
    /// Fold one replicated event into the application state.
    async fn apply_event(&self, event: &EventRecord) {
        let _ = event;
    }

    /// Produce a full snapshot of the application state, or `None` if
    /// this peer does not advertise baselines.
    async fn snapshot(&self) -> Option<Value> {
        None
    }

    /// Replace the application state with a baseline snapshot.
    async fn load_snapshot(&self, state: Value) {
        let _ = state;
    }
}

/// An applier that ignores everything.
///
/// Useful for peers that only want the store-side protocol behavior,
/// and in tests that exercise the engine without an application.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullApplier;

#[async_trait]
impl Applier for NullApplier {}
