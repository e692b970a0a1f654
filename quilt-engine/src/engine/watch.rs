//! Reaction to store change notifications.
//!
//! The watcher task turns "some other peer's meta mutated" into a sync
//! attempt on the next task turn. It never runs a sync inside the
//! notifier delivery itself, and a sync rejected by the busy flag is
//! simply dropped - a later remote change re-triggers it.

use std::sync::Arc;

use tokio::task::JoinHandle;

use quilt_types::{keys, EngineError};

use super::Engine;
use crate::adapter::StoreAdapter;

/// Spawn the change watcher for an engine.
///
/// The task holds only a weak reference, so dropping the last external
/// engine handle ends the task instead of leaking it.
pub(crate) fn spawn_change_watcher<S: StoreAdapter>(engine: &Arc<Engine<S>>) -> JoinHandle<()> {
    let mut rx = engine.store.subscribe();
    let own_meta = keys::meta_key(&engine.peer_id);
    let weak = Arc::downgrade(engine);
    tokio::spawn(async move {
        while let Some(batch) = rx.recv().await {
            let remote_meta_changed = batch
                .iter()
                .any(|change| change.key.starts_with(keys::META_PREFIX) && change.key != own_meta);
            if !remote_meta_changed {
                continue;
            }
            let Some(engine) = weak.upgrade() else {
                break;
            };
            // Defer past the notifier turn before touching the engine.
            tokio::task::yield_now().await;
            match engine.sync().await {
                Ok(outcome) => {
                    if outcome.events_applied > 0 {
                        tracing::debug!(
                            peer = %engine.peer_id,
                            events_applied = outcome.events_applied,
                            "change-triggered sync"
                        );
                    }
                }
                Err(EngineError::Busy) => {
                    tracing::debug!(peer = %engine.peer_id, "change-triggered sync dropped, engine busy");
                }
                Err(err) => {
                    tracing::warn!(peer = %engine.peer_id, error = %err, "change-triggered sync failed");
                }
            }
        }
    })
}
