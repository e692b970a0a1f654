//! Read-only snapshot of engine and store state for diagnostics.

use std::collections::BTreeMap;

use quilt_core::{event_order, HlcStamp};
use quilt_types::{decode_events, keys, EngineError, EventRecord, PeerId, PeerMeta};

use super::{Engine, META_OR_SHARD_PATTERN};
use crate::adapter::StoreAdapter;

/// One peer's published meta.
#[derive(Debug, Clone)]
pub struct PeerSummary {
    /// The peer.
    pub peer: PeerId,
    /// Its meta record as currently stored.
    pub meta: PeerMeta,
}

/// One event with its author, as found in the store.
#[derive(Debug, Clone)]
pub struct DebugEvent {
    /// The authoring peer.
    pub author: PeerId,
    /// The stored event.
    pub event: EventRecord,
}

/// Snapshot returned by [`Engine::debug_report`].
#[derive(Debug, Clone)]
pub struct DebugReport {
    /// Every peer meta found in the store.
    pub peers: Vec<PeerSummary>,
    /// Every event across all live shards, in clock order.
    pub events: Vec<DebugEvent>,
    /// Total number of events found.
    pub event_total: usize,
    /// This engine's clock reading.
    pub clock: HlcStamp,
    /// The shard index local appends currently go to.
    pub current_shard: u32,
    /// Events recorded since the last baseline refresh.
    pub events_since_baseline: u32,
    /// Syncs run since the last garbage collection.
    pub syncs_since_gc: u32,
    /// Copy of the in-memory per-peer watermarks.
    pub known_increments: BTreeMap<PeerId, u64>,
}

impl<S: StoreAdapter> Engine<S> {
    /// Assemble a diagnostic snapshot.
    ///
    /// Read-only: mutates neither the store nor engine state, and does
    /// not take the busy flag, so it can run while an operation is in
    /// flight (it briefly waits on the state mutex for a consistent
    /// counter read).
    pub async fn debug_report(&self) -> Result<DebugReport, EngineError> {
        let all = self.store.scan(&META_OR_SHARD_PATTERN).await?;
        let mut peers = Vec::new();
        let mut events: Vec<DebugEvent> = Vec::new();
        for (key, text) in &all {
            if let Some(peer) = keys::peer_from_meta_key(key) {
                match PeerMeta::from_json(text) {
                    Ok(meta) => peers.push(PeerSummary { peer, meta }),
                    Err(err) => {
                        tracing::warn!(%peer, error = %err, "unreadable meta in debug report")
                    }
                }
            } else if let Some((author, index)) = keys::parse_shard_key(key) {
                match decode_events(text) {
                    Ok(list) => events.extend(
                        list.into_iter().map(|event| DebugEvent {
                            author: author.clone(),
                            event,
                        }),
                    ),
                    Err(err) => {
                        tracing::warn!(peer = %author, shard = index, error = %err, "unreadable shard in debug report")
                    }
                }
            }
        }
        events.sort_by(|a, b| {
            event_order(
                (a.event.hlc_time, a.event.hlc_counter, &a.author),
                (b.event.hlc_time, b.event.hlc_counter, &b.author),
            )
        });

        let state = self.state.lock().await;
        Ok(DebugReport {
            event_total: events.len(),
            peers,
            events,
            clock: state.clock.stamp(),
            current_shard: state.shards.current(),
            events_since_baseline: state.events_since_baseline,
            syncs_since_gc: state.syncs_since_gc,
            known_increments: state.known_increments.clone(),
        })
    }
}
