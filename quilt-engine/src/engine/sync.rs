//! Incremental pull sync against every peer's published log.

use std::collections::BTreeMap;

use quilt_core::{event_order, wall_clock_ms, HlcStamp};
use quilt_types::{
    decode_events, keys, EngineError, EventRecord, PeerId, PeerMeta, SeenRecord, PROTOCOL_VERSION,
};

use super::{BusyGuard, Engine, EngineState, META_OR_SHARD_PATTERN};
use crate::adapter::StoreAdapter;
use crate::config::SEEN_REFRESH_INTERVAL_MS;

/// What a sync run accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Number of remote events applied in clock order.
    pub events_applied: usize,
}

impl<S: StoreAdapter> Engine<S> {
    /// Pull and apply every remote event this peer has not seen yet.
    ///
    /// Scans all metas and shards in one pass, collects events above the
    /// per-peer watermark, applies them in clock order while feeding the
    /// clock, refreshes the own seen vector when productive (or stale by
    /// more than a day), and periodically hands off to garbage
    /// collection.
    pub async fn sync(&self) -> Result<SyncOutcome, EngineError> {
        let _busy = BusyGuard::acquire(&self.busy)?;
        let mut state = self.state.lock().await;
        self.sync_locked(&mut state).await
    }

    pub(crate) async fn sync_locked(
        &self,
        state: &mut EngineState,
    ) -> Result<SyncOutcome, EngineError> {
        let all = self.store.scan(&META_OR_SHARD_PATTERN).await?;

        // Watermarks are staged and only committed after the apply loop,
        // so an abort mid-collection cannot strand unapplied events
        // behind an advanced watermark.
        let mut known = state.known_increments.clone();
        let mut incoming: Vec<(PeerId, EventRecord)> = Vec::new();
        for (key, text) in &all {
            let Some(peer) = keys::peer_from_meta_key(key) else {
                continue;
            };
            if peer == self.peer_id {
                continue;
            }
            let meta = match PeerMeta::from_json(text) {
                Ok(meta) => meta,
                Err(err) => {
                    tracing::warn!(%peer, error = %err, "skipping peer with unreadable meta");
                    continue;
                }
            };
            if !known.contains_key(&peer) {
                if meta.version < PROTOCOL_VERSION {
                    return Err(EngineError::UnsupportedVersion {
                        peer: peer.to_string(),
                        found: meta.version,
                        required: PROTOCOL_VERSION,
                    });
                }
                known.insert(peer.clone(), 0);
            }
            let watermark = known.get(&peer).copied().unwrap_or(0);
            if meta.last_increment <= watermark {
                continue;
            }

            let mut lowest: Option<u64> = None;
            for index in &meta.shards {
                let shard_key = keys::shard_key(&peer, *index);
                let Some(text) = all.get(&shard_key) else {
                    continue;
                };
                let events = match decode_events(text) {
                    Ok(events) => events,
                    Err(err) => {
                        tracing::warn!(%peer, shard = *index, error = %err, "skipping unreadable shard");
                        continue;
                    }
                };
                for event in events {
                    if event.increment > watermark {
                        lowest = Some(lowest.map_or(event.increment, |l| l.min(event.increment)));
                        incoming.push((peer.clone(), event));
                    }
                }
            }
            // The watermark fast-forwards to the advertised last
            // increment even when shards no longer hold the whole range
            // (the remote may have collected events that every baseline
            // already covers). Surface the hole rather than hide it.
            match lowest {
                Some(lowest) if lowest > watermark + 1 => {
                    tracing::warn!(
                        %peer,
                        after = watermark,
                        resumed_at = lowest,
                        "gap in remote event log, relying on baseline coverage"
                    );
                }
                None => {
                    tracing::debug!(
                        %peer,
                        after = watermark,
                        advertised = meta.last_increment,
                        "no events above watermark remain in shards"
                    );
                }
                _ => {}
            }
            known.insert(peer.clone(), meta.last_increment);
        }

        incoming.sort_by(|a, b| {
            event_order(
                (a.1.hlc_time, a.1.hlc_counter, &a.0),
                (b.1.hlc_time, b.1.hlc_counter, &b.0),
            )
        });
        let events_applied = incoming.len();
        for (peer, event) in &incoming {
            if self.config.debug {
                tracing::debug!(%peer, increment = event.increment, kind = %event.op.kind, "applying remote event");
            }
            self.applier.apply_event(event).await;
            state
                .clock
                .update(HlcStamp::new(event.hlc_time, event.hlc_counter), wall_clock_ms());
        }
        state.known_increments = known;

        let now = wall_clock_ms();
        if events_applied > 0
            || now.saturating_sub(state.last_active) > SEEN_REFRESH_INTERVAL_MS
        {
            let seen = SeenRecord {
                increments: state.known_increments.clone(),
                last_active: now,
            };
            let batch = BTreeMap::from([(keys::seen_key(&self.peer_id), seen.to_json()?)]);
            self.store.set(batch).await?;
            state.last_active = now;
        }

        state.syncs_since_gc += 1;
        if state.syncs_since_gc >= self.config.gc_frequency {
            self.run_gc(state).await?;
            state.syncs_since_gc = 0;
        }

        if events_applied > 0 {
            tracing::debug!(peer = %self.peer_id, events_applied, "sync applied remote events");
        }
        Ok(SyncOutcome { events_applied })
    }
}
