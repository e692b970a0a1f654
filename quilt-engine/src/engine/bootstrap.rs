//! First catch-up of a brand-new peer from existing group members.

use std::collections::BTreeMap;

use quilt_core::event_order;
use quilt_types::{
    decode_events, keys, BaselineRecord, EngineError, EventRecord, PeerId, PeerMeta, SeenRecord,
    PROTOCOL_VERSION,
};

use super::{Engine, EngineState};
use crate::adapter::StoreAdapter;

impl<S: StoreAdapter> Engine<S> {
    /// Bootstrap from the group's existing records.
    ///
    /// Adopts one baseline (any baseline is a valid cut over its
    /// includes vector; the choice only shifts work between snapshot
    /// load and event replay, so the byte-lexicographically first peer
    /// with a readable one is picked for determinism), replays every
    /// event after the adopted cut in clock order, then publishes this
    /// peer's own fresh records.
    pub(crate) async fn bootstrap(
        &self,
        state: &mut EngineState,
        metas: &BTreeMap<String, String>,
    ) -> Result<(), EngineError> {
        let mut peers: Vec<(PeerId, PeerMeta)> = Vec::new();
        for (key, text) in metas {
            let Some(peer) = keys::peer_from_meta_key(key) else {
                continue;
            };
            let meta = match PeerMeta::from_json(text) {
                Ok(meta) => meta,
                Err(err) => {
                    tracing::warn!(%peer, error = %err, "skipping peer with unreadable meta");
                    continue;
                }
            };
            if meta.version < PROTOCOL_VERSION {
                return Err(EngineError::UnsupportedVersion {
                    peer: peer.to_string(),
                    found: meta.version,
                    required: PROTOCOL_VERSION,
                });
            }
            peers.push((peer, meta));
        }

        // metas is keyed by `m_<peer>`, so peers is already in
        // byte-lexicographic peer order.
        let mut includes: BTreeMap<PeerId, u64> = BTreeMap::new();
        let mut baseline_author: Option<PeerId> = None;
        for (peer, _) in &peers {
            let Some(text) = self.store.get(&keys::baseline_key(peer)).await? else {
                continue;
            };
            match BaselineRecord::from_json(&text) {
                Ok(baseline) => {
                    self.applier.load_snapshot(baseline.state).await;
                    includes = baseline.includes;
                    baseline_author = Some(peer.clone());
                    break;
                }
                Err(err) => {
                    tracing::warn!(%peer, error = %err, "skipping unreadable baseline");
                }
            }
        }

        let mut known: BTreeMap<PeerId, u64> = BTreeMap::new();
        let mut incoming: Vec<(PeerId, EventRecord)> = Vec::new();
        for (peer, meta) in &peers {
            let floor = includes.get(peer).copied().unwrap_or(0);
            for index in &meta.shards {
                let Some(text) = self.store.get(&keys::shard_key(peer, *index)).await? else {
                    continue;
                };
                match decode_events(&text) {
                    Ok(events) => {
                        for event in events {
                            if event.increment > floor {
                                incoming.push((peer.clone(), event));
                            }
                        }
                    }
                    Err(err) => {
                        tracing::warn!(%peer, shard = *index, error = %err, "skipping unreadable shard");
                    }
                }
            }
            known.insert(peer.clone(), meta.last_increment);
        }

        incoming.sort_by(|a, b| {
            event_order(
                (a.1.hlc_time, a.1.hlc_counter, &a.0),
                (b.1.hlc_time, b.1.hlc_counter, &b.0),
            )
        });
        for (peer, event) in &incoming {
            if self.config.debug {
                tracing::debug!(%peer, increment = event.increment, kind = %event.op.kind, "replaying event");
            }
            self.applier.apply_event(event).await;
        }

        let now = quilt_core::wall_clock_ms();
        let mut batch = BTreeMap::new();
        batch.insert(keys::meta_key(&self.peer_id), PeerMeta::new().to_json()?);
        batch.insert(
            keys::seen_key(&self.peer_id),
            SeenRecord {
                increments: known.clone(),
                last_active: now,
            }
            .to_json()?,
        );
        if let Some(snapshot) = self.applier.snapshot().await {
            batch.insert(
                keys::baseline_key(&self.peer_id),
                BaselineRecord {
                    includes: known.clone(),
                    state: snapshot,
                }
                .to_json()?,
            );
        }
        self.store.set(batch).await?;

        state.known_increments = known;
        state.last_active = now;
        tracing::info!(
            peer = %self.peer_id,
            baseline = baseline_author.as_ref().map(|p| p.as_str()).unwrap_or("<none>"),
            replayed = incoming.len(),
            "bootstrapped from existing peers"
        );
        Ok(())
    }
}
