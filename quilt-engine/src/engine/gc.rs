//! Garbage collection: reclaim quota once every baseline covers a prefix
//! of the own log, and optionally evict peers that went silent.

use std::collections::BTreeMap;

use quilt_core::{wall_clock_ms, ShardManager};
use quilt_types::{
    decode_events, encode_events, keys, BaselineRecord, EngineError, EventRecord, PeerMeta,
    SeenRecord,
};

use super::{Engine, EngineState, BASELINE_PATTERN, SEEN_PATTERN};
use crate::adapter::StoreAdapter;

impl<S: StoreAdapter> Engine<S> {
    /// Drop own events that every extant baseline already covers.
    ///
    /// The safe cut is the minimum of `includes[self]` over all
    /// baselines in the store (0 when any baseline is unreadable - its
    /// needs are unknown, so nothing is provably safe). With no baseline
    /// anywhere the whole log is reclaimable. Shards that end up empty
    /// are deleted, partially covered ones rewritten, untouched ones
    /// left alone.
    pub(crate) async fn run_gc(&self, state: &mut EngineState) -> Result<(), EngineError> {
        if self.config.remove_inactive_devices {
            self.evict_inactive(state).await?;
        }

        let baselines = self.store.scan(&BASELINE_PATTERN).await?;
        let safe = if baselines.is_empty() {
            state.last_increment
        } else {
            let mut safe = u64::MAX;
            for (key, text) in &baselines {
                let cut = match BaselineRecord::from_json(text) {
                    Ok(baseline) => baseline.includes.get(&self.peer_id).copied().unwrap_or(0),
                    Err(err) => {
                        tracing::warn!(%key, error = %err, "unreadable baseline blocks collection");
                        0
                    }
                };
                safe = safe.min(cut);
            }
            safe
        };
        if safe == 0 {
            tracing::debug!(peer = %self.peer_id, "no provably safe cut, nothing collected");
            return Ok(());
        }

        // The store's meta is the source of truth for which shards
        // exist; the in-memory view can be behind it after a
        // quota-retry wrote a pre-collection batch back.
        let meta_key = keys::meta_key(&self.peer_id);
        let Some(meta_text) = self.store.get(&meta_key).await? else {
            return Ok(());
        };
        let meta = PeerMeta::from_json(&meta_text)?;

        let mut rewritten: BTreeMap<String, String> = BTreeMap::new();
        let mut emptied: Vec<String> = Vec::new();
        let mut remaining: Vec<u32> = Vec::new();
        let mut dropped = 0usize;
        for index in &meta.shards {
            let shard_key = keys::shard_key(&self.peer_id, *index);
            let Some(text) = self.store.get(&shard_key).await? else {
                continue;
            };
            let events = decode_events(&text)?;
            let kept: Vec<EventRecord> = events
                .iter()
                .filter(|event| event.increment > safe)
                .cloned()
                .collect();
            if kept.len() == events.len() {
                remaining.push(*index);
                continue;
            }
            dropped += events.len() - kept.len();
            if kept.is_empty() {
                emptied.push(shard_key);
            } else {
                rewritten.insert(shard_key, encode_events(&kept)?);
                remaining.push(*index);
            }
        }
        if dropped == 0 {
            return Ok(());
        }

        let previous_current = state.shards.current();
        state.shards = ShardManager::from_indices(&remaining);
        state.shards.advance_current_to(previous_current);
        let new_meta = PeerMeta {
            version: meta.version,
            last_increment: meta.last_increment,
            shards: remaining,
        };
        let mut batch = rewritten;
        batch.insert(meta_key, new_meta.to_json()?);
        self.store.set(batch).await?;
        if !emptied.is_empty() {
            self.store.remove(&emptied).await?;
        }
        tracing::info!(
            peer = %self.peer_id,
            cut = safe,
            events = dropped,
            deleted_shards = emptied.len(),
            "garbage collected"
        );
        Ok(())
    }

    /// Delete every record of peers idle past the configured timeout.
    async fn evict_inactive(&self, state: &mut EngineState) -> Result<(), EngineError> {
        let seen_records = self.store.scan(&SEEN_PATTERN).await?;
        let now = wall_clock_ms();
        let mut evicted_any = false;
        for (key, text) in &seen_records {
            let Some(peer) = keys::peer_from_seen_key(key) else {
                continue;
            };
            if peer == self.peer_id {
                continue;
            }
            let seen = match SeenRecord::from_json(text) {
                Ok(seen) => seen,
                Err(err) => {
                    tracing::warn!(%peer, error = %err, "skipping peer with unreadable seen vector");
                    continue;
                }
            };
            if seen.last_active == 0
                || now.saturating_sub(seen.last_active) <= self.config.inactive_device_timeout_ms
            {
                continue;
            }

            let mut doomed = vec![
                keys::meta_key(&peer),
                keys::baseline_key(&peer),
                keys::seen_key(&peer),
            ];
            if let Some(meta_text) = self.store.get(&keys::meta_key(&peer)).await? {
                match PeerMeta::from_json(&meta_text) {
                    Ok(meta) => {
                        doomed.extend(meta.shards.iter().map(|i| keys::shard_key(&peer, *i)));
                    }
                    Err(err) => {
                        tracing::warn!(%peer, error = %err, "evicting peer with unreadable meta, shards unknown");
                    }
                }
            }
            self.store.remove(&doomed).await?;
            state.known_increments.remove(&peer);
            evicted_any = true;
            tracing::info!(
                %peer,
                idle_ms = now.saturating_sub(seen.last_active),
                "evicted inactive peer"
            );
        }
        if evicted_any {
            let seen = SeenRecord {
                increments: state.known_increments.clone(),
                last_active: now,
            };
            let batch = BTreeMap::from([(keys::seen_key(&self.peer_id), seen.to_json()?)]);
            self.store.set(batch).await?;
            state.last_active = now;
        }
        Ok(())
    }
}
