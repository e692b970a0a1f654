//! Record types stored under the shared key-value store.
//!
//! Every record is serialized as compact JSON text, which is what the
//! store actually holds. Each record family is authored by exactly one
//! peer; the engine never writes under another peer's keys.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{PeerId, RecordError, PROTOCOL_VERSION};

/// Per-peer metadata record, stored under `m_<peer>`.
///
/// `last_increment` is the largest increment the peer has ever appended;
/// `shards` is the sorted set of shard indices that currently hold any of
/// the peer's events (it may be empty after garbage collection).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerMeta {
    /// Protocol version the author speaks.
    pub version: u32,
    /// Largest increment ever appended by the author.
    pub last_increment: u64,
    /// Sorted shard indices that currently contain events.
    pub shards: Vec<u32>,
}

impl PeerMeta {
    /// Meta for a freshly initialized peer: no events, shard 0 open.
    pub fn new() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            last_increment: 0,
            shards: vec![0],
        }
    }

    /// Serialize to the JSON text stored under `m_<peer>`.
    pub fn to_json(&self) -> Result<String, RecordError> {
        encode(self)
    }

    /// Deserialize from stored JSON text.
    pub fn from_json(text: &str) -> Result<Self, RecordError> {
        decode(text)
    }
}

impl Default for PeerMeta {
    fn default() -> Self {
        Self::new()
    }
}

/// Baseline record, stored under `b_<peer>`.
///
/// `includes[q]` is the largest `q`-increment whose effect is already
/// folded into `state`. `state` is opaque to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineRecord {
    /// Largest folded-in increment per peer.
    pub includes: BTreeMap<PeerId, u64>,
    /// Opaque application state snapshot.
    pub state: Value,
}

impl BaselineRecord {
    /// Serialize to the JSON text stored under `b_<peer>`.
    pub fn to_json(&self) -> Result<String, RecordError> {
        encode(self)
    }

    /// Deserialize from stored JSON text.
    pub fn from_json(text: &str) -> Result<Self, RecordError> {
        decode(text)
    }
}

/// Seen-vector record, stored under `s_<peer>`.
///
/// `increments[q]` is the largest `q`-increment the author has observed
/// and integrated; `last_active` is the author's wall clock (ms) at its
/// last productive sync and doubles as the liveness heartbeat consumed
/// by inactive-peer eviction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeenRecord {
    /// Largest observed increment per peer.
    pub increments: BTreeMap<PeerId, u64>,
    /// Wall clock (ms since epoch) of the last productive sync.
    pub last_active: u64,
}

impl SeenRecord {
    /// Serialize to the JSON text stored under `s_<peer>`.
    pub fn to_json(&self) -> Result<String, RecordError> {
        encode(self)
    }

    /// Deserialize from stored JSON text.
    pub fn from_json(text: &str) -> Result<Self, RecordError> {
        decode(text)
    }
}

/// One replicated event.
///
/// `increment` is strictly monotonic per author and never reused;
/// `(hlc_time, hlc_counter, author)` is the globally unique replay key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Per-author strictly monotonic ordinal.
    pub increment: u64,
    /// Hybrid logical clock wall component, ms since epoch.
    pub hlc_time: u64,
    /// Hybrid logical clock counter component.
    pub hlc_counter: u32,
    /// The application operation carried by this event.
    pub op: EventOp,
}

/// An application operation. Opaque to the engine beyond its type tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventOp {
    /// Application-defined operation type.
    #[serde(rename = "type")]
    pub kind: String,
    /// Application-defined payload.
    pub data: Value,
}

impl EventOp {
    /// Create an operation from a type tag and opaque payload.
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }
}

/// Serialize a shard's event list to the JSON text stored under
/// `e_<peer>_<shard>`.
pub fn encode_events(events: &[EventRecord]) -> Result<String, RecordError> {
    encode(&events)
}

/// Deserialize a shard's event list from stored JSON text.
pub fn decode_events(text: &str) -> Result<Vec<EventRecord>, RecordError> {
    decode(text)
}

fn encode<T: Serialize>(value: &T) -> Result<String, RecordError> {
    serde_json::to_string(value).map_err(RecordError::Encode)
}

fn decode<'a, T: Deserialize<'a>>(text: &'a str) -> Result<T, RecordError> {
    serde_json::from_str(text).map_err(RecordError::Decode)
}
