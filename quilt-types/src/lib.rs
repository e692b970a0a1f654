//! # quilt-types
//!
//! Record schema, key schema and error types for the quilt-sync
//! replication engine.
//!
//! This crate provides the foundational types used across all quilt-sync
//! crates:
//! - [`PeerId`] - opaque per-device identity
//! - [`PeerMeta`], [`BaselineRecord`], [`SeenRecord`], [`EventRecord`] -
//!   the four record families stored under the shared key-value store
//! - [`keys`] - the `m_` / `e_` / `b_` / `s_` key schema
//! - [`EngineError`], [`StoreError`], [`RecordError`] - error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod ids;
pub mod keys;
mod records;

pub use error::{EngineError, RecordError, StoreError};
pub use ids::PeerId;
pub use records::{
    decode_events, encode_events, BaselineRecord, EventOp, EventRecord, PeerMeta, SeenRecord,
};

/// Protocol version advertised in every peer meta record.
///
/// Readers reject any meta advertising a lower version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum serialized size of a single store value, in bytes.
///
/// Shard, meta and baseline values must all stay below this limit; the
/// shard manager rolls to a new shard before an append would cross it.
pub const MAX_KEY_SIZE: usize = 7168;
