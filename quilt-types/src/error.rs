//! Error types for quilt-sync.

use thiserror::Error;

/// Errors reported by a store adapter.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The write would exceed the store's total quota.
    ///
    /// A dedicated variant so the engine never has to sniff error text;
    /// this is the only store failure the engine reacts to (by running
    /// garbage collection and retrying once).
    #[error("store quota exceeded")]
    QuotaExceeded,

    /// Any other backend failure, propagated unmodified.
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Errors from encoding or decoding stored records.
#[derive(Debug, Error)]
pub enum RecordError {
    /// Record serialization failed.
    #[error("record encode failed: {0}")]
    Encode(#[source] serde_json::Error),

    /// Record deserialization failed.
    #[error("record decode failed: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Top-level errors surfaced by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Another engine operation is already in flight.
    ///
    /// There is no queue; the caller retries when the current operation
    /// finishes.
    #[error("engine is busy with another operation")]
    Busy,

    /// A single event alone would exceed the per-key size limit.
    #[error("event of {size} estimated bytes exceeds the per-key limit of {max} bytes")]
    EventTooLarge {
        /// Estimated serialized size of the event.
        size: usize,
        /// The per-key limit.
        max: usize,
    },

    /// A discovered peer meta advertises an older protocol version.
    #[error("peer {peer} advertises protocol version {found}, this build requires at least {required}")]
    UnsupportedVersion {
        /// The peer whose meta failed validation.
        peer: String,
        /// The version the peer advertises.
        found: u32,
        /// The minimum version this build accepts.
        required: u32,
    },

    /// A store adapter failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A codec failure on a record this engine authors.
    ///
    /// Malformed *remote* records are skipped with a warning instead of
    /// surfacing here.
    #[error(transparent)]
    Codec(#[from] RecordError),
}
