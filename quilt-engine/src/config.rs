//! Engine configuration.

/// Default number of recorded events between baseline refreshes.
pub const DEFAULT_BASELINE_THRESHOLD: u32 = 15;

/// Default number of syncs between garbage collection runs.
pub const DEFAULT_GC_FREQUENCY: u32 = 10;

/// Default idle time after which a peer may be evicted: 60 days.
pub const DEFAULT_INACTIVE_TIMEOUT_MS: u64 = 60 * 24 * 60 * 60 * 1000;

/// How stale the own seen vector may get before a sync refreshes it even
/// without applied events: 1 day.
pub const SEEN_REFRESH_INTERVAL_MS: u64 = 24 * 60 * 60 * 1000;

/// Tuning knobs for an [`Engine`](crate::Engine).
///
/// All fields have defaults; `with_*` methods adjust individual knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Recorded events between baseline refreshes.
    pub baseline_threshold: u32,
    /// Syncs between garbage collection runs.
    pub gc_frequency: u32,
    /// Whether garbage collection evicts long-idle peers.
    pub remove_inactive_devices: bool,
    /// Idle time (ms) after which a peer counts as inactive.
    pub inactive_device_timeout_ms: u64,
    /// Emit a trace line for every applied event.
    pub debug: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            baseline_threshold: DEFAULT_BASELINE_THRESHOLD,
            gc_frequency: DEFAULT_GC_FREQUENCY,
            remove_inactive_devices: false,
            inactive_device_timeout_ms: DEFAULT_INACTIVE_TIMEOUT_MS,
            debug: false,
        }
    }
}

impl EngineConfig {
    /// Configuration with all defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of recorded events between baseline refreshes.
    pub fn with_baseline_threshold(mut self, events: u32) -> Self {
        self.baseline_threshold = events;
        self
    }

    /// Set the number of syncs between garbage collection runs.
    pub fn with_gc_frequency(mut self, syncs: u32) -> Self {
        self.gc_frequency = syncs;
        self
    }

    /// Enable inactive-peer eviction with the given idle timeout.
    pub fn with_inactive_eviction(mut self, timeout_ms: u64) -> Self {
        self.remove_inactive_devices = true;
        self.inactive_device_timeout_ms = timeout_ms;
        self
    }

    /// Enable or disable per-event tracing.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}
