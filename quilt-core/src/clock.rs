//! Hybrid logical clock for quilt-sync.
//!
//! Every locally recorded event is stamped by [`HybridClock::advance`];
//! every remotely received event is fed back through
//! [`HybridClock::update`] so the local clock never falls behind a stamp
//! it has observed. The resulting `(time, counter, author)` triple is
//! globally unique and [`event_order`] over it is the sole comparator
//! used for replay.
//!
//! The clock never reads the wall clock itself; callers pass the current
//! time in, which keeps every transition a pure function.

use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use quilt_types::PeerId;

/// One hybrid-logical-clock reading: wall milliseconds plus a logical
/// counter that disambiguates stamps taken within the same millisecond.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HlcStamp {
    /// Wall component, ms since the Unix epoch.
    pub time_ms: u64,
    /// Logical counter within `time_ms`.
    pub counter: u32,
}

impl HlcStamp {
    /// Create a stamp from its components.
    pub fn new(time_ms: u64, counter: u32) -> Self {
        Self { time_ms, counter }
    }
}

/// A peer's hybrid logical clock.
///
/// State transitions follow the classic HLC rules: local sends advance
/// the clock past the wall time, remote receives merge the remote stamp
/// in, and the result of either is strictly greater than everything the
/// clock has produced or observed before.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HybridClock {
    time_ms: u64,
    counter: u32,
}

impl HybridClock {
    /// Create a clock seeded with the current wall time.
    pub fn new(now_ms: u64) -> Self {
        Self {
            time_ms: now_ms,
            counter: 0,
        }
    }

    /// The current reading without advancing.
    pub fn stamp(&self) -> HlcStamp {
        HlcStamp::new(self.time_ms, self.counter)
    }

    /// Advance for a local event and return the stamp to attach to it.
    pub fn advance(&mut self, now_ms: u64) -> HlcStamp {
        if now_ms > self.time_ms {
            self.time_ms = now_ms;
            self.counter = 0;
        } else {
            self.counter += 1;
        }
        self.stamp()
    }

    /// Merge a remote stamp into the clock.
    ///
    /// Afterwards the clock reads strictly greater than both its prior
    /// state and `remote`. When the local clock is already ahead of both
    /// the remote stamp and the wall clock, the counter is bumped rather
    /// than reset; a reset there would let the clock re-issue a stamp it
    /// has already handed out.
    pub fn update(&mut self, remote: HlcStamp, now_ms: u64) {
        let merged = self.time_ms.max(remote.time_ms).max(now_ms);
        if merged == self.time_ms && self.time_ms == remote.time_ms {
            self.counter = self.counter.max(remote.counter) + 1;
        } else if merged == remote.time_ms {
            self.time_ms = remote.time_ms;
            self.counter = remote.counter + 1;
        } else if merged == self.time_ms {
            self.counter += 1;
        } else {
            self.time_ms = merged;
            self.counter = 0;
        }
    }
}

/// Total order over replayed events: stamp first, then author id bytes.
///
/// The author only breaks ties between truly concurrent events (identical
/// stamps); the choice is arbitrary but identical on every replica, which
/// is all replay determinism needs.
pub fn event_order(a: (u64, u32, &PeerId), b: (u64, u32, &PeerId)) -> Ordering {
    HlcStamp::new(a.0, a.1)
        .cmp(&HlcStamp::new(b.0, b.1))
        .then_with(|| a.2.cmp(b.2))
}

/// Current wall clock in ms since the Unix epoch.
///
/// The one impure helper in this crate; the engine threads its result
/// into [`HybridClock`] calls.
pub fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
