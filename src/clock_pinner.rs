//! Monotonic clock pinning
//!
//! Some receiver builds stamp pulses with the monotonic (since-boot)
//! clock while GPS fixes carry realtime. The two clocks tick at the same
//! rate, so a single offset converts one to the other. The pinner
//! brackets each realtime fix between the monotonic observations on
//! either side of it: if the monotonic clock read `m1` just before a fix
//! at realtime `v` and `m2` just after, the offset lies in
//! `[v - m2, v - m1]`. The tightest bracket seen so far wins; the offset
//! is usable once the bracket is narrower than the tolerance.

use serde::{Deserialize, Serialize};

use crate::types::Timestamp;

/// Which clock an observation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeClass {
    /// Since-boot monotonic clock.
    Monotonic,
    /// GPS-disciplined realtime clock.
    Valid,
}

/// Estimates the monotonic-to-realtime offset from interleaved
/// observations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClockPinner {
    /// Most recent monotonic observation.
    last_mono: Option<Timestamp>,
    /// A fix waiting for its closing monotonic observation, with the
    /// monotonic reading that preceded it.
    pending: Option<(Timestamp, Timestamp)>,
    /// Best (offset midpoint, half-width) so far.
    best: Option<(Timestamp, Timestamp)>,
}

impl ClockPinner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one timestamp observation.
    pub fn observe(&mut self, class: TimeClass, ts: Timestamp) {
        match class {
            TimeClass::Monotonic => {
                if let Some((fix, before)) = self.pending.take() {
                    // bracket closed: before <= realtime(fix) <= ts
                    let lo = fix - ts;
                    let hi = fix - before;
                    let half = (hi - lo) / 2.0;
                    let mid = (hi + lo) / 2.0;
                    if self.best.map_or(true, |(_, bh)| half < bh) {
                        self.best = Some((mid, half));
                    }
                }
                self.last_mono = Some(ts);
            }
            TimeClass::Valid => {
                if let Some(before) = self.last_mono {
                    // keep the fix nearest its preceding monotonic reading
                    match self.pending {
                        Some((fix, b)) if fix - b <= ts - before => {}
                        _ => self.pending = Some((ts, before)),
                    }
                }
            }
        }
    }

    /// The estimated offset and its error half-width, when a bracket at
    /// most `tol` seconds wide (total) has been seen.
    pub fn offset(&self, tol: Timestamp) -> Option<(Timestamp, Timestamp)> {
        self.best.filter(|&(_, half)| 2.0 * half <= tol)
    }
}
