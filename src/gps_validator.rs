//! Stuck-GPS detection
//!
//! Some GPS units go to sleep and keep reporting the same fix. A fix is
//! normally written every 5 minutes, so the GPS is judged stuck when two
//! consecutive GPS records carry identical timestamps while the non-GPS
//! records between them advance by more than 10 minutes. Once stuck,
//! GPS timestamps are ignored for clock calibration.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::Timestamp;

const STUCK_SPAN: Timestamp = 600.0; // 10 minutes

/// Detects a GPS that has stopped updating its fix.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GpsValidator {
    last_gps: Option<Timestamp>,
    /// Span of non-GPS timestamps seen since the last GPS record.
    span: Option<(Timestamp, Timestamp)>,
    stuck: bool,
}

impl GpsValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a GPS fix timestamp. Returns true if the GPS is (now) stuck.
    pub fn observe_gps(&mut self, ts: Timestamp) -> bool {
        if !self.stuck {
            if let (Some(last), Some((lo, hi))) = (self.last_gps, self.span) {
                if ts == last && hi - lo > STUCK_SPAN {
                    warn!(ts, "GPS fix has not advanced; treating GPS as stuck");
                    self.stuck = true;
                }
            }
        }
        self.last_gps = Some(ts);
        self.span = None;
        self.stuck
    }

    /// Feed a non-GPS record timestamp.
    pub fn observe_other(&mut self, ts: Timestamp) {
        self.span = Some(match self.span {
            None => (ts, ts),
            Some((lo, hi)) => (lo.min(ts), hi.max(ts)),
        });
    }

    /// Has the GPS been judged stuck?
    pub fn stuck(&self) -> bool {
        self.stuck
    }
}
