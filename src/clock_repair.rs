//! Timestamp repair filter
//!
//! Receiver records reach us with three kinds of timestamp fault: pulse
//! timestamps taken from the since-boot monotonic clock, realtime
//! timestamps from before the first GPS sync, and (rarely) a GPS that has
//! stopped updating. This filter buffers records in arrival order until
//! the offsets needed to correct the eras actually seen have been
//! estimated, then drains the buffer with corrections applied and passes
//! subsequent records through inline.
//!
//! Eras, by raw timestamp value:
//!
//! ```text
//!  MONOTONIC      |  PRE_GPS            |  VALID
//!  0              946684800             1262304000
//!                 (2000-01-01)          (2010-01-01)
//! ```
//!
//! `OFFSET_PRE_GPS` is estimated from the first upward step of a
//! non-pulse timestamp from the PRE_GPS era into the VALID era (good to
//! within the 5-minute GPS fix cadence). `OFFSET_MONOTONIC` comes from
//! bracketing monotonic pulses around a valid fix (see
//! [`ClockPinner`]). If the input ends before the needed offsets exist,
//! the unresolved records are never emitted; the harness observes
//! [`ClockRepair::unresolved`] and escalates.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock_pinner::{ClockPinner, TimeClass};
use crate::gps_validator::GpsValidator;
use crate::record::Record;
use crate::types::Timestamp;

/// Realtime clock value at receiver boot (2000-01-01 00:00:00 UTC).
pub const TS_BOOT_EPOCH: Timestamp = 946_684_800.0;

/// Earliest credible valid timestamp (2010-01-01 00:00:00 UTC).
pub const TS_VALID_EPOCH: Timestamp = 1_262_304_000.0;

/// Accuracy bound of the PRE_GPS correction: the GPS fix cadence.
pub const PRE_GPS_ERROR: Timestamp = 300.0;

/// Which clock regime a raw timestamp belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Era {
    Monotonic,
    PreGps,
    Valid,
}

/// Classify a raw timestamp.
pub fn era(ts: Timestamp) -> Era {
    if ts < TS_BOOT_EPOCH {
        Era::Monotonic
    } else if ts < TS_VALID_EPOCH {
        Era::PreGps
    } else {
        Era::Valid
    }
}

/// Buffering filter that corrects faulty record timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClockRepair {
    mono_tol: Timestamp,
    pinner: ClockPinner,
    gpsv: GpsValidator,
    buf: VecDeque<Record>,
    out: VecDeque<Record>,
    correcting: bool,
    seen_monotonic: bool,
    seen_pre_gps: bool,
    pre_gps_offset: Option<Timestamp>,
    monotonic_offset: Option<Timestamp>,
    last_nonpulse_ts: Option<Timestamp>,
}

impl ClockRepair {
    /// Filter with the given monotonic-pinning tolerance, seconds.
    pub fn new(mono_tol: Timestamp) -> Self {
        Self {
            mono_tol,
            pinner: ClockPinner::new(),
            gpsv: GpsValidator::new(),
            buf: VecDeque::new(),
            out: VecDeque::new(),
            correcting: false,
            seen_monotonic: false,
            seen_pre_gps: false,
            pre_gps_offset: None,
            monotonic_offset: None,
            last_nonpulse_ts: None,
        }
    }

    /// The PRE_GPS correction, once estimated.
    pub fn pre_gps_offset(&self) -> Option<Timestamp> {
        self.pre_gps_offset
    }

    /// The monotonic correction, once estimated.
    pub fn monotonic_offset(&self) -> Option<Timestamp> {
        self.monotonic_offset
    }

    /// Records still held back waiting for offsets.
    pub fn unresolved(&self) -> usize {
        self.buf.len()
    }

    /// Accept one record from the stream.
    pub fn put(&mut self, r: Record) {
        let ts = r.ts();
        match &r {
            Record::Gps { .. } => {
                let stuck = self.gpsv.observe_gps(ts);
                if !stuck && era(ts) == Era::Valid {
                    self.pinner.observe(TimeClass::Valid, ts);
                }
            }
            Record::Pulse { .. } => {
                self.gpsv.observe_other(ts);
                if era(ts) == Era::Monotonic {
                    self.seen_monotonic = true;
                    self.pinner.observe(TimeClass::Monotonic, ts);
                }
            }
            Record::FreqSetting { .. } | Record::Param { .. } => {
                self.gpsv.observe_other(ts);
                if era(ts) == Era::Valid {
                    self.pinner.observe(TimeClass::Valid, ts);
                }
            }
        }
        if era(ts) == Era::PreGps {
            self.seen_pre_gps = true;
        }

        // the first upward non-pulse step out of PRE_GPS measures the
        // realtime correction
        if !r.is_pulse() {
            if self.pre_gps_offset.is_none() {
                if let Some(prev) = self.last_nonpulse_ts {
                    if era(prev) == Era::PreGps && era(ts) == Era::Valid && ts > prev {
                        let off = ts - prev;
                        info!(offset = off, "estimated PRE_GPS clock offset");
                        self.pre_gps_offset = Some(off);
                    }
                }
            }
            self.last_nonpulse_ts = Some(ts);
        }

        if self.monotonic_offset.is_none() {
            if let Some((off, err)) = self.pinner.offset(self.mono_tol) {
                info!(offset = off, error = err, "estimated monotonic clock offset");
                self.monotonic_offset = Some(off);
            }
        }

        if !self.correcting && self.offsets_ready() {
            self.correcting = true;
            debug!(buffered = self.buf.len(), "clock repair draining buffer");
            while let Some(mut held) = self.buf.pop_front() {
                let ok = self.correct(&mut held);
                debug_assert!(ok, "era seen implies offset known");
                self.out.push_back(held);
            }
        }

        if self.correcting {
            let mut r = r;
            if self.correct(&mut r) {
                self.out.push_back(r);
            } else {
                // a new era appeared without its offset; fall back to
                // buffering until it is estimated
                self.correcting = false;
                self.buf.push_back(r);
            }
        } else {
            self.buf.push_back(r);
        }
    }

    /// Next corrected record available for processing.
    pub fn get(&mut self) -> Option<Record> {
        self.out.pop_front()
    }

    fn offsets_ready(&self) -> bool {
        (!self.seen_pre_gps || self.pre_gps_offset.is_some())
            && (!self.seen_monotonic || self.monotonic_offset.is_some())
    }

    fn correct(&self, r: &mut Record) -> bool {
        let ts = r.ts();
        let offset = match era(ts) {
            Era::Valid => 0.0,
            Era::PreGps => match self.pre_gps_offset {
                Some(o) => o,
                None => return false,
            },
            Era::Monotonic => match self.monotonic_offset {
                Some(o) => o,
                None => return false,
            },
        };
        r.set_ts(ts + offset);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param(ts: Timestamp) -> Record {
        Record::Param {
            ts,
            name: "test".into(),
            value: 0.0,
        }
    }

    fn pulse(ts: Timestamp) -> Record {
        Record::Pulse {
            port: 1,
            ts,
            dfreq: 0.0,
            sig: -40.0,
            noise: -90.0,
        }
    }

    fn drain(cr: &mut ClockRepair) -> Vec<Timestamp> {
        let mut out = Vec::new();
        while let Some(r) = cr.get() {
            out.push(r.ts());
        }
        out
    }

    #[test]
    fn test_valid_stream_passes_through() {
        let mut cr = ClockRepair::new(1.0);
        cr.put(pulse(1.4e9));
        cr.put(param(1.4e9 + 1.0));
        assert_eq!(drain(&mut cr), vec![1.4e9, 1.4e9 + 1.0]);
        assert_eq!(cr.unresolved(), 0);
    }

    #[test]
    fn test_pre_gps_step_correction() {
        let mut cr = ClockRepair::new(1.0);
        cr.put(param(1_000_000_000.0));
        cr.put(param(1_000_000_300.0));
        assert_eq!(drain(&mut cr), Vec::<Timestamp>::new(), "held until offset known");
        assert_eq!(cr.unresolved(), 2);

        cr.put(Record::Gps { ts: 1_300_000_600.0 });
        assert_eq!(cr.pre_gps_offset(), Some(300_000_300.0));
        assert_eq!(
            drain(&mut cr),
            vec![1_300_000_300.0, 1_300_000_600.0, 1_300_000_600.0]
        );
        assert_eq!(cr.unresolved(), 0);
    }

    #[test]
    fn test_monotonic_pulses_pinned_to_gps_fix() {
        let mut cr = ClockRepair::new(1.0);
        cr.put(pulse(99.8));
        cr.put(Record::Gps { ts: 1.3e9 });
        assert_eq!(cr.unresolved(), 2, "bracket still open");
        cr.put(pulse(100.2));

        let out = drain(&mut cr);
        assert_eq!(out.len(), 3);
        // pulses land within the bracket error of true realtime
        assert!((out[0] - (1.3e9 - 0.2)).abs() <= 0.41);
        assert_eq!(out[1], 1.3e9);
        assert!((out[2] - (1.3e9 + 0.2)).abs() <= 0.41);
        // arrival order preserved
        assert!(out[0] < out[1] && out[1] < out[2]);
    }

    #[test]
    fn test_unresolved_batch_emits_nothing() {
        let mut cr = ClockRepair::new(1.0);
        cr.put(pulse(100.0));
        cr.put(pulse(103.0));
        cr.put(pulse(108.0));
        assert_eq!(drain(&mut cr), Vec::<Timestamp>::new());
        assert_eq!(cr.unresolved(), 3);
    }

    #[test]
    fn test_stuck_gps_ignored_for_calibration() {
        let mut cr = ClockRepair::new(1.0);
        cr.put(pulse(50.0));
        cr.put(pulse(700.0));
        cr.put(Record::Gps { ts: 1.3e9 });
        cr.put(pulse(701.0));
        cr.put(pulse(1400.0));
        cr.put(Record::Gps { ts: 1.3e9 }); // stuck: same fix, >10 min apart
        cr.put(pulse(1401.0));
        // the stuck second fix must not have fed the pinner: the only
        // bracket is 700..701 around the first fix
        let off = cr.monotonic_offset().expect("first fix still pins");
        assert!((off - (1.3e9 - 700.5)).abs() <= 1.0);
    }
}
