//! Pulse rate limiter
//!
//! Lightning, electric fences and other wideband interference can flood a
//! receiver with pulses that would otherwise spawn enormous candidate
//! sets. The gate buffers pulses for one window length; a pulse that ages
//! out of the window unremarkably is released to the matcher. When the
//! buffered count exceeds the permitted rate, the whole window is
//! discarded and a single sentinel detection is signalled, itself limited
//! to one per `min_spacing` seconds. After a discard the gate stays
//! closed until a quiet window has elapsed.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::record::Pulse;
use crate::types::{Gap, Timestamp};

/// What the gate decided about an offered pulse.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GateOutput {
    /// Pulses released to the matcher, oldest first.
    pub released: Vec<Pulse>,
    /// Timestamp at which to emit a sentinel detection, if due.
    pub sentinel: Option<Timestamp>,
}

/// Sliding-window pulse rate limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateGate {
    max_pulses: usize,
    window: Gap,
    min_spacing: Gap,
    buf: VecDeque<Pulse>,
    suppress_until: Option<Timestamp>,
    last_sentinel: Option<Timestamp>,
    discarded: u64,
}

impl RateGate {
    /// Gate allowing `max_rate` pulses per second over `window` seconds.
    pub fn new(max_rate: f64, window: Gap, min_spacing: Gap) -> Self {
        Self {
            max_pulses: (max_rate * window).floor() as usize,
            window,
            min_spacing,
            buf: VecDeque::new(),
            suppress_until: None,
            last_sentinel: None,
            discarded: 0,
        }
    }

    /// Total pulses discarded so far.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Offer a pulse; returns pulses released and any sentinel due.
    pub fn offer(&mut self, p: Pulse) -> GateOutput {
        let mut out = GateOutput::default();

        if let Some(until) = self.suppress_until {
            if p.ts < until {
                self.discarded += 1;
                return out;
            }
            self.suppress_until = None;
        }

        // pulses that survived a whole window are clean
        while let Some(front) = self.buf.front() {
            if front.ts <= p.ts - self.window {
                out.released.push(self.buf.pop_front().unwrap());
            } else {
                break;
            }
        }

        self.buf.push_back(p);
        if self.buf.len() > self.max_pulses {
            let n = self.buf.len();
            self.discarded += n as u64;
            warn!(
                count = n,
                window = self.window,
                ts = p.ts,
                "pulse rate exceeded; discarding window"
            );
            self.buf.clear();
            self.suppress_until = Some(p.ts + self.window);
            let due = match self.last_sentinel {
                None => true,
                Some(last) => p.ts - last >= self.min_spacing,
            };
            if due {
                self.last_sentinel = Some(p.ts);
                out.sentinel = Some(p.ts);
            }
        }
        out
    }

    /// End of stream: release whatever survived in the buffer.
    pub fn flush(&mut self) -> Vec<Pulse> {
        self.buf.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pulse(ts: f64, seq_no: u64) -> Pulse {
        Pulse {
            ts,
            dfreq: 0.0,
            sig: -40.0,
            noise: -90.0,
            ant_freq: 166.380,
            seq_no,
        }
    }

    #[test]
    fn test_quiet_stream_passes_through() {
        let mut gate = RateGate::new(10.0, 1.0, 5.0);
        let mut released = 0;
        for i in 0..20 {
            let out = gate.offer(pulse(i as f64, i));
            assert!(out.sentinel.is_none());
            released += out.released.len();
        }
        released += gate.flush().len();
        assert_eq!(released, 20);
        assert_eq!(gate.discarded(), 0);
    }

    #[test]
    fn test_storm_discards_whole_window_with_one_sentinel() {
        // 20 pulses within half a second at 10/s over a 1 s window
        let mut gate = RateGate::new(10.0, 1.0, 5.0);
        let mut released = 0;
        let mut sentinels = 0;
        for i in 0..20 {
            let out = gate.offer(pulse(100.0 + i as f64 * 0.025, i));
            released += out.released.len();
            sentinels += out.sentinel.iter().count();
        }
        released += gate.flush().len();
        assert_eq!(released, 0, "every pulse in the storm is discarded");
        assert_eq!(sentinels, 1, "one sentinel per storm");
        assert_eq!(gate.discarded(), 20);
    }

    #[test]
    fn test_sentinel_spacing() {
        let mut gate = RateGate::new(2.0, 1.0, 5.0);
        let mut sentinels = Vec::new();
        // storms 2 s apart, each tripping the limit
        for storm in 0..3 {
            let t0 = 100.0 + storm as f64 * 2.0;
            for i in 0..4 {
                let out = gate.offer(pulse(t0 + i as f64 * 0.1, storm * 10 + i));
                if let Some(ts) = out.sentinel {
                    sentinels.push(ts);
                }
            }
        }
        // second storm is within min_spacing of the first sentinel
        assert_eq!(sentinels.len(), 1);
    }

    #[test]
    fn test_recovers_after_quiet_window() {
        let mut gate = RateGate::new(2.0, 1.0, 0.5);
        for i in 0..4 {
            gate.offer(pulse(100.0 + i as f64 * 0.1, i));
        }
        assert!(gate.discarded() > 0);
        // well after the suppression window: pulses flow again
        let mut released = 0;
        for i in 0..3 {
            let out = gate.offer(pulse(105.0 + i as f64, 50 + i));
            released += out.released.len();
        }
        released += gate.flush().len();
        assert_eq!(released, 3);
    }
}
