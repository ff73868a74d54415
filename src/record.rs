//! Input records from a telemetry receiver
//!
//! The raw-file parser is external; records arrive here already typed.
//! Pulses carry the measurements the matcher works on, frequency settings
//! retune a port, parameter records document receiver state changes, and
//! GPS records exist solely so the clock-repair filter can calibrate.

use serde::{Deserialize, Serialize};

use crate::types::{FreqOffsetKHz, FrequencyMHz, PortNum, SeqNo, SignalDb, Timestamp};

/// A single received radio pulse, as presented to the matcher.
///
/// `seq_no` is assigned by the driver on ingestion and is strictly
/// increasing across all ports.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pulse {
    /// Timestamp, seconds since the Unix epoch.
    pub ts: Timestamp,
    /// Offset from the listening frequency, kHz.
    pub dfreq: FreqOffsetKHz,
    /// Signal level, dB.
    pub sig: SignalDb,
    /// Noise level, dB.
    pub noise: SignalDb,
    /// Listening frequency of the antenna that heard the pulse, MHz.
    pub ant_freq: FrequencyMHz,
    /// Ingestion sequence number.
    pub seq_no: SeqNo,
}

/// A typed record from the receiver data stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Record {
    /// A detected pulse on a port.
    Pulse {
        port: PortNum,
        ts: Timestamp,
        dfreq: FreqOffsetKHz,
        sig: SignalDb,
        noise: SignalDb,
    },
    /// A port was retuned to a new listening frequency.
    FreqSetting {
        port: PortNum,
        ts: Timestamp,
        freq_mhz: FrequencyMHz,
    },
    /// A named receiver parameter changed.
    Param {
        ts: Timestamp,
        name: String,
        value: f64,
    },
    /// A GPS fix was written to the stream.
    Gps { ts: Timestamp },
}

impl Record {
    /// Timestamp of the record.
    pub fn ts(&self) -> Timestamp {
        match self {
            Record::Pulse { ts, .. }
            | Record::FreqSetting { ts, .. }
            | Record::Param { ts, .. }
            | Record::Gps { ts } => *ts,
        }
    }

    /// Replace the record's timestamp (clock repair applies offsets here).
    pub fn set_ts(&mut self, new_ts: Timestamp) {
        match self {
            Record::Pulse { ts, .. }
            | Record::FreqSetting { ts, .. }
            | Record::Param { ts, .. }
            | Record::Gps { ts } => *ts = new_ts,
        }
    }

    /// Is this a pulse record?
    pub fn is_pulse(&self) -> bool {
        matches!(self, Record::Pulse { .. })
    }

    /// Is this a GPS fix record?
    pub fn is_gps(&self) -> bool {
        matches!(self, Record::Gps { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ts_accessors() {
        let mut r = Record::Pulse {
            port: 1,
            ts: 100.0,
            dfreq: 2.5,
            sig: -40.0,
            noise: -90.0,
        };
        assert_eq!(r.ts(), 100.0);
        r.set_ts(150.0);
        assert_eq!(r.ts(), 150.0);
        assert!(r.is_pulse());
        assert!(!r.is_gps());
    }
}
