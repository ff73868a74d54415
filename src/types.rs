//! Core scalar types for tag detection
//!
//! Type aliases shared across the crate. Timestamps are seconds since the
//! Unix epoch in double precision; gaps are differences between nearby
//! timestamps, also in seconds. Frequencies appear in two flavours:
//! the antenna listening frequency (MHz) and the pulse offset from it (kHz).

/// Seconds since the Unix epoch (1 Jan 1970 UTC), double precision.
pub type Timestamp = f64;

/// Inter-pulse time difference, in seconds.
pub type Gap = f64;

/// Antenna listening frequency, in MHz.
pub type FrequencyMHz = f64;

/// Pulse offset frequency relative to the listening frequency, in kHz.
pub type FreqOffsetKHz = f64;

/// Nominal listening frequency rounded to kHz; partitions tags into
/// independent pattern-matching graphs.
pub type NominalFreqKHz = i32;

/// Signal or noise level, in dB relative to full scale.
pub type SignalDb = f64;

/// External registry key of a tag.
pub type TagId = i32;

/// 0-based index of a pulse within a tag's burst.
pub type Phase = u16;

/// Sequence number assigned to each pulse on ingestion; strictly increasing.
pub type SeqNo = u64;

/// Antenna port number.
pub type PortNum = i16;

/// Persistent identifier of a detection run.
pub type RunId = i64;

/// Tag id reported for rate-limit sentinel detections.
pub const SENTINEL_TAG_ID: TagId = 0;

/// Convert a listening frequency in MHz to its nominal kHz key.
pub fn nominal_khz(freq_mhz: FrequencyMHz) -> NominalFreqKHz {
    (freq_mhz * 1000.0).round() as NominalFreqKHz
}
