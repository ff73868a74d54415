//! Configuration for a detection foray
//!
//! All tunables carry sensible defaults, so `ForayConfig::default()` is a
//! working configuration. Units are documented per field; timing slops are
//! seconds (receivers report pulse timestamps with sub-millisecond
//! precision, so the default pulse slop is 1.5 ms).

use serde::{Deserialize, Serialize};

use crate::error::{TagScanError, TagScanResult};
use crate::types::{FrequencyMHz, FreqOffsetKHz, Gap, SignalDb, Timestamp};

/// Timing tolerances used when building the pattern-matching graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Allowed deviation of an observed intra-burst gap from the
    /// registered gap, in seconds.
    pub pulse_slop: Gap,
    /// Allowed deviation of the burst-to-burst interval, in seconds.
    pub burst_slop: Gap,
    /// Additional burst-interval slop per skipped burst, in seconds.
    /// Allows for clock drift between tag and receiver.
    pub burst_slop_expansion: Gap,
    /// How many consecutive bursts may be missed without ending a run.
    pub max_skipped_bursts: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            pulse_slop: 0.0015,
            burst_slop: 0.010,
            burst_slop_expansion: 0.001,
            max_skipped_bursts: 60,
        }
    }
}

/// Configuration for a [`Foray`](crate::foray::Foray).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForayConfig {
    /// Listening frequency assumed on a port before any frequency-setting
    /// record has been seen, in MHz.
    pub default_freq_mhz: FrequencyMHz,
    /// Ignore in-stream frequency settings and always use the default.
    pub force_default_freq: bool,

    /// Pulses with offset frequency below this are discarded, in kHz.
    pub min_dfreq_khz: Option<FreqOffsetKHz>,
    /// Pulses with offset frequency above this are discarded, in kHz.
    pub max_dfreq_khz: Option<FreqOffsetKHz>,
    /// Drop the sign of pulse offset frequencies on ingestion.
    pub unsigned_dfreq: bool,

    /// Graph timing tolerances.
    pub timing: TimingConfig,

    /// Pulses accepted before a single-tag candidate is confirmed.
    pub pulses_to_confirm_id: u32,
    /// Maximum allowed frequency spread within a burst, in kHz.
    pub freq_slop_khz: FreqOffsetKHz,
    /// Maximum allowed signal-strength spread within a burst, in dB.
    pub sig_slop_db: SignalDb,

    /// Maximum sustained pulse rate per second; 0 disables rate limiting.
    pub max_pulse_rate: f64,
    /// Length of the rate-measurement window, in seconds.
    pub pulse_rate_window: Gap,
    /// Minimum spacing between sentinel detections, in seconds.
    pub min_bogus_spacing: Gap,

    /// Emit raw pulses to the sink without matching.
    pub pulses_only: bool,

    /// Tolerance for pinning the monotonic clock to realtime, in seconds.
    pub mono_tol: Timestamp,

    /// Sink operations per transactional chunk.
    pub ops_per_commit: u64,
}

impl Default for ForayConfig {
    fn default() -> Self {
        Self {
            default_freq_mhz: 166.380,
            force_default_freq: false,
            min_dfreq_khz: None,
            max_dfreq_khz: None,
            unsigned_dfreq: false,
            timing: TimingConfig::default(),
            pulses_to_confirm_id: 4,
            freq_slop_khz: 2.0,
            sig_slop_db: 10.0,
            max_pulse_rate: 0.0,
            pulse_rate_window: 60.0,
            min_bogus_spacing: 120.0,
            pulses_only: false,
            mono_tol: 1.0,
            ops_per_commit: 20_000,
        }
    }
}

impl ForayConfig {
    /// Check the configuration for values the engine cannot run with.
    pub fn validate(&self) -> TagScanResult<()> {
        if self.timing.pulse_slop <= 0.0 {
            return Err(TagScanError::Config("pulse_slop must be positive".into()));
        }
        if self.timing.burst_slop <= 0.0 {
            return Err(TagScanError::Config("burst_slop must be positive".into()));
        }
        if self.timing.burst_slop_expansion < 0.0 {
            return Err(TagScanError::Config(
                "burst_slop_expansion must be non-negative".into(),
            ));
        }
        if self.pulses_to_confirm_id < 2 {
            return Err(TagScanError::Config(
                "pulses_to_confirm_id must be at least 2".into(),
            ));
        }
        if let (Some(lo), Some(hi)) = (self.min_dfreq_khz, self.max_dfreq_khz) {
            if lo > hi {
                return Err(TagScanError::Config(
                    "min_dfreq_khz exceeds max_dfreq_khz".into(),
                ));
            }
        }
        if self.max_pulse_rate > 0.0 && self.pulse_rate_window <= 0.0 {
            return Err(TagScanError::Config(
                "pulse_rate_window must be positive when rate limiting".into(),
            ));
        }
        if self.mono_tol <= 0.0 {
            return Err(TagScanError::Config("mono_tol must be positive".into()));
        }
        if self.ops_per_commit == 0 {
            return Err(TagScanError::Config("ops_per_commit must be positive".into()));
        }
        Ok(())
    }

    /// Numeric parameters recorded to the sink at batch open.
    pub fn sink_params(&self) -> Vec<(&'static str, f64)> {
        vec![
            ("default_freq", self.default_freq_mhz),
            ("pulse_slop", self.timing.pulse_slop),
            ("burst_slop", self.timing.burst_slop),
            ("burst_slop_expansion", self.timing.burst_slop_expansion),
            ("max_skipped_bursts", self.timing.max_skipped_bursts as f64),
            ("pulses_to_confirm_id", self.pulses_to_confirm_id as f64),
            ("freq_slop_khz", self.freq_slop_khz),
            ("sig_slop_db", self.sig_slop_db),
            ("max_pulse_rate", self.max_pulse_rate),
            ("pulse_rate_window", self.pulse_rate_window),
            ("min_bogus_spacing", self.min_bogus_spacing),
        ]
    }
}
