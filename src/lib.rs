//! # Coded VHF Telemetry Tag Detection
//!
//! This crate identifies coded VHF radio telemetry tags in a stream of
//! received pulses. Each registered tag transmits short bursts of pulses
//! with a fixed, tag-specific inter-pulse gap pattern, repeating at a
//! tag-specific period; the engine correlates incoming pulses against the
//! registered patterns and emits detection runs to a persistence sink.
//!
//! ## Processing Pipeline
//!
//! ```text
//! records → Clock Repair → Activation Events → Rate Gate
//!                                                  │
//!            Sink ← Candidate Matching ← DFA  ←────┘
//! ```
//!
//! - **Clock repair** buffers records until faulty timestamps (monotonic
//!   clocks, missing GPS sync) can be corrected.
//! - The **activation history** keeps each frequency's pattern graph
//!   current as tags enter and leave service.
//! - The **graph** is a DFA over inter-pulse gaps: each state is the set
//!   of (tag, phase) pairs compatible with a recent pulse history.
//! - **Candidates** are in-flight match attempts advanced, cloned and
//!   expired as pulses arrive; confirmed candidates emit bursts as run
//!   hits through the [`sink::DetectionSink`] trait.
//!
//! ## Example
//!
//! ```rust
//! use tagscan::prelude::*;
//!
//! // one registered tag: bursts of 4 pulses with gaps 3, 5, 7 s,
//! // repeating every 20 s
//! let db = TagDatabase::new(vec![Tag {
//!     id: 1,
//!     nominal_khz: 166_380,
//!     gaps: vec![3.0, 5.0, 7.0],
//!     period: 20.0,
//!     active_from: 0.0,
//!     active_until: 2e9,
//! }])
//! .unwrap();
//!
//! let mut cfg = ForayConfig::default();
//! cfg.timing.pulse_slop = 0.5;
//!
//! let mut foray = Foray::new(db, cfg, MemorySink::new()).unwrap();
//! for ts in [10.0, 13.0, 18.0, 25.0] {
//!     foray
//!         .process_record(Record::Pulse {
//!             port: 1,
//!             ts: 1.4e9 + ts,
//!             dfreq: 2.5,
//!             sig: -40.0,
//!             noise: -90.0,
//!         })
//!         .unwrap();
//! }
//! let sink = foray.finish().unwrap();
//! assert_eq!(sink.runs_begun().len(), 1);
//! ```

pub mod candidate;
pub mod clock_pinner;
pub mod clock_repair;
pub mod config;
pub mod error;
pub mod finder;
pub mod foray;
pub mod gps_validator;
pub mod graph;
pub mod history;
pub mod interval_map;
pub mod rate_gate;
pub mod record;
pub mod sink;
pub mod snapshot;
pub mod tag;
pub mod types;

// Re-export main types
pub use candidate::{Candidate, IdLevel};
pub use clock_repair::ClockRepair;
pub use config::{ForayConfig, TimingConfig};
pub use error::{TagScanError, TagScanResult};
pub use finder::TagFinder;
pub use foray::{Diagnostics, Foray};
pub use graph::{Graph, NodeHandle};
pub use history::{Event, EventKind, History};
pub use record::{Pulse, Record};
pub use sink::{BurstParams, DetectionSink, MemorySink};
pub use tag::{Tag, TagDatabase};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::ForayConfig;
    pub use crate::error::{TagScanError, TagScanResult};
    pub use crate::foray::Foray;
    pub use crate::record::{Pulse, Record};
    pub use crate::sink::{DetectionSink, MemorySink};
    pub use crate::tag::{Tag, TagDatabase};
}
