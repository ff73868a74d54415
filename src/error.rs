//! Error types for the tag detection engine

use crate::types::{NominalFreqKHz, TagId};
use thiserror::Error;

/// Result type for tag detection operations
pub type TagScanResult<T> = Result<T, TagScanError>;

/// Errors surfaced by the detection engine.
///
/// The matcher and pattern graph do not return runtime errors; the
/// fallible surfaces are configuration validation, the persistence sink,
/// and snapshot resume.
#[derive(Error, Debug)]
pub enum TagScanError {
    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A registered tag fails its structural invariants
    #[error("invalid tag {tag_id}: {reason}")]
    InvalidTag { tag_id: TagId, reason: String },

    /// Two or more tags on one nominal frequency cannot be told apart
    #[error("tags on {nominal_khz} kHz are indistinguishable: {tag_ids:?}")]
    IndistinguishableTags {
        nominal_khz: NominalFreqKHz,
        tag_ids: Vec<TagId>,
    },

    /// Persistence sink failure; fatal for the batch
    #[error("persistence sink failed: {0}")]
    Sink(String),

    /// Snapshot carries an incompatible version tag
    #[error("snapshot version mismatch: found {found:#010x}, reader supports {supported:#010x}")]
    SnapshotVersion { found: u32, supported: u32 },

    /// Snapshot bytes could not be decoded
    #[error("snapshot decode failed: {0}")]
    Snapshot(String),

    /// An input record that cannot be processed
    #[error("malformed input record: {0}")]
    MalformedRecord(String),
}
