//! Pause/resume serialization
//!
//! A paused foray is written as a JSON envelope carrying a version tag
//! `(major << 16) | minor`. Resume refuses a different major outright; a
//! minor newer than this reader knows is refused too, since it may carry
//! fields this reader would silently drop.

use serde::Serialize;

use crate::error::{TagScanError, TagScanResult};
use crate::foray::ForayState;

/// Incremented on incompatible layout changes.
pub const SNAPSHOT_MAJOR: u16 = 1;
/// Incremented on additive changes a newer reader can absorb.
pub const SNAPSHOT_MINOR: u16 = 0;

/// The version tag written into every snapshot.
pub fn version() -> u32 {
    ((SNAPSHOT_MAJOR as u32) << 16) | SNAPSHOT_MINOR as u32
}

#[derive(Serialize)]
struct Envelope<'a> {
    version: u32,
    state: &'a ForayState,
}

pub(crate) fn save(state: &ForayState) -> TagScanResult<Vec<u8>> {
    let envelope = Envelope {
        version: version(),
        state,
    };
    serde_json::to_vec(&envelope).map_err(|e| TagScanError::Snapshot(e.to_string()))
}

pub(crate) fn load(bytes: &[u8]) -> TagScanResult<ForayState> {
    let value: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|e| TagScanError::Snapshot(e.to_string()))?;
    let found = value
        .get("version")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| TagScanError::Snapshot("missing version tag".into()))? as u32;
    if found >> 16 != SNAPSHOT_MAJOR as u32 || (found & 0xffff) > SNAPSHOT_MINOR as u32 {
        return Err(TagScanError::SnapshotVersion {
            found,
            supported: version(),
        });
    }
    let state = value
        .get("state")
        .cloned()
        .ok_or_else(|| TagScanError::Snapshot("missing state".into()))?;
    serde_json::from_value(state).map_err(|e| TagScanError::Snapshot(e.to_string()))
}
