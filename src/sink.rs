//! Persistence sink for detections
//!
//! The engine talks to storage through the [`DetectionSink`] capability
//! trait; the concrete schema (SQL or otherwise) lives outside the crate.
//! [`Filer`] wraps a sink with the bookkeeping the driver needs: operation
//! counting with commit-and-reopen every `ops_per_commit` calls, run and
//! hit totals for batch close, and the run ledger that decides when the
//! last candidate carrying a run id has died.
//!
//! [`MemorySink`] records every call; tests assert on its call sequence.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{TagScanError, TagScanResult};
use crate::record::Pulse;
use crate::types::{PortNum, RunId, SignalDb, TagId, Timestamp};

/// Statistics of one emitted burst.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BurstParams {
    /// Mean signal over the burst, dB.
    pub sig: SignalDb,
    /// Sample SD of linear signal, percent of mean.
    pub sig_sd: f64,
    /// Mean noise over the burst, dB.
    pub noise: SignalDb,
    /// Mean offset frequency, kHz.
    pub freq: f64,
    /// Sample SD of offset frequency, kHz.
    pub freq_sd: f64,
    /// Total absolute deviation of intra-burst gaps from registration, s.
    pub slop: f64,
    /// Deviation of the burst interval from registration, s; 0.0 on the
    /// first burst of a run.
    pub burst_slop: f64,
}

/// Capability set of the persistence layer.
pub trait DetectionSink {
    /// Open a new batch of output.
    fn open_batch(&mut self) -> TagScanResult<()>;

    /// Open a run for a tag on an antenna; returns its persistent id.
    fn begin_run(&mut self, tag_id: TagId, port: PortNum, ts: Timestamp)
        -> TagScanResult<RunId>;

    /// Append one burst to a run.
    fn add_hit(&mut self, run_id: RunId, ts: Timestamp, par: &BurstParams) -> TagScanResult<()>;

    /// Close a run. `ending_batch` marks runs ended because the batch
    /// ended, rather than because the tag went quiet.
    fn end_run(
        &mut self,
        run_id: RunId,
        num_hits: u64,
        last_ts: Timestamp,
        ending_batch: bool,
    ) -> TagScanResult<()>;

    /// Record a named parameter for the batch.
    fn add_param(&mut self, name: &str, value: f64) -> TagScanResult<()>;

    /// Record a raw pulse (pulses-only mode).
    fn add_pulse(&mut self, port: PortNum, pulse: &Pulse) -> TagScanResult<()>;

    /// Commit the open transactional chunk and begin another.
    fn commit(&mut self) -> TagScanResult<()>;

    /// Close the batch with its run and hit totals.
    fn close_batch(&mut self, num_runs: u64, num_hits: u64) -> TagScanResult<()>;
}

/// Counts live candidates per open run id.
///
/// Clones of a confirmed candidate share its run id; the run is closed
/// only when the count drops to zero.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunLedger {
    counts: HashMap<RunId, u32>,
}

impl RunLedger {
    /// A candidate took (or cloned into) this run id.
    pub fn acquire(&mut self, run_id: RunId) {
        *self.counts.entry(run_id).or_insert(0) += 1;
    }

    /// A candidate carrying this run id died. Returns true when it was
    /// the last one, i.e. the run must be ended.
    pub fn release(&mut self, run_id: RunId) -> bool {
        match self.counts.get_mut(&run_id) {
            Some(n) if *n > 1 => {
                *n -= 1;
                false
            }
            Some(_) => {
                self.counts.remove(&run_id);
                true
            }
            None => false,
        }
    }

    /// Number of currently open runs.
    pub fn open_runs(&self) -> usize {
        self.counts.len()
    }
}

/// Sink wrapper carrying the driver-side output bookkeeping.
#[derive(Debug)]
pub struct Filer<S> {
    sink: S,
    ops: u64,
    ops_per_commit: u64,
    num_runs: u64,
    num_hits: u64,
}

impl<S: DetectionSink> Filer<S> {
    /// Wrap a sink; `ops_per_commit` sets the transactional chunk size.
    pub fn new(sink: S, ops_per_commit: u64) -> Self {
        Self {
            sink,
            ops: 0,
            ops_per_commit,
            num_runs: 0,
            num_hits: 0,
        }
    }

    /// Unwrap the sink.
    pub fn into_inner(self) -> S {
        self.sink
    }

    /// Borrow the wrapped sink.
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Runs ended so far in this batch.
    pub fn num_runs(&self) -> u64 {
        self.num_runs
    }

    /// Hits written so far in this batch.
    pub fn num_hits(&self) -> u64 {
        self.num_hits
    }

    /// Restore batch totals when resuming a paused foray.
    pub fn restore_totals(&mut self, num_runs: u64, num_hits: u64) {
        self.num_runs = num_runs;
        self.num_hits = num_hits;
    }

    fn step(&mut self) -> TagScanResult<()> {
        self.ops += 1;
        if self.ops >= self.ops_per_commit {
            self.sink.commit()?;
            self.ops = 0;
        }
        Ok(())
    }

    pub fn open_batch(&mut self) -> TagScanResult<()> {
        self.sink.open_batch()
    }

    pub fn begin_run(
        &mut self,
        tag_id: TagId,
        port: PortNum,
        ts: Timestamp,
    ) -> TagScanResult<RunId> {
        let rid = self.sink.begin_run(tag_id, port, ts)?;
        self.step()?;
        Ok(rid)
    }

    pub fn add_hit(
        &mut self,
        run_id: RunId,
        ts: Timestamp,
        par: &BurstParams,
    ) -> TagScanResult<()> {
        self.sink.add_hit(run_id, ts, par)?;
        self.num_hits += 1;
        self.step()
    }

    pub fn end_run(
        &mut self,
        run_id: RunId,
        num_hits: u64,
        last_ts: Timestamp,
        ending_batch: bool,
    ) -> TagScanResult<()> {
        self.sink.end_run(run_id, num_hits, last_ts, ending_batch)?;
        self.num_runs += 1;
        self.step()
    }

    pub fn add_param(&mut self, name: &str, value: f64) -> TagScanResult<()> {
        self.sink.add_param(name, value)?;
        self.step()
    }

    pub fn add_pulse(&mut self, port: PortNum, pulse: &Pulse) -> TagScanResult<()> {
        self.sink.add_pulse(port, pulse)?;
        self.step()
    }

    /// Close the batch, committing whatever remains in the open chunk.
    pub fn close_batch(&mut self) -> TagScanResult<()> {
        self.sink.commit()?;
        self.sink.close_batch(self.num_runs, self.num_hits)
    }
}

/// Everything a sink can be told, as data.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkCall {
    OpenBatch,
    BeginRun {
        run_id: RunId,
        tag_id: TagId,
        port: PortNum,
        ts: Timestamp,
    },
    AddHit {
        run_id: RunId,
        ts: Timestamp,
        par: BurstParams,
    },
    EndRun {
        run_id: RunId,
        num_hits: u64,
        last_ts: Timestamp,
        ending_batch: bool,
    },
    AddParam {
        name: String,
        value: f64,
    },
    AddPulse {
        port: PortNum,
        pulse: Pulse,
    },
    Commit,
    CloseBatch {
        num_runs: u64,
        num_hits: u64,
    },
}

/// In-memory sink recording every call, for tests and dry runs.
#[derive(Debug)]
pub struct MemorySink {
    /// Recorded calls, in order.
    pub calls: Vec<SinkCall>,
    next_run: RunId,
    /// When set, every operation fails; exercises error propagation.
    pub fail: bool,
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySink {
    /// Create an empty recording sink.
    pub fn new() -> Self {
        Self {
            calls: Vec::new(),
            next_run: 1,
            fail: false,
        }
    }

    fn check(&self) -> TagScanResult<()> {
        if self.fail {
            Err(TagScanError::Sink("memory sink forced failure".into()))
        } else {
            Ok(())
        }
    }

    /// Hits recorded for one run, in order.
    pub fn hits_for(&self, run_id: RunId) -> Vec<&SinkCall> {
        self.calls
            .iter()
            .filter(|c| matches!(c, SinkCall::AddHit { run_id: r, .. } if *r == run_id))
            .collect()
    }

    /// Run ids opened, in order.
    pub fn runs_begun(&self) -> Vec<RunId> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                SinkCall::BeginRun { run_id, .. } => Some(*run_id),
                _ => None,
            })
            .collect()
    }

    /// Tag id a run was opened for.
    pub fn run_tag(&self, run_id: RunId) -> Option<TagId> {
        self.calls.iter().find_map(|c| match c {
            SinkCall::BeginRun {
                run_id: r, tag_id, ..
            } if *r == run_id => Some(*tag_id),
            _ => None,
        })
    }
}

impl DetectionSink for MemorySink {
    fn open_batch(&mut self) -> TagScanResult<()> {
        self.check()?;
        self.calls.push(SinkCall::OpenBatch);
        Ok(())
    }

    fn begin_run(
        &mut self,
        tag_id: TagId,
        port: PortNum,
        ts: Timestamp,
    ) -> TagScanResult<RunId> {
        self.check()?;
        let run_id = self.next_run;
        self.next_run += 1;
        self.calls.push(SinkCall::BeginRun {
            run_id,
            tag_id,
            port,
            ts,
        });
        Ok(run_id)
    }

    fn add_hit(&mut self, run_id: RunId, ts: Timestamp, par: &BurstParams) -> TagScanResult<()> {
        self.check()?;
        self.calls.push(SinkCall::AddHit {
            run_id,
            ts,
            par: *par,
        });
        Ok(())
    }

    fn end_run(
        &mut self,
        run_id: RunId,
        num_hits: u64,
        last_ts: Timestamp,
        ending_batch: bool,
    ) -> TagScanResult<()> {
        self.check()?;
        self.calls.push(SinkCall::EndRun {
            run_id,
            num_hits,
            last_ts,
            ending_batch,
        });
        Ok(())
    }

    fn add_param(&mut self, name: &str, value: f64) -> TagScanResult<()> {
        self.check()?;
        self.calls.push(SinkCall::AddParam {
            name: name.to_string(),
            value,
        });
        Ok(())
    }

    fn add_pulse(&mut self, port: PortNum, pulse: &Pulse) -> TagScanResult<()> {
        self.check()?;
        self.calls.push(SinkCall::AddPulse {
            port,
            pulse: *pulse,
        });
        Ok(())
    }

    fn commit(&mut self) -> TagScanResult<()> {
        self.check()?;
        self.calls.push(SinkCall::Commit);
        Ok(())
    }

    fn close_batch(&mut self, num_runs: u64, num_hits: u64) -> TagScanResult<()> {
        self.check()?;
        self.calls.push(SinkCall::CloseBatch { num_runs, num_hits });
        Ok(())
    }
}
