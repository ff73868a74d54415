//! In-flight match candidates
//!
//! A candidate is one tentative interpretation of recent pulses as a tag.
//! It holds its current graph state, the pulses consumed so far, and the
//! signal/frequency windows those pulses established. Candidates compete
//! for pulses: the first one to complete a burst at CONFIRMED level owns
//! its buffered pulses, and every other candidate sharing any of them is
//! destroyed.
//!
//! Signal strength can change sharply between bursts (antenna pattern,
//! tag orientation), so the signal window resets after every completed
//! burst. Frequency offset drifts slowly with temperature, so the
//! frequency window is recentred on the burst mean instead, keeping its
//! width.

use serde::{Deserialize, Serialize};

use crate::config::ForayConfig;
use crate::error::TagScanResult;
use crate::graph::{Graph, NodeHandle};
use crate::record::Pulse;
use crate::sink::{BurstParams, DetectionSink, Filer, RunLedger};
use crate::tag::{Tag, TagDatabase};
use crate::types::{PortNum, RunId, TagId, Timestamp};

/// How narrowly a candidate's pulse history identifies a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdLevel {
    /// Two or more distinct tags remain compatible.
    Multiple,
    /// Exactly one tag remains.
    Single,
    /// One tag, and enough pulses consumed to confirm it.
    Confirmed,
}

/// A min/max window with symmetric slop on both sides.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    slop: f64,
    bounds: Option<(f64, f64)>,
}

impl ValueRange {
    /// Window seeded at one value.
    pub fn new(slop: f64, initial: f64) -> Self {
        Self {
            slop,
            bounds: Some((initial, initial)),
        }
    }

    /// Is `x` within the window extended by the slop? An unseeded window
    /// accepts anything.
    pub fn accepts(&self, x: f64) -> bool {
        match self.bounds {
            None => true,
            Some((lo, hi)) => x >= lo - self.slop && x <= hi + self.slop,
        }
    }

    /// Widen the window to include `x`.
    pub fn extend(&mut self, x: f64) {
        self.bounds = Some(match self.bounds {
            None => (x, x),
            Some((lo, hi)) => (lo.min(x), hi.max(x)),
        });
    }

    /// Forget the bounds; the next extend reseeds.
    pub fn clear(&mut self) {
        self.bounds = None;
    }

    /// Shift the window to be centred at `centre`, preserving its width.
    pub fn recentre(&mut self, centre: f64) {
        if let Some((lo, hi)) = self.bounds {
            let half = (hi - lo) / 2.0;
            self.bounds = Some((centre - half, centre + half));
        }
    }
}

/// One in-flight match attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    state: NodeHandle,
    pulses: Vec<Pulse>,
    last_ts: Timestamp,
    /// Timestamp of the last pulse of the most recently emitted burst.
    last_burst_ts: Option<Timestamp>,
    tag_id: Option<TagId>,
    burst_len: usize,
    level: IdLevel,
    run_id: Option<RunId>,
    hit_count: u64,
    freq_range: ValueRange,
    sig_range: ValueRange,
}

impl Candidate {
    /// Seed a candidate at `state` with a single pulse.
    pub fn new(graph: &mut Graph, state: NodeHandle, pulse: Pulse, cfg: &ForayConfig) -> Self {
        graph.cand_link(state);
        Self {
            state,
            last_ts: pulse.ts,
            last_burst_ts: None,
            tag_id: None,
            burst_len: 0,
            level: IdLevel::Multiple,
            run_id: None,
            hit_count: 0,
            freq_range: ValueRange::new(cfg.freq_slop_khz, pulse.dfreq),
            sig_range: ValueRange::new(cfg.sig_slop_db, pulse.sig),
            pulses: vec![pulse],
        }
    }

    /// Clone this candidate, bumping the graph and run bookkeeping.
    pub fn cloned(&self, graph: &mut Graph, runs: &mut RunLedger) -> Self {
        graph.cand_link(self.state);
        if self.level == IdLevel::Confirmed {
            if let Some(rid) = self.run_id {
                runs.acquire(rid);
            }
        }
        self.clone()
    }

    /// The state this candidate would advance to on `p`, or None if the
    /// pulse is incompatible (window gates or no matching edge).
    pub fn advance_target(&self, graph: &Graph, p: &Pulse) -> Option<NodeHandle> {
        if !self.freq_range.accepts(p.dfreq) || !self.sig_range.accepts(p.sig) {
            return None;
        }
        graph.advance(self.state, p.ts - self.last_ts)
    }

    /// Consume `p`, moving to `new_state`. Returns true when this
    /// candidate now owns its buffered pulses: it is CONFIRMED and `p`
    /// completes a burst.
    pub fn accept(
        &mut self,
        graph: &mut Graph,
        db: &TagDatabase,
        cfg: &ForayConfig,
        p: Pulse,
        new_state: NodeHandle,
    ) -> bool {
        debug_assert!(
            self.pulses.last().map_or(true, |q| q.seq_no < p.seq_no),
            "pulse sequence numbers must increase within a candidate"
        );
        self.pulses.push(p);
        self.last_ts = p.ts;
        graph.cand_link(new_state);
        graph.cand_unlink(self.state);
        self.state = new_state;

        if self.level == IdLevel::Multiple {
            if let Some(id) = graph.node(new_state).unique_tag() {
                self.tag_id = Some(id);
                self.burst_len = db.get(id).map(|t| t.burst_len()).unwrap_or(0);
                self.level = IdLevel::Single;
            }
        }
        if self.level == IdLevel::Single
            && self.pulses.len() >= cfg.pulses_to_confirm_id as usize
        {
            self.level = IdLevel::Confirmed;
        }

        let mut completes = false;
        if self.level != IdLevel::Multiple && self.burst_len > 0 {
            if let Some(phase) = graph.node(new_state).unique_phase() {
                completes = phase as usize == self.burst_len - 1;
            }
        }

        if completes {
            self.sig_range.clear();
            let n = self.burst_len.min(self.pulses.len());
            let mean = self.pulses[self.pulses.len() - n..]
                .iter()
                .map(|q| q.dfreq)
                .sum::<f64>()
                / n as f64;
            self.freq_range.recentre(mean);
        } else {
            self.sig_range.extend(p.sig);
            self.freq_range.extend(p.dfreq);
        }

        self.level == IdLevel::Confirmed && completes
    }

    /// Has this candidate waited longer than its state can accept?
    /// A candidate on an invalidated state is expired outright.
    pub fn expired(&self, graph: &Graph, ts: Timestamp) -> bool {
        let node = graph.node(self.state);
        if !node.is_valid() {
            return true;
        }
        ts - self.last_ts >= node.max_gap()
    }

    /// Do the two candidates share any pulse? Buffers are ordered by
    /// sequence number, so a single merge pass suffices.
    pub fn shares_pulses(&self, other: &Candidate) -> bool {
        let (mut i, mut j) = (0, 0);
        while i < self.pulses.len() && j < other.pulses.len() {
            let (a, b) = (self.pulses[i].seq_no, other.pulses[j].seq_no);
            if a < b {
                i += 1;
            } else if a > b {
                j += 1;
            } else {
                return true;
            }
        }
        false
    }

    /// Emit every complete burst in the buffer, opening a run on the
    /// first. Emitted pulses are dropped from the buffer.
    pub fn emit_bursts<S: DetectionSink>(
        &mut self,
        db: &TagDatabase,
        port: PortNum,
        filer: &mut Filer<S>,
        runs: &mut RunLedger,
    ) -> TagScanResult<()> {
        let tag_id = match self.tag_id {
            Some(id) => id,
            None => return Ok(()),
        };
        let tag = match db.get(tag_id) {
            Some(t) => t.clone(),
            None => return Ok(()),
        };
        while self.burst_len > 0 && self.pulses.len() >= self.burst_len {
            let burst: Vec<Pulse> = self.pulses.drain(..self.burst_len).collect();
            let first_ts = burst[0].ts;
            let run_id = match self.run_id {
                Some(rid) => rid,
                None => {
                    let rid = filer.begin_run(tag_id, port, first_ts)?;
                    self.run_id = Some(rid);
                    runs.acquire(rid);
                    rid
                }
            };
            let par = burst_stats(&tag, &burst, self.last_burst_ts);
            filer.add_hit(run_id, first_ts, &par)?;
            self.hit_count += 1;
            self.last_burst_ts = Some(burst.last().unwrap().ts);
        }
        Ok(())
    }

    /// The registry replaced `from` with `to` for this physical tag:
    /// end the current run, keep the pulse buffer and id level, and
    /// report subsequent hits under the new id. A candidate holding a
    /// different tag is untouched.
    pub fn rename_tag<S: DetectionSink>(
        &mut self,
        from: TagId,
        to: TagId,
        db: &TagDatabase,
        runs: &mut RunLedger,
        filer: &mut Filer<S>,
    ) -> TagScanResult<()> {
        if self.tag_id != Some(from) {
            return Ok(());
        }
        if let (IdLevel::Confirmed, Some(rid)) = (self.level, self.run_id) {
            if runs.release(rid) {
                let last = self.last_burst_ts.unwrap_or(self.last_ts);
                filer.end_run(rid, self.hit_count, last, false)?;
            }
        }
        self.run_id = None;
        self.hit_count = 0;
        self.tag_id = Some(to);
        if let Some(t) = db.get(to) {
            self.burst_len = t.burst_len();
        }
        Ok(())
    }

    /// Destroy the candidate: drop its state link, and if it was the last
    /// carrier of an open run, end the run.
    pub fn retire<S: DetectionSink>(
        self,
        graph: &mut Graph,
        runs: &mut RunLedger,
        filer: &mut Filer<S>,
        ending_batch: bool,
    ) -> TagScanResult<()> {
        if let (IdLevel::Confirmed, Some(rid)) = (self.level, self.run_id) {
            if runs.release(rid) {
                let last = self.last_burst_ts.unwrap_or(self.last_ts);
                filer.end_run(rid, self.hit_count, last, ending_batch)?;
            }
        }
        graph.cand_unlink(self.state);
        Ok(())
    }

    pub fn level(&self) -> IdLevel {
        self.level
    }

    pub fn tag_id(&self) -> Option<TagId> {
        self.tag_id
    }

    pub fn run_id(&self) -> Option<RunId> {
        self.run_id
    }

    pub fn pulse_count(&self) -> usize {
        self.pulses.len()
    }

    pub fn last_ts(&self) -> Timestamp {
        self.last_ts
    }

    /// Is a complete burst sitting in the buffer?
    pub fn has_complete_burst(&self) -> bool {
        self.burst_len > 0 && self.pulses.len() >= self.burst_len
    }
}

/// Statistics for one completed burst.
///
/// Signal and noise are averaged in linear power and reported in dB; the
/// signal SD is the sample SD of linear power as a percentage of its
/// mean. Frequency statistics are arithmetic. Slop sums the absolute
/// deviations of observed intra-burst gaps from the registered gaps;
/// burst slop measures the burst interval against the registered period,
/// with 0.0 standing in on the first burst of a run.
pub fn burst_stats(tag: &Tag, burst: &[Pulse], prev_burst_ts: Option<Timestamp>) -> BurstParams {
    let n = burst.len() as f64;
    let mut sig_sum = 0.0;
    let mut sig_sq = 0.0;
    let mut noise_sum = 0.0;
    let mut freq_sum = 0.0;
    let mut freq_sq = 0.0;
    let mut slop = 0.0;
    for (i, p) in burst.iter().enumerate() {
        let lin = 10.0_f64.powf(p.sig / 10.0);
        sig_sum += lin;
        sig_sq += lin * lin;
        noise_sum += 10.0_f64.powf(p.noise / 10.0);
        freq_sum += p.dfreq;
        freq_sq += p.dfreq * p.dfreq;
        if i > 0 {
            slop += ((p.ts - burst[i - 1].ts) - tag.gaps[i - 1]).abs();
        }
    }

    let burst_slop = match prev_burst_ts {
        Some(prev) => (burst[0].ts - prev) % tag.period - tag.burst_gap(),
        None => 0.0,
    };

    let sig_rad = n * sig_sq - sig_sum * sig_sum;
    let sig_sd = if sig_rad > 0.0 && n > 1.0 {
        (sig_rad / (n * (n - 1.0))).sqrt() / (sig_sum / n) * 100.0
    } else {
        0.0
    };
    let freq_rad = n * freq_sq - freq_sum * freq_sum;
    let freq_sd = if freq_rad > 0.0 && n > 1.0 {
        (freq_rad / (n * (n - 1.0))).sqrt()
    } else {
        0.0
    };

    BurstParams {
        sig: 10.0 * (sig_sum / n).log10(),
        sig_sd,
        noise: 10.0 * (noise_sum / n).log10(),
        freq: freq_sum / n,
        freq_sd,
        slop,
        burst_slop,
    }
}
