//! Per-channel candidate management
//!
//! One finder serves one (antenna port, nominal frequency) channel. On
//! each pulse it expires stale candidates, advances every live one
//! (cloning so the un-advanced interpretation survives), seeds a fresh
//! candidate at the graph root, resolves pulse-ownership conflicts, and
//! emits completed bursts through the sink.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::candidate::{Candidate, IdLevel};
use crate::config::ForayConfig;
use crate::error::TagScanResult;
use crate::graph::Graph;
use crate::rate_gate::RateGate;
use crate::record::Pulse;
use crate::sink::{DetectionSink, Filer, RunLedger};
use crate::tag::TagDatabase;
use crate::types::{NominalFreqKHz, PortNum, Timestamp};

/// Candidate set for one (port, nominal frequency) channel.
#[derive(Debug, Serialize, Deserialize)]
pub struct TagFinder {
    port: PortNum,
    nominal_khz: NominalFreqKHz,
    cands: Vec<Candidate>,
    /// Rate limiter ahead of the matcher; None when disabled.
    pub rate_gate: Option<RateGate>,
}

impl TagFinder {
    /// Create a finder for one channel.
    pub fn new(port: PortNum, nominal_khz: NominalFreqKHz, cfg: &ForayConfig) -> Self {
        let rate_gate = (cfg.max_pulse_rate > 0.0).then(|| {
            RateGate::new(
                cfg.max_pulse_rate,
                cfg.pulse_rate_window,
                cfg.min_bogus_spacing,
            )
        });
        Self {
            port,
            nominal_khz,
            cands: Vec::new(),
            rate_gate,
        }
    }

    pub fn port(&self) -> PortNum {
        self.port
    }

    pub fn nominal_khz(&self) -> NominalFreqKHz {
        self.nominal_khz
    }

    /// Number of live candidates.
    pub fn num_cands(&self) -> usize {
        self.cands.len()
    }

    /// Destroy every candidate whose state can no longer accept a pulse
    /// at time `ts`.
    pub fn expire<S: DetectionSink>(
        &mut self,
        ts: Timestamp,
        graph: &mut Graph,
        runs: &mut RunLedger,
        filer: &mut Filer<S>,
    ) -> TagScanResult<()> {
        let mut kept = Vec::with_capacity(self.cands.len());
        for cand in self.cands.drain(..) {
            if cand.expired(graph, ts) {
                cand.retire(graph, runs, filer, false)?;
            } else {
                kept.push(cand);
            }
        }
        self.cands = kept;
        Ok(())
    }

    /// Process one pulse through the candidate set.
    pub fn process_pulse<S: DetectionSink>(
        &mut self,
        p: Pulse,
        graph: &mut Graph,
        db: &TagDatabase,
        cfg: &ForayConfig,
        runs: &mut RunLedger,
        filer: &mut Filer<S>,
    ) -> TagScanResult<()> {
        self.expire(p.ts, graph, runs, filer)?;

        // advance: each candidate that can consume the pulse is cloned;
        // the original stays put so other interpretations remain open
        let mut owners: Vec<usize> = Vec::new();
        let existing = self.cands.len();
        for i in 0..existing {
            if let Some(target) = self.cands[i].advance_target(graph, &p) {
                let mut clone = self.cands[i].cloned(graph, runs);
                let owns = clone.accept(graph, db, cfg, p, target);
                if owns {
                    owners.push(self.cands.len());
                }
                self.cands.push(clone);
            }
        }

        // seed a fresh interpretation: this pulse as someone's phase 0
        let root = graph.root();
        self.cands.push(Candidate::new(graph, root, p, cfg));

        // conflict resolution: an owner's buffered pulses belong to it;
        // everyone else sharing any of them dies
        if !owners.is_empty() {
            let mut doomed = vec![false; self.cands.len()];
            for &o in &owners {
                if doomed[o] {
                    continue;
                }
                for i in 0..self.cands.len() {
                    if i != o && !doomed[i] && self.cands[o].shares_pulses(&self.cands[i]) {
                        doomed[i] = true;
                    }
                }
            }
            let mut idx = 0;
            let mut kept = Vec::with_capacity(self.cands.len());
            let mut survivors: Vec<usize> = Vec::new();
            for (i, cand) in self.cands.drain(..).enumerate() {
                if doomed[i] {
                    cand.retire(graph, runs, filer, false)?;
                } else {
                    if owners.contains(&i) {
                        survivors.push(idx);
                    }
                    kept.push(cand);
                    idx += 1;
                }
            }
            self.cands = kept;

            for i in survivors {
                let cand = &mut self.cands[i];
                if cand.has_complete_burst() {
                    cand.emit_bursts(db, self.port, filer, runs)?;
                }
            }
        }
        Ok(())
    }

    /// End-of-stream flush: emit complete in-buffer bursts of confirmed
    /// candidates, then destroy everything, ending open runs.
    pub fn finish<S: DetectionSink>(
        &mut self,
        graph: &mut Graph,
        db: &TagDatabase,
        runs: &mut RunLedger,
        filer: &mut Filer<S>,
    ) -> TagScanResult<()> {
        debug!(
            port = self.port,
            nominal_khz = self.nominal_khz,
            cands = self.cands.len(),
            "flushing finder"
        );
        for cand in &mut self.cands {
            if cand.level() == IdLevel::Confirmed && cand.has_complete_burst() {
                cand.emit_bursts(db, self.port, filer, runs)?;
            }
        }
        for cand in self.cands.drain(..) {
            cand.retire(graph, runs, filer, true)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimingConfig;
    use crate::sink::{MemorySink, SinkCall};
    use crate::tag::Tag;
    use crate::types::Gap;

    fn tag(id: i32, gaps: &[Gap], period: Gap) -> Tag {
        Tag {
            id,
            nominal_khz: 166_380,
            gaps: gaps.to_vec(),
            period,
            active_from: 0.0,
            active_until: 1e12,
        }
    }

    fn pulse(ts: f64, seq_no: u64) -> Pulse {
        Pulse {
            ts,
            dfreq: 2.5,
            sig: -40.0,
            noise: -90.0,
            ant_freq: 166.380,
            seq_no,
        }
    }

    struct Rig {
        graph: Graph,
        db: TagDatabase,
        cfg: ForayConfig,
        runs: RunLedger,
        filer: Filer<MemorySink>,
        finder: TagFinder,
    }

    fn rig(tags: Vec<Tag>, pulse_slop: Gap) -> Rig {
        let mut cfg = ForayConfig::default();
        cfg.timing = TimingConfig {
            pulse_slop,
            burst_slop: 0.1,
            burst_slop_expansion: 0.01,
            max_skipped_bursts: 2,
        };
        let mut graph = Graph::new(166_380);
        for t in &tags {
            graph.add_tag(t, &cfg.timing);
        }
        let finder = TagFinder::new(3, 166_380, &cfg);
        Rig {
            graph,
            db: TagDatabase::new(tags).unwrap(),
            cfg,
            runs: RunLedger::default(),
            filer: Filer::new(MemorySink::new(), 100_000),
            finder,
        }
    }

    fn feed(r: &mut Rig, ts: &[f64], seq0: u64) {
        for (i, &t) in ts.iter().enumerate() {
            r.finder
                .process_pulse(
                    pulse(t, seq0 + i as u64),
                    &mut r.graph,
                    &r.db,
                    &r.cfg,
                    &mut r.runs,
                    &mut r.filer,
                )
                .unwrap();
        }
    }

    #[test]
    fn test_single_clean_burst_opens_run() {
        let mut r = rig(vec![tag(1, &[3.0, 5.0, 7.0], 20.0)], 0.5);
        feed(&mut r, &[10.0, 13.0, 18.0, 25.0], 1);

        let sink = r.filer.sink();
        assert_eq!(sink.runs_begun().len(), 1);
        let rid = sink.runs_begun()[0];
        assert_eq!(sink.run_tag(rid), Some(1));
        let hits = sink.hits_for(rid);
        assert_eq!(hits.len(), 1);
        if let SinkCall::AddHit { par, ts, .. } = hits[0] {
            assert!(par.slop.abs() < 1e-9);
            assert_eq!(par.burst_slop, 0.0);
            assert_eq!(*ts, 10.0);
        } else {
            unreachable!()
        }
        // the winner killed every other candidate sharing its pulses;
        // only it survives
        assert_eq!(r.finder.num_cands(), 1);
    }

    #[test]
    fn test_second_burst_continues_run() {
        let mut r = rig(vec![tag(1, &[3.0, 5.0, 7.0], 20.0)], 0.5);
        feed(&mut r, &[10.0, 13.0, 18.0, 25.0], 1);
        feed(&mut r, &[30.0, 33.0, 38.0, 45.0], 5);

        let sink = r.filer.sink();
        assert_eq!(sink.runs_begun().len(), 1, "one run spans both bursts");
        let rid = sink.runs_begun()[0];
        let hits = sink.hits_for(rid);
        assert_eq!(hits.len(), 2);
        if let SinkCall::AddHit { par, .. } = hits[1] {
            assert!(par.burst_slop.abs() < 1e-9, "cadence matches the period");
        }
    }

    #[test]
    fn test_gap_slop_rejection_yields_no_run() {
        let mut r = rig(vec![tag(1, &[3.0, 5.0, 7.0], 20.0)], 0.5);
        // third pulse 0.6 s late: outside the 0.5 s slop
        feed(&mut r, &[10.0, 13.0, 18.6, 25.0], 1);
        assert!(r.filer.sink().runs_begun().is_empty());

        // expire everything far in the future: still no run
        r.finder
            .expire(1e6, &mut r.graph, &mut r.runs, &mut r.filer)
            .unwrap();
        assert!(r.filer.sink().runs_begun().is_empty());
        assert_eq!(r.runs.open_runs(), 0);
    }

    #[test]
    fn test_two_overlapping_tags_disambiguate() {
        let mut r = rig(
            vec![
                tag(1, &[3.0, 5.0, 7.0], 20.0),
                tag(2, &[3.0, 5.0, 7.1], 20.0),
            ],
            0.04,
        );
        feed(&mut r, &[10.0, 13.0, 18.0], 1);
        // after three pulses both tags are still possible somewhere in the
        // candidate set, and nothing is confirmed
        assert!(r.filer.sink().runs_begun().is_empty());

        // the 7.0 gap disambiguates; the confirmed winner is tag 1
        feed(&mut r, &[25.0], 4);
        let sink = r.filer.sink();
        assert_eq!(sink.runs_begun().len(), 1);
        assert_eq!(sink.run_tag(sink.runs_begun()[0]), Some(1));
    }

    #[test]
    fn test_run_closes_on_expiry() {
        let mut r = rig(vec![tag(1, &[3.0, 5.0, 7.0], 20.0)], 0.5);
        feed(&mut r, &[10.0, 13.0, 18.0, 25.0], 1);
        assert_eq!(r.runs.open_runs(), 1);

        // long silence: past the widest skipped-burst interval
        r.finder
            .expire(200.0, &mut r.graph, &mut r.runs, &mut r.filer)
            .unwrap();
        assert_eq!(r.runs.open_runs(), 0);
        let sink = r.filer.sink();
        let end = sink
            .calls
            .iter()
            .find_map(|c| match c {
                SinkCall::EndRun {
                    num_hits, last_ts, ..
                } => Some((*num_hits, *last_ts)),
                _ => None,
            })
            .expect("run must end");
        assert_eq!(end, (1, 25.0));
    }

    #[test]
    fn test_finish_flushes_and_ends_runs() {
        let mut r = rig(vec![tag(1, &[3.0, 5.0, 7.0], 20.0)], 0.5);
        feed(&mut r, &[10.0, 13.0, 18.0, 25.0], 1);
        feed(&mut r, &[30.0, 33.0, 38.0, 45.0], 5);
        r.finder
            .finish(&mut r.graph, &r.db, &mut r.runs, &mut r.filer)
            .unwrap();

        let sink = r.filer.sink();
        assert_eq!(sink.runs_begun().len(), 1);
        assert_eq!(sink.hits_for(sink.runs_begun()[0]).len(), 2);
        let ended = sink.calls.iter().any(
            |c| matches!(c, SinkCall::EndRun { ending_batch, .. } if *ending_batch),
        );
        assert!(ended, "finish ends runs with the ending-batch flag");
        assert_eq!(r.finder.num_cands(), 0);
        assert_eq!(r.runs.open_runs(), 0);
    }

    #[test]
    fn test_jittered_bursts_within_slop_still_match() {
        use rand::{rngs::StdRng, Rng, SeedableRng};
        let mut r = rig(vec![tag(1, &[3.0, 5.0, 7.0], 20.0)], 0.5);
        let mut rng = StdRng::seed_from_u64(7);
        let offsets = [0.0, 3.0, 8.0, 15.0];
        let mut seq = 1;
        for burst in 0..3 {
            let t0 = 10.0 + burst as f64 * 20.0;
            for (i, &off) in offsets.iter().enumerate() {
                // burst starts are exact; in-burst pulses jitter well
                // inside the 0.5 s pulse slop and the 0.1 s burst slop
                let jitter: f64 = if i == 0 || i == 3 {
                    0.0
                } else {
                    rng.gen_range(-0.04..0.04)
                };
                feed(&mut r, &[t0 + off + jitter], seq);
                seq += 1;
            }
        }
        let sink = r.filer.sink();
        assert_eq!(sink.runs_begun().len(), 1, "jitter within slop keeps one run");
        assert_eq!(sink.hits_for(sink.runs_begun()[0]).len(), 3);
    }
}
