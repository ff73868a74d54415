//! Top-level detection driver
//!
//! A foray manages every finder searching one record stream. Records pass
//! through clock repair first; each corrected record advances the
//! activation history (keeping the per-frequency graphs current), expires
//! stale candidates everywhere, and pulses are routed to the finder for
//! their (port, nominal frequency) channel. Detections flow to the
//! persistence sink in transactional chunks.
//!
//! The whole foray (graphs, finders, candidates, history cursor and the
//! clock-repair buffer) can be paused to an opaque byte stream and
//! resumed in a later process (see [`crate::snapshot`]).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ForayConfig;
use crate::error::{TagScanError, TagScanResult};
use crate::finder::TagFinder;
use crate::graph::Graph;
use crate::history::{EventKind, History};
use crate::clock_repair::ClockRepair;
use crate::record::{Pulse, Record};
use crate::sink::{BurstParams, DetectionSink, Filer, RunLedger};
use crate::tag::TagDatabase;
use crate::types::{
    nominal_khz, FrequencyMHz, NominalFreqKHz, PortNum, SeqNo, TagId, Timestamp,
    SENTINEL_TAG_ID,
};

/// Stream counters, summarised at batch close.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Diagnostics {
    /// Records accepted from the stream.
    pub records: u64,
    /// Records skipped as malformed.
    pub malformed: u64,
    /// Pulses that reached routing.
    pub pulses: u64,
    /// Pulses dropped by the offset-frequency filter or for lacking a
    /// matching graph.
    pub discarded_pulses: u64,
    /// Sentinel detections emitted by rate limiting.
    pub sentinels: u64,
    /// Largest concurrent candidate count seen.
    pub max_cands: usize,
    /// Timestamp at which the maximum was reached.
    pub max_cands_ts: Timestamp,
}

/// Everything that survives a pause/resume cycle.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ForayState {
    pub(crate) cfg: ForayConfig,
    pub(crate) db: TagDatabase,
    pub(crate) graphs: BTreeMap<NominalFreqKHz, Graph>,
    pub(crate) finders: Vec<TagFinder>,
    pub(crate) port_freq: BTreeMap<PortNum, FrequencyMHz>,
    pub(crate) history: History,
    pub(crate) repair: ClockRepair,
    pub(crate) runs: RunLedger,
    pub(crate) data_ts: Timestamp,
    pub(crate) next_seq: SeqNo,
    pub(crate) diag: Diagnostics,
    pub(crate) offsets_reported: (bool, bool),
    /// Filer totals captured at pause, restored at resume.
    pub(crate) num_runs: u64,
    pub(crate) num_hits: u64,
}

/// The top-level driver: routes records, keeps graphs current, and feeds
/// the sink.
#[derive(Debug)]
pub struct Foray<S: DetectionSink> {
    state: ForayState,
    filer: Filer<S>,
}

impl<S: DetectionSink> Foray<S> {
    /// Start a foray over `db` with `cfg`, writing to `sink`.
    ///
    /// Fails fast on invalid configuration and on tag databases where two
    /// registrations on one frequency cannot be told apart.
    pub fn new(db: TagDatabase, cfg: ForayConfig, sink: S) -> TagScanResult<Self> {
        cfg.validate()?;
        check_distinguishable(&db, &cfg)?;
        let mono_tol = cfg.mono_tol;

        let graphs: BTreeMap<NominalFreqKHz, Graph> = db
            .nominal_frequencies()
            .into_iter()
            .map(|f| (f, Graph::new(f)))
            .collect();
        let history = History::from_database(&db);

        let mut filer = Filer::new(sink, cfg.ops_per_commit);
        filer.open_batch()?;
        for (name, value) in cfg.sink_params() {
            filer.add_param(name, value)?;
        }

        info!(
            tags = db.len(),
            frequencies = graphs.len(),
            "foray started"
        );

        Ok(Self {
            state: ForayState {
                cfg,
                db,
                graphs,
                finders: Vec::new(),
                port_freq: BTreeMap::new(),
                history,
                repair: ClockRepair::new(mono_tol),
                runs: RunLedger::default(),
                data_ts: 0.0,
                next_seq: 1,
                diag: Diagnostics::default(),
                offsets_reported: (false, false),
                num_runs: 0,
                num_hits: 0,
            },
            filer,
        })
    }

    /// Stream counters so far.
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.state.diag
    }

    /// The configuration in effect.
    pub fn config(&self) -> &ForayConfig {
        &self.state.cfg
    }

    /// Borrow the sink (through the filer).
    pub fn sink(&self) -> &S {
        self.filer.sink()
    }

    /// DOT rendering of one frequency's graph, for debugging.
    pub fn dot(&self, nominal: NominalFreqKHz) -> Option<String> {
        self.state.graphs.get(&nominal).map(|g| g.to_dot())
    }

    /// Total live candidates across all finders.
    pub fn num_cands(&self) -> usize {
        self.state.finders.iter().map(|f| f.num_cands()).sum()
    }

    /// Accept one record from the stream.
    pub fn process_record(&mut self, rec: Record) -> TagScanResult<()> {
        if !rec.ts().is_finite() {
            self.state.diag.malformed += 1;
            warn!(?rec, "skipping record with non-finite timestamp");
            return Ok(());
        }
        self.state.diag.records += 1;
        self.state.repair.put(rec);
        self.report_offsets()?;
        while let Some(r) = self.state.repair.get() {
            self.dispatch(r)?;
        }
        Ok(())
    }

    /// Convenience: process a whole iterator of records, then finish.
    pub fn run<I>(mut self, records: I) -> TagScanResult<S>
    where
        I: IntoIterator<Item = Record>,
    {
        for rec in records {
            self.process_record(rec)?;
        }
        self.finish()
    }

    /// End of stream: flush rate gates, emit complete in-buffer bursts of
    /// confirmed candidates, end their runs, and close the batch.
    pub fn finish(mut self) -> TagScanResult<S> {
        let unresolved = self.state.repair.unresolved();
        if unresolved > 0 {
            warn!(
                unresolved,
                "clock repair could not calibrate; records withheld from this batch"
            );
        }

        let state = &mut self.state;
        for finder in &mut state.finders {
            let graph = state
                .graphs
                .get_mut(&finder.nominal_khz())
                .expect("finder without graph");
            let held = finder
                .rate_gate
                .as_mut()
                .map(|g| g.flush())
                .unwrap_or_default();
            for p in held {
                if state.cfg.pulses_only {
                    self.filer.add_pulse(finder.port(), &p)?;
                } else {
                    finder.process_pulse(p, graph, &state.db, &state.cfg, &mut state.runs, &mut self.filer)?;
                }
            }
            finder.finish(graph, &state.db, &mut state.runs, &mut self.filer)?;
        }

        info!(
            records = state.diag.records,
            pulses = state.diag.pulses,
            discarded = state.diag.discarded_pulses,
            malformed = state.diag.malformed,
            sentinels = state.diag.sentinels,
            max_cands = state.diag.max_cands,
            runs = self.filer.num_runs(),
            hits = self.filer.num_hits(),
            "batch complete"
        );
        self.filer.close_batch()?;
        Ok(self.filer.into_inner())
    }

    /// Serialize the foray for a later resume; closes the current batch.
    /// Open runs are not ended; they continue in the next batch.
    pub fn pause(mut self) -> TagScanResult<(Vec<u8>, S)> {
        self.state.num_runs = self.filer.num_runs();
        self.state.num_hits = self.filer.num_hits();
        let bytes = crate::snapshot::save(&self.state)?;
        self.filer.close_batch()?;
        Ok((bytes, self.filer.into_inner()))
    }

    /// Resume a paused foray against a fresh sink.
    pub fn resume(bytes: &[u8], sink: S) -> TagScanResult<Self> {
        let mut state = crate::snapshot::load(bytes)?;
        for graph in state.graphs.values_mut() {
            graph.rebuild_index();
        }
        let mut filer = Filer::new(sink, state.cfg.ops_per_commit);
        filer.restore_totals(state.num_runs, state.num_hits);
        filer.open_batch()?;
        info!(tags = state.db.len(), "foray resumed");
        Ok(Self { state, filer })
    }

    /// Record clock-repair offsets to the sink once each is known.
    fn report_offsets(&mut self) -> TagScanResult<()> {
        if !self.state.offsets_reported.0 {
            if let Some(off) = self.state.repair.pre_gps_offset() {
                self.filer.add_param("pre_gps_offset", off)?;
                self.state.offsets_reported.0 = true;
            }
        }
        if !self.state.offsets_reported.1 {
            if let Some(off) = self.state.repair.monotonic_offset() {
                self.filer.add_param("monotonic_offset", off)?;
                self.state.offsets_reported.1 = true;
            }
        }
        Ok(())
    }

    /// Route one clock-corrected record.
    fn dispatch(&mut self, r: Record) -> TagScanResult<()> {
        let ts = r.ts();
        let advanced = ts > self.state.data_ts;
        if advanced {
            self.state.data_ts = ts;
            self.apply_events(ts)?;
            self.expire_all(ts)?;
        }

        match r {
            Record::FreqSetting { port, freq_mhz, .. } => {
                if !self.state.cfg.force_default_freq {
                    debug!(port, freq_mhz, "port retuned");
                    self.state.port_freq.insert(port, freq_mhz);
                }
                Ok(())
            }
            Record::Param { name, value, .. } => self.filer.add_param(&name, value),
            Record::Gps { .. } => Ok(()),
            Record::Pulse {
                port,
                ts,
                dfreq,
                sig,
                noise,
            } => self.dispatch_pulse(port, ts, dfreq, sig, noise),
        }
    }

    /// Apply all activation events at or before `ts` to their graphs.
    fn apply_events(&mut self, ts: Timestamp) -> TagScanResult<()> {
        let events: Vec<_> = self.state.history.drain_until(ts).to_vec();
        for ev in events {
            let tag = match self.state.db.get(ev.tag_id) {
                Some(t) => t.clone(),
                None => continue,
            };
            let graph = self
                .state
                .graphs
                .get_mut(&tag.nominal_khz)
                .expect("graph exists for every registered frequency");
            match ev.kind {
                EventKind::Activate => {
                    debug!(tag = ev.tag_id, ts = ev.ts, "activating tag");
                    graph.add_tag(&tag, &self.state.cfg.timing);
                }
                EventKind::Deactivate => {
                    debug!(tag = ev.tag_id, ts = ev.ts, "deactivating tag");
                    graph.remove_tag(&tag, &self.state.cfg.timing);
                }
            }
        }
        Ok(())
    }

    /// Expire stale candidates on every channel.
    fn expire_all(&mut self, ts: Timestamp) -> TagScanResult<()> {
        let state = &mut self.state;
        for finder in &mut state.finders {
            let graph = state
                .graphs
                .get_mut(&finder.nominal_khz())
                .expect("finder without graph");
            finder.expire(ts, graph, &mut state.runs, &mut self.filer)?;
        }
        Ok(())
    }

    fn dispatch_pulse(
        &mut self,
        port: PortNum,
        ts: Timestamp,
        dfreq: f64,
        sig: f64,
        noise: f64,
    ) -> TagScanResult<()> {
        let cfg = &self.state.cfg;
        let dfreq = if cfg.unsigned_dfreq { dfreq.abs() } else { dfreq };
        if cfg.min_dfreq_khz.map_or(false, |lo| dfreq < lo)
            || cfg.max_dfreq_khz.map_or(false, |hi| dfreq > hi)
        {
            self.state.diag.discarded_pulses += 1;
            return Ok(());
        }

        let freq_mhz = if cfg.force_default_freq {
            cfg.default_freq_mhz
        } else {
            self.state
                .port_freq
                .get(&port)
                .copied()
                .unwrap_or(cfg.default_freq_mhz)
        };
        let nominal = nominal_khz(freq_mhz);

        if !self.state.cfg.pulses_only && !self.state.graphs.contains_key(&nominal) {
            // no tags registered on this frequency
            self.state.diag.discarded_pulses += 1;
            return Ok(());
        }

        let pulse = Pulse {
            ts,
            dfreq,
            sig,
            noise,
            ant_freq: freq_mhz,
            seq_no: self.state.next_seq,
        };
        self.state.next_seq += 1;
        self.state.diag.pulses += 1;

        let idx = self.finder_index(port, nominal);
        let state = &mut self.state;
        let finder = &mut state.finders[idx];

        let (released, sentinel) = match finder.rate_gate.as_mut() {
            Some(gate) => {
                let out = gate.offer(pulse);
                (out.released, out.sentinel)
            }
            None => (vec![pulse], None),
        };

        if state.cfg.pulses_only {
            for p in released {
                self.filer.add_pulse(port, &p)?;
            }
        } else {
            let graph = state
                .graphs
                .get_mut(&nominal)
                .expect("checked above");
            for p in released {
                finder.process_pulse(p, graph, &state.db, &state.cfg, &mut state.runs, &mut self.filer)?;
            }
        }

        if let Some(sent_ts) = sentinel {
            self.emit_sentinel(port, sent_ts)?;
        }

        let total: usize = self.state.finders.iter().map(|f| f.num_cands()).sum();
        if total > self.state.diag.max_cands {
            self.state.diag.max_cands = total;
            self.state.diag.max_cands_ts = ts;
        }
        Ok(())
    }

    /// A rate-limited window was discarded: report it as a one-hit run
    /// under the sentinel tag id.
    fn emit_sentinel(&mut self, port: PortNum, ts: Timestamp) -> TagScanResult<()> {
        self.state.diag.sentinels += 1;
        let par = BurstParams {
            sig: 0.0,
            sig_sd: 0.0,
            noise: 0.0,
            freq: 0.0,
            freq_sd: 0.0,
            slop: 0.0,
            burst_slop: 0.0,
        };
        let rid = self.filer.begin_run(SENTINEL_TAG_ID, port, ts)?;
        self.filer.add_hit(rid, ts, &par)?;
        self.filer.end_run(rid, 1, ts, false)
    }

    fn finder_index(&mut self, port: PortNum, nominal: NominalFreqKHz) -> usize {
        if let Some(i) = self
            .state
            .finders
            .iter()
            .position(|f| f.port() == port && f.nominal_khz() == nominal)
        {
            i
        } else {
            debug!(port, nominal, "creating finder");
            self.state
                .finders
                .push(TagFinder::new(port, nominal, &self.state.cfg));
            self.state.finders.len() - 1
        }
    }
}

/// Verify that, with every tag of each nominal frequency active, every
/// tag attains some reachable state identifying it uniquely. Tags that
/// never do are indistinguishable from a sibling and the database is
/// unusable as configured.
fn check_distinguishable(db: &TagDatabase, cfg: &ForayConfig) -> TagScanResult<()> {
    for nominal in db.nominal_frequencies() {
        let mut graph = Graph::new(nominal);
        for tag in db.tags_on(nominal) {
            graph.add_tag(tag, &cfg.timing);
        }
        let canonical = graph.canonical();
        let mut ambiguous: Vec<TagId> = Vec::new();
        for tag in db.tags_on(nominal) {
            let distinguishable = canonical.iter().any(|(set, _)| {
                !set.is_empty() && set.iter().all(|&(id, _)| id == tag.id)
            });
            if !distinguishable {
                ambiguous.push(tag.id);
            }
        }
        if !ambiguous.is_empty() {
            return Err(TagScanError::IndistinguishableTags {
                nominal_khz: nominal,
                tag_ids: ambiguous,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimingConfig;
    use crate::sink::{MemorySink, SinkCall};
    use crate::tag::Tag;
    use crate::types::Gap;

    fn tag(id: TagId, gaps: &[Gap], period: Gap) -> Tag {
        Tag {
            id,
            nominal_khz: 166_380,
            gaps: gaps.to_vec(),
            period,
            active_from: 0.0,
            active_until: 2e9,
        }
    }

    fn cfg(pulse_slop: Gap) -> ForayConfig {
        ForayConfig {
            timing: TimingConfig {
                pulse_slop,
                burst_slop: 0.1,
                burst_slop_expansion: 0.01,
                max_skipped_bursts: 2,
            },
            ..ForayConfig::default()
        }
    }

    fn pulse(ts: Timestamp) -> Record {
        Record::Pulse {
            port: 3,
            ts,
            dfreq: 2.5,
            sig: -40.0,
            noise: -90.0,
        }
    }

    /// Offset each scenario timestamp into the VALID era so clock repair
    /// passes records straight through.
    fn t(rel: f64) -> Timestamp {
        1.4e9 + rel
    }

    fn burst(t0: f64) -> Vec<Record> {
        [0.0, 3.0, 8.0, 15.0].iter().map(|o| pulse(t(t0 + o))).collect()
    }

    #[test]
    fn test_scenario_single_clean_burst() {
        let db = TagDatabase::new(vec![tag(1, &[3.0, 5.0, 7.0], 20.0)]).unwrap();
        let mut foray = Foray::new(db, cfg(0.5), MemorySink::new()).unwrap();
        for r in burst(10.0) {
            foray.process_record(r).unwrap();
        }
        let sink = foray.finish().unwrap();
        assert_eq!(sink.runs_begun().len(), 1);
        let rid = sink.runs_begun()[0];
        assert_eq!(sink.run_tag(rid), Some(1));
        let hits = sink.hits_for(rid);
        assert_eq!(hits.len(), 1);
        if let SinkCall::AddHit { par, .. } = hits[0] {
            assert!(par.slop.abs() < 1e-9);
            assert_eq!(par.burst_slop, 0.0);
        }
    }

    #[test]
    fn test_scenario_second_burst_confirms_cadence() {
        let db = TagDatabase::new(vec![tag(1, &[3.0, 5.0, 7.0], 20.0)]).unwrap();
        let mut foray = Foray::new(db, cfg(0.5), MemorySink::new()).unwrap();
        for r in burst(10.0).into_iter().chain(burst(30.0)) {
            foray.process_record(r).unwrap();
        }
        let sink = foray.finish().unwrap();
        assert_eq!(sink.runs_begun().len(), 1);
        let hits = sink.hits_for(sink.runs_begun()[0]);
        assert_eq!(hits.len(), 2);
        if let SinkCall::AddHit { par, .. } = hits[1] {
            assert!(par.burst_slop.abs() < 1e-9);
        }
    }

    #[test]
    fn test_scenario_gap_slop_rejection() {
        let db = TagDatabase::new(vec![tag(1, &[3.0, 5.0, 7.0], 20.0)]).unwrap();
        let mut foray = Foray::new(db, cfg(0.5), MemorySink::new()).unwrap();
        for &o in &[0.0, 3.0, 8.6, 15.0] {
            foray.process_record(pulse(t(10.0 + o))).unwrap();
        }
        let sink = foray.finish().unwrap();
        assert!(sink.runs_begun().is_empty(), "burst never completes");
    }

    #[test]
    fn test_scenario_two_overlapping_tags() {
        let db = TagDatabase::new(vec![
            tag(1, &[3.0, 5.0, 7.0], 20.0),
            tag(2, &[3.0, 5.0, 7.1], 20.0),
        ])
        .unwrap();
        let mut foray = Foray::new(db, cfg(0.04), MemorySink::new()).unwrap();
        for r in burst(10.0) {
            foray.process_record(r).unwrap();
        }
        let sink = foray.finish().unwrap();
        assert_eq!(sink.runs_begun().len(), 1);
        assert_eq!(sink.run_tag(sink.runs_begun()[0]), Some(1));
    }

    #[test]
    fn test_scenario_rate_limit_discard() {
        let db = TagDatabase::new(vec![tag(1, &[3.0, 5.0, 7.0], 20.0)]).unwrap();
        let mut c = cfg(0.5);
        c.max_pulse_rate = 10.0;
        c.pulse_rate_window = 1.0;
        c.min_bogus_spacing = 5.0;
        let mut foray = Foray::new(db, c, MemorySink::new()).unwrap();
        for i in 0..20 {
            foray
                .process_record(pulse(t(100.0 + i as f64 * 0.025)))
                .unwrap();
        }
        let sink = foray.finish().unwrap();
        // the only run is the sentinel
        assert_eq!(sink.runs_begun().len(), 1);
        assert_eq!(sink.run_tag(sink.runs_begun()[0]), Some(SENTINEL_TAG_ID));
    }

    #[test]
    fn test_scenario_clock_repair_pre_gps() {
        let db = TagDatabase::new(vec![tag(1, &[3.0, 5.0, 7.0], 20.0)]).unwrap();
        let mut foray = Foray::new(db, cfg(0.5), MemorySink::new()).unwrap();
        foray
            .process_record(Record::Param {
                ts: 1_000_000_000.0,
                name: "antenna".into(),
                value: 1.0,
            })
            .unwrap();
        foray
            .process_record(Record::Param {
                ts: 1_000_000_300.0,
                name: "antenna".into(),
                value: 2.0,
            })
            .unwrap();
        foray
            .process_record(Record::Gps {
                ts: 1_300_000_600.0,
            })
            .unwrap();
        let sink = foray.finish().unwrap();
        let offsets: Vec<f64> = sink
            .calls
            .iter()
            .filter_map(|c| match c {
                SinkCall::AddParam { name, value } if name == "pre_gps_offset" => Some(*value),
                _ => None,
            })
            .collect();
        assert_eq!(offsets, vec![300_000_300.0]);
        // the buffered params were released (they appear after the offset
        // was learned) with their original values
        let antenna_params = sink
            .calls
            .iter()
            .filter(|c| matches!(c, SinkCall::AddParam { name, .. } if name == "antenna"))
            .count();
        assert_eq!(antenna_params, 2);
    }

    #[test]
    fn test_indistinguishable_tags_rejected() {
        let db = TagDatabase::new(vec![
            tag(1, &[3.0, 5.0, 7.0], 20.0),
            tag(2, &[3.0, 5.0, 7.0], 20.0),
        ])
        .unwrap();
        let err = Foray::new(db, cfg(0.5), MemorySink::new()).unwrap_err();
        match err {
            TagScanError::IndistinguishableTags { tag_ids, .. } => {
                assert_eq!(tag_ids, vec![1, 2]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_deactivation_expires_candidates_and_stops_matching() {
        let mut a = tag(1, &[3.0, 5.0, 7.0], 20.0);
        a.active_until = t(27.0);
        let db = TagDatabase::new(vec![a]).unwrap();
        let mut foray = Foray::new(db, cfg(0.5), MemorySink::new()).unwrap();
        // first burst completes before deactivation
        for r in burst(10.0) {
            foray.process_record(r).unwrap();
        }
        assert_eq!(foray.sink().runs_begun().len(), 1);
        // after deactivation the same cadence no longer matches
        for r in burst(30.0) {
            foray.process_record(r).unwrap();
        }
        let sink = foray.finish().unwrap();
        assert_eq!(sink.runs_begun().len(), 1, "no new run after deactivation");
        let hits = sink.hits_for(sink.runs_begun()[0]);
        assert_eq!(hits.len(), 1, "no second hit after deactivation");
    }

    #[test]
    fn test_dfreq_filter_and_unsigned() {
        let db = TagDatabase::new(vec![tag(1, &[3.0, 5.0, 7.0], 20.0)]).unwrap();
        let mut c = cfg(0.5);
        c.min_dfreq_khz = Some(0.0);
        c.max_dfreq_khz = Some(10.0);
        c.unsigned_dfreq = true;
        let mut foray = Foray::new(db, c, MemorySink::new()).unwrap();
        // negative offsets fold positive under unsigned_dfreq and pass
        for &o in &[0.0_f64, 3.0, 8.0, 15.0] {
            foray
                .process_record(Record::Pulse {
                    port: 3,
                    ts: t(10.0 + o),
                    dfreq: -2.5,
                    sig: -40.0,
                    noise: -90.0,
                })
                .unwrap();
        }
        let sink = foray.finish().unwrap();
        assert_eq!(sink.runs_begun().len(), 1);
    }

    #[test]
    fn test_pulses_only_mode() {
        let db = TagDatabase::new(vec![tag(1, &[3.0, 5.0, 7.0], 20.0)]).unwrap();
        let mut c = cfg(0.5);
        c.pulses_only = true;
        let mut foray = Foray::new(db, c, MemorySink::new()).unwrap();
        for r in burst(10.0) {
            foray.process_record(r).unwrap();
        }
        let sink = foray.finish().unwrap();
        assert!(sink.runs_begun().is_empty(), "no matching in pulses-only mode");
        let raw = sink
            .calls
            .iter()
            .filter(|c| matches!(c, SinkCall::AddPulse { .. }))
            .count();
        assert_eq!(raw, 4);
    }

    #[test]
    fn test_freq_setting_routes_to_other_graph() {
        let mut b = tag(2, &[4.0, 6.0], 30.0);
        b.nominal_khz = 150_100;
        let db = TagDatabase::new(vec![tag(1, &[3.0, 5.0, 7.0], 20.0), b]).unwrap();
        let mut foray = Foray::new(db, cfg(0.5), MemorySink::new()).unwrap();
        foray
            .process_record(Record::FreqSetting {
                port: 3,
                ts: t(1.0),
                freq_mhz: 150.100,
            })
            .unwrap();
        // tag 2's pattern on the retuned port
        for &o in &[0.0, 4.0, 10.0, 30.0, 34.0, 40.0] {
            foray.process_record(pulse(t(10.0 + o))).unwrap();
        }
        let sink = foray.finish().unwrap();
        assert_eq!(sink.runs_begun().len(), 1);
        assert_eq!(sink.run_tag(sink.runs_begun()[0]), Some(2));
    }

    #[test]
    fn test_malformed_record_skipped() {
        let db = TagDatabase::new(vec![tag(1, &[3.0, 5.0, 7.0], 20.0)]).unwrap();
        let mut foray = Foray::new(db, cfg(0.5), MemorySink::new()).unwrap();
        foray
            .process_record(Record::Gps { ts: f64::NAN })
            .unwrap();
        assert_eq!(foray.diagnostics().malformed, 1);
    }

    #[test]
    fn test_sink_failure_is_fatal() {
        let db = TagDatabase::new(vec![tag(1, &[3.0, 5.0, 7.0], 20.0)]).unwrap();
        let mut sink = MemorySink::new();
        sink.fail = true;
        assert!(Foray::new(db, cfg(0.5), sink).is_err());
    }
}
