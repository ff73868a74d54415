//! Pattern-matching graph for one nominal frequency
//!
//! A deterministic finite automaton over inter-pulse gaps. Each node owns
//! the set of (tag, phase) pairs still compatible with some recent pulse
//! history; each edge maps a gap interval to a successor node. Phases are
//! cyclic: intra-burst edges take phase `p` to `p + 1` over the registered
//! gap widened by the pulse slop, and burst-interval edges take the last
//! phase back to phase 0, once per permitted number of skipped bursts.
//!
//! Nodes live in an arena indexed by integer handles and are
//! reference-counted along two independent axes: structural links from
//! other nodes' edges, and candidate links from in-flight match attempts.
//! A node is reclaimed only when both counts are zero and it has been
//! invalidated by removal from the graph. The empty sink is implicit: a
//! gap that falls outside every edge interval advances to no node at all.
//!
//! Tags are added and removed as the activation history drains; after
//! `add_tag` followed by `remove_tag` the graph is structurally identical
//! to its prior state.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::config::TimingConfig;
use crate::interval_map::{closed_upper, IntervalMap};
use crate::tag::Tag;
use crate::types::{Gap, NominalFreqKHz, Phase, TagId};

/// A (tag, phase) pair: one pulse position of one registered tag.
pub type TagPhase = (TagId, Phase);

/// The compatible-set label of a node.
pub type PhaseSet = BTreeSet<TagPhase>;

/// Arena handle of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeHandle(u32);

/// One DFA state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    set: PhaseSet,
    edges: IntervalMap<NodeHandle>,
    use_count: u32,
    cand_count: u32,
    valid: bool,
}

impl Node {
    fn new(set: PhaseSet, edges: IntervalMap<NodeHandle>) -> Self {
        Self {
            set,
            edges,
            use_count: 0,
            cand_count: 0,
            valid: true,
        }
    }

    /// The (tag, phase) pairs this state is still compatible with.
    pub fn set(&self) -> &PhaseSet {
        &self.set
    }

    /// Has this node been removed from the graph?
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// The single tag id this state identifies, if exactly one remains.
    pub fn unique_tag(&self) -> Option<TagId> {
        let mut ids = self.set.iter().map(|&(id, _)| id);
        let first = ids.next()?;
        ids.all(|id| id == first).then_some(first)
    }

    /// The phase of the identified tag, when it is unambiguous.
    pub fn unique_phase(&self) -> Option<Phase> {
        self.unique_tag()?;
        let mut phases = self.set.iter().map(|&(_, p)| p);
        let first = phases.next()?;
        phases.all(|p| p == first).then_some(first)
    }

    /// Exclusive upper bound on gaps this state can still consume.
    /// A candidate older than this relative to its last pulse is dead.
    pub fn max_gap(&self) -> Gap {
        self.edges.upper_bound().unwrap_or(0.0)
    }

    /// Smallest gap this state can consume.
    pub fn min_gap(&self) -> Gap {
        self.edges.lower_bound().unwrap_or(0.0)
    }
}

struct Transition {
    from: Phase,
    to: Phase,
    intervals: Vec<(Gap, Gap)>,
}

fn transitions(tag: &Tag, timing: &TimingConfig) -> Vec<Transition> {
    let k = tag.gaps.len();
    let mut out = Vec::with_capacity(k + 1);
    for (p, &g) in tag.gaps.iter().enumerate() {
        out.push(Transition {
            from: p as Phase,
            to: (p + 1) as Phase,
            intervals: vec![(g - timing.pulse_slop, closed_upper(g + timing.pulse_slop))],
        });
    }
    let bg = tag.burst_gap();
    let mut intervals = Vec::with_capacity(timing.max_skipped_bursts as usize + 1);
    for m in 0..=timing.max_skipped_bursts {
        let centre = bg + m as Gap * tag.period;
        let width = timing.burst_slop + m as Gap * timing.burst_slop_expansion;
        intervals.push((centre - width, closed_upper(centre + width)));
    }
    out.push(Transition {
        from: k as Phase,
        to: 0,
        intervals,
    });
    out
}

/// The pattern-matching DFA for one nominal frequency.
#[derive(Debug, Serialize, Deserialize)]
pub struct Graph {
    nominal_khz: NominalFreqKHz,
    nodes: Vec<Option<Node>>,
    free: Vec<u32>,
    root: NodeHandle,
    /// Set-to-node index. The root is deliberately not indexed: its set
    /// mutates as tags activate, and no edge ever targets it.
    #[serde(skip)]
    set_index: HashMap<PhaseSet, NodeHandle>,
}

impl Graph {
    /// Create an empty graph for one nominal frequency.
    pub fn new(nominal_khz: NominalFreqKHz) -> Self {
        let root = Node::new(PhaseSet::new(), IntervalMap::new());
        Self {
            nominal_khz,
            nodes: vec![Some(root)],
            free: Vec::new(),
            root: NodeHandle(0),
            set_index: HashMap::new(),
        }
    }

    /// The nominal frequency this graph serves, kHz.
    pub fn nominal_khz(&self) -> NominalFreqKHz {
        self.nominal_khz
    }

    /// Handle of the root state.
    pub fn root(&self) -> NodeHandle {
        self.root
    }

    /// Borrow a node. Panics on a reclaimed handle; callers hold either a
    /// structural or a candidate link, so live handles never dangle.
    pub fn node(&self, h: NodeHandle) -> &Node {
        self.nodes[h.0 as usize]
            .as_ref()
            .expect("dangling node handle")
    }

    fn node_mut(&mut self, h: NodeHandle) -> &mut Node {
        self.nodes[h.0 as usize]
            .as_mut()
            .expect("dangling node handle")
    }

    /// Number of live nodes, including the root.
    pub fn num_nodes(&self) -> usize {
        self.nodes.iter().flatten().filter(|n| n.valid).count()
    }

    /// Follow the edge labelled by `gap`, if one exists.
    pub fn advance(&self, h: NodeHandle, gap: Gap) -> Option<NodeHandle> {
        self.node(h).edges.get(gap)
    }

    /// Record that a candidate now resides at `h`.
    pub fn cand_link(&mut self, h: NodeHandle) {
        self.node_mut(h).cand_count += 1;
    }

    /// Record that a candidate left `h`, reclaiming the node if it was
    /// already invalidated and nothing else refers to it.
    pub fn cand_unlink(&mut self, h: NodeHandle) {
        let node = self.node_mut(h);
        debug_assert!(node.cand_count > 0);
        node.cand_count -= 1;
        if node.cand_count == 0 && node.use_count == 0 && !node.valid {
            self.release(h);
        }
    }

    fn release(&mut self, h: NodeHandle) {
        debug_assert!(h != self.root);
        self.nodes[h.0 as usize] = None;
        self.free.push(h.0);
    }

    fn alloc(&mut self, node: Node) -> NodeHandle {
        match self.free.pop() {
            Some(i) => {
                self.nodes[i as usize] = Some(node);
                NodeHandle(i)
            }
            None => {
                self.nodes.push(Some(node));
                NodeHandle(self.nodes.len() as u32 - 1)
            }
        }
    }

    fn link(&mut self, h: NodeHandle, n: u32) {
        self.node_mut(h).use_count += n;
    }

    fn unlink(&mut self, h: NodeHandle, n: u32) {
        let root = self.root;
        let node = self.node_mut(h);
        debug_assert!(node.use_count >= n);
        node.use_count -= n;
        if node.use_count == 0 && h != root && node.valid {
            self.invalidate(h);
        }
    }

    /// Remove a node from the graph: unindex it, drop its outgoing links
    /// (cascading), and reclaim it unless candidates still reside there.
    fn invalidate(&mut self, h: NodeHandle) {
        let root = self.root;
        let mut work = vec![h];
        while let Some(h) = work.pop() {
            let node = self.node_mut(h);
            if !node.valid {
                continue;
            }
            node.valid = false;
            let edges = std::mem::take(&mut node.edges);
            let set = node.set.clone();
            self.set_index.remove(&set);
            for (child, n) in edges.value_counts() {
                let c = self.node_mut(child);
                debug_assert!(c.use_count >= n as u32);
                c.use_count -= n as u32;
                if c.use_count == 0 && child != root && c.valid {
                    work.push(child);
                }
            }
            if self.node(h).cand_count == 0 {
                self.release(h);
            }
        }
    }

    /// Find the node for `set`, or create one. A freshly created node
    /// clones the `donor`'s edges (linking their targets), so it accepts
    /// the same continuations the donor did.
    fn node_for_set(&mut self, set: PhaseSet, donor: Option<NodeHandle>) -> NodeHandle {
        if let Some(&h) = self.set_index.get(&set) {
            return h;
        }
        let edges = match donor {
            Some(d) => self.node(d).edges.clone(),
            None => IntervalMap::new(),
        };
        let targets = edges.value_counts();
        let h = self.alloc(Node::new(set.clone(), edges));
        for (child, n) in targets {
            self.link(child, n as u32);
        }
        self.set_index.insert(set, h);
        h
    }

    /// All valid nodes (root included) whose set contains `tp`, discovered
    /// by traversal from the root.
    fn nodes_containing(&self, tp: TagPhase) -> Vec<NodeHandle> {
        let mut found = Vec::new();
        let mut seen = HashSet::new();
        let mut work = vec![self.root];
        while let Some(h) = work.pop() {
            if !seen.insert(h) {
                continue;
            }
            let node = self.node(h);
            if node.set.contains(&tp) {
                found.push(h);
            }
            for seg in node.edges.iter() {
                work.push(seg.value);
            }
        }
        found
    }

    /// Rewrite `[lo, hi)` of `src`'s edges so every piece's target set
    /// additionally contains `tp`. Returns true if anything changed.
    fn splice_union(&mut self, src: NodeHandle, lo: Gap, hi: Gap, tp: TagPhase) -> bool {
        let mut edges = std::mem::take(&mut self.node_mut(src).edges);
        let before = edges.value_counts();
        let changed = edges.splice(lo, hi, |cur| {
            Some(match cur {
                Some(h) if self.node(h).set.contains(&tp) => h,
                Some(h) => {
                    let mut s = self.node(h).set.clone();
                    s.insert(tp);
                    self.node_for_set(s, Some(h))
                }
                None => {
                    let mut s = PhaseSet::new();
                    s.insert(tp);
                    self.node_for_set(s, None)
                }
            })
        });
        let after = edges.value_counts();
        self.node_mut(src).edges = edges;
        self.apply_deltas(before, after);
        changed
    }

    /// Rewrite every edge piece of `src` whose target set contains some
    /// phase of `id`, retargeting it to the reduced set (or the implicit
    /// sink when nothing remains). Returns true if anything changed.
    fn sweep_subtract(&mut self, src: NodeHandle, id: TagId) -> bool {
        let bounds = {
            let edges = &self.node(src).edges;
            if edges.is_empty() {
                return false;
            }
            (edges.lower_bound().unwrap(), edges.upper_bound().unwrap())
        };
        let mut edges = std::mem::take(&mut self.node_mut(src).edges);
        let before = edges.value_counts();
        let changed = edges.splice(bounds.0, bounds.1, |cur| {
            let h = cur?;
            let set = &self.node(h).set;
            if !set.iter().any(|&(tid, _)| tid == id) {
                return Some(h);
            }
            let reduced: PhaseSet = set.iter().copied().filter(|&(tid, _)| tid != id).collect();
            if reduced.is_empty() {
                None
            } else {
                Some(self.node_for_set(reduced, Some(h)))
            }
        });
        let after = edges.value_counts();
        self.node_mut(src).edges = edges;
        self.apply_deltas(before, after);
        changed
    }

    fn apply_deltas(
        &mut self,
        before: HashMap<NodeHandle, usize>,
        after: HashMap<NodeHandle, usize>,
    ) {
        // increments first: every handle due a decrement still holds at
        // least one reference until we take it away
        for (&h, &n) in &after {
            let prev = before.get(&h).copied().unwrap_or(0);
            if n > prev {
                self.link(h, (n - prev) as u32);
            }
        }
        for (&h, &prev) in &before {
            let n = after.get(&h).copied().unwrap_or(0);
            if prev > n {
                self.unlink(h, (prev - n) as u32);
            }
        }
    }

    /// Activate a tag: thread its phase transitions through every
    /// compatible state. Repeats until the edge structure reaches a fixed
    /// point, so states created late (e.g. the after-burst phase-0 state)
    /// receive their own continuations.
    pub fn add_tag(&mut self, tag: &Tag, timing: &TimingConfig) {
        debug_assert_eq!(tag.nominal_khz, self.nominal_khz);
        self.node_mut(self.root).set.insert((tag.id, 0));
        let transitions = transitions(tag, timing);
        loop {
            let mut changed = false;
            for tr in &transitions {
                for src in self.nodes_containing((tag.id, tr.from)) {
                    if !self.node(src).valid {
                        continue;
                    }
                    for &(lo, hi) in &tr.intervals {
                        changed |= self.splice_union(src, lo, hi, (tag.id, tr.to));
                    }
                }
            }
            if !changed {
                break;
            }
        }
    }

    /// Deactivate a tag: subtract every edge piece it contributed.
    /// Sweeps to a fixed point so states cloned during the sweep are
    /// cleaned too; afterwards no reachable set mentions the tag.
    pub fn remove_tag(&mut self, tag: &Tag, _timing: &TimingConfig) {
        loop {
            let mut changed = false;
            let handles: Vec<NodeHandle> = (0..self.nodes.len() as u32)
                .map(NodeHandle)
                .filter(|&h| {
                    self.nodes[h.0 as usize]
                        .as_ref()
                        .map(|n| n.valid)
                        .unwrap_or(false)
                })
                .collect();
            for src in handles {
                if !self
                    .nodes
                    .get(src.0 as usize)
                    .and_then(|s| s.as_ref())
                    .map(|n| n.valid)
                    .unwrap_or(false)
                {
                    continue;
                }
                changed |= self.sweep_subtract(src, tag.id);
            }
            if !changed {
                break;
            }
        }
        self.node_mut(self.root).set.remove(&(tag.id, 0));
    }

    /// Rebuild the set-to-node index after deserialization.
    pub fn rebuild_index(&mut self) {
        self.set_index.clear();
        let root = self.root;
        for (i, slot) in self.nodes.iter().enumerate() {
            if let Some(node) = slot {
                let h = NodeHandle(i as u32);
                if node.valid && h != root {
                    self.set_index.insert(node.set.clone(), h);
                }
            }
        }
    }

    /// Structural fingerprint: reachable nodes in traversal order with
    /// their sets and edge intervals. Two graphs with equal fingerprints
    /// accept identical pulse histories.
    pub fn canonical(&self) -> Vec<(PhaseSet, Vec<(u64, u64, PhaseSet)>)> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut work = vec![self.root];
        while let Some(h) = work.pop() {
            if !seen.insert(h) {
                continue;
            }
            let node = self.node(h);
            let edges: Vec<(u64, u64, PhaseSet)> = node
                .edges
                .iter()
                .map(|seg| {
                    (
                        seg.lo.to_bits(),
                        seg.hi.to_bits(),
                        self.node(seg.value).set.clone(),
                    )
                })
                .collect();
            out.push((node.set.clone(), edges));
            for seg in node.edges.iter() {
                work.push(seg.value);
            }
        }
        out.sort();
        out
    }

    /// Render the graph in Graphviz DOT form.
    pub fn to_dot(&self) -> String {
        use std::fmt::Write;
        let mut s = String::from("digraph dfa {\n");
        for (i, slot) in self.nodes.iter().enumerate() {
            let node = match slot {
                Some(n) if n.valid => n,
                _ => continue,
            };
            let _ = writeln!(s, "  n{} [label=\"{:?}\"];", i, node.set);
            for seg in node.edges.iter() {
                let _ = writeln!(
                    s,
                    "  n{} -> n{} [label=\"{:.4}..{:.4}\"];",
                    i, seg.value.0, seg.lo, seg.hi
                );
            }
        }
        s.push_str("}\n");
        s
    }
}
