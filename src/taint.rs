use crate::dfg::{Dfg, NodeLabel};
use crate::labels::Cap;
use petgraph::Direction;
use petgraph::graph::NodeIndex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Instant;
use tracing::debug;

/// Unit name → taint categories that can reach its return value.
pub type Summaries = HashMap<String, Cap>;

/// One taint origin: the source instruction and what it introduced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Origin {
    pub instr: usize,
    pub cap: Cap,
}

pub type TaintSet = BTreeSet<Origin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stop {
    /// One node was visited more than the configured cap.
    IterationCap,
    /// The unit's wall-clock budget ran out.
    Deadline,
}

#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Maximum visits of any single node.
    pub iteration_cap: usize,
    pub deadline: Option<Instant>,
}

#[derive(Debug)]
pub struct Propagation {
    /// Taint holding after each instruction, indexed by instruction.
    pub out: Vec<TaintSet>,
    pub stopped: Option<Stop>,
    pub steps: usize,
}

impl Propagation {
    pub fn at(&self, instr: usize) -> Option<&TaintSet> {
        self.out.get(instr)
    }

    /// Union of the categories reaching `instr`.
    pub fn caps_at(&self, instr: usize) -> Cap {
        self.at(instr)
            .map(|s| s.iter().fold(Cap::empty(), |acc, o| acc | o.cap))
            .unwrap_or(Cap::empty())
    }
}

fn apply_taint(node: NodeIndex, label: Option<NodeLabel>, incoming: TaintSet) -> TaintSet {
    let mut out = incoming;

    match label {
        // A new tainted value enters the unit
        Some(NodeLabel::Source(cap)) | Some(NodeLabel::Summary(cap)) => {
            out.insert(Origin { instr: node.index(), cap });
        }
        // Sanitizers clean the categories they cover, others pass through
        Some(NodeLabel::Sanitizer(clean)) => {
            out = out
                .into_iter()
                .filter_map(|o| {
                    let rest = o.cap - clean;
                    (!rest.is_empty()).then_some(Origin { instr: o.instr, cap: rest })
                })
                .collect();
        }
        None => {}
    }

    out
}

/// Forward worklist propagation over the data-flow graph.
///
/// Each node's state only grows, so the fixpoint is reached without a cap;
/// the cap and deadline bound pathological graphs and report the early stop.
pub fn propagate(g: &Dfg, limits: &Limits) -> Propagation {
    let n = g.node_count();
    let mut out: Vec<TaintSet> = vec![TaintSet::new(); n];
    let mut visits = vec![0usize; n];
    let mut queued = vec![true; n];
    let mut work: VecDeque<NodeIndex> = g.node_indices().collect();
    let mut stopped = None;
    let mut steps = 0usize;

    while let Some(node) = work.pop_front() {
        let i = node.index();
        queued[i] = false;

        visits[i] += 1;
        if visits[i] > limits.iteration_cap {
            stopped = Some(Stop::IterationCap);
            break;
        }
        steps += 1;
        if steps % 64 == 0 {
            if let Some(deadline) = limits.deadline {
                if Instant::now() >= deadline {
                    stopped = Some(Stop::Deadline);
                    break;
                }
            }
        }

        let mut incoming = TaintSet::new();
        for pred in g.neighbors_directed(node, Direction::Incoming) {
            incoming.extend(out[pred.index()].iter().copied());
        }

        let updated = apply_taint(node, g[node].label, incoming);
        if updated != out[i] {
            out[i] = updated;
            for succ in g.neighbors_directed(node, Direction::Outgoing) {
                if !queued[succ.index()] {
                    queued[succ.index()] = true;
                    work.push_back(succ);
                }
            }
        }
    }

    debug!(target: "taint", steps, ?stopped, "propagation finished");
    Propagation { out, stopped, steps }
}
