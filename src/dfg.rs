use crate::facts::{Fact, FactBody};
use crate::ir::Unit;
use crate::labels::{self, Cap, DataLabel};
use crate::taint::Summaries;
use petgraph::prelude::*;

/// Taint metadata attached to call nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeLabel {
  Source(Cap),
  Sanitizer(Cap),
  /// Call to another scanned unit whose return value carries `Cap`.
  Summary(Cap),
}

/// Per-instruction node of the data-flow graph. The node index is the
/// instruction index.
#[derive(Debug, Clone)]
pub struct FlowNode {
  pub label: Option<NodeLabel>,
}

/// Edges point from the instruction producing a value to the one consuming it.
pub type Dfg = DiGraph<FlowNode, ()>;

fn label_for(callee: &str, lang: &str, summaries: &Summaries) -> Option<NodeLabel> {
  match labels::classify(lang, callee) {
    Some(DataLabel::Source(c))    => Some(NodeLabel::Source(c)),
    Some(DataLabel::Sanitizer(c)) => Some(NodeLabel::Sanitizer(c)),
    None => summaries
      .get(callee)
      .filter(|c| !c.is_empty())
      .map(|c| NodeLabel::Summary(*c)),
  }
}

/// Build the data-flow graph of one unit from its `Flow` facts.
///
/// Node `i` is instruction `i`, so `NodeIndex::new(i)` addresses it directly.
pub fn build_dfg(unit: &Unit, facts: &[Fact], lang: &str, summaries: &Summaries) -> Dfg {
  let n = unit.instructions.len();
  let mut g: Dfg = Graph::with_capacity(n, n * 2);

  for ins in &unit.instructions {
    let label = ins
      .op
      .callee()
      .and_then(|c| label_for(&c, lang, summaries));
    g.add_node(FlowNode { label });
  }

  for f in facts {
    if let FactBody::Flow { from } = f.body {
      if from < n && f.instr < n {
        g.update_edge(NodeIndex::new(from), NodeIndex::new(f.instr), ());
      }
    }
  }

  tracing::debug!(unit = %unit.name, nodes = g.node_count(), edges = g.edge_count(), "data-flow graph built");
  g
}

#[test]
fn graph_mirrors_flow_facts_and_labels_calls() {
  use crate::facts::extract;
  use crate::ir::test_unit;

  let unit = test_unit(
    "a.App.q",
    "void",
    r#"[
      { "op": "invoke", "callee": "java.lang.System.getenv", "operands": [{ "lit": "X" }], "line": 1 },
      { "op": "invoke", "callee": "java.lang.Integer.parseInt", "operands": [{ "ref": 0 }], "line": 2 },
      { "op": "invoke", "callee": "a.App.helper", "line": 3 },
      { "op": "concat", "operands": [{ "ref": 1 }, { "ref": 2 }], "line": 4 }
    ]"#,
  );
  let facts = extract(&unit, "java");
  let mut summaries = Summaries::new();
  summaries.insert("a.App.helper".into(), Cap::WEAK_RANDOM);

  let g = build_dfg(&unit, &facts, "java", &summaries);
  assert_eq!(g.node_count(), 4);
  assert_eq!(g.edge_count(), 3);
  assert!(g.contains_edge(NodeIndex::new(0), NodeIndex::new(1)));
  assert!(g.contains_edge(NodeIndex::new(2), NodeIndex::new(3)));

  assert_eq!(g[NodeIndex::new(0)].label, Some(NodeLabel::Source(Cap::ENV_CONFIG)));
  assert_eq!(g[NodeIndex::new(1)].label, Some(NodeLabel::Sanitizer(Cap::UNTRUSTED)));
  assert_eq!(g[NodeIndex::new(2)].label, Some(NodeLabel::Summary(Cap::WEAK_RANDOM)));
  assert_eq!(g[NodeIndex::new(3)].label, None);
}
