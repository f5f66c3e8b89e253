//! Fact extraction: one forward pass over a [`Unit`] turning instructions
//! into normalized observations the rule engine can match on.
//!
//! Extraction is a pure function of the unit and its language key, so
//! repeated scans produce identical fact streams.

use crate::ir::{Literal, Opcode, Operand, Unit, Var};
use crate::labels::{self, Cap, DataLabel};
use serde::Serialize;

/// How many `load → store` hops literal resolution may follow.
pub const MAX_FOLD_DEPTH: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FactKind {
    Call,
    ConstantValue,
    Return,
    Flow,
}

/// Where a value comes from, as far as extraction could tell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provenance {
    Literal(Literal),
    /// Loaded from a field with no visible assignment in this unit.
    Field(String),
    Param(usize),
    Source(Cap),
    /// More than one store reaches the load; one entry per distinct value.
    Either(Vec<Provenance>),
    Unknown,
}

impl Provenance {
    /// Whether any alternative satisfies `pred`.
    pub fn any(&self, pred: &mut impl FnMut(&Provenance) -> bool) -> bool {
        match self {
            Provenance::Either(alts) => alts.iter().any(|p| p.any(pred)),
            other => pred(other),
        }
    }
}

/// One operand of a call or return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arg {
    /// Producing instruction, `None` for inline literals.
    pub instr: Option<usize>,
    pub provenance: Provenance,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FactBody {
    Call {
        callee: String,
        receiver: Option<Arg>,
        args: Vec<Arg>,
    },
    ConstantValue {
        var: Var,
        value: Literal,
    },
    Return {
        value: Option<Arg>,
    },
    /// The value produced by `from` flows into this fact's instruction.
    Flow {
        from: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fact {
    pub instr: usize,
    pub line: u32,
    pub body: FactBody,
}

impl Fact {
    pub fn kind(&self) -> FactKind {
        match self.body {
            FactBody::Call { .. } => FactKind::Call,
            FactBody::ConstantValue { .. } => FactKind::ConstantValue,
            FactBody::Return { .. } => FactKind::Return,
            FactBody::Flow { .. } => FactKind::Flow,
        }
    }

    pub fn callee(&self) -> Option<&str> {
        match &self.body {
            FactBody::Call { callee, .. } => Some(callee),
            _ => None,
        }
    }

    pub fn args(&self) -> &[Arg] {
        match &self.body {
            FactBody::Call { args, .. } => args,
            _ => &[],
        }
    }
}

struct Resolver<'a> {
    unit: &'a Unit,
    lang: &'a str,
    /// Control-flow predecessors of each instruction.
    preds: Vec<Vec<usize>>,
}

impl<'a> Resolver<'a> {
    fn new(unit: &'a Unit, lang: &'a str) -> Self {
        let len = unit.instructions.len();
        let mut preds = vec![Vec::new(); len];
        let mut edge = |from: usize, to: usize| {
            if to < len && !preds[to].contains(&from) {
                preds[to].push(from);
            }
        };
        for (i, ins) in unit.instructions.iter().enumerate() {
            match &ins.op {
                Opcode::Return => {}
                Opcode::Jump { target } => edge(i, *target),
                Opcode::Branch { targets } => {
                    edge(i, i + 1);
                    for t in targets {
                        edge(i, *t);
                    }
                }
                _ => edge(i, i + 1),
            }
        }
        Self { unit, lang, preds }
    }

    fn arg(&self, op: &Operand) -> Arg {
        match op {
            Operand::Lit(l) => Arg {
                instr: None,
                provenance: Provenance::Literal(l.clone()),
            },
            Operand::Ref(j) => Arg {
                instr: Some(*j),
                provenance: self.resolve(*j, 0),
            },
        }
    }

    fn operand(&self, op: &Operand, depth: usize) -> Provenance {
        match op {
            Operand::Lit(l) => Provenance::Literal(l.clone()),
            Operand::Ref(j) => self.resolve(*j, depth),
        }
    }

    /// Stores to `var` reaching instruction `at` along some control-flow
    /// path, in ascending order, and whether some path from the unit entry
    /// reaches `at` with no store at all. A store shadows everything behind it.
    fn reaching_stores(&self, var: &Var, at: usize) -> (Vec<usize>, bool) {
        let mut found = Vec::new();
        let mut from_entry = at == 0;
        let mut seen = vec![false; self.preds.len()];
        let mut stack: Vec<usize> = self.preds.get(at).cloned().unwrap_or_default();

        while let Some(i) = stack.pop() {
            if std::mem::replace(&mut seen[i], true) {
                continue;
            }
            if matches!(&self.unit.instructions[i].op, Opcode::Store { var: v } if v == var) {
                found.push(i);
                continue;
            }
            from_entry |= i == 0;
            stack.extend(self.preds[i].iter().copied());
        }

        found.sort_unstable();
        (found, from_entry)
    }

    fn resolve(&self, at: usize, depth: usize) -> Provenance {
        let Some(ins) = self.unit.instructions.get(at) else {
            return Provenance::Unknown;
        };

        match &ins.op {
            Opcode::Const => match ins.operands.first() {
                Some(Operand::Lit(l)) => Provenance::Literal(l.clone()),
                _ => Provenance::Unknown,
            },
            Opcode::Param { index } => Provenance::Param(*index),
            Opcode::Load { var } => {
                if depth >= MAX_FOLD_DEPTH {
                    return Provenance::Unknown;
                }
                let (stores, from_entry) = self.reaching_stores(var, at);
                if stores.is_empty() {
                    return match var {
                        Var::Field(name) => Provenance::Field(name.clone()),
                        Var::Local(_) => Provenance::Unknown,
                    };
                }

                let mut alts: Vec<Provenance> = Vec::with_capacity(stores.len() + 1);
                // a field keeps its outside value on paths that skip every store
                if let (true, Var::Field(name)) = (from_entry, var) {
                    alts.push(Provenance::Field(name.clone()));
                }
                for s in stores {
                    let p = match self.unit.instructions[s].operands.first() {
                        Some(op) => self.operand(op, depth + 1),
                        None => Provenance::Unknown,
                    };
                    if !alts.contains(&p) {
                        alts.push(p);
                    }
                }
                match alts.len() {
                    1 => alts.remove(0),
                    _ => Provenance::Either(alts),
                }
            }
            Opcode::Invoke { .. } | Opcode::New { .. } => {
                let callee = ins.op.callee().unwrap_or_default();
                match labels::classify(self.lang, &callee) {
                    Some(DataLabel::Source(cap)) => Provenance::Source(cap),
                    _ => Provenance::Unknown,
                }
            }
            Opcode::Concat => {
                if depth >= MAX_FOLD_DEPTH {
                    return Provenance::Unknown;
                }
                let mut folded = String::new();
                for op in &ins.operands {
                    match self.operand(op, depth + 1) {
                        Provenance::Literal(Literal::Str(s)) => folded.push_str(&s),
                        Provenance::Literal(Literal::Int(i)) => folded.push_str(&i.to_string()),
                        _ => return Provenance::Unknown,
                    }
                }
                Provenance::Literal(Literal::Str(folded))
            }
            _ => Provenance::Unknown,
        }
    }
}

/// Extract the ordered fact stream for `unit`.
///
/// Order is instruction order; within one instruction `Flow` facts come
/// first, followed by the instruction's primary fact (if any).
pub fn extract(unit: &Unit, lang: &str) -> Vec<Fact> {
    let r = Resolver::new(unit, lang);
    let mut out = Vec::with_capacity(unit.instructions.len() * 2);

    for (i, ins) in unit.instructions.iter().enumerate() {
        let fact = |body| Fact {
            instr: i,
            line: ins.line,
            body,
        };

        for op in &ins.operands {
            if let Operand::Ref(from) = *op {
                out.push(fact(FactBody::Flow { from }));
            }
        }

        match &ins.op {
            Opcode::Load { var } => {
                // every store of the variable may reach this load (loops included)
                for (s, other) in unit.instructions.iter().enumerate() {
                    if s != i && matches!(&other.op, Opcode::Store { var: v } if v == var) {
                        out.push(fact(FactBody::Flow { from: s }));
                    }
                }
            }
            Opcode::Store { var } => {
                if let Some(Provenance::Literal(value)) =
                    ins.operands.first().map(|op| r.operand(op, 0))
                {
                    out.push(fact(FactBody::ConstantValue {
                        var: var.clone(),
                        value,
                    }));
                }
            }
            Opcode::Invoke { .. } | Opcode::New { .. } => {
                let is_instance = matches!(ins.op, Opcode::Invoke { instance: true, .. });
                let mut args: Vec<Arg> = ins.operands.iter().map(|op| r.arg(op)).collect();
                let receiver = if is_instance && !args.is_empty() {
                    Some(args.remove(0))
                } else {
                    None
                };
                out.push(fact(FactBody::Call {
                    callee: ins.op.callee().unwrap_or_default(),
                    receiver,
                    args,
                }));
            }
            Opcode::Return => {
                out.push(fact(FactBody::Return {
                    value: ins.operands.first().map(|op| r.arg(op)),
                }));
            }
            _ => {}
        }
    }

    tracing::debug!(unit = %unit.name, facts = out.len(), "facts extracted");
    out
}

#[test]
fn literal_resolution_follows_two_hops_and_no_more() {
    use crate::ir::test_unit;
    let unit = test_unit(
        "a.App.hops",
        "void",
        r#"[
          { "op": "const", "operands": [{ "lit": "pass" }], "line": 1 },
          { "op": "store", "var": { "local": "a" }, "operands": [{ "ref": 0 }], "line": 1 },
          { "op": "load",  "var": { "local": "a" }, "line": 2 },
          { "op": "store", "var": { "local": "b" }, "operands": [{ "ref": 2 }], "line": 2 },
          { "op": "load",  "var": { "local": "b" }, "line": 3 },
          { "op": "store", "var": { "local": "c" }, "operands": [{ "ref": 4 }], "line": 3 },
          { "op": "load",  "var": { "local": "c" }, "line": 4 },
          { "op": "invoke", "callee": "x.Y.two", "operands": [{ "ref": 4 }], "line": 5 },
          { "op": "invoke", "callee": "x.Y.three", "operands": [{ "ref": 6 }], "line": 6 }
        ]"#,
    );

    let facts = extract(&unit, "java");
    let call = |name: &str| {
        facts
            .iter()
            .find(|f| f.callee() == Some(name))
            .expect("call fact")
            .args()[0]
            .provenance
            .clone()
    };

    assert_eq!(call("x.Y.two"), Provenance::Literal(Literal::Str("pass".into())));
    assert_eq!(call("x.Y.three"), Provenance::Unknown);
}

#[test]
fn external_values_get_unknown_or_source_provenance() {
    use crate::ir::test_unit;
    let unit = test_unit(
        "a.App.env",
        "void",
        r#"[
          { "op": "invoke", "callee": "java.lang.System.getenv", "operands": [{ "lit": "DB_PASS" }], "line": 1 },
          { "op": "invoke", "callee": "com.other.Lib.fetch", "line": 2 },
          { "op": "store", "var": { "field": "a.App.PASS" }, "operands": [{ "ref": 0 }], "line": 3 },
          { "op": "invoke", "callee": "x.Y.use", "operands": [{ "ref": 0 }, { "ref": 1 }], "line": 4 }
        ]"#,
    );

    let facts = extract(&unit, "java");
    let use_call = facts.iter().find(|f| f.callee() == Some("x.Y.use")).unwrap();
    assert_eq!(use_call.args()[0].provenance, Provenance::Source(Cap::ENV_CONFIG));
    assert_eq!(use_call.args()[1].provenance, Provenance::Unknown);

    // a field assigned from an environment read is not a constant
    assert!(!facts.iter().any(|f| f.kind() == FactKind::ConstantValue));
}

#[test]
fn facts_are_ordered_and_deterministic() {
    use crate::ir::test_unit;
    let unit = test_unit(
        "a.App.loop",
        "java.lang.String",
        r#"[
          { "op": "const", "operands": [{ "lit": "x" }], "line": 1 },
          { "op": "store", "var": { "local": "s" }, "operands": [{ "ref": 0 }], "line": 1 },
          { "op": "load",  "var": { "local": "s" }, "line": 2 },
          { "op": "concat", "operands": [{ "ref": 2 }, { "lit": "y" }], "line": 2 },
          { "op": "store", "var": { "local": "s" }, "operands": [{ "ref": 3 }], "line": 2 },
          { "op": "branch", "targets": [2, 6], "line": 3 },
          { "op": "return", "operands": [{ "ref": 2 }], "line": 4 }
        ]"#,
    );

    let first = extract(&unit, "java");
    assert_eq!(first, extract(&unit, "java"));

    let instrs: Vec<usize> = first.iter().map(|f| f.instr).collect();
    let mut sorted = instrs.clone();
    sorted.sort();
    assert_eq!(instrs, sorted);

    // the load sees both stores, including the loop-carried one
    let load_sources: Vec<usize> = first
        .iter()
        .filter(|f| f.instr == 2)
        .filter_map(|f| match f.body {
            FactBody::Flow { from } => Some(from),
            _ => None,
        })
        .collect();
    assert_eq!(load_sources, vec![1, 4]);

    let ret = first.iter().find(|f| f.kind() == FactKind::Return).unwrap();
    assert_eq!(ret.line, 4);
}

#[test]
fn load_after_branch_resolves_every_reaching_store() {
    use crate::ir::test_unit;
    let unit = test_unit(
        "a.App.pick",
        "java.lang.Boolean",
        r#"[
          { "op": "const", "operands": [{ "lit": null }], "line": 1 },
          { "op": "store", "var": { "local": "r" }, "operands": [{ "ref": 0 }], "line": 1 },
          { "op": "param", "index": 0, "line": 2 },
          { "op": "branch", "operands": [{ "ref": 2 }], "targets": [7], "line": 2 },
          { "op": "const", "operands": [{ "lit": true }], "line": 3 },
          { "op": "store", "var": { "local": "r" }, "operands": [{ "ref": 4 }], "line": 3 },
          { "op": "jump", "target": 7, "line": 3 },
          { "op": "load", "var": { "local": "r" }, "line": 4 },
          { "op": "return", "operands": [{ "ref": 7 }], "line": 4 },
          { "op": "const", "operands": [{ "lit": false }], "line": 5 },
          { "op": "store", "var": { "local": "r" }, "operands": [{ "ref": 9 }], "line": 5 }
        ]"#,
    );

    let facts = extract(&unit, "java");
    let ret = facts.iter().find(|f| f.kind() == FactKind::Return).unwrap();
    let FactBody::Return { value: Some(arg) } = &ret.body else {
        panic!("return without value");
    };
    // the store after the return is unreachable from it
    assert_eq!(
        arg.provenance,
        Provenance::Either(vec![
            Provenance::Literal(Literal::Null),
            Provenance::Literal(Literal::Bool(true)),
        ])
    );
    assert!(arg.provenance.any(&mut |p| *p == Provenance::Literal(Literal::Null)));
}

#[test]
fn field_stored_on_one_branch_keeps_its_outside_value() {
    use crate::ir::test_unit;
    let unit = test_unit(
        "a.App.mode",
        "void",
        r#"[
          { "op": "param", "index": 0, "line": 1 },
          { "op": "branch", "operands": [{ "ref": 0 }], "targets": [4], "line": 1 },
          { "op": "const", "operands": [{ "lit": "AES/GCM/NoPadding" }], "line": 2 },
          { "op": "store", "var": { "field": "a.App.MODE" }, "operands": [{ "ref": 2 }], "line": 2 },
          { "op": "load", "var": { "field": "a.App.MODE" }, "line": 3 },
          { "op": "invoke", "callee": "javax.crypto.Cipher.getInstance", "operands": [{ "ref": 4 }], "line": 3 }
        ]"#,
    );

    let facts = extract(&unit, "java");
    let call = facts.iter().find(|f| f.kind() == FactKind::Call).unwrap();
    assert_eq!(
        call.args()[0].provenance,
        Provenance::Either(vec![
            Provenance::Field("a.App.MODE".into()),
            Provenance::Literal(Literal::Str("AES/GCM/NoPadding".into())),
        ])
    );
}
