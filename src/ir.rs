//! Normalized method listings handed to us by an external front-end.
//!
//! One [`Unit`] is one method. Its body is a flat three-address listing in
//! which operands point at other instructions by index.

use crate::errors::{SigilError, SigilResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A literal value as it appears in the listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
}

impl Literal {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Literal::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Literal::Null)
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Null => f.write_str("null"),
            Literal::Bool(b) => write!(f, "{b}"),
            Literal::Int(i) => write!(f, "{i}"),
            Literal::Str(s) => write!(f, "\"{s}\""),
        }
    }
}

/// Variable identity: a method local or a (qualified) field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Var {
    Local(String),
    Field(String),
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Var::Local(n) | Var::Field(n) => f.write_str(n),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operand {
    /// Index of the instruction producing the value.
    Ref(usize),
    Lit(Literal),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Opcode {
    Const,
    Param { index: usize },
    Load { var: Var },
    Store { var: Var },
    /// `instance: true` means operand 0 is the receiver.
    Invoke {
        callee: String,
        #[serde(default)]
        instance: bool,
    },
    New { class: String },
    Concat,
    Return,
    Branch { targets: Vec<usize> },
    Jump { target: usize },
}

impl Opcode {
    /// Whether other instructions may use this one as an operand.
    pub fn produces_value(&self) -> bool {
        matches!(
            self,
            Opcode::Const
                | Opcode::Param { .. }
                | Opcode::Load { .. }
                | Opcode::Invoke { .. }
                | Opcode::New { .. }
                | Opcode::Concat
        )
    }

    /// Callee signature for call-like opcodes. Constructors are `<class>.<init>`.
    pub fn callee(&self) -> Option<String> {
        match self {
            Opcode::Invoke { callee, .. } => Some(callee.clone()),
            Opcode::New { class } => Some(format!("{class}.<init>")),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    #[serde(flatten)]
    pub op: Opcode,
    #[serde(default)]
    pub operands: Vec<Operand>,
    pub line: u32,
}

fn default_return_type() -> String {
    "void".into()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    /// Fully qualified method name, e.g. `com.acme.App.connectDB`.
    pub name: String,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default = "default_return_type")]
    pub return_type: String,
    pub instructions: Vec<Instruction>,
}

impl Unit {
    /// Method name without its class prefix.
    pub fn simple_name(&self) -> &str {
        self.name.rsplit('.').next().unwrap_or(&self.name)
    }

    /// Check that every instruction reference in the listing is consistent.
    pub fn validate(&self) -> SigilResult<()> {
        let len = self.instructions.len();
        let bad = |reason: String| SigilError::MalformedUnit {
            unit: self.name.clone(),
            reason,
        };

        for (i, ins) in self.instructions.iter().enumerate() {
            for op in &ins.operands {
                let Operand::Ref(j) = *op else { continue };
                if j >= len {
                    return Err(bad(format!(
                        "instruction {i} references missing instruction {j}"
                    )));
                }
                if j == i {
                    return Err(bad(format!("instruction {i} references itself")));
                }
                if !self.instructions[j].op.produces_value() {
                    return Err(bad(format!(
                        "instruction {i} uses instruction {j}, which produces no value"
                    )));
                }
            }

            match &ins.op {
                Opcode::Const if !matches!(ins.operands.first(), Some(Operand::Lit(_))) => {
                    return Err(bad(format!("const at {i} carries no literal")));
                }
                Opcode::Store { .. } if ins.operands.is_empty() => {
                    return Err(bad(format!("store at {i} has no value")));
                }
                Opcode::Invoke { instance: true, .. } if ins.operands.is_empty() => {
                    return Err(bad(format!("instance call at {i} has no receiver")));
                }
                Opcode::Branch { targets } => {
                    if let Some(t) = targets.iter().find(|&&t| t >= len) {
                        return Err(bad(format!("branch at {i} jumps to missing {t}")));
                    }
                }
                Opcode::Jump { target } if *target >= len => {
                    return Err(bad(format!("jump at {i} jumps to missing {target}")));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn default_language() -> String {
    "java".into()
}

/// On-disk container: one front-end output file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitFile {
    #[serde(default = "default_language")]
    pub language: String,
    pub units: Vec<Unit>,
}

impl UnitFile {
    /// Pair each unit with the file's language; units without a source
    /// file inherit `origin`.
    pub fn into_targets(self, origin: &str) -> Vec<Target> {
        let language = self.language;
        self.units
            .into_iter()
            .map(|mut unit| {
                if unit.file.is_empty() {
                    unit.file = origin.to_owned();
                }
                Target {
                    language: language.clone(),
                    unit,
                }
            })
            .collect()
    }
}

/// A unit ready to be scanned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub language: String,
    pub unit: Unit,
}

pub fn parse_units(text: &str) -> SigilResult<UnitFile> {
    Ok(serde_json::from_str(text)?)
}

#[test]
fn parses_listing_with_all_operand_shapes() {
    let file = parse_units(
        r#"{
          "units": [{
            "name": "com.acme.App.booleanMethod",
            "file": "App.java",
            "return_type": "java.lang.Boolean",
            "instructions": [
              { "op": "const", "operands": [{ "lit": null }], "line": 33 },
              { "op": "store", "var": { "local": "b" }, "operands": [{ "ref": 0 }], "line": 33 },
              { "op": "invoke", "callee": "java.lang.Long.toHexString", "operands": [{ "lit": 7 }], "line": 34 },
              { "op": "return", "operands": [{ "ref": 0 }], "line": 35 }
            ]
          }]
        }"#,
    )
    .unwrap();

    assert_eq!(file.language, "java");
    let unit = &file.units[0];
    assert_eq!(unit.simple_name(), "booleanMethod");
    assert_eq!(unit.instructions[0].operands[0], Operand::Lit(Literal::Null));
    assert_eq!(
        unit.instructions[1].op,
        Opcode::Store { var: Var::Local("b".into()) }
    );
    assert_eq!(
        unit.instructions[2].op.callee().as_deref(),
        Some("java.lang.Long.toHexString")
    );
    assert!(unit.validate().is_ok());
}

#[test]
fn validate_rejects_inconsistent_references() {
    let unit = |ops: &str| -> Unit {
        serde_json::from_str(&format!(
            r#"{{ "name": "a.B.m", "instructions": {ops} }}"#
        ))
        .unwrap()
    };

    let dangling = unit(r#"[{ "op": "return", "operands": [{ "ref": 4 }], "line": 1 }]"#);
    assert!(matches!(dangling.validate(), Err(SigilError::MalformedUnit { .. })));

    let to_store = unit(
        r#"[
          { "op": "store", "var": { "local": "x" }, "operands": [{ "lit": 1 }], "line": 1 },
          { "op": "return", "operands": [{ "ref": 0 }], "line": 2 }
        ]"#,
    );
    assert!(to_store.validate().is_err());

    let bad_jump = unit(r#"[{ "op": "jump", "target": 9, "line": 1 }]"#);
    assert!(bad_jump.validate().is_err());

    let new_default = unit(
        r#"[{ "op": "new", "class": "java.util.Random", "line": 1 }]"#,
    );
    assert_eq!(new_default.return_type, "void");
    assert_eq!(
        new_default.instructions[0].op.callee().as_deref(),
        Some("java.util.Random.<init>")
    );
    assert!(new_default.validate().is_ok());
}

/// Build a unit from an inline instruction array; test-only shorthand.
#[cfg(test)]
pub(crate) fn test_unit(name: &str, return_type: &str, instructions: &str) -> Unit {
    serde_json::from_str(&format!(
        r#"{{ "name": "{name}", "file": "App.java", "return_type": "{return_type}", "instructions": {instructions} }}"#
    ))
    .expect("test unit should parse")
}
