mod java;

use crate::errors::{SigilError, SigilResult};
use crate::facts::{Arg, Fact, FactKind, Provenance};
use crate::ir::{Literal, Unit};
use crate::labels::Cap;
use console::style;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Severity {
    Info,
    Warning,
    SecurityHigh,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Severity::SecurityHigh => style(self.as_str()).red().bold().to_string(),
            Severity::Warning => style(self.as_str()).yellow().bold().to_string(),
            Severity::Info => style(self.as_str()).cyan().bold().to_string(),
        };
        f.write_str(&s)
    }
}

impl Severity {
    /// Plain textual value used in reports.
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::SecurityHigh => "SECURITY-HIGH",
            Severity::Warning => "WARNING",
            Severity::Info => "INFO",
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.to_ascii_lowercase().replace('_', "-").as_str() {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "security-high" | "high" => Ok(Severity::SecurityHigh),
            other => Err(format!("unknown severity `{other}`")),
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

/// Which operands of a sink must carry taint for a taint rule to fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkOperands {
    AnyArg,
    /// Index into the call's arguments (receiver excluded).
    Arg(usize),
    ReturnValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaintRequirement {
    pub sources: Cap,
    pub sink: SinkOperands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    Structural,
    Taint(TaintRequirement),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dedupe {
    /// One finding per distinct sink instruction.
    PerSink,
    /// One finding per unit, at the first sink.
    PerUnit,
}

/// Scan-wide table of fields assigned a single literal somewhere in the scan.
pub type FieldConstants = HashMap<String, Literal>;

/// What a matcher may look at besides the fact itself.
pub struct MatchCtx<'a> {
    pub unit: &'a Unit,
    pub fields: &'a FieldConstants,
}

impl MatchCtx<'_> {
    /// Literal value of `arg`, following field constants.
    pub fn literal_of<'a>(&'a self, arg: &'a Arg) -> Option<&'a Literal> {
        match &arg.provenance {
            Provenance::Literal(l) => Some(l),
            Provenance::Field(name) => self.fields.get(name),
            _ => None,
        }
    }

    /// Whether some path may give `arg` a literal value satisfying `pred`.
    pub fn may_be_literal(&self, arg: &Arg, pred: impl Fn(&Literal) -> bool) -> bool {
        arg.provenance.any(&mut |p| match p {
            Provenance::Literal(l) => pred(l),
            Provenance::Field(name) => self.fields.get(name).is_some_and(&pred),
            _ => false,
        })
    }
}

pub type Matcher = fn(&Fact, &MatchCtx<'_>) -> bool;

/// One declarative defect pattern.
#[derive(Debug, Clone)]
pub struct Rule {
    /// Unique identifier (kebab-case).
    pub id: &'static str,
    /// Upstream bug type the rule corresponds to.
    pub bug_type: &'static str,
    pub description: &'static str,
    /// Message template; `{unit}`, `{callee}`, `{arg0}` and `{source}` are filled in.
    pub message: &'static str,
    pub severity: Severity,
    pub confidence: Confidence,
    pub cwe: Option<u32>,
    pub reference: &'static str,
    /// Fact kind the matcher inspects; for taint rules, the sink's kind.
    pub fact_kind: FactKind,
    pub kind: RuleKind,
    pub matcher: Matcher,
    pub dedupe: Dedupe,
}

impl PartialEq for Rule {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Rule {
    pub fn taint(&self) -> Option<&TaintRequirement> {
        match &self.kind {
            RuleKind::Taint(t) => Some(t),
            RuleKind::Structural => None,
        }
    }
}

/// Every rule table shipped with the scanner.
static BUILTIN: Lazy<Vec<&'static Rule>> = Lazy::new(|| {
    let rules: Vec<&'static Rule> = java::RULES.iter().collect();
    tracing::debug!("pattern registry initialised ({} rules)", rules.len());
    rules
});

/// All built-in rules, in declaration order.
pub fn builtin() -> &'static [&'static Rule] {
    &BUILTIN
}

/// The loaded, read-only rule set for one scan.
#[derive(Debug)]
pub struct PatternLibrary {
    rules: BTreeMap<&'static str, &'static Rule>,
    by_kind: HashMap<FactKind, Vec<&'static Rule>>,
}

impl PatternLibrary {
    /// Load the built-in rules, keeping those named in `enabled` (all when
    /// empty) at or above `min_severity`.
    pub fn load(enabled: &[String], min_severity: Severity) -> SigilResult<Self> {
        Self::from_rules(builtin(), enabled, min_severity)
    }

    pub fn from_rules(
        rules: &[&'static Rule],
        enabled: &[String],
        min_severity: Severity,
    ) -> SigilResult<Self> {
        let mut seen = HashSet::new();
        for r in rules {
            if !seen.insert(r.id) {
                return Err(SigilError::PatternLibrary(format!(
                    "duplicate rule id `{}`",
                    r.id
                )));
            }
        }
        if let Some(unknown) = enabled.iter().find(|id| !seen.contains(id.as_str())) {
            return Err(SigilError::PatternLibrary(format!(
                "enabled_rules names unknown rule `{unknown}`"
            )));
        }

        let mut lib = PatternLibrary {
            rules: BTreeMap::new(),
            by_kind: HashMap::new(),
        };
        for r in rules {
            let wanted = enabled.is_empty() || enabled.iter().any(|id| id == r.id);
            if wanted && r.severity >= min_severity {
                lib.rules.insert(r.id, *r);
            }
        }
        // BTreeMap iteration keeps each per-kind list in rule-id order
        for r in lib.rules.values() {
            lib.by_kind.entry(r.fact_kind).or_default().push(*r);
        }

        tracing::debug!(rules = lib.rules.len(), "pattern library loaded");
        Ok(lib)
    }

    /// Rules whose matcher inspects facts of `kind`, ordered by rule id.
    pub fn lookup_rules_for(&self, kind: FactKind) -> &[&'static Rule] {
        self.by_kind.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn get(&self, id: &str) -> Option<&'static Rule> {
        self.rules.get(id).copied()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.rules.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &'static Rule> + '_ {
        self.rules.values().copied()
    }

    /// Whether any loaded rule needs data-flow analysis.
    pub fn has_taint_rules(&self) -> bool {
        self.iter().any(|r| r.taint().is_some())
    }
}

#[test]
fn severity_parse_roundtrip() {
    for &s in &[Severity::SecurityHigh, Severity::Warning, Severity::Info] {
        let txt = s.as_str();
        assert!(matches!(txt, "SECURITY-HIGH" | "WARNING" | "INFO"));
        assert_eq!(txt.parse::<Severity>().unwrap(), s);
        assert_eq!(txt.to_lowercase().parse::<Severity>().unwrap(), s);
    }
    assert!("critical".parse::<Severity>().is_err());
    assert!(Severity::Info < Severity::Warning && Severity::Warning < Severity::SecurityHigh);
}

#[test]
fn severity_display_contains_uppercase_name() {
    assert!(Severity::SecurityHigh.to_string().contains("SECURITY-HIGH"));
    assert!(Severity::Warning.to_string().contains("WARNING"));
    assert!(Severity::Info.to_string().contains("INFO"));
}

#[test]
fn library_indexes_by_fact_kind_in_id_order() {
    let lib = PatternLibrary::load(&[], Severity::Info).unwrap();
    assert_eq!(lib.len(), builtin().len());

    let calls: Vec<&str> = lib.lookup_rules_for(FactKind::Call).iter().map(|r| r.id).collect();
    let mut sorted = calls.clone();
    sorted.sort();
    assert_eq!(calls, sorted);
    assert!(calls.contains(&"insecure-cipher-mode"));
    assert!(calls.contains(&"sql-injection"));

    let returns: Vec<&str> = lib.lookup_rules_for(FactKind::Return).iter().map(|r| r.id).collect();
    assert_eq!(returns, vec!["nullable-boxed-return", "weak-random-token"]);

    assert!(lib.lookup_rules_for(FactKind::Flow).is_empty());
}

#[test]
fn library_filters_and_rejects_unknown_ids() {
    let only = PatternLibrary::load(&["sql-injection".into()], Severity::Info).unwrap();
    assert_eq!(only.len(), 1);
    assert!(only.contains("sql-injection"));
    assert!(only.has_taint_rules());

    let high = PatternLibrary::load(&[], Severity::SecurityHigh).unwrap();
    assert!(high.iter().all(|r| r.severity == Severity::SecurityHigh));
    assert!(!high.contains("nullable-boxed-return"));

    let none = PatternLibrary::load(&["nullable-boxed-return".into()], Severity::SecurityHigh).unwrap();
    assert!(none.is_empty());
    assert!(!none.has_taint_rules());

    let err = PatternLibrary::load(&["no-such-rule".into()], Severity::Info).unwrap_err();
    assert!(matches!(err, SigilError::PatternLibrary(_)));
}

#[test]
fn duplicate_rule_ids_fail_to_load() {
    let first = builtin()[0];
    let err = PatternLibrary::from_rules(&[first, first], &[], Severity::Info).unwrap_err();
    assert!(matches!(err, SigilError::PatternLibrary(_)));
}
