//! The rule engine: matches a unit's facts against the pattern library.
//!
//! Structural rules are evaluated fact by fact. Taint rules first collect
//! candidate sinks with their matcher, then run one propagation over the
//! unit's data-flow graph and fire where a required category reaches a
//! sink operand.

use crate::dfg::build_dfg;
use crate::errors::SigilError;
use crate::facts::{Arg, Fact, FactBody, extract};
use crate::ir::{Literal, Opcode, Target, Var};
use crate::labels::Cap;
use crate::patterns::{
    Confidence, Dedupe, FieldConstants, MatchCtx, PatternLibrary, Rule, RuleKind, Severity,
    SinkOperands,
};
use crate::taint::{Limits, Origin, Propagation, Stop, Summaries, propagate};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Rounds of interprocedural summary refinement.
pub const MAX_SUMMARY_ROUNDS: usize = 4;

/// One confirmed rule match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub rule_id: String,
    pub bug_type: String,
    pub severity: Severity,
    pub confidence: Confidence,
    pub unit: String,
    pub file: String,
    pub line: u32,
    /// Index of the primary instruction inside the unit.
    pub instr: usize,
    pub message: String,
    pub cwe: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    MalformedUnit,
    TaintCapExceeded,
    UnitTimeout,
    UnreadableInput,
    Cancelled,
}

/// Non-fatal problem recorded while scanning.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub file: String,
    pub unit: Option<String>,
    pub message: String,
}

impl Diagnostic {
    pub fn from_error(err: &SigilError, file: &str) -> Self {
        let (kind, unit) = match err {
            SigilError::MalformedUnit { unit, .. } => (DiagnosticKind::MalformedUnit, Some(unit.clone())),
            SigilError::TaintCapExceeded { unit, .. } => {
                (DiagnosticKind::TaintCapExceeded, Some(unit.clone()))
            }
            _ => (DiagnosticKind::UnreadableInput, None),
        };
        Diagnostic {
            kind,
            file: file.to_owned(),
            unit,
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Default)]
pub struct UnitOutcome {
    pub findings: Vec<Finding>,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub taint_iteration_cap: usize,
    pub unit_timeout: Option<Duration>,
    /// Wall-clock point after which no new unit is started.
    pub scan_deadline: Option<Instant>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            taint_iteration_cap: 50,
            unit_timeout: None,
            scan_deadline: None,
        }
    }
}

/// Cooperative cancellation shared by all workers of a scan.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// A validated unit together with its extracted facts.
#[derive(Debug)]
pub struct Prepared<'a> {
    pub target: &'a Target,
    pub facts: Vec<Fact>,
}

/// Scan-wide facts every worker reads: field constants and return summaries.
#[derive(Debug, Default)]
pub struct ScanKnowledge {
    pub fields: FieldConstants,
    pub summaries: Summaries,
}

impl ScanKnowledge {
    pub fn gather(prepared: &[Prepared<'_>], library: &PatternLibrary, cfg: &EngineConfig) -> Self {
        let fields = collect_field_constants(prepared);
        let summaries = if library.has_taint_rules() {
            compute_summaries(prepared, cfg)
        } else {
            Summaries::new()
        };
        ScanKnowledge { fields, summaries }
    }
}

/// Fields that are only ever assigned literals, mapped to the first literal
/// in unit order.
pub fn collect_field_constants(prepared: &[Prepared<'_>]) -> FieldConstants {
    let mut ordered: Vec<&Prepared<'_>> = prepared.iter().collect();
    ordered.sort_by(|a, b| a.target.unit.name.cmp(&b.target.unit.name));

    let mut fields = FieldConstants::new();
    let mut poisoned: HashSet<String> = HashSet::new();

    for p in ordered {
        for (i, ins) in p.target.unit.instructions.iter().enumerate() {
            let Opcode::Store { var: Var::Field(name) } = &ins.op else { continue };
            let literal = p.facts.iter().find_map(|f| match &f.body {
                FactBody::ConstantValue { value, .. } if f.instr == i => Some(value.clone()),
                _ => None,
            });
            match literal {
                Some(value) => {
                    fields.entry(name.clone()).or_insert(value);
                }
                None => {
                    poisoned.insert(name.clone());
                }
            }
        }
    }

    fields.retain(|name, _| !poisoned.contains(name));
    fields
}

/// Taint categories reaching any `return` of the unit.
fn return_caps(p: &Prepared<'_>, prop: &Propagation) -> Cap {
    p.facts
        .iter()
        .filter_map(|f| match &f.body {
            FactBody::Return { value: Some(Arg { instr: Some(j), .. }) } => Some(prop.caps_at(*j)),
            _ => None,
        })
        .fold(Cap::empty(), |acc, c| acc | c)
}

/// Interprocedural return summaries, refined in rounds until stable.
pub fn compute_summaries(prepared: &[Prepared<'_>], cfg: &EngineConfig) -> Summaries {
    let limits = Limits {
        iteration_cap: cfg.taint_iteration_cap,
        deadline: None,
    };
    let mut summaries = Summaries::new();

    for round in 0..MAX_SUMMARY_ROUNDS {
        let found: Vec<(String, Cap)> = prepared
            .par_iter()
            .filter_map(|p| {
                let g = build_dfg(&p.target.unit, &p.facts, &p.target.language, &summaries);
                let caps = return_caps(p, &propagate(&g, &limits));
                (!caps.is_empty()).then(|| (p.target.unit.name.clone(), caps))
            })
            .collect();

        // overloads share a name; their summaries merge
        let mut next = Summaries::new();
        for (name, caps) in found {
            *next.entry(name).or_insert(Cap::empty()) |= caps;
        }

        tracing::debug!(round, summaries = next.len(), "summary round finished");
        if next == summaries {
            break;
        }
        summaries = next;
    }
    summaries
}

pub struct RuleEngine<'a> {
    pub library: &'a PatternLibrary,
    pub knowledge: &'a ScanKnowledge,
    pub config: EngineConfig,
}

impl<'a> RuleEngine<'a> {
    pub fn new(library: &'a PatternLibrary, knowledge: &'a ScanKnowledge, config: EngineConfig) -> Self {
        Self {
            library,
            knowledge,
            config,
        }
    }

    /// Run every loaded rule over one prepared unit.
    pub fn scan(&self, p: &Prepared<'_>) -> UnitOutcome {
        let started = Instant::now();
        let target = p.target;
        let ctx = MatchCtx {
            unit: &target.unit,
            fields: &self.knowledge.fields,
        };
        let mut outcome = UnitOutcome::default();
        let mut fired: HashSet<(&'static str, usize)> = HashSet::new();
        let mut sinks: Vec<(&'static Rule, &Fact)> = Vec::new();

        for fact in &p.facts {
            for rule in self.library.lookup_rules_for(fact.kind()) {
                if !(rule.matcher)(fact, &ctx) {
                    continue;
                }
                match rule.kind {
                    RuleKind::Structural => {
                        if claim(&mut fired, rule, fact) {
                            outcome.findings.push(self.finding(rule, fact, &ctx, None));
                        }
                    }
                    RuleKind::Taint(_) => sinks.push((*rule, fact)),
                }
            }
        }

        if !sinks.is_empty() {
            self.scan_taint(p, &ctx, &sinks, &mut fired, &mut outcome);
        }

        tracing::debug!(
            unit = %target.unit.name,
            findings = outcome.findings.len(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "unit scanned"
        );
        outcome
    }

    fn scan_taint(
        &self,
        p: &Prepared<'_>,
        ctx: &MatchCtx<'_>,
        sinks: &[(&'static Rule, &Fact)],
        fired: &mut HashSet<(&'static str, usize)>,
        outcome: &mut UnitOutcome,
    ) {
        let unit = &p.target.unit;
        let g = build_dfg(unit, &p.facts, &p.target.language, &self.knowledge.summaries);
        let limits = Limits {
            iteration_cap: self.config.taint_iteration_cap,
            deadline: self.config.unit_timeout.map(|d| Instant::now() + d),
        };
        let prop = propagate(&g, &limits);
        tracing::trace!(unit = %unit.name, steps = prop.steps, sinks = sinks.len(), "taint pass done");

        match prop.stopped {
            Some(Stop::IterationCap) => {
                let err = SigilError::TaintCapExceeded {
                    unit: unit.name.clone(),
                    cap: self.config.taint_iteration_cap,
                };
                tracing::warn!("{err}; findings for this unit may be incomplete");
                outcome.diagnostics.push(Diagnostic::from_error(&err, &unit.file));
            }
            Some(Stop::Deadline) => {
                tracing::warn!(unit = %unit.name, "unit time budget exhausted during taint propagation");
                outcome.diagnostics.push(Diagnostic {
                    kind: DiagnosticKind::UnitTimeout,
                    file: unit.file.clone(),
                    unit: Some(unit.name.clone()),
                    message: "taint propagation stopped at the per-unit time limit; results may be incomplete".into(),
                });
            }
            None => {}
        }

        for &(rule, fact) in sinks {
            let Some(req) = rule.taint() else { continue };

            let operands: Vec<&Arg> = match (req.sink, &fact.body) {
                (SinkOperands::AnyArg, FactBody::Call { args, .. }) => args.iter().collect(),
                (SinkOperands::Arg(i), FactBody::Call { args, .. }) => args.get(i).into_iter().collect(),
                (SinkOperands::ReturnValue, FactBody::Return { value }) => value.iter().collect(),
                _ => Vec::new(),
            };

            let origin: Option<Origin> = operands
                .iter()
                .filter_map(|a| a.instr)
                .filter_map(|j| prop.at(j))
                .flat_map(|set| set.iter().copied())
                .filter(|o| o.cap.intersects(req.sources))
                .min();

            let Some(origin) = origin else { continue };
            if claim(fired, rule, fact) {
                let source = describe_origin(p, origin, req.sources);
                outcome.findings.push(self.finding(rule, fact, ctx, Some(source)));
            }
        }

        outcome.findings.sort_by_key(|f| f.instr);
    }

    fn finding(&self, rule: &Rule, fact: &Fact, ctx: &MatchCtx<'_>, source: Option<String>) -> Finding {
        let unit = ctx.unit;
        Finding {
            rule_id: rule.id.to_owned(),
            bug_type: rule.bug_type.to_owned(),
            severity: rule.severity,
            confidence: rule.confidence,
            unit: unit.name.clone(),
            file: unit.file.clone(),
            line: fact.line,
            instr: fact.instr,
            message: render_message(rule.message, fact, ctx, source.as_deref()),
            cwe: rule.cwe,
        }
    }
}

/// Record that `rule` fired at `fact`; `false` if the dedupe key was taken.
fn claim(fired: &mut HashSet<(&'static str, usize)>, rule: &Rule, fact: &Fact) -> bool {
    let key = match rule.dedupe {
        Dedupe::PerSink => fact.instr,
        Dedupe::PerUnit => usize::MAX,
    };
    fired.insert((rule.id, key))
}

fn describe_origin(p: &Prepared<'_>, origin: Origin, wanted: Cap) -> String {
    let what = (origin.cap & wanted).describe();
    match p.target.unit.instructions.get(origin.instr) {
        Some(ins) => match ins.op.callee() {
            Some(callee) => format!("{what} ({callee}, line {})", ins.line),
            None => format!("{what} (line {})", ins.line),
        },
        None => what,
    }
}

fn render_message(template: &str, fact: &Fact, ctx: &MatchCtx<'_>, source: Option<&str>) -> String {
    let arg0 = fact
        .args()
        .first()
        .and_then(|a| ctx.literal_of(a))
        .map(Literal::to_string)
        .unwrap_or_else(|| "a non-constant value".into());

    template
        .replace("{unit}", &ctx.unit.name)
        .replace("{callee}", fact.callee().unwrap_or("return"))
        .replace("{arg0}", &arg0)
        .replace("{source}", source.unwrap_or("an untrusted source"))
}

/// Group findings by rule id; handy for summaries and tests.
pub fn count_by_rule(findings: &[Finding]) -> HashMap<&str, usize> {
    let mut m = HashMap::new();
    for f in findings {
        *m.entry(f.rule_id.as_str()).or_insert(0) += 1;
    }
    m
}

/// How the targets of one scan were accounted for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnitTally {
    pub scanned: usize,
    /// Not analysed because the scan was cancelled.
    pub skipped: usize,
    /// Rejected by validation.
    pub malformed: usize,
    pub cancelled: bool,
}

/// Everything one scan produced, before aggregation.
#[derive(Debug, Default)]
pub struct ScanOutput {
    pub findings: Vec<Finding>,
    pub diagnostics: Vec<Diagnostic>,
    pub tally: UnitTally,
}

/// Validate, extract and scan every target on the rayon pool.
///
/// Malformed units are skipped with a diagnostic and counted apart from
/// units left unanalysed by cancellation. Workers check `token`
/// before each unit; a passed `scan_deadline` cancels it. Output order is
/// not deterministic; the reporter sorts.
pub fn scan_targets(
    targets: &[Target],
    library: &PatternLibrary,
    config: EngineConfig,
    token: &CancelToken,
) -> ScanOutput {
    let diagnostics: Mutex<Vec<Diagnostic>> = Mutex::new(Vec::new());
    let malformed = AtomicUsize::new(0);
    let expired = || {
        if config.scan_deadline.is_some_and(|d| Instant::now() >= d) {
            token.cancel();
        }
        token.is_cancelled()
    };

    let prepared: Vec<Prepared<'_>> = targets
        .par_iter()
        .filter_map(|t| {
            if expired() {
                return None;
            }
            match t.unit.validate() {
                Ok(()) => Some(Prepared {
                    target: t,
                    facts: extract(&t.unit, &t.language),
                }),
                Err(err) => {
                    tracing::warn!("skipping unit: {err}");
                    malformed.fetch_add(1, Ordering::Relaxed);
                    diagnostics
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(Diagnostic::from_error(&err, &t.unit.file));
                    None
                }
            }
        })
        .collect();

    let knowledge = ScanKnowledge::gather(&prepared, library, &config);
    let engine = RuleEngine::new(library, &knowledge, config);

    let findings: Mutex<Vec<Finding>> = Mutex::new(Vec::new());
    let scanned = AtomicUsize::new(0);

    prepared.par_iter().for_each(|p| {
        if expired() {
            return;
        }
        let outcome = engine.scan(p);
        scanned.fetch_add(1, Ordering::Relaxed);
        findings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(outcome.findings);
        diagnostics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(outcome.diagnostics);
    });

    let scanned = scanned.into_inner();
    let malformed = malformed.into_inner();
    let tally = UnitTally {
        scanned,
        skipped: targets.len().saturating_sub(scanned + malformed),
        malformed,
        cancelled: token.is_cancelled(),
    };
    let mut diagnostics = diagnostics.into_inner().unwrap_or_else(PoisonError::into_inner);

    if tally.cancelled {
        tracing::warn!(scanned, skipped = tally.skipped, "scan cancelled before completion");
        diagnostics.push(Diagnostic {
            kind: DiagnosticKind::Cancelled,
            file: String::new(),
            unit: None,
            message: format!("scan cancelled; {} unit(s) not analysed", tally.skipped),
        });
    }

    ScanOutput {
        findings: findings.into_inner().unwrap_or_else(PoisonError::into_inner),
        diagnostics,
        tally,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{UnitFile, parse_units};

    const APP: &str = include_str!("../fixtures/app.units.json");

    fn targets(json: &str) -> Vec<Target> {
        parse_units(json).unwrap().into_targets("Test.java")
    }

    fn run(json: &str) -> ScanOutput {
        let lib = PatternLibrary::load(&[], Severity::Info).unwrap();
        scan_targets(&targets(json), &lib, EngineConfig::default(), &CancelToken::new())
    }

    fn sorted(mut f: Vec<Finding>) -> Vec<Finding> {
        f.sort_by(|a, b| (&a.unit, a.line, &a.rule_id).cmp(&(&b.unit, b.line, &b.rule_id)));
        f
    }

    fn single(name: &str, return_type: &str, body: &str) -> String {
        format!(
            r#"{{ "units": [{{ "name": "{name}", "return_type": "{return_type}", "instructions": {body} }}] }}"#
        )
    }

    #[test]
    fn app_fixture_yields_expected_findings() {
        let out = run(APP);
        assert!(out.diagnostics.is_empty(), "{:?}", out.diagnostics);
        assert_eq!(out.tally.scanned, 7);

        let counts = count_by_rule(&out.findings);
        assert_eq!(counts.get("insecure-cipher-mode"), Some(&1));
        assert_eq!(counts.get("hardcoded-credential"), Some(&1));
        assert_eq!(counts.get("weak-random-token"), Some(&2));
        assert_eq!(counts.get("nullable-boxed-return"), Some(&1));
        // the query is built from constants only
        assert_eq!(counts.get("sql-injection"), None);
        assert_eq!(out.findings.len(), 5);

        let cipher = out.findings.iter().find(|f| f.rule_id == "insecure-cipher-mode").unwrap();
        assert_eq!(cipher.severity, Severity::SecurityHigh);
        assert_eq!(cipher.line, 40);
        assert!(cipher.unit.ends_with("insecureCypher"));
        assert!(cipher.message.contains("AES/ECB/NoPadding"));

        let cred = out.findings.iter().find(|f| f.rule_id == "hardcoded-credential").unwrap();
        assert_eq!(cred.line, 69);

        let tokens: Vec<u32> = sorted(out.findings.clone())
            .into_iter()
            .filter(|f| f.rule_id == "weak-random-token")
            .map(|f| f.line)
            .collect();
        assert_eq!(tokens, vec![53, 59]);
    }

    #[test]
    fn scanning_is_deterministic() {
        let a = sorted(run(APP).findings);
        let b = sorted(run(APP).findings);
        assert_eq!(a, b);
    }

    #[test]
    fn authenticated_cipher_mode_is_accepted() {
        let out = run(&single(
            "a.C.enc",
            "void",
            r#"[
              { "op": "invoke", "callee": "javax.crypto.Cipher.getInstance", "operands": [{ "lit": "AES/GCM/NoPadding" }], "line": 3 },
              { "op": "return", "line": 4 }
            ]"#,
        ));
        assert!(out.findings.is_empty());
    }

    #[test]
    fn cipher_mode_from_constant_field_is_resolved() {
        let out = run(r#"{ "units": [
          { "name": "a.C.<clinit>", "instructions": [
              { "op": "const", "operands": [{ "lit": "DES/ECB/PKCS5Padding" }], "line": 1 },
              { "op": "store", "var": { "field": "a.C.MODE" }, "operands": [{ "ref": 0 }], "line": 1 }
          ]},
          { "name": "a.C.enc", "instructions": [
              { "op": "load", "var": { "field": "a.C.MODE" }, "line": 5 },
              { "op": "invoke", "callee": "javax.crypto.Cipher.getInstance", "operands": [{ "ref": 0 }], "line": 5 }
          ]}
        ]}"#);
        assert_eq!(out.findings.len(), 1);
        assert_eq!(out.findings[0].line, 5);
    }

    #[test]
    fn password_from_environment_is_not_hardcoded() {
        let out = run(r#"{ "units": [
          { "name": "a.Db.<clinit>", "instructions": [
              { "op": "invoke", "callee": "java.lang.System.getenv", "operands": [{ "lit": "DB_PASS" }], "line": 2 },
              { "op": "store", "var": { "field": "a.Db.PASS" }, "operands": [{ "ref": 0 }], "line": 2 }
          ]},
          { "name": "a.Db.open", "instructions": [
              { "op": "load", "var": { "field": "a.Db.PASS" }, "line": 7 },
              { "op": "invoke", "callee": "java.sql.DriverManager.getConnection", "operands": [{ "lit": "jdbc:h2:mem" }, { "lit": "sa" }, { "ref": 0 }], "line": 7 }
          ]}
        ]}"#);
        assert!(out.findings.is_empty(), "{:?}", out.findings);
    }

    #[test]
    fn empty_password_is_its_own_bug() {
        let out = run(&single(
            "a.Db.open",
            "void",
            r#"[
              { "op": "invoke", "callee": "java.sql.DriverManager.getConnection", "operands": [{ "lit": "jdbc:h2:mem" }, { "lit": "sa" }, { "lit": "" }], "line": 7 }
            ]"#,
        ));
        let ids: Vec<&str> = out.findings.iter().map(|f| f.rule_id.as_str()).collect();
        assert_eq!(ids, vec!["empty-db-password"]);
    }

    #[test]
    fn token_from_helper_called_twice_is_reported_once() {
        let out = run(r#"{ "units": [
          { "name": "a.Tokens.nextRandom", "return_type": "long", "instructions": [
              { "op": "new", "class": "java.util.Random", "line": 3 },
              { "op": "invoke", "callee": "java.util.Random.nextLong", "instance": true, "operands": [{ "ref": 0 }], "line": 3 },
              { "op": "return", "operands": [{ "ref": 1 }], "line": 3 }
          ]},
          { "name": "a.Tokens.makeToken", "return_type": "java.lang.String", "instructions": [
              { "op": "invoke", "callee": "a.Tokens.nextRandom", "line": 8 },
              { "op": "invoke", "callee": "a.Tokens.nextRandom", "line": 8 },
              { "op": "concat", "operands": [{ "ref": 0 }, { "ref": 1 }], "line": 8 },
              { "op": "return", "operands": [{ "ref": 2 }], "line": 8 }
          ]}
        ]}"#);
        assert_eq!(out.findings.len(), 1, "{:?}", out.findings);
        let f = &out.findings[0];
        assert_eq!(f.rule_id, "weak-random-token");
        assert_eq!(f.unit, "a.Tokens.makeToken");
        assert!(f.message.contains("a.Tokens.nextRandom"));
    }

    #[test]
    fn secure_random_token_is_clean() {
        let out = run(&single(
            "a.Tokens.makeToken",
            "java.lang.String",
            r#"[
              { "op": "new", "class": "java.security.SecureRandom", "line": 3 },
              { "op": "invoke", "callee": "java.security.SecureRandom.nextLong", "instance": true, "operands": [{ "ref": 0 }], "line": 3 },
              { "op": "invoke", "callee": "java.lang.Long.toHexString", "operands": [{ "ref": 1 }], "line": 3 },
              { "op": "return", "operands": [{ "ref": 2 }], "line": 3 }
            ]"#,
        ));
        assert!(out.findings.is_empty());
    }

    #[test]
    fn untrusted_value_in_query_is_injection() {
        for source in ["java.lang.System.getenv", "javax.servlet.http.HttpServletRequest.getParameter"] {
            let body = format!(
                r#"[
                  {{ "op": "invoke", "callee": "{source}", "operands": [{{ "lit": "name" }}], "line": 10 }},
                  {{ "op": "store", "var": {{ "local": "name" }}, "operands": [{{ "ref": 0 }}], "line": 10 }},
                  {{ "op": "load", "var": {{ "local": "name" }}, "line": 11 }},
                  {{ "op": "concat", "operands": [{{ "lit": "SELECT * FROM t WHERE a = " }}, {{ "ref": 2 }}], "line": 11 }},
                  {{ "op": "param", "index": 0, "line": 12 }},
                  {{ "op": "invoke", "callee": "java.sql.Statement.executeQuery", "instance": true, "operands": [{{ "ref": 4 }}, {{ "ref": 3 }}], "line": 12 }}
                ]"#
            );
            let out = run(&single("a.Dao.find", "void", &body));
            assert_eq!(out.findings.len(), 1, "{source}: {:?}", out.findings);
            assert_eq!(out.findings[0].rule_id, "sql-injection");
            assert_eq!(out.findings[0].line, 12);
        }
    }

    #[test]
    fn sanitised_value_in_query_is_clean() {
        let out = run(&single(
            "a.Dao.find",
            "void",
            r#"[
              { "op": "invoke", "callee": "java.lang.System.getenv", "operands": [{ "lit": "ID" }], "line": 10 },
              { "op": "invoke", "callee": "java.lang.Integer.parseInt", "operands": [{ "ref": 0 }], "line": 10 },
              { "op": "concat", "operands": [{ "lit": "SELECT * FROM t WHERE id = " }, { "ref": 1 }], "line": 11 },
              { "op": "invoke", "callee": "java.sql.Connection.prepareStatement", "operands": [{ "ref": 2 }], "line": 12 }
            ]"#,
        ));
        assert!(out.findings.is_empty());
    }

    #[test]
    fn null_returned_on_one_branch_is_reported() {
        let out = run(&single(
            "a.T.isReady",
            "java.lang.Boolean",
            r#"[
              { "op": "const", "operands": [{ "lit": null }], "line": 2 },
              { "op": "store", "var": { "local": "r" }, "operands": [{ "ref": 0 }], "line": 2 },
              { "op": "param", "index": 0, "line": 3 },
              { "op": "branch", "operands": [{ "ref": 2 }], "targets": [6], "line": 3 },
              { "op": "invoke", "callee": "java.lang.Boolean.valueOf", "operands": [{ "lit": true }], "line": 4 },
              { "op": "store", "var": { "local": "r" }, "operands": [{ "ref": 4 }], "line": 4 },
              { "op": "load", "var": { "local": "r" }, "line": 5 },
              { "op": "return", "operands": [{ "ref": 6 }], "line": 5 }
            ]"#,
        ));
        assert_eq!(out.findings.len(), 1, "{:?}", out.findings);
        assert_eq!(out.findings[0].rule_id, "nullable-boxed-return");
        assert_eq!(out.findings[0].line, 5);
    }

    #[test]
    fn null_overwritten_on_every_path_is_clean() {
        let out = run(&single(
            "a.T.isReady",
            "java.lang.Boolean",
            r#"[
              { "op": "const", "operands": [{ "lit": null }], "line": 2 },
              { "op": "store", "var": { "local": "r" }, "operands": [{ "ref": 0 }], "line": 2 },
              { "op": "invoke", "callee": "java.lang.Boolean.valueOf", "operands": [{ "lit": true }], "line": 3 },
              { "op": "store", "var": { "local": "r" }, "operands": [{ "ref": 2 }], "line": 3 },
              { "op": "load", "var": { "local": "r" }, "line": 4 },
              { "op": "return", "operands": [{ "ref": 4 }], "line": 4 }
            ]"#,
        ));
        assert!(out.findings.is_empty(), "{:?}", out.findings);
    }

    #[test]
    fn token_from_field_held_random_is_reported() {
        let out = run(r#"{ "units": [
          { "name": "a.T.<clinit>", "instructions": [
              { "op": "new", "class": "java.util.Random", "line": 3 },
              { "op": "store", "var": { "field": "a.T.RNG" }, "operands": [{ "ref": 0 }], "line": 3 }
          ]},
          { "name": "a.T.generateToken", "return_type": "java.lang.String", "instructions": [
              { "op": "load", "var": { "field": "a.T.RNG" }, "line": 6 },
              { "op": "invoke", "callee": "java.util.Random.nextLong", "instance": true, "operands": [{ "ref": 0 }], "line": 6 },
              { "op": "invoke", "callee": "java.lang.Long.toHexString", "operands": [{ "ref": 1 }], "line": 6 },
              { "op": "return", "operands": [{ "ref": 2 }], "line": 6 }
          ]}
        ]}"#);
        assert_eq!(out.findings.len(), 1, "{:?}", out.findings);
        let f = &out.findings[0];
        assert_eq!(f.rule_id, "weak-random-token");
        assert_eq!(f.unit, "a.T.generateToken");
        assert!(f.message.contains("java.util.Random.nextLong"), "{}", f.message);
    }

    #[test]
    fn weak_digest_is_reported_and_sha256_is_not() {
        let digest = |alg: &str| {
            run(&single(
                "a.H.hash",
                "void",
                &format!(
                    r#"[
                      {{ "op": "invoke", "callee": "java.security.MessageDigest.getInstance", "operands": [{{ "lit": "{alg}" }}], "line": 9 }}
                    ]"#
                ),
            ))
        };

        let out = digest("MD5");
        assert_eq!(out.findings.len(), 1);
        assert_eq!(out.findings[0].rule_id, "weak-message-digest");
        assert_eq!(out.findings[0].line, 9);

        assert!(digest("SHA-256").findings.is_empty());
    }

    fn exec_of(arg: &str) -> ScanOutput {
        run(&single(
            "a.Ops.runJob",
            "void",
            &format!(
                r#"[
                  {arg},
                  {{ "op": "invoke", "callee": "java.lang.Runtime.getRuntime", "line": 20 }},
                  {{ "op": "invoke", "callee": "java.lang.Runtime.exec", "instance": true, "operands": [{{ "ref": 1 }}, {{ "ref": 0 }}], "line": 21 }}
                ]"#
            ),
        ))
    }

    #[test]
    fn environment_value_in_exec_is_command_injection() {
        let out = exec_of(
            r#"{ "op": "invoke", "callee": "java.lang.System.getenv", "operands": [{ "lit": "JOB" }], "line": 19 }"#,
        );
        assert_eq!(out.findings.len(), 1, "{:?}", out.findings);
        assert_eq!(out.findings[0].rule_id, "command-injection");
        assert_eq!(out.findings[0].line, 21);
        assert!(out.findings[0].message.contains("java.lang.System.getenv"));
    }

    #[test]
    fn literal_command_is_clean() {
        let out = exec_of(r#"{ "op": "const", "operands": [{ "lit": "ls -l" }], "line": 19 }"#);
        assert!(out.findings.is_empty(), "{:?}", out.findings);
    }

    fn open_file_from(first: &str, second: Option<&str>) -> ScanOutput {
        let value = usize::from(second.is_some());
        let middle = second.map(|s| format!("{s},")).unwrap_or_default();
        run(&single(
            "a.Files.open",
            "void",
            &format!(
                r#"[
                  {first},
                  {middle}
                  {{ "op": "new", "class": "java.io.File", "operands": [{{ "ref": {value} }}], "line": 31 }}
                ]"#
            ),
        ))
    }

    #[test]
    fn request_parameter_in_file_path_is_traversal() {
        let out = open_file_from(
            r#"{ "op": "invoke", "callee": "javax.servlet.http.HttpServletRequest.getParameter", "operands": [{ "lit": "f" }], "line": 30 }"#,
            None,
        );
        assert_eq!(out.findings.len(), 1, "{:?}", out.findings);
        assert_eq!(out.findings[0].rule_id, "path-traversal");
        assert_eq!(out.findings[0].line, 31);
    }

    #[test]
    fn environment_or_sanitised_file_path_is_clean() {
        let env = open_file_from(
            r#"{ "op": "invoke", "callee": "java.lang.System.getenv", "operands": [{ "lit": "HOME" }], "line": 30 }"#,
            None,
        );
        assert!(env.findings.is_empty(), "{:?}", env.findings);

        let sanitised = open_file_from(
            r#"{ "op": "invoke", "callee": "javax.servlet.http.HttpServletRequest.getParameter", "operands": [{ "lit": "f" }], "line": 30 }"#,
            Some(
                r#"{ "op": "invoke", "callee": "org.apache.commons.io.FilenameUtils.getName", "operands": [{ "ref": 0 }], "line": 30 }"#,
            ),
        );
        assert!(sanitised.findings.is_empty(), "{:?}", sanitised.findings);
    }

    #[test]
    fn query_reached_by_tainted_and_clean_paths_still_fires() {
        let out = run(&single(
            "a.Dao.find",
            "void",
            r#"[
              { "op": "const", "operands": [{ "lit": "1" }], "line": 2 },
              { "op": "store", "var": { "local": "id" }, "operands": [{ "ref": 0 }], "line": 2 },
              { "op": "param", "index": 0, "line": 3 },
              { "op": "branch", "operands": [{ "ref": 2 }], "targets": [6], "line": 3 },
              { "op": "invoke", "callee": "java.lang.System.getenv", "operands": [{ "lit": "ID" }], "line": 4 },
              { "op": "store", "var": { "local": "id" }, "operands": [{ "ref": 4 }], "line": 4 },
              { "op": "load", "var": { "local": "id" }, "line": 5 },
              { "op": "concat", "operands": [{ "lit": "SELECT * FROM t WHERE id = " }, { "ref": 6 }], "line": 5 },
              { "op": "param", "index": 1, "line": 6 },
              { "op": "invoke", "callee": "java.sql.Statement.executeQuery", "instance": true, "operands": [{ "ref": 8 }, { "ref": 7 }], "line": 6 }
            ]"#,
        ));
        assert_eq!(out.findings.len(), 1, "{:?}", out.findings);
        assert_eq!(out.findings[0].rule_id, "sql-injection");
        assert_eq!(out.findings[0].line, 6);
    }

    #[test]
    fn unit_time_budget_is_reported() {
        // 80 chained concats keep the worklist busy past its first clock check
        let mut body = vec![
            r#"{ "op": "invoke", "callee": "java.lang.System.getenv", "operands": [{ "lit": "CMD" }], "line": 1 }"#
                .to_owned(),
        ];
        for i in 0..80 {
            body.push(format!(
                r#"{{ "op": "concat", "operands": [{{ "ref": {i} }}, {{ "lit": "x" }}], "line": 2 }}"#
            ));
        }
        body.push(r#"{ "op": "invoke", "callee": "java.lang.Runtime.getRuntime", "line": 3 }"#.to_owned());
        body.push(
            r#"{ "op": "invoke", "callee": "java.lang.Runtime.exec", "instance": true, "operands": [{ "ref": 81 }, { "ref": 80 }], "line": 3 }"#
                .to_owned(),
        );
        let json = single("a.Ops.slow", "void", &format!("[{}]", body.join(",")));

        let lib = PatternLibrary::load(&[], Severity::Info).unwrap();
        let cfg = EngineConfig {
            unit_timeout: Some(Duration::ZERO),
            ..EngineConfig::default()
        };
        let out = scan_targets(&targets(&json), &lib, cfg, &CancelToken::new());

        let timeout = out
            .diagnostics
            .iter()
            .find(|d| d.kind == DiagnosticKind::UnitTimeout)
            .expect("unit timeout diagnostic");
        assert_eq!(timeout.unit.as_deref(), Some("a.Ops.slow"));
        assert_eq!(out.tally.scanned, 1);
        assert!(!out.tally.cancelled);
    }

    #[test]
    fn malformed_unit_is_skipped_with_diagnostic() {
        let out = run(r#"{ "units": [
          { "name": "a.Bad.m", "instructions": [
              { "op": "return", "operands": [{ "ref": 9 }], "line": 1 }
          ]},
          { "name": "a.Good.isReady", "return_type": "java.lang.Boolean", "instructions": [
              { "op": "const", "operands": [{ "lit": null }], "line": 4 },
              { "op": "return", "operands": [{ "ref": 0 }], "line": 4 }
          ]}
        ]}"#);
        assert_eq!(
            out.tally,
            UnitTally {
                scanned: 1,
                skipped: 0,
                malformed: 1,
                cancelled: false,
            }
        );
        assert_eq!(out.diagnostics.len(), 1);
        assert_eq!(out.diagnostics[0].kind, DiagnosticKind::MalformedUnit);
        assert_eq!(out.diagnostics[0].unit.as_deref(), Some("a.Bad.m"));
        assert_eq!(out.findings.len(), 1);
        assert_eq!(out.findings[0].rule_id, "nullable-boxed-return");
    }

    #[test]
    fn taint_cap_is_reported_and_structural_findings_survive() {
        let json = single(
            "a.Loop.run",
            "void",
            r#"[
              { "op": "invoke", "callee": "java.lang.System.getenv", "operands": [{ "lit": "N" }], "line": 1 },
              { "op": "store", "var": { "local": "s" }, "operands": [{ "ref": 0 }], "line": 1 },
              { "op": "load", "var": { "local": "s" }, "line": 2 },
              { "op": "concat", "operands": [{ "ref": 2 }, { "lit": "a" }], "line": 3 },
              { "op": "store", "var": { "local": "s" }, "operands": [{ "ref": 3 }], "line": 3 },
              { "op": "invoke", "callee": "javax.crypto.Cipher.getInstance", "operands": [{ "lit": "AES" }], "line": 4 },
              { "op": "invoke", "callee": "java.lang.Runtime.exec", "instance": true, "operands": [{ "ref": 5 }, { "ref": 2 }], "line": 5 }
            ]"#,
        );
        let lib = PatternLibrary::load(&[], Severity::Info).unwrap();
        let cfg = EngineConfig {
            taint_iteration_cap: 1,
            ..EngineConfig::default()
        };
        let out = scan_targets(&targets(&json), &lib, cfg, &CancelToken::new());
        assert!(out.diagnostics.iter().any(|d| d.kind == DiagnosticKind::TaintCapExceeded));
        assert!(out.findings.iter().any(|f| f.rule_id == "insecure-cipher-mode"));
    }

    #[test]
    fn cancelled_scan_reports_skipped_units() {
        let lib = PatternLibrary::load(&[], Severity::Info).unwrap();
        let token = CancelToken::new();
        token.cancel();
        let out = scan_targets(&targets(APP), &lib, EngineConfig::default(), &token);
        assert_eq!(out.tally.scanned, 0);
        assert_eq!(out.tally.skipped, 7);
        assert_eq!(out.tally.malformed, 0);
        assert!(out.tally.cancelled);
        assert!(out.findings.is_empty());
        assert_eq!(out.diagnostics.last().unwrap().kind, DiagnosticKind::Cancelled);
    }

    #[test]
    fn disabled_rules_stay_silent() {
        let lib = PatternLibrary::load(&["insecure-cipher-mode".into()], Severity::Info).unwrap();
        let out = scan_targets(&targets(APP), &lib, EngineConfig::default(), &CancelToken::new());
        assert!(out.findings.iter().all(|f| f.rule_id == "insecure-cipher-mode"));
        assert_eq!(out.findings.len(), 1);

        let high = PatternLibrary::load(&[], Severity::SecurityHigh).unwrap();
        let out = scan_targets(&targets(APP), &high, EngineConfig::default(), &CancelToken::new());
        assert!(out.findings.iter().all(|f| f.severity == Severity::SecurityHigh));
        assert_eq!(out.findings.len(), 4);
    }

    #[test]
    fn unit_file_defaults_to_origin() {
        let file: UnitFile = parse_units(&single("a.B.c", "void", "[]")).unwrap();
        let t = file.into_targets("x/B.json");
        assert_eq!(t[0].unit.file, "x/B.json");
        assert_eq!(t[0].language, "java");
    }
}
