//! Turns raw engine output into a stable, deduplicated report.

use crate::engine::{Diagnostic, Finding, UnitTally, count_by_rule};
use crate::errors::{SigilError, SigilResult};
use crate::patterns::{Confidence, PatternLibrary, Severity};
use chrono::{DateTime, SecondsFormat, Utc};
use console::style;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::{self, Write};

/// Version of the JSON report layout.
pub const REPORT_VERSION: &str = "1.0";

const CWE_URL: &str = "https://cwe.mitre.org/data/definitions";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Analyzer {
    pub id: &'static str,
    pub name: &'static str,
    pub version: &'static str,
}

impl Default for Analyzer {
    fn default() -> Self {
        Self {
            id: "sigil",
            name: "Sigil",
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub name: String,
    pub value: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Location {
    pub file: String,
    pub line: u32,
    pub class: String,
    pub method: String,
}

/// One reported problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Issue {
    pub rule_id: String,
    pub name: &'static str,
    pub message: String,
    pub severity: Severity,
    pub confidence: Confidence,
    /// `fingerprint:bug_type:file:line`; equal across scans of the same defect.
    pub compare_key: String,
    pub fingerprint: String,
    pub location: Location,
    pub identifiers: Vec<Identifier>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanInfo {
    pub analyzer: Analyzer,
    pub start_time: String,
    pub end_time: String,
    pub status: &'static str,
    pub units_scanned: usize,
    pub units_skipped: usize,
    pub units_malformed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Report {
    pub version: &'static str,
    pub scan: ScanInfo,
    pub vulnerabilities: Vec<Issue>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Console rendering knobs, taken from the `[output]` config section.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleOptions {
    pub quiet: bool,
    pub max_results: Option<usize>,
}

/// Stable hash identifying a finding independent of message wording.
pub fn fingerprint(f: &Finding) -> String {
    let key = format!("{}:{}:{}:{}", f.rule_id, f.unit, f.file, f.line);
    let hex = blake3::hash(key.as_bytes()).to_hex();
    hex.as_str()[..32].to_owned()
}

fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn split_unit(unit: &str) -> (String, String) {
    match unit.rsplit_once('.') {
        Some((class, method)) => (class.to_owned(), method.to_owned()),
        None => (String::new(), unit.to_owned()),
    }
}

/// Deduplicate, sort and resolve raw findings against `library`.
///
/// Entries sharing (rule id, unit, file, line) collapse into the one with
/// the lowest instruction index. Output is sorted by unit, file, line and
/// rule id, so the same input always yields the same report.
pub fn aggregate(
    mut findings: Vec<Finding>,
    mut diagnostics: Vec<Diagnostic>,
    library: &PatternLibrary,
) -> SigilResult<Report> {
    if let Some(f) = findings.iter().find(|f| !library.contains(&f.rule_id)) {
        return Err(SigilError::UnresolvedRuleReference(f.rule_id.clone()));
    }

    findings.sort_by(|a, b| {
        (&a.unit, &a.file, a.line, &a.rule_id, a.instr)
            .cmp(&(&b.unit, &b.file, b.line, &b.rule_id, b.instr))
    });
    findings.dedup_by(|b, a| {
        a.rule_id == b.rule_id && a.unit == b.unit && a.file == b.file && a.line == b.line
    });

    diagnostics.sort();
    diagnostics.dedup();

    let mut vulnerabilities = Vec::with_capacity(findings.len());
    for f in findings {
        let rule = library
            .get(&f.rule_id)
            .ok_or_else(|| SigilError::UnresolvedRuleReference(f.rule_id.clone()))?;

        let mut identifiers = vec![Identifier {
            kind: "bug_type",
            name: rule.bug_type.to_owned(),
            value: rule.bug_type.to_owned(),
            url: format!("{}#{}", rule.reference, rule.bug_type),
        }];
        if let Some(cwe) = rule.cwe {
            identifiers.push(Identifier {
                kind: "cwe",
                name: format!("CWE-{cwe}"),
                value: cwe.to_string(),
                url: format!("{CWE_URL}/{cwe}.html"),
            });
        }

        let fp = fingerprint(&f);
        let (class, method) = split_unit(&f.unit);
        vulnerabilities.push(Issue {
            compare_key: format!("{fp}:{}:{}:{}", rule.bug_type, f.file, f.line),
            fingerprint: fp,
            rule_id: f.rule_id,
            name: rule.description,
            message: f.message,
            severity: f.severity,
            confidence: f.confidence,
            location: Location {
                file: f.file,
                line: f.line,
                class,
                method,
            },
            identifiers,
        });
    }

    let now = timestamp(Utc::now());
    Ok(Report {
        version: REPORT_VERSION,
        scan: ScanInfo {
            analyzer: Analyzer::default(),
            start_time: now.clone(),
            end_time: now,
            status: "success",
            units_scanned: 0,
            units_skipped: 0,
            units_malformed: 0,
        },
        vulnerabilities,
        diagnostics,
    })
}

impl Report {
    /// Fill in the scan window and unit counters. Only a cancelled scan is
    /// `partial`; malformed units are reported but do not make it so.
    pub fn stamp(&mut self, started: DateTime<Utc>, tally: UnitTally) {
        self.scan.start_time = timestamp(started);
        self.scan.end_time = timestamp(Utc::now());
        self.scan.units_scanned = tally.scanned;
        self.scan.units_skipped = tally.skipped;
        self.scan.units_malformed = tally.malformed;
        self.scan.status = if tally.cancelled { "partial" } else { "success" };
    }

    pub fn to_json(&self) -> SigilResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn render_console<W: Write>(&self, out: &mut W, opts: ConsoleOptions) -> io::Result<()> {
        let limit = opts.max_results.unwrap_or(usize::MAX);

        for issue in self.vulnerabilities.iter().take(limit) {
            writeln!(
                out,
                "{}:{}  [{}]  {}",
                style(&issue.location.file).blue().underlined(),
                issue.location.line,
                issue.severity,
                style(&issue.rule_id).bold(),
            )?;
            writeln!(out, "    {}", issue.message)?;
        }

        if opts.quiet {
            return Ok(());
        }

        if self.vulnerabilities.len() > limit {
            writeln!(
                out,
                "{}",
                style(format!("… {} more not shown", self.vulnerabilities.len() - limit)).dim()
            )?;
        }

        for d in &self.diagnostics {
            writeln!(out, "{}  {}", style("warning:").yellow().bold(), d.message)?;
        }

        let mut per_rule: BTreeMap<&str, usize> = BTreeMap::new();
        for issue in &self.vulnerabilities {
            *per_rule.entry(issue.rule_id.as_str()).or_insert(0) += 1;
        }

        let breakdown = per_rule
            .iter()
            .map(|(id, n)| format!("{id}: {n}"))
            .collect::<Vec<_>>()
            .join(", ");
        writeln!(
            out,
            "{} issue(s) in {} unit(s), {} skipped, {} malformed{}",
            style(self.vulnerabilities.len()).bold(),
            self.scan.units_scanned,
            self.scan.units_skipped,
            self.scan.units_malformed,
            if breakdown.is_empty() { String::new() } else { format!(" ({breakdown})") },
        )?;
        Ok(())
    }
}

/// Log a per-rule tally of raw findings before aggregation.
pub fn trace_counts(findings: &[Finding]) {
    let mut counts: Vec<_> = count_by_rule(findings).into_iter().collect();
    counts.sort();
    tracing::debug!(?counts, "raw findings by rule");
}
