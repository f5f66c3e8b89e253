use crate::engine::{CancelToken, Diagnostic, EngineConfig, scan_targets};
use crate::errors::SigilResult;
use crate::ir::{Target, parse_units};
use crate::patterns::PatternLibrary;
use crate::report::{ConsoleOptions, Report, aggregate, trace_counts};
use crate::utils::{Config, OutputFormat};
use crate::walk::spawn_senders;
use chrono::Utc;
use rayon::prelude::*;
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Entry point called by the CLI.
pub fn handle(path: &str, format: Option<OutputFormat>, config: &Config) -> SigilResult<()> {
    let scan_path = Path::new(path).canonicalize()?;
    let library = PatternLibrary::load(&config.scanner.enabled_rules, config.scanner.min_severity)?;
    tracing::debug!(rules = library.len(), path = %scan_path.display(), "starting scan");
    if library.is_empty() {
        tracing::warn!("no rules match the configured filters; the report will be empty");
    }

    let report = run(&scan_path, &library, config)?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    match format.unwrap_or(config.output.default_format) {
        OutputFormat::Console => report.render_console(
            &mut out,
            ConsoleOptions {
                quiet: config.output.quiet,
                max_results: config.output.max_results,
            },
        )?,
        OutputFormat::Json => writeln!(out, "{}", report.to_json()?)?,
    }
    Ok(())
}

pub fn engine_config(config: &Config) -> EngineConfig {
    EngineConfig {
        taint_iteration_cap: config.scanner.taint_iteration_cap,
        unit_timeout: config.scanner.unit_timeout(),
        scan_deadline: config
            .performance
            .scan_timeout_secs
            .map(|s| Instant::now() + Duration::from_secs(s)),
    }
}

/// Discover, parse and scan everything under `root`, returning the final report.
pub fn run(root: &Path, library: &PatternLibrary, config: &Config) -> SigilResult<Report> {
    let started = Utc::now();
    let engine_cfg = engine_config(config);

    let (targets, mut diagnostics) = load_targets(root, config)?;
    tracing::debug!(units = targets.len(), files_failed = diagnostics.len(), "IR loaded");

    let token = CancelToken::new();
    let out = scan_targets(&targets, library, engine_cfg, &token);
    trace_counts(&out.findings);

    diagnostics.extend(out.diagnostics);
    let mut report = aggregate(out.findings, diagnostics, library)?;
    report.stamp(started, out.tally);
    Ok(report)
}

/// Read every IR file the walker finds. Files that cannot be read or decoded
/// become diagnostics; the rest contribute their units.
fn load_targets(root: &Path, cfg: &Config) -> SigilResult<(Vec<Target>, Vec<Diagnostic>)> {
    let rx = spawn_senders(root, cfg)?;
    let targets = Mutex::new(Vec::new());
    let diagnostics = Mutex::new(Vec::new());

    rx.into_iter()
        .flatten()
        .par_bridge()
        .for_each(|path| {
            let shown = match path.strip_prefix(root) {
                Ok(rel) if !rel.as_os_str().is_empty() => rel.to_string_lossy().into_owned(),
                _ => path.to_string_lossy().into_owned(),
            };
            match read_unit_file(&path, &shown) {
                Ok(mut found) => targets
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .append(&mut found),
                Err(err) => {
                    tracing::warn!("cannot load {}: {err}", path.display());
                    diagnostics
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(Diagnostic::from_error(&err, &shown));
                }
            }
        });

    let mut targets = targets.into_inner().unwrap_or_else(PoisonError::into_inner);
    // walk order varies between runs
    targets.sort_by(|a, b| (&a.unit.file, &a.unit.name).cmp(&(&b.unit.file, &b.unit.name)));
    let diagnostics = diagnostics.into_inner().unwrap_or_else(PoisonError::into_inner);
    Ok((targets, diagnostics))
}

fn read_unit_file(path: &Path, shown: &str) -> SigilResult<Vec<Target>> {
    let text = std::fs::read_to_string(path)?;
    Ok(parse_units(&text)?.into_targets(shown))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::DiagnosticKind;
    use crate::patterns::Severity;
    use std::fs;

    const APP: &str = include_str!("../../fixtures/app.units.json");

    fn project() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("app")).unwrap();
        fs::write(dir.path().join("app/app.units.json"), APP).unwrap();
        dir
    }

    #[test]
    fn scan_of_fixture_project() {
        let dir = project();
        fs::write(dir.path().join("broken.json"), "{ not json").unwrap();

        let lib = PatternLibrary::load(&[], Severity::Info).unwrap();
        let report = run(dir.path(), &lib, &Config::default()).unwrap();

        assert_eq!(report.vulnerabilities.len(), 5);
        assert_eq!(report.scan.units_scanned, 7);
        assert_eq!(report.scan.status, "success");

        assert_eq!(report.diagnostics.len(), 1);
        assert_eq!(report.diagnostics[0].kind, DiagnosticKind::UnreadableInput);
        assert_eq!(report.diagnostics[0].file, "broken.json");

        let ids: Vec<&str> = report.vulnerabilities.iter().map(|i| i.rule_id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "nullable-boxed-return",
                "hardcoded-credential",
                "weak-random-token",
                "weak-random-token",
                "insecure-cipher-mode",
            ]
        );
        assert!(
            report
                .vulnerabilities
                .iter()
                .all(|i| i.location.file == "src/main/java/com/gitlab/security_products/tests/App.java")
        );
    }

    #[test]
    fn repeated_scans_are_identical() {
        let dir = project();
        let lib = PatternLibrary::load(&[], Severity::Info).unwrap();
        let a = run(dir.path(), &lib, &Config::default()).unwrap();
        let b = run(dir.path(), &lib, &Config::default()).unwrap();
        assert_eq!(a.vulnerabilities, b.vulnerabilities);
        assert_eq!(a.diagnostics, b.diagnostics);
    }

    #[test]
    fn single_file_can_be_scanned() {
        let dir = project();
        let file = dir.path().join("app/app.units.json");
        let lib = PatternLibrary::load(&["insecure-cipher-mode".into()], Severity::Info).unwrap();
        let report = run(&file, &lib, &Config::default()).unwrap();
        assert_eq!(report.vulnerabilities.len(), 1);
        assert_eq!(report.vulnerabilities[0].location.line, 40);
    }

    #[test]
    fn expired_deadline_skips_everything() {
        let dir = project();
        let lib = PatternLibrary::load(&[], Severity::Info).unwrap();
        let mut cfg = Config::default();
        cfg.performance.scan_timeout_secs = Some(0);

        let report = run(dir.path(), &lib, &cfg).unwrap();
        assert!(report.vulnerabilities.is_empty());
        assert_eq!(report.scan.units_skipped, 7);
        assert_eq!(report.scan.units_malformed, 0);
        assert_eq!(report.scan.status, "partial");
        assert!(report.diagnostics.iter().any(|d| d.kind == DiagnosticKind::Cancelled));
    }

    #[test]
    fn malformed_unit_leaves_scan_complete() {
        let dir = project();
        fs::write(
            dir.path().join("bad.json"),
            r#"{ "units": [{ "name": "a.Bad.m", "instructions": [
                { "op": "return", "operands": [{ "ref": 3 }], "line": 1 }
            ]}]}"#,
        )
        .unwrap();

        let lib = PatternLibrary::load(&[], Severity::Info).unwrap();
        let report = run(dir.path(), &lib, &Config::default()).unwrap();
        assert_eq!(report.scan.status, "success");
        assert_eq!(report.scan.units_scanned, 7);
        assert_eq!(report.scan.units_malformed, 1);
        assert_eq!(report.scan.units_skipped, 0);
        assert_eq!(report.vulnerabilities.len(), 5);
        assert!(report.diagnostics.iter().any(|d| d.kind == DiagnosticKind::MalformedUnit));
    }

    #[test]
    fn empty_directory_gives_empty_report() {
        let dir = tempfile::tempdir().unwrap();
        let lib = PatternLibrary::load(&[], Severity::Info).unwrap();
        let report = run(dir.path(), &lib, &Config::default()).unwrap();
        assert!(report.vulnerabilities.is_empty());
        assert!(report.diagnostics.is_empty());
        assert_eq!(report.scan.units_scanned, 0);
    }
}
