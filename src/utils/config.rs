use crate::errors::SigilResult;
use crate::patterns::Severity;
use console::style;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

static DEFAULT_CONFIG_TOML: &str = include_str!("../../default-sigil.conf");

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Console,
    Json,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ScannerConfig {
    /// Rule ids to run; empty means every built-in rule.
    pub enabled_rules: Vec<String>,

    /// The minimum severity a rule needs to be loaded.
    pub min_severity: Severity,

    /// Maximum visits of one data-flow node during taint propagation.
    pub taint_iteration_cap: usize,

    /// Wall-clock budget for the taint pass of one unit, in milliseconds (0 disables).
    pub unit_timeout_ms: u64,

    /// The maximum IR file size to read, in megabytes.
    pub max_file_size_mb: Option<u64>,

    /// Directories to exclude from scanning.
    pub excluded_directories: Vec<String>,

    /// Whether to respect VCS ignore files (`.gitignore`, ..) or not.
    pub read_vcsignore: bool,

    /// Whether to follow symlinks or not.
    pub follow_symlinks: bool,

    /// Whether to scan hidden files or not.
    pub scan_hidden_files: bool,
}
impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            enabled_rules: Vec::new(),
            min_severity: Severity::Info,
            taint_iteration_cap: 50,
            unit_timeout_ms: 2000,
            max_file_size_mb: None,
            excluded_directories: vec![".git", "node_modules", "target", ".gradle", ".idea"]
                .into_iter()
                .map(str::to_owned)
                .collect(),
            read_vcsignore: true,
            follow_symlinks: false,
            scan_hidden_files: false,
        }
    }
}

impl ScannerConfig {
    pub fn unit_timeout(&self) -> Option<Duration> {
        (self.unit_timeout_ms > 0).then(|| Duration::from_millis(self.unit_timeout_ms))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct OutputConfig {
    /// The default output format.
    pub default_format: OutputFormat,

    /// Print findings only, no diagnostics or summary.
    pub quiet: bool,

    /// The maximum number of results to show on the console.
    pub max_results: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PerformanceConfig {
    /// The maximum number of worker threads to use, or `None` to auto-detect.
    pub worker_threads: Option<usize>,

    /// Paths per batch sent by the file walker.
    pub batch_size: usize,

    /// capacity = threads × this
    pub channel_multiplier: usize,

    /// The stack size for Rayon threads, in bytes.
    pub rayon_thread_stack_size: usize,

    /// Whole-scan deadline; units not started by then are skipped.
    pub scan_timeout_secs: Option<u64>,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            worker_threads: None,
            batch_size: 16usize,
            channel_multiplier: 4usize,
            rayon_thread_stack_size: 8 * 1024 * 1024, // 8 MiB
            scan_timeout_secs: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub scanner: ScannerConfig,
    pub output: OutputConfig,
    pub performance: PerformanceConfig,
}

impl Config {
    pub fn load(config_dir: &Path) -> SigilResult<Self> {
        let mut config = Config::default();

        let default_config_path = config_dir.join("sigil.conf");
        if !default_config_path.exists() {
            create_example_config(config_dir)?;
        }

        let user_config_path = config_dir.join("sigil.local");
        if user_config_path.exists() {
            let user_config_content = fs::read_to_string(&user_config_path)?;
            let user_config: Config = toml::from_str(&user_config_content)?;

            config = merge_configs(config, user_config);

            eprintln!(
                "{}: Loaded user config from: {}\n",
                style("note").green().bold(),
                style(user_config_path.display()).underlined().white().bold()
            );
        } else {
            tracing::debug!(
                "using default configuration; create {} to customise",
                user_config_path.display()
            );
        }

        Ok(config)
    }
}

fn create_example_config(config_dir: &Path) -> SigilResult<()> {
    let example_path = config_dir.join("sigil.conf");
    if !example_path.exists() {
        fs::write(&example_path, DEFAULT_CONFIG_TOML)?;
        tracing::debug!("Example config created at: {}", example_path.display());
    }
    Ok(())
}

/// Merge user config into default config. List fields are unioned and
/// deduplicated, everything else takes the user's value.
fn merge_configs(mut default: Config, user: Config) -> Config {
    // --- ScannerConfig ---
    default.scanner.min_severity = user.scanner.min_severity;
    default.scanner.taint_iteration_cap = user.scanner.taint_iteration_cap;
    default.scanner.unit_timeout_ms = user.scanner.unit_timeout_ms;
    default.scanner.max_file_size_mb = user.scanner.max_file_size_mb;
    default.scanner.read_vcsignore = user.scanner.read_vcsignore;
    default.scanner.follow_symlinks = user.scanner.follow_symlinks;
    default.scanner.scan_hidden_files = user.scanner.scan_hidden_files;

    default.scanner.enabled_rules.extend(user.scanner.enabled_rules);
    default
        .scanner
        .excluded_directories
        .extend(user.scanner.excluded_directories);
    default.scanner.enabled_rules.sort_unstable();
    default.scanner.enabled_rules.dedup();
    default.scanner.excluded_directories.sort_unstable();
    default.scanner.excluded_directories.dedup();

    // --- OutputConfig ---
    default.output = user.output;

    // --- PerformanceConfig ---
    default.performance = user.performance;

    default
}

#[test]
fn embedded_default_config_parses() {
    let cfg: Config = toml::from_str(DEFAULT_CONFIG_TOML).unwrap();
    assert_eq!(cfg.scanner.taint_iteration_cap, 50);
    assert_eq!(cfg.scanner.min_severity, Severity::Info);
    assert_eq!(cfg.output.default_format, OutputFormat::Console);
    assert!(cfg.scanner.enabled_rules.is_empty());
}

#[test]
fn merge_configs_dedupes_and_keeps_order() {
    let mut default_cfg = Config::default();
    default_cfg.scanner.excluded_directories = vec!["target".into(), "build".into()];

    let mut user_cfg = Config::default();
    user_cfg.scanner.excluded_directories = vec!["out".into(), "target".into()];
    user_cfg.scanner.enabled_rules = vec!["sql-injection".into(), "sql-injection".into()];

    let merged = merge_configs(default_cfg, user_cfg);

    assert_eq!(merged.scanner.excluded_directories, vec!["build", "out", "target"]);
    assert_eq!(merged.scanner.enabled_rules, vec!["sql-injection"]);
}

#[test]
fn load_creates_example_and_reads_user_overrides() {
    let cfg_dir = tempfile::tempdir().unwrap();
    let cfg_path = cfg_dir.path();

    let user_toml = r#"
        [scanner]
        min_severity = "security-high"
        taint_iteration_cap = 10
        unit_timeout_ms = 0
        enabled_rules = ["insecure-cipher-mode"]

        [output]
        default_format = "json"
        quiet = true
    "#;
    fs::write(cfg_path.join("sigil.local"), user_toml).unwrap();

    let cfg = Config::load(cfg_path).expect("Config::load should succeed");

    assert!(cfg_path.join("sigil.conf").is_file());

    assert_eq!(cfg.scanner.min_severity, Severity::SecurityHigh);
    assert_eq!(cfg.scanner.taint_iteration_cap, 10);
    assert_eq!(cfg.scanner.unit_timeout(), None);
    assert_eq!(cfg.scanner.enabled_rules, vec!["insecure-cipher-mode"]);
    assert_eq!(cfg.output.default_format, OutputFormat::Json);
    assert!(cfg.output.quiet);

    assert!(!cfg.scanner.follow_symlinks);
}

#[test]
fn bad_user_config_is_an_error() {
    let cfg_dir = tempfile::tempdir().unwrap();
    fs::write(cfg_dir.path().join("sigil.local"), "[scanner]\nmin_severity = \"loud\"\n").unwrap();
    assert!(Config::load(cfg_dir.path()).is_err());
}
