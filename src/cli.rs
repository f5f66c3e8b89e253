use crate::patterns::Severity;
use crate::utils::OutputFormat;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "sigil")]
#[command(about = "A pattern-based static bug detector for JVM method listings")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub(crate) command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Scan IR listings for defect patterns
    Scan {
        /// File or directory to scan (defaults to current directory)
        #[arg(default_value = ".")]
        path: String,

        /// Output format (defaults to the configured one)
        #[arg(short, long, value_enum)]
        format: Option<OutputFormat>,

        /// Only load rules at or above this severity
        #[arg(long)]
        min_severity: Option<Severity>,

        /// Run only this rule (repeatable)
        #[arg(long = "rule", value_name = "ID")]
        rule: Vec<String>,

        /// Maximum visits of one data-flow node during taint propagation
        #[arg(long, value_name = "N")]
        taint_cap: Option<usize>,
    },

    /// List the built-in rules
    Rules {
        /// Show detailed information
        #[arg(short, long)]
        verbose: bool,
    },
}

#[test]
fn scan_flags_parse() {
    let cli = Cli::try_parse_from([
        "sigil", "scan", "out/ir", "--format", "json", "--min-severity", "security-high",
        "--rule", "sql-injection", "--rule", "insecure-cipher-mode", "--taint-cap", "10",
    ])
    .unwrap();

    match cli.command {
        Commands::Scan { path, format, min_severity, rule, taint_cap } => {
            assert_eq!(path, "out/ir");
            assert_eq!(format, Some(OutputFormat::Json));
            assert_eq!(min_severity, Some(Severity::SecurityHigh));
            assert_eq!(rule, vec!["sql-injection", "insecure-cipher-mode"]);
            assert_eq!(taint_cap, Some(10));
        }
        Commands::Rules { .. } => panic!("expected scan"),
    }

    assert!(Cli::try_parse_from(["sigil", "scan", "--min-severity", "loud"]).is_err());
}
