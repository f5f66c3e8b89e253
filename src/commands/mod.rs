pub mod rules;
pub mod scan;

use crate::cli::Commands;
use crate::errors::SigilResult;
use crate::utils::Config;

pub fn handle_command(command: Commands, config: &mut Config) -> SigilResult<()> {
    match command {
        Commands::Scan {
            path,
            format,
            min_severity,
            rule,
            taint_cap,
        } => {
            if let Some(sev) = min_severity {
                config.scanner.min_severity = sev;
            }

            if !rule.is_empty() {
                config.scanner.enabled_rules = rule;
            }

            if let Some(cap) = taint_cap {
                config.scanner.taint_iteration_cap = cap;
            }

            scan::handle(&path, format, config)
        }
        Commands::Rules { verbose } => rules::handle(verbose),
    }
}
