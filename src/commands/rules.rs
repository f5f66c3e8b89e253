use crate::errors::SigilResult;
use crate::patterns::{PatternLibrary, RuleKind, Severity};
use console::style;

pub fn handle(verbose: bool) -> SigilResult<()> {
    let library = PatternLibrary::load(&[], Severity::Info)?;
    println!("{}", style("Built-in rules").blue().bold().underlined());

    for rule in library.iter() {
        let kind = match rule.kind {
            RuleKind::Structural => "structural",
            RuleKind::Taint(_) => "taint",
        };
        println!(
            "  {:24} [{}]  {}",
            style(rule.id).white().bold(),
            rule.severity,
            style(kind).dim()
        );

        if verbose {
            println!("    {:10} {}", style("Type"), rule.bug_type);
            if let Some(cwe) = rule.cwe {
                println!("    {:10} CWE-{cwe}", style("CWE"));
            }
            println!("    {:10} {:?}", style("Confidence"), rule.confidence);
            println!("    {:10} {}", style("About"), rule.description);
            if let Some(req) = rule.taint() {
                println!("    {:10} {}", style("Sources"), req.sources.describe());
            }
            println!(
                "    {:10} {}",
                style("Reference"),
                style(format!("{}#{}", rule.reference, rule.bug_type)).underlined()
            );
        }
    }
    Ok(())
}
