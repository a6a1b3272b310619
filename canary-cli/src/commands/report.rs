//! Console session reporting

use canary_engine::case::StatusName;
use canary_engine::{Catalog, EngineResult, Reporter};

/// The built-in console reporter
pub struct ConsoleReporter;

impl Reporter for ConsoleReporter {
    fn name(&self) -> &'static str {
        "console"
    }

    fn report(&self, catalog: &Catalog) -> EngineResult<()> {
        print_summary(catalog);
        Ok(())
    }
}

/// Print a one-line-per-status summary, then the cases that need
/// attention
pub fn print_summary(catalog: &Catalog) {
    let mut counts: Vec<(StatusName, usize)> = Vec::new();
    for case in catalog.active() {
        match counts.iter_mut().find(|(name, _)| *name == case.status.name) {
            Some((_, n)) => *n += 1,
            None => counts.push((case.status.name, 1)),
        }
    }
    let total: usize = counts.iter().map(|(_, n)| n).sum();
    let parts: Vec<String> = counts
        .iter()
        .map(|(name, n)| format!("{} {}", n, name.label()))
        .collect();
    println!("{} test cases: {}", total, parts.join(", "));

    for case in catalog.active() {
        let bad = matches!(
            case.status.name,
            StatusName::Fail
                | StatusName::Diff
                | StatusName::Timeout
                | StatusName::NotRun
                | StatusName::Cancelled
        );
        if !bad {
            continue;
        }
        let reason = case
            .status
            .message
            .clone()
            .unwrap_or_default();
        if reason.is_empty() {
            println!("  {:<9} {}", case.status.name.label(), case.display_name());
        } else {
            println!(
                "  {:<9} {} ({})",
                case.status.name.label(),
                case.display_name(),
                reason
            );
        }
    }
}

/// Print the full status table
pub fn print_status(catalog: &Catalog) {
    for case in catalog.active() {
        let duration = match (case.start, case.stop) {
            (Some(start), Some(stop)) => {
                format!("{:8.2}s", (stop - start).num_milliseconds() as f64 / 1000.0)
            }
            _ => format!("{:>9}", "-"),
        };
        println!(
            "{:<9} {} {}",
            case.status.name.label(),
            duration,
            case.display_name()
        );
    }
}
