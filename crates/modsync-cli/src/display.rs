//! Console output for plans, scans and reports

use console::style;
use modsync_sync::{
    format_bytes, format_duration, format_speed, pluralize, ScanOutcome, SyncOutcome, SyncPlan,
    SyncReport,
};
use std::path::Path;

/// Summarize what a run is about to do
pub fn display_plan(plan: &SyncPlan, base: &Path) {
    let downloads = plan.downloads();
    let deletions = plan.deletions();
    if downloads.is_empty() && deletions.is_empty() {
        println!("{} No files to download or delete.", style("✓").green());
        return;
    }

    let mut parts = Vec::new();
    if !downloads.is_empty() {
        parts.push(format!(
            "{} to download ({})",
            style(pluralize(downloads.len(), "file")).cyan(),
            style(format_bytes(plan.diff().download_bytes())).cyan()
        ));
    }
    if !deletions.is_empty() {
        parts.push(format!("{} to delete", style(pluralize(deletions.len(), "file")).cyan()));
    }
    println!("{} {}.", style("→").green().bold(), parts.join(" and "));

    for (pack, totals) in plan.pack_totals() {
        println!(
            "  - {}: {} ({})",
            style(pack).magenta(),
            style(pluralize(totals.files, "file")).cyan(),
            style(format_bytes(totals.bytes)).cyan()
        );
    }

    if plan.is_partial_scan() && !plan.diff().to_delete.is_empty() {
        display_warning(&format!(
            "The scan was incomplete, so {} will be kept.",
            pluralize(plan.diff().to_delete.len(), "extra file")
        ));
    }
    if tracing::enabled!(tracing::Level::DEBUG) {
        for path in deletions {
            println!("  {} {}", style("-").red(), relative(path, base));
        }
    }
}

/// Print the result of `modsync scan`
pub fn display_scan(outcome: &ScanOutcome) {
    println!();
    println!("{}", style("Scan Results:").bold().underlined());
    println!("  Files: {}", style(outcome.index.len()).green());
    println!("  Size: {}", style(format_bytes(outcome.total_bytes())).green());
    println!(
        "  Directories listed: {}",
        style(outcome.stats.directories_listed).green()
    );
    if outcome.stats.recovered_listings > 0 {
        println!(
            "  Recovered listings: {}",
            style(outcome.stats.recovered_listings).yellow()
        );
    }
    println!("  Duration: {}", style(format_duration(outcome.elapsed)).blue());
    for fault in &outcome.faults {
        display_error(&fault.to_string());
    }
}

/// Print the end-of-run summary
pub fn display_report(report: &SyncReport) {
    println!();
    println!("{}", style("Sync Summary:").bold().underlined());
    println!(
        "  Started: {}",
        style(report.started_at.format("%Y-%m-%d %H:%M:%S")).dim()
    );
    if report.dry_run {
        println!("  {}", style("Dry run, nothing was changed").yellow());
        println!("  Would download: {}", style(pluralize(report.files_planned, "file")).cyan());
        println!("  Would delete: {}", style(pluralize(report.deletions_planned, "file")).cyan());
    } else {
        println!(
            "  Downloaded: {} ({})",
            style(pluralize(report.files_downloaded, "file")).green(),
            style(format_bytes(report.bytes_downloaded)).green()
        );
        for (pack, bytes) in &report.pack_bytes {
            println!("    - {}: {}", style(pack).magenta(), format_bytes(*bytes));
        }
        println!("  Deleted: {}", style(pluralize(report.files_deleted, "file")).green());
    }
    println!("  Up to date: {}", style(pluralize(report.files_up_to_date, "file")).green());
    if report.files_failed > 0 {
        println!("  Failed: {}", style(pluralize(report.files_failed, "file")).red());
    }
    if report.files_cancelled > 0 {
        println!("  Cancelled: {}", style(pluralize(report.files_cancelled, "file")).yellow());
    }
    println!("  Duration: {}", style(format_duration(report.elapsed)).blue());
    if report.bytes_downloaded > 0 {
        println!("  Average speed: {}", style(format_speed(report.average_speed)).blue());
    }

    if let Some(fault) = &report.fault {
        for error in fault.faults() {
            display_error(&error.to_string());
        }
    }

    let verdict = match report.outcome {
        SyncOutcome::Completed => style("Sync completed").green().bold(),
        SyncOutcome::PartialSuccess => {
            style("Sync partially completed; see the log for details")
                .yellow()
                .bold()
        }
        SyncOutcome::Cancelled => style("Sync was cancelled").yellow().bold(),
        SyncOutcome::Failed => style("Sync failed").red().bold(),
    };
    println!();
    println!("{verdict}");
}

/// Print a warning line
pub fn display_warning(message: &str) {
    eprintln!("{} {}", style("⚠").yellow().bold(), style(message).yellow());
}

/// Print an error line
pub fn display_error(message: &str) {
    eprintln!("{} {}", style("✗").red().bold(), style(message).red());
}

fn relative(path: &Path, base: &Path) -> String {
    path.strip_prefix(base).unwrap_or(path).display().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_falls_back_to_full_path() {
        assert_eq!(
            relative(Path::new("/g/mods/a"), Path::new("/g")),
            Path::new("mods/a").display().to_string()
        );
        assert_eq!(relative(Path::new("/x/a"), Path::new("/g")), "/x/a");
    }
}
