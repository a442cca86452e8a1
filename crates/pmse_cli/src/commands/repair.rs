//! Repair command implementation.
//!
//! Runs the same repair pass the engine runs after an unclean shutdown,
//! against the files in place. The clean shutdown flag is left alone so the
//! next engine open still decides for itself.

use super::open_metadata;
use pmse_core::{repair_pool, Config, Pool, RepairReport, COLLECTION_LAYOUT};
use std::path::Path;

/// Runs the repair command.
pub fn run(
    path: &Path,
    remove_orphans: bool,
    dry_run: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if dry_run {
        println!("Dry run: checking without writing");
        return super::verify::run(path, false);
    }

    println!("Repairing data directory at {:?}", path);
    println!();

    let (dir, list) = open_metadata(path)?;
    let (entries, mut total) = pmse_core::repair_identlist(&list)?;
    print_report("metadata", &total);

    let config = Config::default();
    for (ident, _) in entries.iter().filter(|(_, ns)| !ns.is_empty()) {
        let pool_path = dir.pool_path(ident)?;
        if !pool_path.exists() {
            total.finding(format!("{ident}: pool file is missing"));
            println!("  {ident}: pool file is missing");
            continue;
        }
        let pool = Pool::open(&pool_path, COLLECTION_LAYOUT)?;
        let report = repair_pool(&pool, &config);
        pool.close()?;
        let report = report?;
        print_report(ident, &report);
        total.merge(report);
    }

    for ident in dir.pool_files()? {
        if entries.iter().any(|(listed, _)| *listed == ident) {
            continue;
        }
        if remove_orphans {
            dir.remove_pool(&ident)?;
            total.finding(format!("{ident}: unlisted pool file removed"));
            println!("  {ident}: unlisted pool file removed");
        } else {
            println!("  {ident}: unlisted pool file kept (use --remove-orphans)");
        }
    }
    list.close()?;

    println!();
    println!("{total}");
    if total.is_clean() {
        println!("✓ Nothing to repair");
    } else {
        println!("✓ Repair complete");
    }
    Ok(())
}

fn print_report(what: &str, report: &RepairReport) {
    if report.is_clean() {
        println!("  {what}: ok");
        return;
    }
    println!("  {what}: {} blocks reclaimed", report.reclaimed_blocks);
    for finding in &report.findings {
        println!("    - {finding}");
    }
}
