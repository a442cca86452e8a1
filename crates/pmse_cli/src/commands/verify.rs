//! Verify command implementation.
//!
//! Every pool is copied into memory and repaired there, so the files on
//! disk are never modified. Anything the repair pass would change is
//! reported as a problem.

use super::open_metadata;
use pmse_core::{
    repair_identlist, repair_pool, Config, IdentList, Pool, RepairReport, COLLECTION_LAYOUT,
};
use pmse_storage::InMemoryBackend;
use std::fs;
use std::path::Path;

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Number of pools checked.
    pub pools_checked: usize,
    /// Number of pools needing no repair.
    pub valid_pools: usize,
    /// Combined repair report.
    pub report: RepairReport,
    /// List of errors found.
    pub errors: Vec<String>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        self.errors.is_empty() && self.report.is_clean()
    }

    fn add(&mut self, what: &str, report: RepairReport) {
        self.pools_checked += 1;
        if report.is_clean() {
            self.valid_pools += 1;
        } else {
            for finding in &report.findings {
                self.errors.push(format!("{what}: {finding}"));
            }
            if report.reclaimed_blocks > 0 {
                self.errors.push(format!(
                    "{what}: {} unreachable blocks",
                    report.reclaimed_blocks
                ));
            }
        }
        self.report.merge(report);
    }
}

/// Runs the verify command.
pub fn run(path: &Path, metadata_only: bool) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying data directory at {:?}", path);
    println!();

    let (dir, list) = open_metadata(path)?;
    let clean = list.is_after_safe_shutdown()?;
    list.close()?;
    drop(list);

    let mut result = VerifyResult::default();
    if !clean {
        println!("Note: the last session did not shut down cleanly");
    }

    println!("Checking metadata pool...");
    let copy = InMemoryBackend::with_data(fs::read(dir.identlist_path())?);
    let list = IdentList::open_in(Box::new(copy))?;
    let (entries, report) = repair_identlist(&list)?;
    result.add("metadata", report);

    if !metadata_only {
        let config = Config::default();
        for (ident, _) in entries.iter().filter(|(_, ns)| !ns.is_empty()) {
            println!("Checking collection {ident}...");
            let pool_path = dir.pool_path(ident)?;
            let bytes = match fs::read(&pool_path) {
                Ok(bytes) => bytes,
                Err(e) => {
                    result.errors.push(format!("{ident}: cannot read pool file: {e}"));
                    continue;
                }
            };
            let checked = Pool::open_in(Box::new(InMemoryBackend::with_data(bytes)), COLLECTION_LAYOUT)
                .and_then(|pool| repair_pool(&pool, &config));
            match checked {
                Ok(report) => result.add(ident, report),
                Err(e) => result.errors.push(format!("{ident}: {e}")),
            }
        }

        for ident in dir.pool_files()? {
            if !entries.iter().any(|(listed, _)| *listed == ident) {
                result.errors.push(format!("{ident}: pool file is not listed"));
            }
        }
    }

    print_result(&result);
    println!();
    if result.is_ok() {
        println!("✓ Verification passed");
        Ok(())
    } else {
        println!("✗ Verification failed");
        Err("Verification failed".into())
    }
}

fn print_result(result: &VerifyResult) {
    println!();
    println!("Results:");
    println!("  Pools checked:  {}", result.pools_checked);
    println!("  Valid pools:    {}", result.valid_pools);
    println!("  Records:        {}", result.report.entries);
    println!("  Index entries:  {}", result.report.index_entries);

    if !result.errors.is_empty() {
        println!("  Errors:");
        for error in result.errors.iter().take(10) {
            println!("    - {}", error);
        }
        if result.errors.len() > 10 {
            println!("    ... and {} more", result.errors.len() - 10);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_collects_findings() {
        let mut result = VerifyResult::default();
        result.add("a", RepairReport::default());
        assert!(result.is_ok());

        let mut dirty = RepairReport::default();
        dirty.findings.push("chain cut".into());
        dirty.reclaimed_blocks = 2;
        result.add("b", dirty);
        assert!(!result.is_ok());
        assert_eq!(result.pools_checked, 2);
        assert_eq!(result.valid_pools, 1);
        assert_eq!(result.errors.len(), 2);
    }
}
