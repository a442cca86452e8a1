//! Inspect command implementation.

use super::open_metadata;
use pmse_core::{PoolHandle, PoolStats};
use serde::Serialize;
use std::path::Path;

/// Data directory inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Data directory path.
    pub path: String,
    /// Whether the last session closed cleanly.
    pub clean_shutdown: bool,
    /// Number of listed identifiers.
    pub ident_count: usize,
    /// Listed collections.
    pub collections: Vec<CollectionStats>,
    /// Pool files no identifier lists.
    pub unlisted_pools: Vec<String>,
}

/// Statistics for a single collection.
#[derive(Debug, Serialize)]
pub struct CollectionStats {
    /// Collection identifier.
    pub ident: String,
    /// Collection namespace.
    pub namespace: String,
    /// Number of records.
    pub record_count: u64,
    /// Total payload bytes.
    pub data_size: u64,
    /// Indexes in the collection's pool.
    pub indexes: Vec<IndexStats>,
    /// Pool usage (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolUsage>,
    /// Why the pool could not be read.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Statistics for a single index.
#[derive(Debug, Serialize)]
pub struct IndexStats {
    /// Index identifier.
    pub ident: String,
    /// Number of entries.
    pub entry_count: u64,
    /// Comparator name.
    pub comparator: String,
    /// Whether keys are unique.
    pub unique: bool,
}

/// Heap usage of one pool.
#[derive(Debug, Serialize)]
pub struct PoolUsage {
    /// Total pool size in bytes.
    pub capacity: u64,
    /// Redo log size in bytes.
    pub log_capacity: u64,
    /// Heap bytes carved into blocks.
    pub heap_used: u64,
    /// Heap bytes never carved.
    pub heap_remaining: u64,
    /// Free blocks available for reuse.
    pub free_blocks: usize,
    /// Payload bytes in free blocks.
    pub free_bytes: u64,
}

impl From<PoolStats> for PoolUsage {
    fn from(stats: PoolStats) -> Self {
        Self {
            capacity: stats.capacity,
            log_capacity: stats.log_capacity,
            heap_used: stats.heap_used,
            heap_remaining: stats.heap_remaining,
            free_blocks: stats.free_blocks,
            free_bytes: stats.free_bytes,
        }
    }
}

/// Runs the inspect command.
pub fn run(path: &Path, show_pools: bool, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let (dir, list) = open_metadata(path)?;
    let entries = list.entries()?;

    let mut result = InspectResult {
        path: path.display().to_string(),
        clean_shutdown: list.is_after_safe_shutdown()?,
        ident_count: entries.len(),
        collections: Vec::new(),
        unlisted_pools: Vec::new(),
    };

    for (ident, ns) in entries.iter().filter(|(_, ns)| !ns.is_empty()) {
        result.collections.push(inspect_collection(&dir.pool_path(ident)?, ident, ns, show_pools));
    }
    for ident in dir.pool_files()? {
        if !entries.iter().any(|(listed, _)| *listed == ident) {
            result.unlisted_pools.push(ident);
        }
    }
    list.close()?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_text(&result),
    }
    Ok(())
}

fn inspect_collection(path: &Path, ident: &str, ns: &str, show_pool: bool) -> CollectionStats {
    let mut stats = CollectionStats {
        ident: ident.to_string(),
        namespace: ns.to_string(),
        record_count: 0,
        data_size: 0,
        indexes: Vec::new(),
        pool: None,
        error: None,
    };

    let handle = match PoolHandle::open(path, ident) {
        Ok(handle) => handle,
        Err(e) => {
            stats.error = Some(e.to_string());
            return stats;
        }
    };
    stats.record_count = handle.map().len();
    stats.data_size = handle.map().data_size();
    if show_pool {
        stats.pool = handle.pool().stats().ok().map(PoolUsage::from);
    }

    match handle.index_names() {
        Ok(names) => {
            for name in names {
                match handle.tree_info(&name) {
                    Ok(info) => stats.indexes.push(IndexStats {
                        ident: name,
                        entry_count: info.entries,
                        comparator: info.comparator,
                        unique: info.unique,
                    }),
                    Err(e) => stats.error = Some(format!("index {name}: {e}")),
                }
            }
        }
        Err(e) => stats.error = Some(e.to_string()),
    }

    handle.release();
    stats
}

fn print_text(result: &InspectResult) {
    println!("pmse data directory: {}", result.path);
    println!("========================================");
    println!(
        "Last shutdown:    {}",
        if result.clean_shutdown { "clean" } else { "UNCLEAN" }
    );
    println!("Identifiers:      {}", result.ident_count);
    println!("Collections:      {}", result.collections.len());

    for c in &result.collections {
        println!();
        println!("Collection {} ({})", c.ident, c.namespace);
        if let Some(error) = &c.error {
            println!("  error: {error}");
        }
        println!("  records:        {}", c.record_count);
        println!("  data size:      {}", format_bytes(c.data_size));
        if let Some(pool) = &c.pool {
            println!("  pool capacity:  {}", format_bytes(pool.capacity));
            println!("  redo log:       {}", format_bytes(pool.log_capacity));
            println!("  heap used:      {}", format_bytes(pool.heap_used));
            println!("  heap remaining: {}", format_bytes(pool.heap_remaining));
            println!(
                "  free blocks:    {} ({})",
                pool.free_blocks,
                format_bytes(pool.free_bytes)
            );
        }
        for index in &c.indexes {
            println!(
                "  index {}: {} entries, {}{}",
                index.ident,
                index.entry_count,
                index.comparator,
                if index.unique { ", unique" } else { "" }
            );
        }
    }

    if !result.unlisted_pools.is_empty() {
        println!();
        println!("Unlisted pool files: {}", result.unlisted_pools.join(", "));
    }
}

/// Formats bytes as human-readable string.
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_bytes_units() {
        assert_eq!(format_bytes(512), "512 bytes");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(8 * 1024 * 1024), "8.00 MB");
    }
}
