//! Engine configuration.

use crate::map::DEFAULT_BUCKETS;
use crate::pool::MIN_POOL_SIZE;
use crate::tree::KeyComparator;
use std::fmt;
use std::sync::Arc;

/// Configuration for opening an engine.
#[derive(Clone)]
pub struct Config {
    /// Whether to create the data directory and metadata pool if missing.
    pub create_if_missing: bool,

    /// Capacity of the metadata (ident list) pool.
    pub identlist_pool_size: u64,

    /// Capacity of a regular collection pool.
    pub collection_pool_size: u64,

    /// Capacity of a system collection pool (`admin.*`, `local.*`, ...).
    pub system_collection_pool_size: u64,

    /// Hash buckets of a new collection's record map.
    pub map_buckets: u32,

    /// Permission bits of new pool files.
    pub file_mode: u32,

    /// Extra key comparators, resolved by name when indexes are repaired.
    pub comparators: Vec<Arc<dyn KeyComparator>>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("create_if_missing", &self.create_if_missing)
            .field("identlist_pool_size", &self.identlist_pool_size)
            .field("collection_pool_size", &self.collection_pool_size)
            .field("system_collection_pool_size", &self.system_collection_pool_size)
            .field("map_buckets", &self.map_buckets)
            .field("file_mode", &format_args!("{:o}", self.file_mode))
            .field(
                "comparators",
                &self.comparators.iter().map(|c| c.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            identlist_pool_size: 4 * MIN_POOL_SIZE,
            collection_pool_size: 200 * MIN_POOL_SIZE,
            system_collection_pool_size: 4 * MIN_POOL_SIZE,
            map_buckets: DEFAULT_BUCKETS,
            file_mode: 0o664,
            comparators: Vec::new(),
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the data directory if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets the metadata pool capacity.
    #[must_use]
    pub const fn identlist_pool_size(mut self, size: u64) -> Self {
        self.identlist_pool_size = size;
        self
    }

    /// Sets the capacity of regular collection pools.
    #[must_use]
    pub const fn collection_pool_size(mut self, size: u64) -> Self {
        self.collection_pool_size = size;
        self
    }

    /// Sets the capacity of system collection pools.
    #[must_use]
    pub const fn system_collection_pool_size(mut self, size: u64) -> Self {
        self.system_collection_pool_size = size;
        self
    }

    /// Sets the bucket count of new record maps.
    #[must_use]
    pub const fn map_buckets(mut self, buckets: u32) -> Self {
        self.map_buckets = buckets;
        self
    }

    /// Sets the permission bits of new pool files.
    #[must_use]
    pub const fn file_mode(mut self, mode: u32) -> Self {
        self.file_mode = mode;
        self
    }

    /// Registers a custom comparator.
    #[must_use]
    pub fn comparator(mut self, comparator: Arc<dyn KeyComparator>) -> Self {
        self.comparators.push(comparator);
        self
    }

    /// Looks up a comparator by name, built-ins first.
    #[must_use]
    pub fn resolve_comparator(&self, name: &str) -> Option<Arc<dyn KeyComparator>> {
        crate::tree::builtin_comparator(name).or_else(|| {
            self.comparators
                .iter()
                .find(|c| c.name() == name)
                .map(Arc::clone)
        })
    }

    /// Pool capacity for a collection in namespace `ns`.
    #[must_use]
    pub fn pool_size_for(&self, ns: &str) -> u64 {
        if is_system_namespace(ns) {
            self.system_collection_pool_size
        } else {
            self.collection_pool_size
        }
    }
}

/// Returns true for namespaces of system collections.
#[must_use]
pub fn is_system_namespace(ns: &str) -> bool {
    ns.starts_with("admin.")
        || ns.starts_with("local.")
        || ns.starts_with("config.")
        || ns.contains(".system.")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    struct LengthFirst;

    impl KeyComparator for LengthFirst {
        fn name(&self) -> &str {
            "test.length_first"
        }

        fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
            a.len().cmp(&b.len()).then_with(|| a.cmp(b))
        }
    }

    #[test]
    fn default_config() {
        let config = Config::default();
        assert!(config.create_if_missing);
        assert_eq!(config.collection_pool_size, 200 * MIN_POOL_SIZE);
        assert_eq!(config.file_mode, 0o664);
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .create_if_missing(false)
            .map_buckets(64)
            .collection_pool_size(MIN_POOL_SIZE);

        assert!(!config.create_if_missing);
        assert_eq!(config.map_buckets, 64);
        assert_eq!(config.pool_size_for("db.users"), MIN_POOL_SIZE);
        assert_eq!(config.pool_size_for("admin.users"), 4 * MIN_POOL_SIZE);
    }

    #[test]
    fn system_namespaces() {
        assert!(is_system_namespace("admin.system.users"));
        assert!(is_system_namespace("local.oplog"));
        assert!(is_system_namespace("config.settings"));
        assert!(is_system_namespace("db.system.indexes"));
        assert!(!is_system_namespace("db.users"));
        assert!(!is_system_namespace("administrator.x"));
    }

    #[test]
    fn comparators_resolve() {
        let config = Config::new().comparator(Arc::new(LengthFirst));
        assert!(config.resolve_comparator("pmse.bytewise").is_some());
        assert!(config.resolve_comparator("test.length_first").is_some());
        assert!(config.resolve_comparator("missing").is_none());
    }
}
