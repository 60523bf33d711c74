use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_PAGE_LIMIT: usize = 100;
pub const DEFAULT_MAX_PAGE_LIMIT: usize = 1000;
pub const DEFAULT_MAX_INDEXES_PER_MONIKER_SEARCH: usize = 500;
pub const DEFAULT_BULK_LOOKUP_CEILING: usize = 10_000;
pub const DEFAULT_UPLOAD_CACHE_CAPACITY: usize = 10_000;

/// Tuning knobs of [`crate::service::CodeNavService`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeNavConfig {
    /// Page size used when a request asks for zero locations.
    pub default_page_limit: usize,
    pub max_page_limit: usize,
    /// Upload batch size of the referencing-upload search.
    pub max_indexes_per_moniker_search: usize,
    /// Limit handed to every bulk moniker lookup.
    pub bulk_lookup_ceiling: usize,
    pub upload_cache_capacity: usize,
    pub request_timeout: Option<Duration>,
}

impl Default for CodeNavConfig {
    fn default() -> Self {
        Self {
            default_page_limit: DEFAULT_PAGE_LIMIT,
            max_page_limit: DEFAULT_MAX_PAGE_LIMIT,
            max_indexes_per_moniker_search: DEFAULT_MAX_INDEXES_PER_MONIKER_SEARCH,
            bulk_lookup_ceiling: DEFAULT_BULK_LOOKUP_CEILING,
            upload_cache_capacity: DEFAULT_UPLOAD_CACHE_CAPACITY,
            request_timeout: None,
        }
    }
}

impl CodeNavConfig {
    /// Clamps a requested page size into `1..=max_page_limit`.
    pub fn page_limit(&self, requested: usize) -> usize {
        let limit = if requested == 0 {
            self.default_page_limit
        } else {
            requested
        };
        limit.clamp(1, self.max_page_limit.max(1))
    }
}
