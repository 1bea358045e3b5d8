//! Storage types shared by all backends.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use teamsync_core::{ReconcilerName, Slug};
use time::OffsetDateTime;

/// Opaque per-(reconciler, team) state as persisted by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcilerStateRecord {
    pub reconciler: ReconcilerName,
    pub team: Slug,
    /// Version of the payload schema, owned by the reconciler.
    pub schema_version: u32,
    pub payload: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// One page of a paginated read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Total number of matching items across all pages.
    pub total: u64,
    pub limit: usize,
    pub offset: usize,
}

impl<T> Page<T> {
    /// Builds a page from a complete, already ordered result set.
    #[must_use]
    pub fn from_ordered(all: Vec<T>, limit: usize, offset: usize) -> Self {
        let total = all.len() as u64;
        let items = all.into_iter().skip(offset).take(limit).collect();
        Self {
            items,
            total,
            limit,
            offset,
        }
    }

    /// Returns `true` if more items exist beyond this page.
    #[must_use]
    pub fn has_more(&self) -> bool {
        ((self.offset + self.items.len()) as u64) < self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_from_ordered() {
        let page = Page::from_ordered((0..10).collect(), 3, 6);
        assert_eq!(page.items, vec![6, 7, 8]);
        assert_eq!(page.total, 10);
        assert!(page.has_more());

        let last = Page::from_ordered((0..10).collect::<Vec<_>>(), 3, 9);
        assert_eq!(last.items, vec![9]);
        assert!(!last.has_more());
    }
}
