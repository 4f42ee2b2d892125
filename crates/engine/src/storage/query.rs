//! Pagination for list reads.

use serde::{Deserialize, Serialize};

/// Pagination parameters for list queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Maximum number of items to return.
    pub limit: u32,
    /// Offset for pagination (0-based).
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

impl Pagination {
    pub const MAX_LIMIT: u32 = 1000;

    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(50).min(Self::MAX_LIMIT),
            offset: offset.unwrap_or(0),
        }
    }
}

/// One page of a list query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Number of items matching the query across all pages.
    pub total: u64,
    pub pagination: Pagination,
    pub has_more: bool,
}

impl<T> Page<T> {
    /// Cut a page out of an already filtered and ordered sequence.
    pub fn paginate(items: impl IntoIterator<Item = T>, pagination: Pagination) -> Self {
        let all: Vec<T> = items.into_iter().collect();
        let total = all.len() as u64;
        let limit = pagination.limit.min(Pagination::MAX_LIMIT) as usize;
        let items: Vec<T> = all
            .into_iter()
            .skip(pagination.offset as usize)
            .take(limit)
            .collect();
        let has_more = (pagination.offset as u64) + (items.len() as u64) < total;

        Self {
            items,
            total,
            pagination,
            has_more,
        }
    }
}
