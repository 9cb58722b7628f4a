//! Conjunctive tag queries
//!
//! A query is a set of tag bodies that must all be present, plus
//! pagination and a sort order. Execution intersects the shard index in
//! ascending-cardinality order (the smallest set seeds the scan), so the
//! cost is driven by the rarest tag.

use entitydb_core::{Error, Result, TagBody};

/// Result ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    /// Ids ascending (the natural index order)
    #[default]
    IdAscending,
    /// Ids descending
    IdDescending,
    /// Most recently updated first; costs one block read per candidate
    UpdatedDescending,
}

/// A conjunctive tag filter with pagination
#[derive(Debug, Clone, Default)]
pub struct Query {
    /// Tag bodies that must all be present
    pub tags: Vec<String>,
    /// Skip this many results
    pub offset: usize,
    /// Cap the result count
    pub limit: Option<usize>,
    /// Result ordering
    pub sort: SortOrder,
}

impl Query {
    /// A query over the given tag bodies
    pub fn with_tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Query {
            tags: tags.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Set the offset
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Set the limit
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set the sort order
    pub fn sort(mut self, sort: SortOrder) -> Self {
        self.sort = sort;
        self
    }

    /// Validate the filter, returning the checked bodies
    pub fn validated_bodies(&self) -> Result<Vec<TagBody>> {
        if self.tags.is_empty() {
            return Err(Error::invalid_filter("query needs at least one tag"));
        }
        self.tags
            .iter()
            .map(|raw| {
                TagBody::new(raw.clone())
                    .map_err(|e| Error::invalid_filter(format!("tag {:?}: {}", raw, e)))
            })
            .collect()
    }
}
