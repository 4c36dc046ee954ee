//! # Search Query
//!
//! Parameters that select a slice of the aggregator's catalog. A query is
//! immutable for the lifetime of one crawl run; the page number travels
//! separately so the same query value can describe every listing page.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of listing items the aggregator renders per page.
pub const DEFAULT_PAGE_SIZE: u32 = 24;

/// Opaque product identifier (`uniqueID` on the source).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ItemId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for ItemId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

impl SortDirection {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        }
    }
}

/// Listing order, e.g. `popularity/desc` or `price/asc`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortSpec {
    pub kind: String,
    pub direction: SortDirection,
}

impl Default for SortSpec {
    fn default() -> Self {
        Self {
            kind: "popularity".to_string(),
            direction: SortDirection::Desc,
        }
    }
}

/// Crawl-wide listing parameters.
///
/// Empty strings and empty lists mean "no constraint" and are left out of
/// the navigation URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchQuery {
    pub free_text: String,
    pub category: String,
    pub subcategories: Vec<String>,
    pub sources: Vec<String>,
    pub sort: SortSpec,
    pub page_size: u32,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            free_text: String::new(),
            category: String::new(),
            subcategories: Vec::new(),
            sources: Vec::new(),
            sort: SortSpec::default(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl SearchQuery {
    #[must_use]
    pub fn new(free_text: impl Into<String>) -> Self {
        Self {
            free_text: free_text.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    #[must_use]
    pub fn with_subcategories<I, S>(mut self, subcategories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subcategories = subcategories.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_sources<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sources = sources.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_sort(mut self, kind: impl Into<String>, direction: SortDirection) -> Self {
        self.sort = SortSpec {
            kind: kind.into(),
            direction,
        };
        self
    }

    /// Zero is clamped to 1 so termination on short pages stays well defined.
    #[must_use]
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }
}
