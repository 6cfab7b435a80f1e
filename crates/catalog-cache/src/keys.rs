//! Cache key derivation.
//!
//! ## Key Format
//!
//! ```text
//! {namespace}:{version}:item:{id}
//! {namespace}:{version}:tags:{id}
//! {namespace}:{version}:list:limit={l}:offset={o}:sort={s}:name={n}
//! lock:{cache key}
//! ```
//!
//! Keys are pure functions of their inputs. List parameters are normalized
//! before encoding so that the same logical query never lands on two keys.
//! Bumping `version` retires every old entry: nothing constructs old-version
//! keys any more, so they are never read and expire on their own.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Prefix of every lock key.
pub const LOCK_PREFIX: &str = "lock:";

/// Default page size for list queries.
pub const DEFAULT_LIMIT: u32 = 20;

/// Largest page size a list query may ask for.
pub const MAX_LIMIT: u32 = 100;

/// A derived cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Wrap an already-derived key string.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The lock key guarding origin fetches for this key.
    pub fn lock_key(&self) -> String {
        lock_key(&self.0)
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Lock key for a cache key string. One lock key per cache key.
#[inline]
pub fn lock_key(key: &str) -> String {
    format!("{LOCK_PREFIX}{key}")
}

/// Sort orders accepted by list queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    CreatedAtAsc,
    #[default]
    CreatedAtDesc,
    NameAsc,
    NameDesc,
    PriceAsc,
    PriceDesc,
}

impl SortOrder {
    pub const ALL: [SortOrder; 6] = [
        SortOrder::CreatedAtAsc,
        SortOrder::CreatedAtDesc,
        SortOrder::NameAsc,
        SortOrder::NameDesc,
        SortOrder::PriceAsc,
        SortOrder::PriceDesc,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::CreatedAtAsc => "created_at_asc",
            SortOrder::CreatedAtDesc => "created_at_desc",
            SortOrder::NameAsc => "name_asc",
            SortOrder::NameDesc => "name_desc",
            SortOrder::PriceAsc => "price_asc",
            SortOrder::PriceDesc => "price_desc",
        }
    }
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SortOrder {
    type Err = ListParamsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SortOrder::ALL
            .into_iter()
            .find(|order| order.as_str() == s)
            .ok_or_else(|| ListParamsError::UnknownSort(s.to_string()))
    }
}

/// Invalid list query parameters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ListParamsError {
    #[error("limit must be between 1 and 100, got {0}")]
    LimitOutOfRange(u32),
    #[error("unknown sort order `{0}`")]
    UnknownSort(String),
}

/// Parameters of a paginated list query.
///
/// Construct through [`ListParams::new`] (or `Default`) so the filter is
/// normalized: surrounding whitespace is dropped, the name is lowercased
/// because the origin matches names case-insensitively, and an empty filter
/// becomes `None`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListParams {
    pub limit: u32,
    pub offset: u64,
    pub sort: SortOrder,
    pub name: Option<String>,
}

impl Default for ListParams {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            offset: 0,
            sort: SortOrder::default(),
            name: None,
        }
    }
}

impl ListParams {
    pub fn new(
        limit: u32,
        offset: u64,
        sort: SortOrder,
        name: Option<&str>,
    ) -> Result<Self, ListParamsError> {
        if limit == 0 || limit > MAX_LIMIT {
            return Err(ListParamsError::LimitOutOfRange(limit));
        }
        Ok(Self {
            limit,
            offset,
            sort,
            name: normalize_name(name),
        })
    }

    /// Canonical `limit=..:offset=..:sort=..:name=..` encoding.
    ///
    /// The field order is fixed and an absent filter encodes as `name=`.
    pub fn canonical(&self) -> String {
        let name = normalize_name(self.name.as_deref()).unwrap_or_default();
        format!(
            "limit={}:offset={}:sort={}:name={}",
            self.limit,
            self.offset,
            self.sort,
            urlencoding::encode(&name)
        )
    }
}

fn normalize_name(name: Option<&str>) -> Option<String> {
    name.map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_lowercase)
}

/// Namespaced, versioned key builder for one entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    namespace: String,
    version: String,
}

impl KeySpace {
    pub fn new(namespace: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            version: version.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    #[inline]
    fn prefix(&self, kind: &str) -> String {
        format!("{}:{}:{kind}:", self.namespace, self.version)
    }

    /// Key of a single entity.
    pub fn item(&self, id: &str) -> CacheKey {
        CacheKey(format!("{}{id}", self.prefix("item")))
    }

    /// Key of the tag collection derived from an entity.
    pub fn tags(&self, id: &str) -> CacheKey {
        CacheKey(format!("{}{id}", self.prefix("tags")))
    }

    /// Key of one page of a list query.
    pub fn list(&self, params: &ListParams) -> CacheKey {
        CacheKey(format!("{}{}", self.prefix("list"), params.canonical()))
    }

    /// Glob matching every list page of this entity type.
    pub fn list_pattern(&self) -> String {
        format!("{}*", self.prefix("list"))
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new("products", "v1")
    }
}
