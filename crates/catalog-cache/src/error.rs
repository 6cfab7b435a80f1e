//! Error types for the cache coordination layer.
//!
//! Two families live here:
//!
//! - [`CacheError`] is raised inside backend adapters. It never crosses the
//!   public backend API: every adapter method degrades to a miss or a no-op
//!   and logs the error instead.
//! - [`OriginError`] is what the origin data source reports. It is `Clone`
//!   because one failed fetch is observed by every coalesced waiter.

use std::sync::Arc;

/// Internal backend failure.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The connection pool could not be built.
    #[error("Cache pool setup error: {0}")]
    Setup(#[from] deadpool_redis::CreatePoolError),

    /// No connection could be checked out of the pool.
    #[error("Cache pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    /// A command reached the backend and failed.
    #[error("Cache command error: {0}")]
    Command(#[from] redis::RedisError),

    /// A value could not be encoded for storage.
    #[error("Cache encode error: {0}")]
    Encode(#[from] serde_json::Error),

    /// A glob pattern could not be translated.
    #[error("Invalid key pattern `{pattern}`: {message}")]
    Pattern { pattern: String, message: String },
}

/// Failure reported by the origin data source.
#[derive(Debug, Clone, thiserror::Error)]
pub enum OriginError {
    /// The origin could not be reached.
    #[error("Origin unavailable: {message}")]
    Unavailable { message: String },

    /// The origin was reached but the query failed.
    #[error("Origin query failed: {message}")]
    Query { message: String },

    /// The fetch task ended without producing a result (panic or runtime
    /// shutdown).
    #[error("Origin fetch aborted: {message}")]
    Aborted { message: String },

    /// Any other error, kept behind an `Arc` so it stays cloneable.
    #[error(transparent)]
    Other(Arc<dyn std::error::Error + Send + Sync>),
}

impl OriginError {
    /// Creates a new `Unavailable` error.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Creates a new `Query` error.
    #[must_use]
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
        }
    }

    /// Creates a new `Aborted` error.
    #[must_use]
    pub fn aborted(message: impl Into<String>) -> Self {
        Self::Aborted {
            message: message.into(),
        }
    }

    /// Wraps an arbitrary error.
    #[must_use]
    pub fn other<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Other(Arc::new(err))
    }

    /// Returns `true` if the fetch never completed.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_error_display() {
        let err = OriginError::unavailable("connection refused");
        assert_eq!(err.to_string(), "Origin unavailable: connection refused");

        let err = OriginError::query("syntax error");
        assert_eq!(err.to_string(), "Origin query failed: syntax error");
    }

    #[test]
    fn origin_error_clones_share_source() {
        let io = std::io::Error::other("disk gone");
        let err = OriginError::other(io);
        let cloned = err.clone();
        assert_eq!(err.to_string(), cloned.to_string());
        assert!(!cloned.is_aborted());
        assert!(OriginError::aborted("panic").is_aborted());
    }

    #[test]
    fn pattern_error_display() {
        let err = CacheError::Pattern {
            pattern: "a[".into(),
            message: "unclosed".into(),
        };
        assert_eq!(err.to_string(), "Invalid key pattern `a[`: unclosed");
    }
}
