//! # Formula Cache
//!
//! Parsed formulas keyed by source text. Parsing is done by an external
//! collaborator; the cache only guarantees each distinct source is parsed
//! once while it stays among the most recently used entries.

use crate::domain::ast::Expr;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// LRU cache of parsed formulas.
pub struct FormulaCache {
    entries: Mutex<LruCache<String, Arc<Expr>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl FormulaCache {
    /// Cache holding at most `capacity` formulas.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns the cached tree for `source`, parsing it on a miss.
    ///
    /// # Errors
    ///
    /// Propagates the parser's error; failures are not cached.
    pub fn get_or_parse<E>(
        &self,
        source: &str,
        parse: impl FnOnce(&str) -> Result<Expr, E>,
    ) -> Result<Arc<Expr>, E> {
        if let Some(expr) = self.entries.lock().get(source) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(expr));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        trace!(len = source.len(), "formula cache miss");
        let expr = Arc::new(parse(source)?);
        self.entries.lock().put(source.to_string(), Arc::clone(&expr));
        Ok(expr)
    }

    /// Number of cached formulas.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(hits, misses)` since creation.
    #[must_use]
    pub fn stats(&self) -> (u64, u64) {
        (self.hits.load(Ordering::Relaxed), self.misses.load(Ordering::Relaxed))
    }
}
