//! Content-addressed storage for minified output.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::core::{ArcStr, Hash32};
use crate::error::CacheError;
use crate::pipeline::{PipelineOutput, Problem};

/// Minified output of a single asset, as stored in a [`Cache`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub code: String,
    pub warnings: Vec<Problem>,
    pub errors: Vec<Problem>,
}

impl From<PipelineOutput> for CacheEntry {
    fn from(output: PipelineOutput) -> Self {
        Self {
            code: output.code,
            warnings: output.warnings,
            errors: output.errors,
        }
    }
}

/// A store keyed by asset name and etag. Entries are immutable once stored.
///
/// Implementations are shared between the tasks of a pass, so they must be
/// safe to call from several threads at once.
pub trait Cache: Send + Sync {
    fn get(&self, name: &str, etag: Hash32) -> Result<Option<Arc<CacheEntry>>, CacheError>;

    /// Stores an entry. When the key is already present the existing entry
    /// is kept.
    fn store(&self, name: &str, etag: Hash32, entry: CacheEntry) -> Result<(), CacheError>;
}

/// Thread-safe in-memory [`Cache`].
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<(ArcStr, Hash32), Arc<CacheEntry>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Cache for MemoryCache {
    fn get(&self, name: &str, etag: Hash32) -> Result<Option<Arc<CacheEntry>>, CacheError> {
        let entries = self.entries.read().map_err(|_| CacheError::Poisoned)?;
        Ok(entries.get(&(ArcStr::from(name), etag)).cloned())
    }

    fn store(&self, name: &str, etag: Hash32, entry: CacheEntry) -> Result<(), CacheError> {
        let mut entries = self.entries.write().map_err(|_| CacheError::Poisoned)?;
        entries
            .entry((ArcStr::from(name), etag))
            .or_insert_with(|| Arc::new(entry));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(code: &str) -> CacheEntry {
        CacheEntry {
            code: code.into(),
            warnings: vec![],
            errors: vec![],
        }
    }

    #[test]
    fn lookups_are_keyed_by_name_and_etag() {
        let cache = MemoryCache::new();
        let etag = Hash32::hash(b"<p>x</p>");

        cache.store("a.html", etag, entry("<p>x</p>")).unwrap();

        assert_eq!(cache.get("a.html", etag).unwrap().unwrap().code, "<p>x</p>");
        assert!(cache.get("b.html", etag).unwrap().is_none());
        assert!(cache.get("a.html", Hash32::hash(b"other")).unwrap().is_none());
    }

    #[test]
    fn first_write_wins() {
        let cache = MemoryCache::new();
        let etag = Hash32::hash(b"x");

        cache.store("a.html", etag, entry("first")).unwrap();
        cache.store("a.html", etag, entry("second")).unwrap();

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("a.html", etag).unwrap().unwrap().code, "first");
    }
}
