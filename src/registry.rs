// 📇 Source Registry Cache - public_id → source metadata + latest reading
//
// The store is the source of truth; this is a process-local projection of it.
// Lookups take a shared read lock on the index. Latest-value updates only
// lock the one entry they touch.

use crate::db::Store;
use crate::error::{Error, Result};
use crate::model::{Latest, NewSource, Source};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ============================================================================
// CACHE ENTRY
// ============================================================================

/// One registered source plus its most recent reading
#[derive(Debug)]
pub struct CacheEntry {
    source: Source,
    latest: Mutex<Option<Latest>>,
}

impl CacheEntry {
    fn new(source: Source, latest: Option<Latest>) -> Self {
        CacheEntry {
            source,
            latest: Mutex::new(latest),
        }
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    pub fn internal_id(&self) -> i64 {
        self.source.internal_id
    }

    pub fn public_id(&self) -> &str {
        &self.source.public_id
    }

    pub fn latest(&self) -> Option<Latest> {
        *self.latest.lock()
    }

    /// Replace the cached reading unless it is strictly newer than `candidate`.
    /// Returns whether the cache changed.
    pub fn offer(&self, candidate: Latest) -> bool {
        let mut latest = self.latest.lock();
        match *latest {
            Some(current) if candidate.timestamp < current.timestamp => false,
            _ => {
                *latest = Some(candidate);
                true
            }
        }
    }
}

#[derive(Debug, Default)]
struct Index {
    by_public_id: HashMap<String, Arc<CacheEntry>>,
    by_short_id: HashMap<String, String>,
}

impl Index {
    fn insert(&mut self, entry: CacheEntry) {
        self.insert_shared(Arc::new(entry));
    }

    fn insert_shared(&mut self, entry: Arc<CacheEntry>) {
        if let Some(short_id) = &entry.source.short_id {
            self.by_short_id
                .insert(short_id.clone(), entry.source.public_id.clone());
        }
        self.by_public_id
            .insert(entry.source.public_id.clone(), entry);
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

/// In-memory registry of sources, kept in step with the store
pub struct Registry {
    store: Store,
    index: RwLock<Index>,
}

impl Registry {
    /// Empty registry; call `prepare()` to load what the store holds.
    pub fn new(store: Store) -> Self {
        Registry {
            store,
            index: RwLock::new(Index::default()),
        }
    }

    /// Reload every source and its latest reading from the store.
    ///
    /// The new index replaces the old one in a single swap; on failure the
    /// previous index stays in place. Sources registered while the reload
    /// was reading are carried over, and so are cached readings newer than
    /// what the reload saw.
    pub fn prepare(&self) -> Result<()> {
        let sources = self.store.select_sources(None)?;
        let mut index = Index::default();

        for source in sources {
            let latest = self.store.select_latest(source.internal_id)?;
            index.insert(CacheEntry::new(source, latest));
        }

        let mut current = self.index.write();
        for (public_id, entry) in &current.by_public_id {
            match index.by_public_id.get(public_id) {
                Some(fresh) => {
                    if let Some(latest) = entry.latest() {
                        fresh.offer(latest);
                    }
                }
                None => index.insert_shared(Arc::clone(entry)),
            }
        }

        let count = index.by_public_id.len();
        *current = index;
        drop(current);
        info!("Registry prepared with {} sources", count);
        Ok(())
    }

    pub fn resolve(&self, public_id: &str) -> Option<Arc<CacheEntry>> {
        self.index.read().by_public_id.get(public_id).cloned()
    }

    /// Map a short id to its public id, asking the store when the cache
    /// does not know it.
    pub fn resolve_by_short_id(&self, short_id: &str) -> Option<String> {
        if let Some(public_id) = self.index.read().by_short_id.get(short_id) {
            return Some(public_id.clone());
        }

        match self.store.select_public_id(short_id) {
            Ok(found) => found,
            Err(e) => {
                warn!("Short id lookup for {} failed: {}", short_id, e);
                None
            }
        }
    }

    /// Persist a new source under a fresh UUID and cache it.
    pub fn register(&self, source: NewSource) -> Result<String> {
        let public_id = Uuid::new_v4().to_string();
        let internal_id = self.store.insert_source(&source, &public_id)?;

        let entry = CacheEntry::new(source.into_source(internal_id, public_id.clone()), None);
        self.index.write().insert(entry);

        info!("Registered source {} (id {})", public_id, internal_id);
        Ok(public_id)
    }

    /// Offer a reading to the cached latest value of `public_id`.
    pub fn update_latest(&self, public_id: &str, value: i64, timestamp: i64) -> Result<()> {
        let entry = self
            .resolve(public_id)
            .ok_or_else(|| Error::NotFound(public_id.to_string()))?;

        if !entry.offer(Latest { value, timestamp }) {
            debug!("Kept newer latest for {} over ts {}", public_id, timestamp);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.index.read().by_public_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn registry() -> Registry {
        let store = Store::open_in_memory().unwrap();
        store.setup(false).unwrap();
        Registry::new(store)
    }

    #[test]
    fn test_register_and_resolve() {
        let registry = registry();
        let public_id = registry.register(NewSource::new("Meter", 2)).unwrap();

        let entry = registry.resolve(&public_id).unwrap();
        let stored = registry.store.select_sources(Some(entry.internal_id())).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].public_id, public_id);
        assert_eq!(entry.latest(), None);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_public_ids_are_uuids() {
        let registry = registry();
        let a = registry.register(NewSource::new("A", 0)).unwrap();
        let b = registry.register(NewSource::new("B", 0)).unwrap();

        assert_ne!(a, b);
        assert!(Uuid::parse_str(&a).is_ok());
    }

    #[test]
    fn test_duplicate_short_id_keeps_first() {
        let registry = registry();
        let first = registry
            .register(NewSource::new("A", 0).with_short_id("porch"))
            .unwrap();

        let err = registry
            .register(NewSource::new("B", 0).with_short_id("porch"))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateIdentifier(_)));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.resolve_by_short_id("porch"), Some(first));
    }

    #[test]
    fn test_short_id_falls_back_to_store() {
        let registry = registry();
        registry
            .store
            .insert_source(&NewSource::new("A", 0).with_short_id("shed"), "u-shed")
            .unwrap();

        assert!(registry.resolve("u-shed").is_none());
        assert_eq!(registry.resolve_by_short_id("shed").as_deref(), Some("u-shed"));
        assert_eq!(registry.resolve_by_short_id("loft"), None);
    }

    #[test]
    fn test_update_latest_last_write_wins_on_tie() {
        let registry = registry();
        let id = registry.register(NewSource::new("A", 0)).unwrap();

        registry.update_latest(&id, 1, 100).unwrap();
        registry.update_latest(&id, 2, 50).unwrap();
        assert_eq!(registry.resolve(&id).unwrap().latest(), Some(Latest { value: 1, timestamp: 100 }));

        registry.update_latest(&id, 3, 100).unwrap();
        assert_eq!(registry.resolve(&id).unwrap().latest(), Some(Latest { value: 3, timestamp: 100 }));
    }

    #[test]
    fn test_update_latest_unknown_source() {
        let registry = registry();
        let err = registry.update_latest("nope", 1, 1).unwrap_err();
        assert!(matches!(err, Error::NotFound(id) if id == "nope"));
    }

    #[test]
    fn test_prepare_reloads_from_store() {
        let registry = registry();
        let internal = registry
            .store
            .insert_source(&NewSource::new("A", 0).with_short_id("roof"), "u-a")
            .unwrap();
        registry.store.insert_reading(internal, 7, 300).unwrap();
        registry.store.insert_reading(internal, 9, 200).unwrap();
        assert!(registry.is_empty());

        registry.prepare().unwrap();

        let entry = registry.resolve("u-a").unwrap();
        assert_eq!(entry.internal_id(), internal);
        assert_eq!(entry.latest(), Some(Latest { value: 7, timestamp: 300 }));
        assert_eq!(registry.resolve_by_short_id("roof").as_deref(), Some("u-a"));
    }

    #[test]
    fn test_prepare_keeps_sources_it_did_not_read() {
        let registry = registry();
        let id = registry.register(NewSource::new("A", 0).with_short_id("attic")).unwrap();
        // Make the reload miss the row, as if it was inserted after the read
        registry
            .store
            .execute_batch(&format!("DELETE FROM sources WHERE public_id = '{}'", id))
            .unwrap();

        registry.prepare().unwrap();

        assert!(registry.resolve(&id).is_some());
        assert_eq!(registry.resolve_by_short_id("attic"), Some(id));
    }

    #[test]
    fn test_prepare_keeps_newer_cached_latest() {
        let registry = registry();
        let id = registry.register(NewSource::new("A", 0)).unwrap();
        let internal = registry.resolve(&id).unwrap().internal_id();
        registry.store.insert_reading(internal, 1, 100).unwrap();
        registry.update_latest(&id, 2, 200).unwrap();

        registry.prepare().unwrap();

        assert_eq!(registry.resolve(&id).unwrap().latest(), Some(Latest { value: 2, timestamp: 200 }));
    }

    #[test]
    fn test_failed_prepare_keeps_previous_index() {
        let store = Store::open_in_memory().unwrap();
        store.setup(false).unwrap();
        let registry = Registry::new(store.clone());
        let id = registry.register(NewSource::new("A", 0)).unwrap();

        store.execute_batch("DROP TABLE data").unwrap();

        assert!(registry.prepare().is_err());
        assert!(registry.resolve(&id).is_some());
    }

    #[test]
    fn test_concurrent_update_latest_keeps_max() {
        let registry = Arc::new(registry());
        let id = registry.register(NewSource::new("A", 0)).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let registry = Arc::clone(&registry);
                let id = id.clone();
                thread::spawn(move || {
                    for i in 0..200 {
                        let ts = i * 8 + t + 1;
                        registry.update_latest(&id, ts, ts).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let latest = registry.resolve(&id).unwrap().latest().unwrap();
        assert_eq!(latest.timestamp, 199 * 8 + 7 + 1);
        assert_eq!(latest.value, latest.timestamp);
    }
}
