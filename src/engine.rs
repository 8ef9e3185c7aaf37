// ⚙️ DataPoints - the storage and query engine
//
// Ties the store, the registry cache and the query builder together.
// Writes go to the store first; the cached latest value is updated after
// the row is committed.

use crate::config::StoreConfig;
use crate::db::Store;
use crate::error::{Error, Result, SchemaStatus};
use crate::model::{Latest, NewSource, SourceView};
use crate::query::{QueryPlan, QuerySpec};
use crate::registry::Registry;
use crate::stream::ResultStream;
use chrono::Utc;
use tracing::{debug, warn};

/// Entry point for registering sources, recording readings and querying them.
///
/// Shareable across threads (`Arc<DataPoints>`).
pub struct DataPoints {
    store: Store,
    registry: Registry,
}

impl DataPoints {
    /// Connect, require a usable schema and load the registry.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let store = Store::connect(config)?;
        Self::from_store(store)
    }

    /// Wrap an already connected store.
    pub fn from_store(store: Store) -> Result<Self> {
        let status = store.validate();
        if status != SchemaStatus::Ok {
            return Err(Error::Schema(status));
        }

        let registry = Registry::new(store.clone());
        registry.prepare()?;
        Ok(DataPoints { store, registry })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    // ------------------------------------------------------------------------
    // Sources
    // ------------------------------------------------------------------------

    /// Register a source and return its new public id.
    pub fn register_source(&self, source: NewSource) -> Result<String> {
        self.registry.register(source)
    }

    pub fn resolve_short_id(&self, short_id: &str) -> Option<String> {
        self.registry.resolve_by_short_id(short_id)
    }

    /// All sources, or just the one with `public_id`.
    pub fn list_sources(&self, public_id: Option<&str>) -> Result<Vec<SourceView>> {
        let filter = match public_id {
            Some(id) => Some(
                self.registry
                    .resolve(id)
                    .ok_or_else(|| Error::NotFound(id.to_string()))?
                    .internal_id(),
            ),
            None => None,
        };

        let sources = self.store.select_sources(filter)?;
        if let (Some(id), true) = (public_id, sources.is_empty()) {
            return Err(Error::NotFound(id.to_string()));
        }
        Ok(sources.iter().map(|s| s.view()).collect())
    }

    // ------------------------------------------------------------------------
    // Readings
    // ------------------------------------------------------------------------

    /// Append a reading. `timestamp` defaults to now.
    pub fn record(&self, public_id: &str, value: i64, timestamp: Option<i64>) -> Result<()> {
        let timestamp = timestamp.unwrap_or_else(|| Utc::now().timestamp());
        if timestamp < 1 {
            warn!("Rejected reading for {} with timestamp {}", public_id, timestamp);
            return Err(Error::InvalidTimestamp(timestamp));
        }

        let entry = self.registry.resolve(public_id).ok_or_else(|| {
            warn!("Rejected reading for unknown source {}", public_id);
            Error::NotFound(public_id.to_string())
        })?;

        self.store.insert_reading(entry.internal_id(), value, timestamp)?;
        entry.offer(Latest { value, timestamp });
        Ok(())
    }

    /// Cached most recent reading of a source
    pub fn latest(&self, public_id: &str) -> Option<Latest> {
        self.registry.resolve(public_id)?.latest()
    }

    /// Latest readings for every id that is known and has data, in input order.
    pub fn latest_many<S: AsRef<str>>(&self, public_ids: &[S]) -> Vec<(String, Latest)> {
        public_ids
            .iter()
            .filter_map(|id| {
                let id = id.as_ref();
                self.latest(id).map(|latest| (id.to_string(), latest))
            })
            .collect()
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Run a query. Failures are reported through the stream's `error()`.
    pub fn query(&self, spec: &QuerySpec) -> ResultStream {
        self.query_at(spec, Utc::now().timestamp())
    }

    /// Like `query`, with relative bounds resolved against `now`.
    pub fn query_at(&self, spec: &QuerySpec, now: i64) -> ResultStream {
        if let Err(e) = spec.validate() {
            return ResultStream::failed(e);
        }

        let mut source_ids: Vec<i64> = Vec::with_capacity(spec.sources.len());
        for public_id in &spec.sources {
            match self.registry.resolve(public_id) {
                Some(entry) if !source_ids.contains(&entry.internal_id()) => {
                    source_ids.push(entry.internal_id())
                }
                Some(_) => {}
                None => debug!("Dropping unknown source {} from query", public_id),
            }
        }

        if source_ids.is_empty() {
            return ResultStream::empty();
        }

        match QueryPlan::build(spec, &source_ids, now, self.store.aggregations()) {
            Ok(plan) => self.store.execute_aggregated_query(plan),
            Err(e) => ResultStream::failed(e),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
