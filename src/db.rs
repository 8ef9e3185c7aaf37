// 🗄️ Durable Store - SQLite persistence for sources and readings
//
// Two relations:
// - sources: registry, unique public_id and short_id
// - data:    append-only readings
//
// Every operation commits on its own. Access to the connection is serialized
// and bounded by the configured busy timeout.

use crate::config::StoreConfig;
use crate::error::{ConnectionError, Error, Result, SchemaStatus};
use crate::model::{Latest, NewSource, Record, Source};
use crate::query::{AggregationMode, AggregationTable, CursorKey, QueryPlan};
use crate::stream::ResultStream;
use parking_lot::Mutex;
use rusqlite::functions::{Aggregate, Context, FunctionFlags};
use rusqlite::types::Value;
use rusqlite::{
    params, params_from_iter, Connection, DatabaseName, ErrorCode, OpenFlags, OptionalExtension,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

// ============================================================================
// SCHEMA
// ============================================================================

const SCHEMA_SQL: &str = "
    CREATE TABLE sources (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        short_id TEXT UNIQUE,
        display_name TEXT NOT NULL,
        public_id TEXT NOT NULL UNIQUE,
        type_tag INTEGER NOT NULL,
        accuracy INTEGER NOT NULL,
        parameters TEXT NOT NULL
    );
    CREATE TABLE data (
        ts INTEGER NOT NULL,
        source_id INTEGER NOT NULL REFERENCES sources(id),
        value INTEGER NOT NULL
    );
    CREATE INDEX idx_data_source_ts ON data(source_id, ts);
";

const DROP_STATEMENTS: [&str; 2] = ["DROP TABLE data", "DROP TABLE sources"];

/// Columns each relation must have for the schema to be usable
const EXPECTED_SCHEMA: [(&str, &[&str]); 2] = [
    (
        "sources",
        &["id", "short_id", "display_name", "public_id", "type_tag", "accuracy", "parameters"],
    ),
    ("data", &["ts", "source_id", "value"]),
];

const SOURCE_COLUMNS: &str =
    "SELECT id, public_id, short_id, display_name, type_tag, accuracy, parameters FROM sources";

// ============================================================================
// AGGREGATIONS
// ============================================================================

// Registered on every connection
pub const AVERAGE_FUNCTION: &str = "dp_average";
pub const MEDIAN_FUNCTION: &str = "dp_median";

/// Aggregations this backend can run. Averages and medians are computed on
/// integers and rounded to the nearest integer, half away from zero.
pub const SQLITE_AGGREGATIONS: AggregationTable = AggregationTable::new(&[
    (AggregationMode::Sum, "SUM(d.value)"),
    (AggregationMode::Average, "dp_average(d.value)"),
    (AggregationMode::Median, "dp_median(d.value)"),
]);

/// `sum / count` rounded half away from zero. `count` must be positive.
pub fn rounded_mean(sum: i128, count: i128) -> i64 {
    let quotient = sum / count;
    let remainder = sum % count;
    let rounded = if 2 * remainder.abs() >= count {
        quotient + sum.signum()
    } else {
        quotient
    };
    rounded as i64
}

/// Median of integer values; an even count yields the rounded mean of the
/// two middle values.
pub fn median(values: &mut [i64]) -> Option<i64> {
    if values.is_empty() {
        return None;
    }
    values.sort_unstable();
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        return Some(values[mid]);
    }

    Some(rounded_mean(values[mid - 1] as i128 + values[mid] as i128, 2))
}

/// Exact integer mean; `AVG` goes through f64 and loses precision on large values
struct Average;

impl Aggregate<(i128, i128), Option<i64>> for Average {
    fn init(&self, _ctx: &mut Context<'_>) -> rusqlite::Result<(i128, i128)> {
        Ok((0, 0))
    }

    fn step(&self, ctx: &mut Context<'_>, acc: &mut (i128, i128)) -> rusqlite::Result<()> {
        if let Some(value) = ctx.get::<Option<i64>>(0)? {
            acc.0 += value as i128;
            acc.1 += 1;
        }
        Ok(())
    }

    fn finalize(
        &self,
        _ctx: &mut Context<'_>,
        acc: Option<(i128, i128)>,
    ) -> rusqlite::Result<Option<i64>> {
        Ok(acc
            .filter(|(_, count)| *count > 0)
            .map(|(sum, count)| rounded_mean(sum, count)))
    }
}

struct Median;

impl Aggregate<Vec<i64>, Option<i64>> for Median {
    fn init(&self, _ctx: &mut Context<'_>) -> rusqlite::Result<Vec<i64>> {
        Ok(Vec::new())
    }

    fn step(&self, ctx: &mut Context<'_>, values: &mut Vec<i64>) -> rusqlite::Result<()> {
        if let Some(value) = ctx.get::<Option<i64>>(0)? {
            values.push(value);
        }
        Ok(())
    }

    fn finalize(
        &self,
        _ctx: &mut Context<'_>,
        values: Option<Vec<i64>>,
    ) -> rusqlite::Result<Option<i64>> {
        Ok(values.and_then(|mut values| median(&mut values)))
    }
}

// ============================================================================
// STORE
// ============================================================================

/// Handle to the durable store. Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    lock_timeout: Duration,
    page_size: u64,
    aggregations: AggregationTable,
}

impl Store {
    /// Open the database described by `config`.
    pub fn connect(config: &StoreConfig) -> std::result::Result<Store, ConnectionError> {
        let conn = if config.is_in_memory() {
            Connection::open_in_memory()
        } else {
            let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX;
            if config.create_if_missing {
                flags |= OpenFlags::SQLITE_OPEN_CREATE;
            }
            Connection::open_with_flags(&config.path, flags)
        }
        .map_err(|e| classify_open_error(&config.path, e))?;

        // SQLite opens lazily, touch the file to surface "not a database"
        conn.query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| row.get::<_, i64>(0))
            .map_err(|e| classify_open_error(&config.path, e))?;

        let read_only = conn
            .is_readonly(DatabaseName::Main)
            .map_err(|e| classify_open_error(&config.path, e))?;
        if read_only {
            return Err(ConnectionError::Authentication(format!(
                "{}: database is opened read-only",
                config.path.display()
            )));
        }

        conn.busy_timeout(config.busy_timeout())
            .map_err(|e| ConnectionError::Other(e.to_string()))?;

        if !config.is_in_memory() {
            let mode: String = conn
                .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
                .map_err(|e| classify_open_error(&config.path, e))?;
            debug!("Journal mode: {}", mode);
        }

        let flags = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;
        conn.create_aggregate_function(AVERAGE_FUNCTION, 1, flags, Average)
            .and_then(|_| conn.create_aggregate_function(MEDIAN_FUNCTION, 1, flags, Median))
            .map_err(|e| ConnectionError::Other(e.to_string()))?;

        info!("Connected to database {}", config.path.display());

        Ok(Store {
            conn: Arc::new(Mutex::new(conn)),
            lock_timeout: config.busy_timeout(),
            page_size: config.page_size,
            aggregations: SQLITE_AGGREGATIONS,
        })
    }

    /// Private in-memory database with default settings
    pub fn open_in_memory() -> std::result::Result<Store, ConnectionError> {
        Self::connect(&StoreConfig::in_memory())
    }

    /// Replace the aggregation table (restricting what queries may ask for)
    pub fn with_aggregations(mut self, aggregations: AggregationTable) -> Self {
        self.aggregations = aggregations;
        self
    }

    pub fn aggregations(&self) -> &AggregationTable {
        &self.aggregations
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self.conn.try_lock_for(self.lock_timeout).ok_or_else(|| {
            Error::QueryExecution(format!(
                "timed out after {:?} waiting for the store connection",
                self.lock_timeout
            ))
        })?;
        f(&conn).map_err(translate)
    }

    // ------------------------------------------------------------------------
    // Schema lifecycle
    // ------------------------------------------------------------------------

    /// Inspect whether both relations exist with the expected columns.
    pub fn validate(&self) -> SchemaStatus {
        match self.with_conn(inspect_schema) {
            Ok(status) => status,
            Err(e) => {
                error!("Schema inspection failed: {}", e);
                SchemaStatus::Error
            }
        }
    }

    /// Create both relations. With `force`, drop them first.
    ///
    /// Refuses to run unless the schema is absent after the optional drop.
    pub fn setup(&self, force: bool) -> Result<()> {
        if force {
            for statement in DROP_STATEMENTS {
                info!("{}", statement);
                // Dropping a table that does not exist is fine here
                if let Err(e) = self.with_conn(|conn| conn.execute_batch(statement)) {
                    debug!("Ignoring drop failure: {}", e);
                }
            }
        }

        let status = self.validate();
        if status != SchemaStatus::NotSetup {
            error!("Database is not in a state where it can be set up ({})", status);
            return Err(Error::Schema(status));
        }

        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute_batch(SCHEMA_SQL)?;
            tx.commit()
        })?;

        info!("Tables created successfully");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    /// Insert a source under `public_id` and return its internal id.
    pub fn insert_source(&self, source: &NewSource, public_id: &str) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sources (short_id, display_name, public_id, type_tag, accuracy, parameters)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    source.short_id,
                    source.display_name,
                    public_id,
                    source.type_tag,
                    source.accuracy,
                    source.parameters,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .map_err(|e| {
            warn!("Failed to add source {}: {}", public_id, e);
            e
        })
    }

    pub fn insert_reading(&self, internal_id: i64, value: i64, timestamp: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO data (ts, source_id, value) VALUES (?1, ?2, ?3)",
                params![timestamp, internal_id, value],
            )
        })?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// All sources, or only the one with `internal_id`, ordered by id.
    pub fn select_sources(&self, internal_id: Option<i64>) -> Result<Vec<Source>> {
        self.with_conn(|conn| {
            let sources = match internal_id {
                Some(id) => {
                    let mut stmt = conn.prepare(&format!("{SOURCE_COLUMNS} WHERE id = ?1"))?;
                    let rows = stmt.query_map([id], source_from_row)?.collect::<rusqlite::Result<Vec<_>>>()?;
                    rows
                }
                None => {
                    let mut stmt = conn.prepare(&format!("{SOURCE_COLUMNS} ORDER BY id"))?;
                    let rows = stmt.query_map([], source_from_row)?.collect::<rusqlite::Result<Vec<_>>>()?;
                    rows
                }
            };
            Ok(sources)
        })
    }

    /// Most recent reading by timestamp; equal timestamps favor the last insert.
    pub fn select_latest(&self, internal_id: i64) -> Result<Option<Latest>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT value, ts FROM data WHERE source_id = ?1 ORDER BY ts DESC, rowid DESC LIMIT 1",
                [internal_id],
                |row| {
                    Ok(Latest {
                        value: row.get(0)?,
                        timestamp: row.get(1)?,
                    })
                },
            )
            .optional()
        })
    }

    pub fn select_public_id(&self, short_id: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT public_id FROM sources WHERE short_id = ?1",
                [short_id],
                |row| row.get(0),
            )
            .optional()
        })
    }

    /// Number of stored readings, optionally for one source
    pub fn count_readings(&self, internal_id: Option<i64>) -> Result<i64> {
        self.with_conn(|conn| match internal_id {
            Some(id) => conn.query_row("SELECT COUNT(*) FROM data WHERE source_id = ?1", [id], |row| row.get(0)),
            None => conn.query_row("SELECT COUNT(*) FROM data", [], |row| row.get(0)),
        })
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Run `plan` and hand back a lazy stream over its records.
    pub fn execute_aggregated_query(&self, plan: QueryPlan) -> ResultStream {
        debug!("Query statement: {} {:?}", plan.sql(), plan.params());
        ResultStream::open(self.clone(), plan, self.page_size)
    }

    /// Fetch one page of `(source, ts, value, sid, rid)` rows.
    pub(crate) fn fetch_page(&self, sql: &str, params: &[Value]) -> Result<Vec<(Record, CursorKey)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(sql)?;
            let rows = stmt
                .query_map(params_from_iter(params.iter()), |row| {
                    let record = Record {
                        source: row.get(0)?,
                        timestamp: row.get(1)?,
                        value: row.get(2)?,
                    };
                    let key = CursorKey {
                        timestamp: record.timestamp,
                        source_id: row.get(3)?,
                        row: row.get(4)?,
                    };
                    Ok((record, key))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .map_err(|e| {
            error!("Failed to query data: {}", e);
            match e {
                Error::QueryExecution(_) => e,
                other => Error::QueryExecution(other.to_string()),
            }
        })
    }
}

#[cfg(test)]
impl Store {
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<()> {
        self.with_conn(|conn| conn.execute_batch(sql))
    }

    /// Hold the connection as a long-running statement would
    pub(crate) fn lock_connection(&self) -> parking_lot::MutexGuard<'_, Connection> {
        self.conn.lock()
    }
}

fn source_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Source> {
    Ok(Source {
        internal_id: row.get(0)?,
        public_id: row.get(1)?,
        short_id: row.get(2)?,
        display_name: row.get(3)?,
        type_tag: row.get(4)?,
        accuracy: row.get(5)?,
        parameters: row.get(6)?,
    })
}

fn inspect_schema(conn: &Connection) -> rusqlite::Result<SchemaStatus> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1)")?;
    let mut status = SchemaStatus::Ok;

    for (table, expected) in EXPECTED_SCHEMA {
        let present = stmt
            .query_map([table], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        if present.is_empty() {
            return Ok(SchemaStatus::NotSetup);
        }
        if expected.iter().any(|column| !present.iter().any(|p| p == column)) {
            status = SchemaStatus::NeedsUpgrade;
        }
    }

    Ok(status)
}

/// Map a backend error onto the engine taxonomy
fn translate(err: rusqlite::Error) -> Error {
    match err {
        rusqlite::Error::SqliteFailure(failure, message)
            if failure.code == ErrorCode::ConstraintViolation
                && failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
        {
            Error::DuplicateIdentifier(message.unwrap_or_else(|| failure.to_string()))
        }
        other => Error::QueryExecution(other.to_string()),
    }
}

fn classify_open_error(path: &Path, err: rusqlite::Error) -> ConnectionError {
    let detail = format!("{}: {}", path.display(), err);
    match err.sqlite_error_code() {
        Some(ErrorCode::PermissionDenied)
        | Some(ErrorCode::AuthorizationForStatementDenied)
        | Some(ErrorCode::ReadOnly) => ConnectionError::Authentication(detail),
        Some(ErrorCode::CannotOpen) if !path.exists() => ConnectionError::MissingDatabase(detail),
        _ => ConnectionError::Other(detail),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QuerySpec;

    fn setup_store() -> Store {
        let store = Store::open_in_memory().unwrap();
        store.setup(false).unwrap();
        store
    }

    #[test]
    fn test_validate_lifecycle() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.validate(), SchemaStatus::NotSetup);

        store.setup(false).unwrap();
        assert_eq!(store.validate(), SchemaStatus::Ok);

        // Second setup without force must refuse
        let err = store.setup(false).unwrap_err();
        assert!(matches!(err, Error::Schema(SchemaStatus::Ok)));
    }

    #[test]
    fn test_forced_setup_drops_data() {
        let store = setup_store();
        let id = store.insert_source(&NewSource::new("Meter", 1), "u-1").unwrap();
        store.insert_reading(id, 5, 100).unwrap();

        store.setup(true).unwrap();

        assert_eq!(store.validate(), SchemaStatus::Ok);
        assert!(store.select_sources(None).unwrap().is_empty());
        assert_eq!(store.count_readings(None).unwrap(), 0);
    }

    #[test]
    fn test_legacy_schema_needs_upgrade() {
        let store = Store::open_in_memory().unwrap();
        store
            .conn
            .lock()
            .execute_batch(
                "CREATE TABLE sources (id INTEGER PRIMARY KEY, name TEXT, uuid TEXT, type INTEGER, accuracy INTEGER, parameters TEXT);
                 CREATE TABLE data (ts INTEGER, source_id INTEGER, value INTEGER);",
            )
            .unwrap();

        assert_eq!(store.validate(), SchemaStatus::NeedsUpgrade);
        assert!(store.setup(false).is_err());

        store.setup(true).unwrap();
        assert_eq!(store.validate(), SchemaStatus::Ok);
    }

    #[test]
    fn test_missing_table_is_not_setup() {
        let store = Store::open_in_memory().unwrap();
        store
            .conn
            .lock()
            .execute_batch("CREATE TABLE data (ts INTEGER, source_id INTEGER, value INTEGER);")
            .unwrap();

        assert_eq!(store.validate(), SchemaStatus::NotSetup);
    }

    #[test]
    fn test_insert_source_assigns_ids() {
        let store = setup_store();
        let first = store.insert_source(&NewSource::new("A", 0), "u-a").unwrap();
        let second = store.insert_source(&NewSource::new("B", 0), "u-b").unwrap();
        assert_ne!(first, second);

        let sources = store.select_sources(Some(second)).unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].public_id, "u-b");
        assert_eq!(sources[0].internal_id, second);
    }

    #[test]
    fn test_duplicate_identifiers_rejected() {
        let store = setup_store();
        store
            .insert_source(&NewSource::new("A", 0).with_short_id("kitchen"), "u-a")
            .unwrap();

        let err = store
            .insert_source(&NewSource::new("B", 0).with_short_id("kitchen"), "u-b")
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateIdentifier(_)));

        let err = store.insert_source(&NewSource::new("C", 0), "u-a").unwrap_err();
        assert!(matches!(err, Error::DuplicateIdentifier(_)));

        // Sources without a short id never collide with each other
        store.insert_source(&NewSource::new("D", 0), "u-d").unwrap();
        store.insert_source(&NewSource::new("E", 0), "u-e").unwrap();
        assert_eq!(store.select_sources(None).unwrap().len(), 3);
    }

    #[test]
    fn test_select_latest_by_timestamp() {
        let store = setup_store();
        let id = store.insert_source(&NewSource::new("A", 0), "u-a").unwrap();
        assert_eq!(store.select_latest(id).unwrap(), None);

        store.insert_reading(id, 10, 500).unwrap();
        store.insert_reading(id, 20, 300).unwrap();
        assert_eq!(
            store.select_latest(id).unwrap(),
            Some(Latest { value: 10, timestamp: 500 })
        );

        store.insert_reading(id, 30, 500).unwrap();
        assert_eq!(
            store.select_latest(id).unwrap(),
            Some(Latest { value: 30, timestamp: 500 })
        );
    }

    #[test]
    fn test_short_id_lookup() {
        let store = setup_store();
        store
            .insert_source(&NewSource::new("A", 0).with_short_id("garage"), "u-a")
            .unwrap();

        assert_eq!(store.select_public_id("garage").unwrap().as_deref(), Some("u-a"));
        assert_eq!(store.select_public_id("attic").unwrap(), None);
    }

    #[test]
    fn test_rounded_mean() {
        assert_eq!(rounded_mean(11, 2), 6);
        assert_eq!(rounded_mean(-11, 2), -6);
        assert_eq!(rounded_mean(10, 3), 3);
        assert_eq!(rounded_mean(-10, 3), -3);
        assert_eq!(rounded_mean(5, 3), 2);
        assert_eq!(rounded_mean(i64::MAX as i128 + 5, 2), 4_611_686_018_427_387_906);
    }

    #[test]
    fn test_median() {
        assert_eq!(median(&mut []), None);
        assert_eq!(median(&mut [7]), Some(7));
        assert_eq!(median(&mut [9, 1, 5]), Some(5));
        assert_eq!(median(&mut [1, 2]), Some(2));
        assert_eq!(median(&mut [-1, -2]), Some(-2));
        assert_eq!(median(&mut [4, 1, 3, 2]), Some(3));
        assert_eq!(median(&mut [i64::MAX, i64::MAX]), Some(i64::MAX));
    }

    #[test]
    fn test_median_aggregate_in_sql() {
        let store = setup_store();
        let id = store.insert_source(&NewSource::new("A", 0), "u-a").unwrap();
        for (value, ts) in [(1, 10), (100, 20), (3, 30), (50, 70)] {
            store.insert_reading(id, value, ts).unwrap();
        }

        let spec = QuerySpec::new(["u-a"]).group_by(60, AggregationMode::Median);
        let plan = QueryPlan::build(&spec, &[id], 0, store.aggregations()).unwrap();
        let records: Vec<Record> = store.execute_aggregated_query(plan).collect();

        assert_eq!(records.len(), 2);
        assert_eq!((records[0].timestamp, records[0].value), (0, 3));
        assert_eq!((records[1].timestamp, records[1].value), (60, 50));
    }

    #[test]
    fn test_average_rounds_to_integer() {
        let store = setup_store();
        let id = store.insert_source(&NewSource::new("A", 0), "u-a").unwrap();
        store.insert_reading(id, 5, 100).unwrap();
        store.insert_reading(id, 6, 101).unwrap();

        let spec = QuerySpec::new(["u-a"]).group_by(60, AggregationMode::Average);
        let plan = QueryPlan::build(&spec, &[id], 0, store.aggregations()).unwrap();
        let records: Vec<Record> = store.execute_aggregated_query(plan).collect();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value, 6);
    }

    #[test]
    fn test_average_is_exact_for_large_values() {
        let store = setup_store();
        let id = store.insert_source(&NewSource::new("A", 0), "u-a").unwrap();
        store.insert_reading(id, i64::MAX, 100).unwrap();
        store.insert_reading(id, 5, 101).unwrap();
        store.insert_reading(id, -7, 200).unwrap();
        store.insert_reading(id, -8, 201).unwrap();

        let spec = QuerySpec::new(["u-a"]).group_by(60, AggregationMode::Average);
        let plan = QueryPlan::build(&spec, &[id], 0, store.aggregations()).unwrap();
        let records: Vec<Record> = store.execute_aggregated_query(plan).collect();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].value, 4_611_686_018_427_387_906);
        assert_eq!(records[1].value, -8);
    }

    #[test]
    fn test_query_against_missing_tables_fails_stream() {
        let store = Store::open_in_memory().unwrap();
        let plan = QueryPlan::build(&QuerySpec::new(["u-a"]), &[1], 0, store.aggregations()).unwrap();

        let mut stream = store.execute_aggregated_query(plan);
        assert!(matches!(stream.error(), Some(Error::QueryExecution(_))));
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_missing_database_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::new(dir.path().join("absent.db"));

        let err = Store::connect(&config).err().unwrap();
        assert!(matches!(err, ConnectionError::MissingDatabase(_)));
    }

    #[test]
    fn test_create_database_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("points.db");
        let config = StoreConfig::new(&path).with_create_if_missing(true);

        let store = Store::connect(&config).unwrap();
        store.setup(false).unwrap();
        drop(store);

        // Reopen without create: schema persisted
        let store = Store::connect(&StoreConfig::new(&path)).unwrap();
        assert_eq!(store.validate(), SchemaStatus::Ok);
    }

    #[test]
    fn test_read_only_database_is_denied() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("points.db");
        let store = Store::connect(&StoreConfig::new(&path).with_create_if_missing(true)).unwrap();
        store.setup(false).unwrap();
        drop(store);

        let uri = format!("file:{}?mode=ro", path.display());
        let err = Store::connect(&StoreConfig::new(uri)).err().unwrap();
        assert!(matches!(err, ConnectionError::Authentication(_)));
    }

    #[test]
    fn test_held_connection_times_out() {
        let mut config = StoreConfig::in_memory();
        config.busy_timeout_ms = 50;
        let store = Store::connect(&config).unwrap();
        store.setup(false).unwrap();

        let guard = store.lock_connection();
        let started = std::time::Instant::now();
        let err = store.insert_reading(1, 1, 1).unwrap_err();
        assert!(matches!(err, Error::QueryExecution(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
        drop(guard);

        store.insert_reading(1, 1, 1).unwrap();
    }

    #[test]
    fn test_locked_database_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("points.db");
        let mut config = StoreConfig::new(&path).with_create_if_missing(true);
        config.busy_timeout_ms = 50;

        let writer = Store::connect(&config).unwrap();
        writer.setup(false).unwrap();
        let other = Store::connect(&config).unwrap();

        writer.execute_batch("BEGIN EXCLUSIVE").unwrap();
        let err = other.insert_reading(1, 1, 1).unwrap_err();
        assert!(matches!(err, Error::QueryExecution(_)));

        writer.execute_batch("ROLLBACK").unwrap();
        other.insert_reading(1, 1, 1).unwrap();
        assert_eq!(writer.count_readings(None).unwrap(), 1);
    }

    #[test]
    fn test_not_a_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.db");
        std::fs::write(&path, vec![0x42u8; 4096]).unwrap();

        let err = Store::connect(&StoreConfig::new(&path)).err().unwrap();
        assert!(matches!(err, ConnectionError::Other(_)));
    }
}
