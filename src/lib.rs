// dataPoints - Core Library
// Storage and query engine for timestamped readings, used by the CLI and the server

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod import;
pub mod logging;
pub mod model;
pub mod query;
pub mod registry;
pub mod stream;

// Re-export commonly used types
pub use config::{LogConfig, ServerConfig, Settings, StoreConfig};
pub use db::{Store, SQLITE_AGGREGATIONS};
pub use engine::DataPoints;
pub use error::{ConnectionError, Error, Result, SchemaStatus};
pub use import::{import_readings, load_readings, ImportSummary, ReadingRow};
pub use model::{Latest, NewSource, Record, Source, SourceView};
pub use query::{AggregationMode, AggregationTable, QuerySpec};
pub use registry::{CacheEntry, Registry};
pub use stream::ResultStream;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
