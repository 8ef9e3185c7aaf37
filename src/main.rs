// dataPoints - Admin CLI
// Schema setup, source registration, ingestion and queries against the local store

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use datapoints::{
    import_readings, load_readings, AggregationMode, DataPoints, Error, NewSource, QuerySpec,
    SchemaStatus, Settings, Store,
};
use serde_json::json;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

#[derive(Parser)]
#[command(
    name = "datapoints",
    version,
    about = "dataPoints - Gather all your data points in one place"
)]
struct Cli {
    /// TOML configuration file
    #[arg(long, short, env = "DATAPOINTS_CONFIG")]
    config: Option<PathBuf>,

    /// Database file (overrides the configuration)
    #[arg(long)]
    database: Option<PathBuf>,

    /// Log to file instead of stderr
    #[arg(long, value_name = "FILE")]
    logfile: Option<PathBuf>,

    /// Default log filter when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the necessary tables
    Setup {
        /// Drop existing tables first (NOTE! YOU'LL LOSE ALL EXISTING DATA)
        #[arg(long)]
        force: bool,
    },
    /// Validate the schema and load the registry
    Check,
    /// Register a new source and print its uuid
    Register {
        name: String,
        #[arg(value_name = "TYPE")]
        type_tag: i64,
        #[arg(long)]
        short_id: Option<String>,
        #[arg(long, default_value_t = 1)]
        accuracy: i64,
        #[arg(long, default_value = "")]
        parameters: String,
    },
    /// Record one reading
    Record {
        /// Source uuid or short id
        id: String,
        #[arg(allow_negative_numbers = true)]
        value: i64,
        /// UNIX timestamp, defaults to now
        #[arg(long, allow_negative_numbers = true)]
        ts: Option<i64>,
    },
    /// List all sources, or one
    Sources { id: Option<String> },
    /// Latest reading of one or more sources
    Latest {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Query readings as JSON lines
    Query {
        #[arg(required = true)]
        ids: Vec<String>,
        /// Inclusive start, negative means seconds before now
        #[arg(long, allow_negative_numbers = true)]
        start: Option<i64>,
        /// Inclusive end, negative means seconds before now
        #[arg(long, allow_negative_numbers = true)]
        end: Option<i64>,
        #[arg(long, default_value_t = 0)]
        limit: u64,
        /// Bucket width in seconds
        #[arg(long, default_value_t = 0)]
        group_by: u64,
        /// none, sum, average or median
        #[arg(long, default_value = "none")]
        mode: String,
        #[arg(long)]
        reverse: bool,
    },
    /// Import `timestamp,value` rows from a CSV file
    Import { id: String, csv: PathBuf },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut settings = match Settings::load(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("❌ Invalid configuration: {}", e);
            return ExitCode::from(1);
        }
    };
    if let Some(path) = &cli.database {
        settings.store.path = path.clone();
    }
    if let Some(file) = &cli.logfile {
        settings.log.file = Some(file.clone());
    }
    if let Some(level) = &cli.log_level {
        settings.log.level = level.clone();
    }

    if let Err(e) = datapoints::logging::init(&settings.log) {
        eprintln!("❌ {:#}", e);
        return ExitCode::from(1);
    }

    match run(cli.command, settings) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            match e.downcast_ref::<Error>() {
                Some(Error::Schema(SchemaStatus::NotSetup)) => {
                    error!("Database is not setup, use `datapoints setup` to create necessary tables");
                    ExitCode::from(2)
                }
                _ => ExitCode::from(1),
            }
        }
    }
}

fn run(command: Command, mut settings: Settings) -> Result<()> {
    match command {
        Command::Setup { force } => {
            settings.store.create_if_missing = true;
            let store = Store::connect(&settings.store)?;
            store.setup(force).context("Setup failed")?;
            println!("✓ Tables created in {}", settings.store.path.display());
        }

        Command::Check => {
            let engine = open(&settings)?;
            println!("✓ Schema: {}", SchemaStatus::Ok);
            println!("✓ Sources: {}", engine.registry().len());
            println!("✓ Readings: {}", engine.store().count_readings(None)?);
        }

        Command::Register {
            name,
            type_tag,
            short_id,
            accuracy,
            parameters,
        } => {
            let engine = open(&settings)?;
            let mut source = NewSource::new(name, type_tag)
                .with_accuracy(accuracy)
                .with_parameters(parameters);
            if let Some(short_id) = short_id {
                source = source.with_short_id(short_id);
            }
            let public_id = engine.register_source(source)?;
            println!("{}", public_id);
        }

        Command::Record { id, value, ts } => {
            let engine = open(&settings)?;
            let public_id = resolve(&engine, &id)?;
            engine.record(&public_id, value, ts)?;
            info!("Recorded {} for {}", value, public_id);
        }

        Command::Sources { id } => {
            let engine = open(&settings)?;
            let public_id = id.map(|id| resolve(&engine, &id)).transpose()?;
            for source in engine.list_sources(public_id.as_deref())? {
                println!("{}", serde_json::to_string(&source)?);
            }
        }

        Command::Latest { ids } => {
            let engine = open(&settings)?;
            let ids = ids
                .iter()
                .map(|id| resolve(&engine, id))
                .collect::<Result<Vec<_>>>()?;
            let latest = engine.latest_many(&ids);
            if latest.is_empty() {
                bail!("No such source or no data");
            }
            for (public_id, latest) in latest {
                println!(
                    "{}",
                    json!({ "uuid": public_id, "value": latest.value, "ts": latest.timestamp })
                );
            }
        }

        Command::Query {
            ids,
            start,
            end,
            limit,
            group_by,
            mode,
            reverse,
        } => {
            let engine = open(&settings)?;
            let mode: AggregationMode = mode.parse()?;
            let ids: Vec<String> = ids
                .iter()
                .map(|id| resolve(&engine, id).unwrap_or_else(|_| id.clone()))
                .collect();

            let mut spec = QuerySpec::new(ids).limit(limit).group_by(group_by, mode);
            spec.start = start;
            spec.end = end;
            if reverse {
                spec = spec.descending();
            }

            let mut stream = engine.query(&spec);
            for record in stream.by_ref() {
                println!("{}", serde_json::to_string(&record)?);
            }
            if let Some(e) = stream.error() {
                bail!("Query failed: {}", e);
            }
            stream.release();
        }

        Command::Import { id, csv } => {
            let engine = open(&settings)?;
            let public_id = resolve(&engine, &id)?;
            let readings = load_readings(&csv)?;
            let summary = import_readings(&engine, &public_id, &readings)?;
            println!(
                "✓ Imported {} readings ({} rejected)",
                summary.accepted, summary.rejected
            );
        }
    }

    Ok(())
}

fn open(settings: &Settings) -> Result<DataPoints> {
    DataPoints::open(&settings.store)
        .with_context(|| format!("Unable to open {}", settings.store.path.display()))
}

/// Accept either a public uuid or a short id
fn resolve(engine: &DataPoints, id: &str) -> Result<String> {
    if engine.registry().resolve(id).is_some() {
        return Ok(id.to_string());
    }
    engine
        .resolve_short_id(id)
        .ok_or_else(|| Error::NotFound(id.to_string()).into())
}
