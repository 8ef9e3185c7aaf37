// dataPoints - Web Server
// REST + WebSocket ingestion and queries with Axum

use axum::{
    extract::{
        rejection::JsonRejection,
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use clap::Parser;
use datapoints::{
    AggregationMode, DataPoints, Error, NewSource, QuerySpec, Record, SchemaStatus, Settings,
    Store,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

#[derive(Parser)]
#[command(
    name = "datapoints-server",
    version,
    about = "dataPoints - Gather all your data points in one place"
)]
struct Args {
    /// TOML configuration file
    #[arg(long, short, env = "DATAPOINTS_CONFIG")]
    config: Option<PathBuf>,

    /// Log to file instead of stderr
    #[arg(long, value_name = "FILE")]
    logfile: Option<PathBuf>,

    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Address to listen on
    #[arg(long, value_name = "ADDRESS")]
    listen: Option<String>,

    /// Which database to use
    #[arg(long, value_name = "DATABASE")]
    database: Option<PathBuf>,

    /// Create necessary tables and exit
    #[arg(long)]
    setup: bool,

    /// Causes setup to delete tables if necessary (NOTE! YOU'LL LOSE ALL EXISTING DATA)
    #[arg(long, requires = "setup")]
    force: bool,
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    engine: Arc<DataPoints>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

fn create_result(code: StatusCode, status: impl Into<String>, data: Option<Value>) -> Response {
    let body = ApiResponse {
        status: status.into(),
        data,
    };
    (code, Json(body)).into_response()
}

fn error_status(e: &Error) -> StatusCode {
    match e {
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        e if e.is_client_error() => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_result(e: &Error) -> Response {
    create_result(error_status(e), e.to_string(), None)
}

fn invalid_json(rejection: JsonRejection) -> Response {
    debug!("Rejected request body: {}", rejection);
    create_result(StatusCode::BAD_REQUEST, "Invalid or missing JSON data", None)
}

/// Run blocking store work off the async runtime
async fn blocking<T, F>(state: &AppState, f: F) -> Result<T, Response>
where
    T: Send + 'static,
    F: FnOnce(&DataPoints) -> T + Send + 'static,
{
    let engine = Arc::clone(&state.engine);
    tokio::task::spawn_blocking(move || f(&engine))
        .await
        .map_err(|e| {
            error!("Worker task failed: {}", e);
            create_result(StatusCode::INTERNAL_SERVER_ERROR, "Internal error", None)
        })
}

// ============================================================================
// Request types
// ============================================================================

#[derive(Deserialize)]
struct RegisterRequest {
    name: String,
    #[serde(rename = "type")]
    type_tag: i64,
    #[serde(default)]
    sid: Option<String>,
    #[serde(default)]
    accuracy: Option<i64>,
    #[serde(default)]
    parameters: Option<String>,
}

impl From<RegisterRequest> for NewSource {
    fn from(req: RegisterRequest) -> Self {
        let mut source = NewSource::new(req.name, req.type_tag);
        if let Some(sid) = req.sid {
            source = source.with_short_id(sid);
        }
        if let Some(accuracy) = req.accuracy {
            source = source.with_accuracy(accuracy);
        }
        if let Some(parameters) = req.parameters {
            source = source.with_parameters(parameters);
        }
        source
    }
}

#[derive(Deserialize)]
struct EntryRequest {
    value: i64,
    #[serde(default)]
    ts: Option<i64>,
}

/// `uuid` may be a single id or a list of ids
#[derive(Deserialize)]
#[serde(untagged)]
enum Ids {
    One(String),
    Many(Vec<String>),
}

impl Ids {
    fn into_vec(self) -> Vec<String> {
        match self {
            Ids::One(id) => vec![id],
            Ids::Many(ids) => ids,
        }
    }
}

#[derive(Deserialize)]
struct RangeRequest {
    #[serde(default)]
    start: Option<i64>,
    #[serde(default)]
    end: Option<i64>,
}

#[derive(Deserialize)]
struct QueryRequest {
    uuid: Ids,
    #[serde(default)]
    count: u64,
    #[serde(default)]
    groupby: u64,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    reverse: bool,
    #[serde(default)]
    range: Option<RangeRequest>,
}

impl QueryRequest {
    fn into_spec(self) -> Result<QuerySpec, String> {
        let mode: AggregationMode = match self.mode.as_deref() {
            Some(mode) => mode.parse().map_err(|_| "Unsupported mode".to_string())?,
            None => AggregationMode::None,
        };

        let mut spec = QuerySpec::new(self.uuid.into_vec())
            .limit(self.count)
            .group_by(self.groupby, mode);

        if let Some(range) = self.range {
            match (range.start, range.end) {
                (None, None) => return Err("Using range requires start, end or both".into()),
                (Some(start), Some(end)) if end < start => {
                    return Err("Start of range has to be before end of range".into())
                }
                _ => {}
            }
            spec.start = range.start;
            spec.end = range.end;
        }

        if self.reverse {
            spec = spec.descending();
        }
        Ok(spec)
    }
}

/// One WebSocket ingestion item
#[derive(Deserialize)]
struct StreamItem {
    uuid: String,
    data: EntryRequest,
    #[serde(default)]
    id: Option<Value>,
}

// ============================================================================
// API Handlers
// ============================================================================

/// POST /register - Register a new source
async fn register(
    State(state): State<AppState>,
    body: Result<Json<RegisterRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match body {
        Ok(body) => body,
        Err(rejection) => return invalid_json(rejection),
    };

    match blocking(&state, move |engine| engine.register_source(req.into())).await {
        Ok(Ok(uuid)) => create_result(StatusCode::OK, "Source registered", Some(json!({ "uuid": uuid }))),
        Ok(Err(e)) => error_result(&e),
        Err(response) => response,
    }
}

/// PUT /entry/:uuid - Record a reading
async fn add_entry(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
    body: Result<Json<EntryRequest>, JsonRejection>,
) -> Response {
    let Json(entry) = match body {
        Ok(body) => body,
        Err(rejection) => return invalid_json(rejection),
    };

    match blocking(&state, move |engine| engine.record(&uuid, entry.value, entry.ts)).await {
        Ok(Ok(())) => create_result(StatusCode::OK, "OK", None),
        Ok(Err(e)) => error_result(&e),
        Err(response) => response,
    }
}

/// GET /entry/:uuid - Latest reading of a source
async fn get_entry(State(state): State<AppState>, Path(uuid): Path<String>) -> Response {
    match state.engine.latest(&uuid) {
        Some(latest) => create_result(
            StatusCode::OK,
            "OK",
            Some(json!([{ "uuid": uuid, "ts": latest.timestamp, "value": latest.value }])),
        ),
        None => create_result(StatusCode::NOT_FOUND, "No such UUID or no data", None),
    }
}

/// GET /sources - All registered sources
async fn list_sources(State(state): State<AppState>) -> Response {
    sources_result(&state, None).await
}

/// GET /source/:uuid - One registered source
async fn get_source(State(state): State<AppState>, Path(uuid): Path<String>) -> Response {
    sources_result(&state, Some(uuid)).await
}

async fn sources_result(state: &AppState, uuid: Option<String>) -> Response {
    match blocking(state, move |engine| engine.list_sources(uuid.as_deref())).await {
        Ok(Ok(sources)) => create_result(StatusCode::OK, "OK", serde_json::to_value(sources).ok()),
        Ok(Err(e)) => error_result(&e),
        Err(response) => response,
    }
}

/// GET /sid/:short_id - Public uuid for a short id
async fn resolve_sid(State(state): State<AppState>, Path(sid): Path<String>) -> Response {
    match blocking(&state, move |engine| engine.resolve_short_id(&sid)).await {
        Ok(Some(uuid)) => create_result(StatusCode::OK, "OK", Some(json!({ "uuid": uuid }))),
        Ok(None) => create_result(StatusCode::NOT_FOUND, "No such short id", None),
        Err(response) => response,
    }
}

/// POST /query - Historical readings, optionally bucketed
async fn query(
    State(state): State<AppState>,
    body: Result<Json<QueryRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match body {
        Ok(body) => body,
        Err(rejection) => return invalid_json(rejection),
    };
    let spec = match req.into_spec() {
        Ok(spec) => spec,
        Err(message) => return create_result(StatusCode::BAD_REQUEST, message, None),
    };

    let outcome = blocking(&state, move |engine| {
        let mut stream = engine.query(&spec);
        let records: Vec<Record> = stream.by_ref().collect();
        let result = match stream.error() {
            Some(Error::StreamReleased) | None => Ok(records),
            Some(e) => Err(error_result(e)),
        };
        stream.release();
        result
    })
    .await;

    match outcome {
        Ok(Ok(records)) => create_result(StatusCode::OK, "OK", serde_json::to_value(records).ok()),
        Ok(Err(response)) | Err(response) => response,
    }
}

// ============================================================================
// WebSocket ingestion
// ============================================================================

/// GET /stream - WebSocket for pushing readings
async fn stream(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    info!("Source connected to WebSocket");

    while let Some(message) = socket.recv().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        debug!("Message from source: {}", text);

        let reply = match blocking(&state, move |engine| process_message(engine, &text)).await {
            Ok(reply) => reply,
            Err(_) => json!({ "status": "Internal error", "status_code": 500 }),
        };

        if socket.send(Message::Text(reply.to_string())).await.is_err() {
            break;
        }
    }

    info!("Source disconnected");
}

/// Handle one message: a single item or an array of items
fn process_message(engine: &DataPoints, text: &str) -> Value {
    let parsed: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            warn!("Source sent invalid message: {}", e);
            return invalid_data(e.to_string());
        }
    };

    match parsed {
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| process_item(engine, item))
                .collect(),
        ),
        item => process_item(engine, item),
    }
}

fn process_item(engine: &DataPoints, item: Value) -> Value {
    let item: StreamItem = match serde_json::from_value(item) {
        Ok(item) => item,
        Err(e) => {
            warn!("Source sent invalid item: {}", e);
            return invalid_data(e.to_string());
        }
    };

    let (status, code) = match engine.record(&item.uuid, item.data.value, item.data.ts) {
        Ok(()) => ("OK".to_string(), StatusCode::OK),
        Err(e) => (e.to_string(), error_status(&e)),
    };

    let mut reply = json!({ "status": status, "status_code": code.as_u16() });
    if let Some(id) = item.id {
        reply["id"] = id;
    }
    reply
}

fn invalid_data(description: String) -> Value {
    json!({ "status": "Invalid data", "status_code": 500, "description": description })
}

// ============================================================================
// Main Server
// ============================================================================

fn app(engine: Arc<DataPoints>) -> Router {
    let state = AppState { engine };

    Router::new()
        .route("/register", post(register))
        .route("/entry/:uuid", get(get_entry).put(add_entry))
        .route("/sources", get(list_sources))
        .route("/source/:uuid", get(get_source))
        .route("/sid/:sid", get(resolve_sid))
        .route("/query", post(query))
        .route("/stream", get(stream))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let mut settings = match Settings::load(args.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("❌ Invalid configuration: {}", e);
            return ExitCode::from(1);
        }
    };
    if let Some(path) = args.database {
        settings.store.path = path;
    }
    if let Some(file) = args.logfile {
        settings.log.file = Some(file);
    }
    if let Some(port) = args.port {
        settings.server.port = port;
    }
    if let Some(listen) = args.listen {
        settings.server.listen = listen;
    }

    if let Err(e) = datapoints::logging::init(&settings.log) {
        eprintln!("❌ {:#}", e);
        return ExitCode::from(1);
    }

    if args.setup {
        settings.store.create_if_missing = true;
        let result = Store::connect(&settings.store)
            .map_err(Error::from)
            .and_then(|store| store.setup(args.force));
        return match result {
            Ok(()) => {
                info!("Tables created successfully");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("Setup failed: {}", e);
                ExitCode::from(1)
            }
        };
    }

    let engine = match DataPoints::open(&settings.store) {
        Ok(engine) => Arc::new(engine),
        Err(Error::Schema(SchemaStatus::NotSetup)) => {
            error!("Database is not setup, use --setup to create necessary tables");
            return ExitCode::from(2);
        }
        Err(e) => {
            error!("Unable to start: {}", e);
            return ExitCode::from(1);
        }
    };

    let addr = format!("{}:{}", settings.server.listen, settings.server.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            return ExitCode::from(1);
        }
    };

    info!("dataPoints running on http://{}", addr);

    if let Err(e) = axum::serve(listener, app(engine)).await {
        error!("Server error: {}", e);
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}
