/*!
duckdb-datasource REST backend

Serves DuckDB / MotherDuck data source queries over HTTP. Each request carries
the data source instance settings; one driver is kept per data source uid and
rebuilt when the settings' `updated` stamp changes.

## Usage

```bash
duckdb-datasource-server --host 127.0.0.1 --port 3334
```

## Endpoints

- `POST /api/v1/query` - Run the queries of a request against a data source
- `POST /api/v1/health` - Boot a data source and run its health query
- `POST /api/v1/tables` - List tables, or the columns of one table
- `GET /api/v1/health` - Server health
- `GET /api/v1/version` - Version information
*/

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use duckdb_datasource::frame::frame_to_json;
use duckdb_datasource::retry::with_retries;
use duckdb_datasource::{
    DataSourceError, DataSourceInstanceSettings, DuckDbDriver, HealthCheckResult, HostEnvironment,
    InstanceManager, QueryRequest, VERSION,
};

/// CLI arguments for the REST server
#[derive(Parser)]
#[command(name = "duckdb-datasource-server")]
#[command(about = "DuckDB / MotherDuck data source backend")]
#[command(version = VERSION)]
struct Cli {
    /// Host address to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port number to bind to
    #[arg(long, default_value = "3334")]
    port: u16,

    /// CORS allowed origins (comma-separated)
    #[arg(long, default_value = "*")]
    cors_origin: String,
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    instances: Arc<InstanceManager>,
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Request body for POST /api/v1/query
#[derive(Debug, Deserialize)]
struct QueryBody {
    datasource: DataSourceInstanceSettings,
    queries: Vec<QueryRequest>,
}

/// Request body for POST /api/v1/health
#[derive(Debug, Deserialize)]
struct DataSourceBody {
    datasource: DataSourceInstanceSettings,
}

/// Request body for POST /api/v1/tables
#[derive(Debug, Deserialize)]
struct TablesBody {
    datasource: DataSourceInstanceSettings,
    #[serde(default)]
    table: Option<String>,
}

/// Successful API response
#[derive(Debug, Serialize)]
struct ApiSuccess<T> {
    status: String,
    data: T,
}

impl<T> ApiSuccess<T> {
    fn new(data: T) -> Json<Self> {
        Json(Self {
            status: "success".to_string(),
            data,
        })
    }
}

/// Error API response
#[derive(Debug, Serialize)]
struct ApiError {
    status: String,
    error: ErrorDetails,
}

#[derive(Debug, Serialize)]
struct ErrorDetails {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

impl From<&DataSourceError> for ErrorDetails {
    fn from(err: &DataSourceError) -> Self {
        let detail = match err {
            DataSourceError::HealthCheckError { detail, .. } => detail.clone(),
            _ => None,
        };
        ErrorDetails {
            message: err.to_string(),
            error_type: classify(err).1.to_string(),
            detail,
        }
    }
}

/// Outcome of one query, keyed by ref id in the response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    executed_sql: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frame: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorDetails>,
}

#[derive(Debug, Serialize)]
struct QueryResults {
    results: BTreeMap<String, QueryResult>,
}

#[derive(Debug, Serialize)]
struct TablesResult {
    names: Vec<String>,
}

/// Health check response
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

/// Version response
#[derive(Debug, Serialize)]
struct VersionResponse {
    version: String,
    features: Vec<String>,
}

// ============================================================================
// Error Handling
// ============================================================================

/// Custom error type for API responses
struct ApiErrorResponse {
    status: StatusCode,
    error: ApiError,
}

impl IntoResponse for ApiErrorResponse {
    fn into_response(self) -> Response {
        let json = Json(self.error);
        (self.status, json).into_response()
    }
}

fn classify(err: &DataSourceError) -> (StatusCode, &'static str) {
    match err {
        DataSourceError::SettingsError(_) => (StatusCode::BAD_REQUEST, "SettingsError"),
        DataSourceError::ConfigError(_) => (StatusCode::BAD_REQUEST, "ConfigError"),
        DataSourceError::MacroError(_) => (StatusCode::BAD_REQUEST, "MacroError"),
        DataSourceError::ExecutionError(_) => (StatusCode::BAD_REQUEST, "ExecutionError"),
        DataSourceError::BootError(_) => (StatusCode::BAD_GATEWAY, "BootError"),
        DataSourceError::HealthCheckError { .. } => {
            (StatusCode::SERVICE_UNAVAILABLE, "HealthCheckError")
        }
        DataSourceError::ConversionError(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "ConversionError")
        }
        DataSourceError::InternalError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "InternalError"),
    }
}

impl From<DataSourceError> for ApiErrorResponse {
    fn from(err: DataSourceError) -> Self {
        ApiErrorResponse {
            status: classify(&err).0,
            error: ApiError {
                status: "error".to_string(),
                error: ErrorDetails::from(&err),
            },
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Run blocking driver work off the async runtime, bounded by `timeout`
///
/// A timeout only stops waiting: the blocking task keeps running until
/// DuckDB returns, and its connection handle is released then.
async fn run_blocking<T, F>(timeout: std::time::Duration, what: &str, work: F) -> Result<T, DataSourceError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, DataSourceError> + Send + 'static,
{
    match tokio::time::timeout(timeout, tokio::task::spawn_blocking(work)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(DataSourceError::InternalError(format!(
            "{} task failed: {}",
            what, e
        ))),
        Err(_) => Err(DataSourceError::ExecutionError(format!(
            "{} timed out after {:?}",
            what, timeout
        ))),
    }
}

async fn execute_query(driver: Arc<DuckDbDriver>, request: QueryRequest) -> QueryResult {
    let timeout = driver.settings().timeout;
    let what = format!("Query {}", request.ref_id);

    let outcome = run_blocking(timeout, &what, move || {
        let response = with_retries(&driver.settings().retry, &request.ref_id, || {
            driver.query(&request)
        })?;
        let frame = frame_to_json(&response.ref_id, &response.frame)?;
        Ok((response.executed_sql, frame))
    })
    .await;

    match outcome {
        Ok((executed_sql, frame)) => QueryResult {
            executed_sql: Some(executed_sql),
            frame: Some(frame),
            error: None,
        },
        Err(e) => {
            warn!("{} failed: {}", what, e);
            QueryResult {
                executed_sql: None,
                frame: None,
                error: Some(ErrorDetails::from(&e)),
            }
        }
    }
}

// ============================================================================
// Handler Functions
// ============================================================================

/// POST /api/v1/query - Run every query of the request
///
/// Failures of individual queries are reported per ref id; only an unusable
/// data source configuration fails the whole request.
async fn query_handler(
    State(state): State<AppState>,
    Json(body): Json<QueryBody>,
) -> Result<Json<ApiSuccess<QueryResults>>, ApiErrorResponse> {
    info!(
        "Executing {} queries for data source '{}'",
        body.queries.len(),
        body.datasource.uid
    );

    let driver = state.instances.get(&body.datasource)?;

    let mut results = BTreeMap::new();
    for request in body.queries {
        let ref_id = request.ref_id.clone();
        let result = execute_query(Arc::clone(&driver), request).await;
        results.insert(ref_id, result);
    }

    Ok(ApiSuccess::new(QueryResults { results }))
}

/// POST /api/v1/health - Data source health check
async fn check_health_handler(
    State(state): State<AppState>,
    Json(body): Json<DataSourceBody>,
) -> Result<Json<ApiSuccess<HealthCheckResult>>, ApiErrorResponse> {
    let driver = state.instances.get(&body.datasource)?;
    let timeout = driver.settings().timeout;

    let result = run_blocking(timeout, "Health check", move || Ok(driver.check_health())).await?;
    Ok(ApiSuccess::new(result.into_result()?))
}

/// POST /api/v1/tables - Table and column discovery
async fn tables_handler(
    State(state): State<AppState>,
    Json(body): Json<TablesBody>,
) -> Result<Json<ApiSuccess<TablesResult>>, ApiErrorResponse> {
    let driver = state.instances.get(&body.datasource)?;
    let timeout = driver.settings().timeout;
    let table = body.table;

    let names = run_blocking(timeout, "Table lookup", move || match table {
        Some(table) => driver.columns(&table),
        None => driver.tables(),
    })
    .await?;

    Ok(ApiSuccess::new(TablesResult { names }))
}

/// GET /api/v1/health - Server health
async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: VERSION.to_string(),
    })
}

/// GET /api/v1/version - Version information
async fn version_handler() -> Json<VersionResponse> {
    Json(VersionResponse {
        version: VERSION.to_string(),
        features: vec![
            "duckdb".to_string(),
            "motherduck".to_string(),
            "rest".to_string(),
        ],
    })
}

/// Root handler
async fn root_handler() -> &'static str {
    "duckdb-datasource backend - See /api/v1/health for status"
}

fn router(state: AppState, cors: CorsLayer) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/api/v1/query", post(query_handler))
        .route("/api/v1/health", get(health_handler).post(check_health_handler))
        .route("/api/v1/tables", post(tables_handler))
        .route("/api/v1/version", get(version_handler))
        .layer(cors)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "duckdb_datasource=info,duckdb_datasource_server=info,tower_http=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let env = HostEnvironment::from_env();
    match &env.data_path {
        Some(path) => info!("DuckDB data directory: {}", path.display()),
        None => info!("No data directory configured, using DuckDB defaults"),
    }

    let state = AppState {
        instances: Arc::new(InstanceManager::new(env)),
    };

    // Configure CORS
    let cors = if cli.cors_origin == "*" {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(vec![header::CONTENT_TYPE])
    } else {
        let origins: Vec<_> = cli
            .cors_origin
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(vec![header::CONTENT_TYPE])
    };

    let app = router(state, cors);

    let addr: SocketAddr = format!("{}:{}", cli.host, cli.port).parse()?;

    info!("Starting duckdb-datasource backend on {}", addr);
    info!("API documentation:");
    info!("  POST /api/v1/query   - Run data source queries");
    info!("  POST /api/v1/health  - Data source health check");
    info!("  POST /api/v1/tables  - Table and column discovery");
    info!("  GET  /api/v1/health  - Server health");
    info!("  GET  /api/v1/version - Version info");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
