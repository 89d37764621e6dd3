//! Driver façade
//!
//! [`DuckDbDriver`] is what a host execution framework talks to: it owns the
//! connector of one data source instance together with the macro table and the
//! converter registry, and declares the execution policy the host applies.

use crate::convert::ConverterRegistry;
use crate::macros::{MacroTable, TimeRange};
use crate::reader::connector::{Connector, HostEnvironment};
use crate::reader::{DuckDbReader, Reader};
use crate::settings::{load_settings, DataSourceInstanceSettings, PluginSettings};
use crate::{DataFrame, DataSourceError, Result};
use duckdb::Connection;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How nulls in time series results are filled
///
/// Only DOUBLE (Float64) value columns are filled, row by row. Missing time
/// points are not inserted, and other columns keep their nulls.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FillMode {
    #[default]
    Null,
    Previous,
    Value(f64),
}

/// Declared retry policy
///
/// The driver never loops itself; hosts (and [`crate::retry::with_retries`])
/// consult it.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub retries: usize,
    pub pause: Duration,
    /// Message fragments that mark an execution error as transient
    pub retry_on: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            pause: Duration::from_millis(100),
            retry_on: Vec::new(),
        }
    }
}

impl RetryPolicy {
    pub fn should_retry(&self, error: &DataSourceError) -> bool {
        match error {
            DataSourceError::ExecutionError(message) => {
                self.retry_on.iter().any(|fragment| message.contains(fragment.as_str()))
            }
            _ => false,
        }
    }
}

/// Execution policy of a driver
#[derive(Debug, Clone, PartialEq)]
pub struct DriverSettings {
    pub timeout: Duration,
    pub fill_mode: FillMode,
    pub retry: RetryPolicy,
    pub forward_headers: bool,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            fill_mode: FillMode::Null,
            retry: RetryPolicy::default(),
            forward_headers: false,
        }
    }
}

/// Requested shape of a query result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResultFormat {
    #[default]
    Table,
    TimeSeries,
}

impl FromStr for ResultFormat {
    type Err = DataSourceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "table" => Ok(ResultFormat::Table),
            "timeseries" | "time_series" | "time-series" => Ok(ResultFormat::TimeSeries),
            other => Err(DataSourceError::SettingsError(format!(
                "Unknown result format '{}', expected 'table' or 'timeseries'",
                other
            ))),
        }
    }
}

/// A single query of a request
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub ref_id: String,
    pub raw_sql: String,
    #[serde(default)]
    pub format: ResultFormat,
    pub time_range: TimeRange,
}

impl QueryRequest {
    pub fn new(ref_id: impl Into<String>, raw_sql: impl Into<String>, time_range: TimeRange) -> Self {
        Self {
            ref_id: ref_id.into(),
            raw_sql: raw_sql.into(),
            format: ResultFormat::Table,
            time_range,
        }
    }

    pub fn with_format(mut self, format: ResultFormat) -> Self {
        self.format = format;
        self
    }
}

#[derive(Debug, Clone)]
pub struct QueryResponse {
    pub ref_id: String,
    /// SQL after macro expansion
    pub executed_sql: String,
    pub format: ResultFormat,
    pub frame: DataFrame,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthCheckResult {
    pub status: HealthStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl HealthCheckResult {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Ok,
            message: message.into(),
            detail: None,
        }
    }

    fn error(message: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Error,
            message: message.into(),
            detail: Some(detail.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == HealthStatus::Ok
    }

    /// Convert a non-OK result into `DataSourceError::HealthCheckError`
    pub fn into_result(self) -> Result<Self> {
        match self.status {
            HealthStatus::Ok => Ok(self),
            HealthStatus::Error => Err(DataSourceError::HealthCheckError {
                message: self.message,
                detail: self.detail,
            }),
        }
    }
}

/// Driver for one DuckDB / MotherDuck data source instance
pub struct DuckDbDriver {
    connector: Connector,
    settings: DriverSettings,
    macros: MacroTable,
    converters: ConverterRegistry,
}

impl DuckDbDriver {
    /// Build a driver from the host's instance payload
    pub fn new(instance: &DataSourceInstanceSettings, env: &HostEnvironment) -> Result<Self> {
        let settings = load_settings(instance)?;
        Self::from_settings(&settings, env)
    }

    pub fn from_settings(settings: &PluginSettings, env: &HostEnvironment) -> Result<Self> {
        let connector = Connector::new(settings, env)?;
        info!("Created DuckDB driver for {:?}", connector.target());
        Ok(Self {
            connector,
            settings: DriverSettings::default(),
            macros: MacroTable::default(),
            converters: ConverterRegistry::default(),
        })
    }

    pub fn with_settings(mut self, settings: DriverSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    pub fn fill_mode(&self) -> FillMode {
        self.settings.fill_mode
    }

    pub fn macros(&self) -> &MacroTable {
        &self.macros
    }

    pub fn converters(&self) -> &ConverterRegistry {
        &self.converters
    }

    pub fn connector(&self) -> &Connector {
        &self.connector
    }

    /// Open a connection handle, booting the database on first success
    pub fn connect(&self) -> Result<Connection> {
        self.connector.connect()
    }

    pub fn reader(&self) -> Result<DuckDbReader<'_>> {
        Ok(DuckDbReader::new(self.connect()?, &self.converters))
    }

    /// Run one query: connect, expand macros, execute and shape the frame
    pub fn query(&self, request: &QueryRequest) -> Result<QueryResponse> {
        let reader = self.reader()?;
        let executed_sql = self.macros.expand(&request.raw_sql, &request.time_range)?;
        debug!("Query {}: {}", request.ref_id, executed_sql);

        let frame = reader.execute(&executed_sql)?;
        let frame = match request.format {
            ResultFormat::Table => frame,
            ResultFormat::TimeSeries => shape_time_series(frame, self.settings.fill_mode)?,
        };

        Ok(QueryResponse {
            ref_id: request.ref_id.clone(),
            executed_sql,
            format: request.format,
            frame,
        })
    }

    pub fn check_health(&self) -> HealthCheckResult {
        let conn = match self.connect() {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Health check failed to connect: {}", e);
                return HealthCheckResult::error("Failed to connect to database", e.to_string());
            }
        };

        match conn.query_row("SELECT 1", [], |row| row.get::<_, i32>(0)) {
            Ok(_) => HealthCheckResult::ok("Data source is working"),
            Err(e) => HealthCheckResult::error("Health query failed", e.to_string()),
        }
    }

    pub fn tables(&self) -> Result<Vec<String>> {
        self.reader()?.tables()
    }

    pub fn columns(&self, table: &str) -> Result<Vec<String>> {
        self.reader()?.columns(table)
    }
}

/// Check a time series frame has a time column and fill numeric gaps
fn shape_time_series(frame: DataFrame, fill_mode: FillMode) -> Result<DataFrame> {
    let has_time = frame
        .get_columns()
        .iter()
        .any(|c| matches!(c.dtype(), DataType::Datetime(_, _) | DataType::Date));
    if !has_time {
        return Err(DataSourceError::ExecutionError(
            "Time series result requires a DATE or TIMESTAMP column".to_string(),
        ));
    }

    if fill_mode == FillMode::Null {
        return Ok(frame);
    }

    let mut columns = Vec::with_capacity(frame.width());
    for column in frame.get_columns() {
        let series = column.as_materialized_series();
        if series.dtype() != &DataType::Float64 {
            columns.push(column.clone());
            continue;
        }

        let ca = series
            .f64()
            .map_err(|e| DataSourceError::InternalError(format!("Failed to cast to f64: {}", e)))?;
        let mut previous = None;
        let filled: Vec<Option<f64>> = ca
            .into_iter()
            .map(|value| match (value, fill_mode) {
                (Some(v), _) => {
                    previous = Some(v);
                    Some(v)
                }
                (None, FillMode::Previous) => previous,
                (None, FillMode::Value(fill)) => Some(fill),
                (None, FillMode::Null) => None,
            })
            .collect();
        columns.push(Series::new(series.name().clone(), filled).into_column());
    }

    DataFrame::new(columns)
        .map_err(|e| DataSourceError::InternalError(format!("Failed to create DataFrame: {}", e)))
}
