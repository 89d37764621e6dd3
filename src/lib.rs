/*!
# duckdb-datasource - DuckDB and MotherDuck as a SQL data source

Backend adapter that lets a dashboarding host query an embedded DuckDB engine,
or a MotherDuck catalog attached into it, like any other relational database.

## Example

```rust,ignore
use duckdb_datasource::{DuckDbDriver, HostEnvironment, PluginSettings, QueryRequest};

let settings = PluginSettings::default(); // in-memory database
let driver = DuckDbDriver::from_settings(&settings, &HostEnvironment::from_env())?;
let response = driver.query(&QueryRequest::new(
    "A",
    "SELECT 42 AS answer WHERE now() > $__timeFrom()",
    time_range,
))?;
```

## Architecture

A query flows through four layers:
- **Settings** → instance payload decoded into [`PluginSettings`]
- **Connector** → one database per configuration, booted once (extensions,
  MotherDuck token and `ATTACH`, user init SQL)
- **Macros** → `$__timeFrom()`, `$__timeTo()` and `$__timeFilter(col)` rewritten
  into literal UTC bounds
- **Converters** → DuckDB column types without a frame equivalent (`HUGEINT`,
  `DECIMAL`, narrow ints and floats) mapped to nullable output columns

## Core Components

- [`settings`] - Instance settings decoding
- [`reader`] - Target parsing, connector bootstrap and frame building
- [`macros`] - Time range macro expansion
- [`convert`] - Type converter registry
- [`driver`] - Driver façade, request and health types
- [`instance`] - One driver per data source configuration
- [`retry`] - Applying the declared retry policy
- [`frame`] - JSON encoding of result frames
*/

pub mod convert;
pub mod driver;
pub mod frame;
pub mod instance;
pub mod macros;
pub mod reader;
pub mod retry;
pub mod settings;

pub use convert::{Converter, ConverterRegistry, FieldType, FieldValue, NativeValue};
pub use driver::{
    DriverSettings, DuckDbDriver, FillMode, HealthCheckResult, HealthStatus, QueryRequest,
    QueryResponse, ResultFormat, RetryPolicy,
};
pub use instance::InstanceManager;
pub use macros::{MacroTable, TimeRange};
pub use reader::connector::{BootState, Connector, HostEnvironment};
pub use settings::{DataSourceInstanceSettings, PluginSettings, SecretPluginSettings};

// Result frames are Polars DataFrames
pub use polars::prelude::DataFrame;

/// Main library error type
#[derive(thiserror::Error, Debug)]
pub enum DataSourceError {
    #[error("Invalid settings: {0}")]
    SettingsError(String),

    /// Malformed or missing configuration, reported verbatim
    #[error("{0}")]
    ConfigError(String),

    #[error("Boot query failed: {0}")]
    BootError(String),

    #[error("Macro error: {0}")]
    MacroError(String),

    #[error("Conversion error: {0}")]
    ConversionError(String),

    #[error("Query execution error: {0}")]
    ExecutionError(String),

    #[error("Health check failed: {message}")]
    HealthCheckError {
        message: String,
        detail: Option<String>,
    },

    #[error("Internal error: {0}")]
    InternalError(String),
}

pub type Result<T> = std::result::Result<T, DataSourceError>;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod integration_tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn range() -> TimeRange {
        TimeRange::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
        )
    }

    #[test]
    fn test_end_to_end_conversion_and_macros() {
        let settings = PluginSettings {
            init_sql: "CREATE TABLE metrics AS SELECT * FROM (VALUES \
                       (TIMESTAMP '2024-01-01 06:00:00', '92233720368547758080'::HUGEINT, 123.45::DECIMAL(10,2), 32000::SMALLINT, 1.5::FLOAT), \
                       (TIMESTAMP '2024-01-03 06:00:00', NULL, NULL, NULL, NULL)) t(ts, big, price, small, ratio)"
                .to_string(),
            ..Default::default()
        };
        let driver = DuckDbDriver::from_settings(&settings, &HostEnvironment::default()).unwrap();

        let request = QueryRequest::new(
            "A",
            "SELECT big, price, small, ratio FROM metrics WHERE $__timeFilter(ts)",
            range(),
        );
        let response = driver.query(&request).unwrap();

        assert_eq!(
            response.executed_sql,
            "SELECT big, price, small, ratio FROM metrics WHERE ts >= '2024-01-01T00:00:00Z' AND ts <= '2024-01-02T00:00:00Z'"
        );

        let df = response.frame;
        assert_eq!(df.shape(), (1, 4));

        let big = df.column("big").unwrap().as_materialized_series().str().unwrap().get(0);
        assert_eq!(big, Some("92233720368547758080"));

        let price = df.column("price").unwrap().as_materialized_series().f64().unwrap().get(0).unwrap();
        assert!((price - 123.45).abs() < 1e-9);

        let small = df.column("small").unwrap().as_materialized_series().i16().unwrap().get(0);
        assert_eq!(small, Some(32000));

        let ratio = df.column("ratio").unwrap().as_materialized_series().f64().unwrap().get(0);
        assert_eq!(ratio, Some(1.5));
    }

    #[test]
    fn test_null_values_stay_null_after_conversion() {
        let driver = DuckDbDriver::from_settings(&PluginSettings::default(), &HostEnvironment::default()).unwrap();
        let request = QueryRequest::new(
            "A",
            "SELECT NULL::HUGEINT AS big, NULL::DECIMAL(10,2) AS price, NULL::TINYINT AS tiny",
            range(),
        );
        let df = driver.query(&request).unwrap().frame;

        assert_eq!(df.shape(), (1, 3));
        assert_eq!(df.column("big").unwrap().null_count(), 1);
        assert_eq!(df.column("price").unwrap().null_count(), 1);
        assert_eq!(df.column("tiny").unwrap().null_count(), 1);
        assert_eq!(df.column("big").unwrap().dtype(), &polars::prelude::DataType::String);
        assert_eq!(df.column("tiny").unwrap().dtype(), &polars::prelude::DataType::Int16);
    }

    #[test]
    fn test_bad_macro_arguments_fail_query() {
        let driver = DuckDbDriver::from_settings(&PluginSettings::default(), &HostEnvironment::default()).unwrap();
        let request = QueryRequest::new("A", "SELECT $__timeFrom(1, 2)", range());

        let err = driver.query(&request).unwrap_err();
        assert!(matches!(err, DataSourceError::MacroError(_)));
        assert!(err.to_string().contains("expected 0 arguments, received 2"));
    }
}
