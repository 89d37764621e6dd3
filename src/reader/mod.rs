//! DuckDB access layer
//!
//! - [`connection`] classifies the configured target
//! - [`connector`] owns the shared database and its one-time boot sequence
//! - [`duckdb`] executes SQL on a booted connection and builds result frames,
//!   routing every column through the converter registry
//!
//! # Example
//!
//! ```rust,ignore
//! use duckdb_datasource::reader::{DuckDbReader, Reader};
//!
//! let conn = connector.connect()?;
//! let reader = DuckDbReader::new(conn, &converters);
//! let df = reader.execute("SELECT * FROM sales")?;
//! ```

use crate::{DataFrame, Result};

pub mod connection;
pub mod connector;
pub mod duckdb;

pub use self::duckdb::DuckDbReader;

/// Trait for data source readers
///
/// Readers execute SQL and return frames, and answer the table and column
/// lookups the query editor relies on.
pub trait Reader {
    /// Execute a SQL query and return the result as a DataFrame
    ///
    /// # Errors
    ///
    /// Returns `DataSourceError::ExecutionError` if the SQL is invalid or
    /// fails, and `DataSourceError::ConversionError` if a value cannot be
    /// converted to its column's output type.
    fn execute(&self, sql: &str) -> Result<DataFrame>;

    /// List user tables visible on the connection
    fn tables(&self) -> Result<Vec<String>>;

    /// List the columns of `table` in declaration order
    fn columns(&self, table: &str) -> Result<Vec<String>>;
}
