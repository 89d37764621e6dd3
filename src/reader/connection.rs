//! Connection target parsing for DuckDB data sources
//!
//! Classifies the configured `path` into an in-memory database, a local
//! database file, or a MotherDuck catalog to be attached.

use crate::{DataSourceError, Result};

/// Prefix selecting a MotherDuck catalog
pub const MOTHERDUCK_PREFIX: &str = "md:";

/// Parsed connection target
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionTarget {
    /// DuckDB in-memory database
    Memory,
    /// DuckDB file-based database
    File(String),
    /// MotherDuck catalog attached into an in-memory DuckDB
    MotherDuck(String),
}

impl ConnectionTarget {
    pub fn is_remote(&self) -> bool {
        matches!(self, ConnectionTarget::MotherDuck(_))
    }

    /// Path handed to DuckDB when opening the local engine
    ///
    /// `None` means an in-memory database.
    pub fn database_path(&self) -> Option<&str> {
        match self {
            ConnectionTarget::File(path) => Some(path),
            ConnectionTarget::Memory | ConnectionTarget::MotherDuck(_) => None,
        }
    }
}

/// Parse a configured path into a connection target
///
/// # Supported Formats
///
/// - `""` - DuckDB in-memory database
/// - `md:<catalog>` - MotherDuck catalog (e.g. `md:sample_data`)
/// - anything else - DuckDB database file
///
/// Surrounding whitespace is ignored. A path wrapped in matching single or
/// double quotes is rejected instead of being handed to DuckDB.
///
/// # Examples
///
/// ```
/// use duckdb_datasource::reader::connection::{parse_target, ConnectionTarget};
///
/// let target = parse_target("md:sample_data").unwrap();
/// assert_eq!(target, ConnectionTarget::MotherDuck("md:sample_data".to_string()));
///
/// let target = parse_target("").unwrap();
/// assert_eq!(target, ConnectionTarget::Memory);
/// ```
pub fn parse_target(path: &str) -> Result<ConnectionTarget> {
    let trimmed = path.trim();

    let quoted = (trimmed.starts_with('\'') && trimmed.ends_with('\''))
        || (trimmed.starts_with('"') && trimmed.ends_with('"'));
    if quoted {
        return Err(DataSourceError::ConfigError(format!(
            "Invalid path: {} -> example input: md:sample_data",
            trimmed
        )));
    }

    if trimmed.starts_with(MOTHERDUCK_PREFIX) {
        return Ok(ConnectionTarget::MotherDuck(trimmed.to_string()));
    }

    if trimmed.is_empty() {
        return Ok(ConnectionTarget::Memory);
    }

    Ok(ConnectionTarget::File(trimmed.to_string()))
}

/// Render a value as a single-quoted SQL string literal
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_is_memory() {
        assert_eq!(parse_target("").unwrap(), ConnectionTarget::Memory);
        assert_eq!(parse_target("   ").unwrap(), ConnectionTarget::Memory);
    }

    #[test]
    fn test_file_relative() {
        let target = parse_target("data.duckdb").unwrap();
        assert_eq!(target, ConnectionTarget::File("data.duckdb".to_string()));
        assert_eq!(target.database_path(), Some("data.duckdb"));
    }

    #[test]
    fn test_file_absolute_is_trimmed() {
        let target = parse_target("  /var/lib/data/metrics.db \n").unwrap();
        assert_eq!(
            target,
            ConnectionTarget::File("/var/lib/data/metrics.db".to_string())
        );
    }

    #[test]
    fn test_motherduck() {
        let target = parse_target("md:sample").unwrap();
        assert_eq!(target, ConnectionTarget::MotherDuck("md:sample".to_string()));
        assert!(target.is_remote());
        assert_eq!(target.database_path(), None);
    }

    #[test]
    fn test_quoted_paths_rejected() {
        for path in ["'md:sample'", "\"md:sample\"", " 'data.db' "] {
            let result = parse_target(path);
            assert!(
                matches!(result, Err(DataSourceError::ConfigError(_))),
                "expected config error for {}",
                path
            );
        }
        let err = parse_target("'md:sample'").unwrap_err();
        assert!(err.to_string().contains("Invalid path: 'md:sample'"));
    }

    #[test]
    fn test_half_quoted_path_is_a_file() {
        let target = parse_target("'data.db").unwrap();
        assert_eq!(target, ConnectionTarget::File("'data.db".to_string()));
    }

    #[test]
    fn test_quote_literal_doubles_quotes() {
        assert_eq!(quote_literal("md:sample"), "'md:sample'");
        assert_eq!(quote_literal("md:weird'name"), "'md:weird''name'");
    }
}
