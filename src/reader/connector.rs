//! One-time connector bootstrap
//!
//! A [`Connector`] owns a single DuckDB database per data source
//! configuration. The first successful [`Connector::connect`] runs the boot
//! sequence (directory settings, MotherDuck extension and token, `ATTACH`,
//! user init SQL) under a mutex; every later caller only clones a handle.
//!
//! A failed boot leaves the connector [`BootState::Uninitialized`] so the
//! next caller runs the full sequence again.

use crate::reader::connection::{parse_target, quote_literal, ConnectionTarget};
use crate::settings::PluginSettings;
use crate::{DataSourceError, Result};
use duckdb::Connection;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

/// Environment variable holding the host's data directory
pub const DATA_PATH_ENV: &str = "GF_PATHS_DATA";

/// Host-provided environment consulted while booting
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostEnvironment {
    /// Base directory for DuckDB's home, extension and secret directories
    pub data_path: Option<PathBuf>,
}

impl HostEnvironment {
    pub fn from_env() -> Self {
        let data_path = std::env::var_os(DATA_PATH_ENV)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from);
        Self { data_path }
    }

    pub fn with_data_path(path: impl Into<PathBuf>) -> Self {
        Self {
            data_path: Some(path.into()),
        }
    }
}

/// Boot progress of a connector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootState {
    Uninitialized,
    Initialized,
}

/// A single statement of the boot sequence
#[derive(Clone, PartialEq)]
pub struct BootQuery {
    pub label: &'static str,
    pub sql: String,
    /// Statement embeds a credential and must not be logged
    pub sensitive: bool,
}

impl BootQuery {
    fn new(label: &'static str, sql: String) -> Self {
        Self {
            label,
            sql,
            sensitive: false,
        }
    }

    fn sensitive(label: &'static str, sql: String) -> Self {
        Self {
            label,
            sql,
            sensitive: true,
        }
    }
}

impl std::fmt::Debug for BootQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sql = if self.sensitive { "<redacted>" } else { &self.sql };
        f.debug_struct("BootQuery")
            .field("label", &self.label)
            .field("sql", &sql)
            .finish()
    }
}

fn directory_setting(name: &str, path: &Path) -> String {
    format!("SET {}={};", name, quote_literal(&path.to_string_lossy()))
}

/// Build the ordered boot sequence for a target
///
/// Directory settings come before extension loading, and the token is set
/// before the catalog is attached.
pub fn boot_queries(
    target: &ConnectionTarget,
    settings: &PluginSettings,
    env: &HostEnvironment,
) -> Vec<BootQuery> {
    let mut queries = Vec::new();

    if let Some(home) = &env.data_path {
        queries.push(BootQuery::new(
            "home directory",
            directory_setting("home_directory", home),
        ));
        queries.push(BootQuery::new(
            "extension directory",
            directory_setting("extension_directory", &home.join(".duckdb/extensions")),
        ));
        queries.push(BootQuery::new(
            "secret directory",
            directory_setting("secret_directory", &home.join(".duckdb/stored_secrets")),
        ));
    }

    let token = &settings.secrets.motherduck_token;
    if target.is_remote() || !token.is_empty() {
        queries.push(BootQuery::new(
            "install motherduck",
            "INSTALL 'motherduck';".to_string(),
        ));
        queries.push(BootQuery::new(
            "load motherduck",
            "LOAD 'motherduck';".to_string(),
        ));
        queries.push(BootQuery::sensitive(
            "motherduck token",
            format!("SET motherduck_token={};", quote_literal(token)),
        ));
    }

    if let ConnectionTarget::MotherDuck(catalog) = target {
        queries.push(BootQuery::new(
            "attach catalog",
            format!(
                "ATTACH IF NOT EXISTS {} (TYPE motherduck);",
                quote_literal(catalog)
            ),
        ));
    }

    if !settings.init_sql.trim().is_empty() {
        queries.push(BootQuery::new("init sql", settings.init_sql.clone()));
    }

    queries
}

/// Lazily booted DuckDB connector shared by every query of one data source
pub struct Connector {
    target: ConnectionTarget,
    boot_queries: Vec<BootQuery>,
    database: Mutex<Option<Connection>>,
    state: Mutex<BootState>,
}

impl Connector {
    /// Validate the configuration and prepare the boot sequence
    ///
    /// No database is opened here.
    ///
    /// # Errors
    ///
    /// Returns `DataSourceError::ConfigError` if:
    /// - The path is wrapped in quotes
    /// - A MotherDuck path is configured without a token
    pub fn new(settings: &PluginSettings, env: &HostEnvironment) -> Result<Self> {
        let target = parse_target(&settings.path)?;

        if target.is_remote() && settings.secrets.motherduck_token.is_empty() {
            return Err(DataSourceError::ConfigError(
                "MotherDuck token is missing for MotherDuck connection".to_string(),
            ));
        }

        match &target {
            ConnectionTarget::Memory => info!("Using in-memory DuckDB database"),
            ConnectionTarget::File(path) => info!("Local file path is: {}", path),
            ConnectionTarget::MotherDuck(catalog) => {
                info!("Using MotherDuck catalog {} over in-memory DuckDB", catalog)
            }
        }

        let boot_queries = boot_queries(&target, settings, env);

        Ok(Self {
            target,
            boot_queries,
            database: Mutex::new(None),
            state: Mutex::new(BootState::Uninitialized),
        })
    }

    pub fn target(&self) -> &ConnectionTarget {
        &self.target
    }

    pub fn boot_queries(&self) -> &[BootQuery] {
        &self.boot_queries
    }

    pub fn state(&self) -> Result<BootState> {
        let state = self.state.lock().map_err(|e| {
            DataSourceError::InternalError(format!("Failed to lock boot state: {}", e))
        })?;
        Ok(*state)
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self.state(), Ok(BootState::Initialized))
    }

    /// Get a booted connection to the shared database
    ///
    /// Safe to call concurrently; the boot sequence runs at most once per
    /// successful boot.
    pub fn connect(&self) -> Result<Connection> {
        let conn = self.open_handle()?;
        self.ensure_initialized(&conn)?;
        Ok(conn)
    }

    /// Run the boot sequence on `conn` unless a previous call completed it
    pub fn ensure_initialized(&self, conn: &Connection) -> Result<()> {
        let mut state = self.state.lock().map_err(|e| {
            DataSourceError::InternalError(format!("Failed to lock boot state: {}", e))
        })?;

        if *state == BootState::Initialized {
            return Ok(());
        }

        info!("Booting DuckDB connector ({} statements)", self.boot_queries.len());
        for query in &self.boot_queries {
            debug!(step = query.label, "Running boot query: {:?}", query);
            conn.execute_batch(&query.sql).map_err(|e| {
                DataSourceError::BootError(format!("{}: {}", query.label, e))
            })?;
        }

        *state = BootState::Initialized;
        info!("DuckDB connector initialized");
        Ok(())
    }

    /// Clone a handle from the shared database, opening it on first use
    fn open_handle(&self) -> Result<Connection> {
        let mut database = self.database.lock().map_err(|e| {
            DataSourceError::InternalError(format!("Failed to lock database handle: {}", e))
        })?;

        if database.is_none() {
            let conn = match self.target.database_path() {
                None => Connection::open_in_memory().map_err(|e| {
                    DataSourceError::ExecutionError(format!(
                        "Failed to open in-memory DuckDB: {}",
                        e
                    ))
                })?,
                Some(path) => Connection::open(path).map_err(|e| {
                    DataSourceError::ExecutionError(format!(
                        "Failed to open DuckDB file '{}': {}",
                        path, e
                    ))
                })?,
            };
            *database = Some(conn);
        }

        match database.as_ref() {
            Some(conn) => conn.try_clone().map_err(|e| {
                DataSourceError::ExecutionError(format!("Failed to clone DuckDB connection: {}", e))
            }),
            None => Err(DataSourceError::InternalError(
                "DuckDB database was not opened".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::SecretPluginSettings;
    use std::sync::Arc;

    fn settings(path: &str, token: &str, init_sql: &str) -> PluginSettings {
        PluginSettings {
            path: path.to_string(),
            init_sql: init_sql.to_string(),
            secrets: SecretPluginSettings {
                motherduck_token: token.to_string(),
            },
        }
    }

    fn sql_of(queries: &[BootQuery]) -> Vec<String> {
        queries.iter().map(|q| q.sql.clone()).collect()
    }

    #[test]
    fn test_memory_without_extras_has_no_boot_queries() {
        let target = parse_target("").unwrap();
        let queries = boot_queries(&target, &settings("", "", "  "), &HostEnvironment::default());
        assert!(queries.is_empty());
    }

    #[test]
    fn test_remote_boot_order() {
        let target = parse_target("md:sample").unwrap();
        let env = HostEnvironment::with_data_path("/var/lib/grafana");
        let queries = boot_queries(&target, &settings("md:sample", "tok", "SELECT 1"), &env);

        assert_eq!(
            sql_of(&queries),
            vec![
                "SET home_directory='/var/lib/grafana';",
                "SET extension_directory='/var/lib/grafana/.duckdb/extensions';",
                "SET secret_directory='/var/lib/grafana/.duckdb/stored_secrets';",
                "INSTALL 'motherduck';",
                "LOAD 'motherduck';",
                "SET motherduck_token='tok';",
                "ATTACH IF NOT EXISTS 'md:sample' (TYPE motherduck);",
                "SELECT 1",
            ]
        );
    }

    #[test]
    fn test_attach_escapes_single_quotes() {
        let target = parse_target("md:weird'name").unwrap();
        let queries = boot_queries(
            &target,
            &settings("md:weird'name", "tok", ""),
            &HostEnvironment::default(),
        );
        let attach = queries.iter().find(|q| q.label == "attach catalog").unwrap();
        assert_eq!(attach.sql, "ATTACH IF NOT EXISTS 'md:weird''name' (TYPE motherduck);");
    }

    #[test]
    fn test_token_without_remote_path_loads_extension_only() {
        let target = parse_target("data.duckdb").unwrap();
        let queries = boot_queries(
            &target,
            &settings("data.duckdb", "tok", ""),
            &HostEnvironment::default(),
        );
        let labels: Vec<_> = queries.iter().map(|q| q.label).collect();
        assert_eq!(labels, vec!["install motherduck", "load motherduck", "motherduck token"]);
    }

    #[test]
    fn test_token_is_redacted_in_debug_output() {
        let target = parse_target("md:sample").unwrap();
        let queries = boot_queries(&target, &settings("md:sample", "s3cr3t", ""), &HostEnvironment::default());
        let rendered = format!("{:?}", queries);
        assert!(!rendered.contains("s3cr3t"));
    }

    #[test]
    fn test_remote_requires_token() {
        let result = Connector::new(&settings("md:sample", "", ""), &HostEnvironment::default());
        assert!(matches!(result, Err(DataSourceError::ConfigError(_))));
        assert!(result
            .err()
            .unwrap()
            .to_string()
            .contains("MotherDuck token is missing"));
    }

    #[test]
    fn test_quoted_path_rejected_before_connecting() {
        for path in ["'md:sample'", "\"md:sample\""] {
            let result = Connector::new(&settings(path, "tok", ""), &HostEnvironment::default());
            assert!(matches!(result, Err(DataSourceError::ConfigError(_))));
        }
    }

    #[test]
    fn test_remote_target_routed_to_attach() {
        let connector =
            Connector::new(&settings("md:sample", "tok", ""), &HostEnvironment::default()).unwrap();
        assert!(connector.target().is_remote());
        assert!(connector
            .boot_queries()
            .iter()
            .any(|q| q.sql == "ATTACH IF NOT EXISTS 'md:sample' (TYPE motherduck);"));
        assert_eq!(connector.state().unwrap(), BootState::Uninitialized);
    }

    #[test]
    fn test_connect_in_memory() {
        let connector = Connector::new(&settings("", "", ""), &HostEnvironment::default()).unwrap();
        let conn = connector.connect().unwrap();
        let answer: i32 = conn.query_row("SELECT 42", [], |row| row.get(0)).unwrap();
        assert_eq!(answer, 42);
        assert!(connector.is_initialized());
    }

    #[test]
    fn test_handles_share_one_database() {
        let connector = Connector::new(
            &settings("", "", "CREATE TABLE shared AS SELECT 7 AS v"),
            &HostEnvironment::default(),
        )
        .unwrap();
        let first = connector.connect().unwrap();
        first.execute_batch("INSERT INTO shared VALUES (8)").unwrap();

        let second = connector.connect().unwrap();
        let total: i64 = second
            .query_row("SELECT sum(v) FROM shared", [], |row| row.get(0))
            .unwrap();
        assert_eq!(total, 15);
    }

    #[test]
    fn test_concurrent_connects_boot_once() {
        let connector = Arc::new(
            Connector::new(
                &settings(
                    "",
                    "",
                    "CREATE SEQUENCE IF NOT EXISTS boot_runs; SELECT nextval('boot_runs');",
                ),
                &HostEnvironment::default(),
            )
            .unwrap(),
        );

        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let connector = Arc::clone(&connector);
                    scope.spawn(move || {
                        let conn = connector.connect().unwrap();
                        let one: i32 = conn.query_row("SELECT 1", [], |row| row.get(0)).unwrap();
                        assert_eq!(one, 1);
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
        });

        // boot consumed value 1; a second boot would have consumed 2
        let conn = connector.connect().unwrap();
        let next: i64 = conn
            .query_row("SELECT nextval('boot_runs')", [], |row| row.get(0))
            .unwrap();
        assert_eq!(next, 2);
    }

    #[test]
    fn test_failed_boot_is_retried() {
        // The cast fails only on the first attempt
        let init_sql = "CREATE SEQUENCE IF NOT EXISTS boot_attempts; \
                        SELECT CAST(CASE WHEN nextval('boot_attempts') = 1 THEN 'boom' ELSE '1' END AS INTEGER);";
        let connector =
            Connector::new(&settings("", "", init_sql), &HostEnvironment::default()).unwrap();

        let err = connector.connect().unwrap_err();
        assert!(matches!(err, DataSourceError::BootError(_)));
        assert!(err.to_string().contains("init sql"));
        assert_eq!(connector.state().unwrap(), BootState::Uninitialized);

        connector.connect().unwrap();
        assert_eq!(connector.state().unwrap(), BootState::Initialized);

        // Initialized connectors do not boot again
        let conn = connector.connect().unwrap();
        let next: i64 = conn
            .query_row("SELECT nextval('boot_attempts')", [], |row| row.get(0))
            .unwrap();
        assert_eq!(next, 3);
    }

    #[test]
    fn test_invalid_init_sql_leaves_connector_uninitialized() {
        let connector = Connector::new(
            &settings("", "", "THIS IS NOT SQL"),
            &HostEnvironment::default(),
        )
        .unwrap();
        assert!(connector.connect().is_err());
        assert!(connector.connect().is_err());
        assert!(!connector.is_initialized());
    }

    #[test]
    fn test_data_path_directories_applied() {
        let dir = std::env::temp_dir().join("duckdb-datasource-boot-test");
        std::fs::create_dir_all(&dir).unwrap();
        let env = HostEnvironment::with_data_path(&dir);
        let connector = Connector::new(&settings("", "", ""), &env).unwrap();
        let conn = connector.connect().unwrap();

        let extension_dir: String = conn
            .query_row("SELECT current_setting('extension_directory')", [], |row| row.get(0))
            .unwrap();
        assert_eq!(
            extension_dir,
            dir.join(".duckdb/extensions").to_string_lossy()
        );
    }
}
