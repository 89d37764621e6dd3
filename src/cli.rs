/*!
duckdb-datasource Command Line Interface

Runs queries and health checks against a DuckDB file, an in-memory database or
a MotherDuck catalog, with the same settings a dashboard host would pass.
*/

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use clap::{Args, Parser, Subcommand};
use duckdb_datasource::frame::frame_to_json;
use duckdb_datasource::settings::SecretPluginSettings;
use duckdb_datasource::{
    DuckDbDriver, HostEnvironment, PluginSettings, QueryRequest, ResultFormat, TimeRange, VERSION,
};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "duckdb-datasource")]
#[command(about = "Query DuckDB and MotherDuck like a dashboard data source")]
#[command(version = VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args)]
pub struct ConnectionArgs {
    /// Database path: a file, empty for in-memory, or md:<catalog>
    #[arg(long, default_value = "")]
    path: String,

    /// SQL run once after the database boots
    #[arg(long, default_value = "")]
    init_sql: String,

    /// File holding SQL run once after the database boots
    #[arg(long, conflicts_with = "init_sql")]
    init_file: Option<PathBuf>,

    /// MotherDuck access token
    #[arg(long, env = "MOTHERDUCK_TOKEN", hide_env_values = true, default_value = "")]
    token: String,
}

impl ConnectionArgs {
    fn driver(self) -> anyhow::Result<DuckDbDriver> {
        let init_sql = match self.init_file {
            Some(file) => std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?,
            None => self.init_sql,
        };
        let settings = PluginSettings {
            path: self.path,
            init_sql,
            secrets: SecretPluginSettings {
                motherduck_token: self.token,
            },
        };
        Ok(DuckDbDriver::from_settings(&settings, &HostEnvironment::from_env())?)
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a query, expanding time range macros
    Query {
        /// SQL to run; may use $__timeFrom(), $__timeTo() and $__timeFilter(col)
        sql: String,

        #[command(flatten)]
        connection: ConnectionArgs,

        /// Start of the time range (RFC 3339), defaults to six hours before --to
        #[arg(long)]
        from: Option<String>,

        /// End of the time range (RFC 3339), defaults to now
        #[arg(long)]
        to: Option<String>,

        /// Result format (table, timeseries)
        #[arg(long, default_value = "table")]
        format: String,

        /// Print the frame as JSON instead of a table
        #[arg(long)]
        json: bool,

        /// Show verbose output (expanded SQL, result shape)
        #[arg(short, long)]
        verbose: bool,
    },

    /// Boot the database and run a health query
    Health {
        #[command(flatten)]
        connection: ConnectionArgs,
    },

    /// List tables, or the columns of one table
    Tables {
        #[command(flatten)]
        connection: ConnectionArgs,

        /// Show the columns of this table
        #[arg(long)]
        table: Option<String>,
    },
}

fn parse_time(value: &str) -> anyhow::Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("Invalid RFC 3339 timestamp: {}", value))?;
    Ok(parsed.with_timezone(&Utc))
}

fn time_range(from: Option<String>, to: Option<String>) -> anyhow::Result<TimeRange> {
    let to = match to {
        Some(to) => parse_time(&to)?,
        None => Utc::now(),
    };
    let from = match from {
        Some(from) => parse_time(&from)?,
        None => to - Duration::hours(6),
    };
    if from > to {
        anyhow::bail!("--from must not be after --to");
    }
    Ok(TimeRange::new(from, to))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("duckdb_datasource=info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Query {
            sql,
            connection,
            from,
            to,
            format,
            json,
            verbose,
        } => cmd_query(sql, connection, from, to, format, json, verbose),
        Commands::Health { connection } => cmd_health(connection),
        Commands::Tables { connection, table } => cmd_tables(connection, table),
    }
}

fn cmd_query(
    sql: String,
    connection: ConnectionArgs,
    from: Option<String>,
    to: Option<String>,
    format: String,
    json: bool,
    verbose: bool,
) -> anyhow::Result<()> {
    let format: ResultFormat = format.parse()?;
    let range = time_range(from, to)?;
    let driver = connection.driver()?;

    let request = QueryRequest::new("A", sql, range).with_format(format);
    let response = driver.query(&request)?;

    if verbose {
        eprintln!("Executed SQL: {}", response.executed_sql);
        eprintln!("Result shape: {:?}", response.frame.shape());
    }

    if json {
        let value = frame_to_json(&response.ref_id, &response.frame)?;
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("{}", response.frame);
    }
    Ok(())
}

fn cmd_health(connection: ConnectionArgs) -> anyhow::Result<()> {
    let driver = connection.driver()?;
    let result = driver.check_health();
    println!("{}", serde_json::to_string_pretty(&result)?);
    result.into_result()?;
    Ok(())
}

fn cmd_tables(connection: ConnectionArgs, table: Option<String>) -> anyhow::Result<()> {
    let driver = connection.driver()?;
    let names = match table {
        Some(table) => driver.columns(&table)?,
        None => driver.tables()?,
    };
    for name in names {
        println!("{}", name);
    }
    Ok(())
}
