//! DuckDB query execution and frame building
//!
//! Column types come from `DESCRIBE`, so converters see DuckDB's own type
//! names (`HUGEINT`, `DECIMAL(10,2)`, ...). Columns with a converter rule are
//! scanned and converted value by value; the rest keep their native type.
//!
//! Statements `DESCRIBE` cannot wrap (`SHOW`, `PRAGMA`, `SUMMARIZE`, ...) are
//! executed directly and typed from the executed statement instead.

use crate::convert::{Converter, ConverterRegistry, FieldType, FieldValue, NativeDecimal, NativeValue, ScanKind};
use crate::reader::Reader;
use crate::{DataFrame, DataSourceError, Result};
use duckdb::arrow::datatypes::DataType as ArrowDataType;
use duckdb::types::{TimeUnit as DuckTimeUnit, ValueRef};
use duckdb::{params, Connection, Statement};
use regex::Regex;
use std::sync::OnceLock;
use tracing::{debug, warn};

/// Widest DECIMAL the DuckDB client can hand out as a native decimal value
const MAX_NATIVE_DECIMAL_WIDTH: u32 = 28;

/// DuckDB database reader
///
/// Wraps one booted connection and the converter registry of its data source.
pub struct DuckDbReader<'a> {
    conn: Connection,
    converters: &'a ConverterRegistry,
}

impl<'a> DuckDbReader<'a> {
    pub fn new(conn: Connection, converters: &'a ConverterRegistry) -> Self {
        Self { conn, converters }
    }

    /// Get a reference to the underlying DuckDB connection
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Column names and DuckDB type names of a query's result
    pub fn describe(&self, sql: &str) -> Result<Vec<(String, String)>> {
        let describe_sql = format!("DESCRIBE {}", sql.trim().trim_end_matches(';'));
        let mut stmt = self
            .conn
            .prepare(&describe_sql)
            .map_err(|e| DataSourceError::ExecutionError(format!("Failed to prepare SQL: {}", e)))?;

        let columns = stmt
            .query_map(params![], |row| {
                let name: String = row.get(0)?;
                let type_name: String = row.get(1)?;
                Ok((name, type_name))
            })
            .map_err(|e| DataSourceError::ExecutionError(format!("Failed to describe SQL: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| DataSourceError::ExecutionError(format!("Failed to read result schema: {}", e)))?;

        Ok(columns)
    }

    fn string_column(&self, sql: &str, param: Option<&str>) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .map_err(|e| DataSourceError::ExecutionError(format!("Failed to prepare SQL: {}", e)))?;

        let rows = match param {
            Some(p) => stmt.query_map(params![p], first_string),
            None => stmt.query_map(params![], first_string),
        }
        .map_err(|e| DataSourceError::ExecutionError(format!("Failed to execute SQL: {}", e)))?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| DataSourceError::ExecutionError(format!("Failed to read rows: {}", e)))
    }
}

fn first_string(row: &duckdb::Row<'_>) -> duckdb::Result<String> {
    row.get(0)
}

/// Skip leading whitespace, `--` line comments and `/* */` block comments
fn strip_leading_comments(sql: &str) -> &str {
    let mut rest = sql.trim_start();
    loop {
        if let Some(line) = rest.strip_prefix("--") {
            rest = match line.find('\n') {
                Some(end) => line[end + 1..].trim_start(),
                None => "",
            };
        } else if let Some(block) = rest.strip_prefix("/*") {
            rest = match block.find("*/") {
                Some(end) => block[end + 2..].trim_start(),
                None => "",
            };
        } else {
            return rest;
        }
    }
}

/// Statements that produce no result set
fn is_statement_without_rows(sql: &str) -> bool {
    let statement = strip_leading_comments(sql).to_uppercase();
    [
        "CREATE ", "DROP ", "INSERT ", "UPDATE ", "DELETE ", "ALTER ", "ATTACH ", "DETACH ",
        "SET ", "RESET ", "INSTALL ", "LOAD ", "USE ", "COPY ", "EXPORT ", "IMPORT ",
        "CHECKPOINT", "VACUUM", "BEGIN", "COMMIT", "ROLLBACK",
    ]
    .iter()
    .any(|prefix| statement.starts_with(prefix))
}

/// Width of a `DECIMAL(width,scale)` type name
fn decimal_width(type_name: &str) -> Option<u32> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"(?i)^\s*DECIMAL\s*\(\s*(\d+)\s*,\s*\d+\s*\)\s*$").expect("Invalid decimal regex")
    });
    re.captures(type_name)?.get(1)?.as_str().parse().ok()
}

fn is_wide_decimal(type_name: &str) -> bool {
    decimal_width(type_name).is_some_and(|width| width > MAX_NATIVE_DECIMAL_WIDTH)
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Wrap `sql` so the named columns come back as their text rendering
fn cast_columns_to_text(sql: &str, columns: &[&str]) -> String {
    let replacements: Vec<String> = columns
        .iter()
        .map(|name| {
            let quoted = quote_identifier(name);
            format!("CAST({} AS VARCHAR) AS {}", quoted, quoted)
        })
        .collect();
    format!(
        "SELECT * REPLACE ({}) FROM (\n{}\n) AS wide_decimals",
        replacements.join(", "),
        sql.trim().trim_end_matches(';')
    )
}

/// Exact decimal from DuckDB's text rendering, e.g. `-12.50`
fn parse_decimal_text(text: &str) -> Option<NativeDecimal> {
    let text = text.trim();
    let (whole, fraction) = text.split_once('.').unwrap_or((text, ""));
    if !fraction.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let mantissa = format!("{}{}", whole, fraction).parse::<i128>().ok()?;
    Some(NativeDecimal::new(mantissa, fraction.len() as u32))
}

/// DuckDB type name of an executed statement's column
fn arrow_type_name(data_type: &ArrowDataType) -> String {
    use duckdb::types::Type;

    if let ArrowDataType::Decimal128(width, scale) = data_type {
        return format!("DECIMAL({},{})", width, scale);
    }
    let name = match Type::from(data_type) {
        Type::Boolean => "BOOLEAN",
        Type::TinyInt => "TINYINT",
        Type::SmallInt => "SMALLINT",
        Type::Int => "INTEGER",
        Type::BigInt => "BIGINT",
        Type::HugeInt => "HUGEINT",
        Type::UTinyInt => "UTINYINT",
        Type::USmallInt => "USMALLINT",
        Type::UInt => "UINTEGER",
        Type::UBigInt => "UBIGINT",
        Type::Float => "FLOAT",
        Type::Double => "DOUBLE",
        Type::Text => "VARCHAR",
        Type::Date32 => "DATE",
        Type::Timestamp => "TIMESTAMP",
        Type::Time64 => "TIME",
        Type::Blob => "BLOB",
        _ => "UNKNOWN",
    };
    name.to_string()
}

fn unexpected_value(expected: &str, value: &ValueRef<'_>) -> DataSourceError {
    DataSourceError::ConversionError(format!("expected {} value, got {:?}", expected, value))
}

fn integer_value(value: &ValueRef<'_>) -> Option<i128> {
    match *value {
        ValueRef::TinyInt(i) => Some(i as i128),
        ValueRef::SmallInt(i) => Some(i as i128),
        ValueRef::Int(i) => Some(i as i128),
        ValueRef::BigInt(i) => Some(i as i128),
        ValueRef::HugeInt(i) => Some(i),
        ValueRef::UTinyInt(i) => Some(i as i128),
        ValueRef::USmallInt(i) => Some(i as i128),
        ValueRef::UInt(i) => Some(i as i128),
        ValueRef::UBigInt(i) => Some(i as i128),
        _ => None,
    }
}

/// Textual rendering of a scalar value, `None` for non-scalars
fn text_value(value: &ValueRef<'_>) -> Option<String> {
    if let Some(i) = integer_value(value) {
        return Some(i.to_string());
    }
    match value {
        ValueRef::Float(f) => Some(f.to_string()),
        ValueRef::Double(f) => Some(f.to_string()),
        ValueRef::Boolean(b) => Some(b.to_string()),
        ValueRef::Decimal(d) => Some(d.to_string()),
        ValueRef::Text(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        _ => None,
    }
}

/// Scan a raw value the way a converter rule expects it
fn scan_native(value: ValueRef<'_>, kind: ScanKind) -> Result<NativeValue> {
    if let ValueRef::Null = value {
        return Ok(NativeValue::Null);
    }
    match kind {
        ScanKind::HugeInt => integer_value(&value)
            .map(NativeValue::HugeInt)
            .ok_or_else(|| unexpected_value("HUGEINT", &value)),
        ScanKind::Decimal => match value {
            ValueRef::Decimal(d) => Ok(NativeValue::Decimal(NativeDecimal::new(
                d.mantissa(),
                d.scale(),
            ))),
            // Wide decimals are fetched as text
            ValueRef::Text(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                parse_decimal_text(&text)
                    .map(NativeValue::Decimal)
                    .ok_or_else(|| {
                        DataSourceError::ConversionError(format!("cannot parse {:?} as decimal", text))
                    })
            }
            // Scale-0 decimals arrive as plain integers
            ref other => integer_value(other)
                .map(|i| NativeValue::Decimal(NativeDecimal::new(i, 0)))
                .ok_or_else(|| unexpected_value("DECIMAL", other)),
        },
        ScanKind::Text => text_value(&value)
            .map(NativeValue::Text)
            .ok_or_else(|| unexpected_value("scalar", &value)),
    }
}

fn to_micros(unit: DuckTimeUnit, value: i64) -> i64 {
    match unit {
        DuckTimeUnit::Second => value * 1_000_000,
        DuckTimeUnit::Millisecond => value * 1_000,
        DuckTimeUnit::Microsecond => value,
        DuckTimeUnit::Nanosecond => value / 1_000,
    }
}

/// Helper struct for building typed columns from rows
enum ColumnBuilder {
    Converted {
        converter: Converter,
        values: Vec<FieldValue>,
    },
    Boolean(Vec<Option<bool>>),
    Int(Vec<Option<i32>>),
    BigInt(Vec<Option<i64>>),
    UBigInt(Vec<Option<u64>>), // Keep as u64, check overflow
    Double(Vec<Option<f64>>),
    Text(Vec<Option<String>>),
    Date32(Vec<Option<i32>>),
    Timestamp(Vec<Option<i64>>), // Microseconds
    Time64(Vec<Option<i64>>),    // Nanoseconds
    Fallback(Vec<Option<String>>),
}

impl ColumnBuilder {
    fn new(type_name: &str, converters: &ConverterRegistry) -> Self {
        if let Some(converter) = converters.lookup(type_name) {
            return ColumnBuilder::Converted {
                converter: *converter,
                values: Vec::new(),
            };
        }

        let upper = type_name.trim().to_uppercase();
        match upper.as_str() {
            "BOOLEAN" => ColumnBuilder::Boolean(Vec::new()),
            "TINYINT" | "SMALLINT" | "INTEGER" | "UTINYINT" | "USMALLINT" => {
                ColumnBuilder::Int(Vec::new())
            }
            "BIGINT" | "UINTEGER" => ColumnBuilder::BigInt(Vec::new()),
            "UBIGINT" => ColumnBuilder::UBigInt(Vec::new()),
            "FLOAT" | "DOUBLE" => ColumnBuilder::Double(Vec::new()),
            "VARCHAR" => ColumnBuilder::Text(Vec::new()),
            "DATE" => ColumnBuilder::Date32(Vec::new()),
            "TIME" => ColumnBuilder::Time64(Vec::new()),
            t if t.starts_with("TIMESTAMP") => ColumnBuilder::Timestamp(Vec::new()),
            _ => ColumnBuilder::Fallback(Vec::new()),
        }
    }

    fn add_value(&mut self, value: ValueRef<'_>) -> Result<()> {
        use ColumnBuilder::*;

        if let Converted { converter, values } = self {
            let native = scan_native(value, converter.scan)?;
            values.push((converter.convert)(&native)?);
            return Ok(());
        }

        if let ValueRef::Null = value {
            match self {
                Converted { .. } => {}
                Boolean(values) => values.push(None),
                Int(values) => values.push(None),
                BigInt(values) | Timestamp(values) | Time64(values) => values.push(None),
                UBigInt(values) => values.push(None),
                Double(values) => values.push(None),
                Text(values) | Fallback(values) => values.push(None),
                Date32(values) => values.push(None),
            }
            return Ok(());
        }

        match self {
            Converted { .. } => {}
            Boolean(values) => match value {
                ValueRef::Boolean(b) => values.push(Some(b)),
                other => return Err(unexpected_value("BOOLEAN", &other)),
            },
            Int(values) => {
                let v = integer_value(&value)
                    .and_then(|i| i32::try_from(i).ok())
                    .ok_or_else(|| unexpected_value("INTEGER", &value))?;
                values.push(Some(v));
            }
            BigInt(values) => {
                let v = integer_value(&value)
                    .and_then(|i| i64::try_from(i).ok())
                    .ok_or_else(|| unexpected_value("BIGINT", &value))?;
                values.push(Some(v));
            }
            UBigInt(values) => {
                let v = integer_value(&value)
                    .and_then(|i| u64::try_from(i).ok())
                    .ok_or_else(|| unexpected_value("UBIGINT", &value))?;
                values.push(Some(v));
            }
            Double(values) => match value {
                ValueRef::Double(f) => values.push(Some(f)),
                ValueRef::Float(f) => values.push(Some(f as f64)),
                other => return Err(unexpected_value("DOUBLE", &other)),
            },
            Text(values) => match value {
                ValueRef::Text(bytes) => values.push(Some(String::from_utf8_lossy(bytes).into_owned())),
                other => return Err(unexpected_value("VARCHAR", &other)),
            },
            Date32(values) => match value {
                ValueRef::Date32(days) => values.push(Some(days)),
                other => return Err(unexpected_value("DATE", &other)),
            },
            Timestamp(values) => match value {
                ValueRef::Timestamp(unit, v) => values.push(Some(to_micros(unit, v))),
                other => return Err(unexpected_value("TIMESTAMP", &other)),
            },
            Time64(values) => match value {
                ValueRef::Time64(unit, v) => values.push(Some(to_micros(unit, v) * 1_000)),
                other => return Err(unexpected_value("TIME", &other)),
            },
            Fallback(values) => {
                let text = text_value(&value).unwrap_or_else(|| format!("{:?}", value));
                values.push(Some(text));
            }
        }
        Ok(())
    }

    fn build(self, column_name: &str) -> Result<polars::prelude::Series> {
        use polars::prelude::*;
        use ColumnBuilder::*;

        Ok(match self {
            Converted { converter, values } => converted_series(column_name, converter, values)?,
            Boolean(values) => Series::new(column_name.into(), values),
            Int(values) => Series::new(column_name.into(), values),
            BigInt(values) => Series::new(column_name.into(), values),
            UBigInt(values) => {
                // Check if all values fit in i64
                let all_fit = values
                    .iter()
                    .all(|opt_val| opt_val.map(|val| val <= i64::MAX as u64).unwrap_or(true));

                if all_fit {
                    let i64_values: Vec<Option<i64>> = values
                        .into_iter()
                        .map(|opt_val| opt_val.map(|val| val as i64))
                        .collect();
                    Series::new(column_name.into(), i64_values)
                } else {
                    warn!("UBIGINT overflow in column '{}', converting to string", column_name);
                    let string_values: Vec<Option<String>> = values
                        .into_iter()
                        .map(|opt_val| opt_val.map(|val| val.to_string()))
                        .collect();
                    Series::new(column_name.into(), string_values)
                }
            }
            Double(values) => Series::new(column_name.into(), values),
            Text(values) => Series::new(column_name.into(), values),
            Date32(values) => Series::new(column_name.into(), values)
                .cast(&DataType::Date)
                .map_err(|e| DataSourceError::InternalError(format!("Date cast failed: {}", e)))?,
            Timestamp(values) => Series::new(column_name.into(), values)
                .cast(&DataType::Datetime(TimeUnit::Microseconds, None))
                .map_err(|e| DataSourceError::InternalError(format!("Timestamp cast failed: {}", e)))?,
            Time64(values) => Series::new(column_name.into(), values)
                .cast(&DataType::Time)
                .map_err(|e| DataSourceError::InternalError(format!("Time cast failed: {}", e)))?,
            Fallback(values) => {
                warn!("Using fallback string conversion for column '{}'", column_name);
                Series::new(column_name.into(), values)
            }
        })
    }
}

fn converted_series(
    column_name: &str,
    converter: Converter,
    values: Vec<FieldValue>,
) -> Result<polars::prelude::Series> {
    use polars::prelude::*;

    let mismatch = |value: &FieldValue| {
        DataSourceError::ConversionError(format!(
            "converter '{}' declared {:?} but produced {:?}",
            converter.name, converter.output, value
        ))
    };

    Ok(match converter.output {
        FieldType::NullableString => {
            let values = values
                .into_iter()
                .map(|v| match v {
                    FieldValue::String(s) => Ok(s),
                    other => Err(mismatch(&other)),
                })
                .collect::<Result<Vec<Option<String>>>>()?;
            Series::new(column_name.into(), values)
        }
        FieldType::NullableFloat64 => {
            let values = values
                .into_iter()
                .map(|v| match v {
                    FieldValue::Float64(f) => Ok(f),
                    other => Err(mismatch(&other)),
                })
                .collect::<Result<Vec<Option<f64>>>>()?;
            Series::new(column_name.into(), values)
        }
        FieldType::NullableInt16 => {
            let values = values
                .into_iter()
                .map(|v| match v {
                    FieldValue::Int16(i) => Ok(i),
                    other => Err(mismatch(&other)),
                })
                .collect::<Result<Vec<Option<i16>>>>()?;
            Series::new(column_name.into(), values)
        }
    })
}

impl DuckDbReader<'_> {
    fn prepare(&self, sql: &str) -> Result<Statement<'_>> {
        self.conn
            .prepare(sql)
            .map_err(|e| DataSourceError::ExecutionError(format!("Failed to prepare SQL: {}", e)))
    }

    /// Execute a query whose columns `DESCRIBE` reported
    fn execute_described(&self, sql: &str, schema: &[(String, String)]) -> Result<DataFrame> {
        let wide: Vec<&str> = schema
            .iter()
            .filter(|(_, type_name)| is_wide_decimal(type_name))
            .map(|(name, _)| name.as_str())
            .collect();

        let mut stmt = if wide.is_empty() {
            self.prepare(sql)?
        } else {
            debug!("Fetching wide decimal columns {:?} as text", wide);
            self.prepare(&cast_columns_to_text(sql, &wide))?
        };
        self.collect_frame(&mut stmt, schema)
    }

    /// Execute a statement `DESCRIBE` cannot wrap, typing columns from the result
    fn execute_undescribed(&self, sql: &str) -> Result<DataFrame> {
        let mut stmt = self.prepare(sql)?;
        stmt.execute(params![])
            .map_err(|e| DataSourceError::ExecutionError(format!("Failed to execute SQL: {}", e)))?;

        let column_count = stmt.column_count();
        if column_count == 0 {
            return Ok(DataFrame::empty());
        }

        let mut schema = Vec::with_capacity(column_count);
        for i in 0..column_count {
            let name = stmt
                .column_name(i)
                .map_err(|e| DataSourceError::ExecutionError(format!("Failed to get column name: {}", e)))?
                .to_string();
            let type_name = arrow_type_name(&stmt.column_type(i));
            if is_wide_decimal(&type_name) {
                return Err(DataSourceError::ConversionError(format!(
                    "column '{}' of type {} is too wide to read from this statement",
                    name, type_name
                )));
            }
            schema.push((name, type_name));
        }
        debug!("Result schema: {:?}", schema);

        self.collect_frame(&mut stmt, &schema)
    }

    fn collect_frame(&self, stmt: &mut Statement<'_>, schema: &[(String, String)]) -> Result<DataFrame> {
        use polars::prelude::*;

        let mut builders: Vec<ColumnBuilder> = schema
            .iter()
            .map(|(_, type_name)| ColumnBuilder::new(type_name, self.converters))
            .collect();

        let mut rows = stmt
            .query(params![])
            .map_err(|e| DataSourceError::ExecutionError(format!("Failed to execute SQL: {}", e)))?;

        while let Some(row) = rows
            .next()
            .map_err(|e| DataSourceError::ExecutionError(format!("Failed to iterate rows: {}", e)))?
        {
            for (col_idx, builder) in builders.iter_mut().enumerate() {
                let value = row.get_ref(col_idx).map_err(|e| {
                    DataSourceError::ExecutionError(format!("Failed to read column {}: {}", col_idx, e))
                })?;
                builder.add_value(value)?;
            }
        }

        let mut columns = Vec::with_capacity(builders.len());
        for (builder, (name, _)) in builders.into_iter().zip(schema) {
            columns.push(builder.build(name)?.into_column());
        }

        DataFrame::new(columns)
            .map_err(|e| DataSourceError::InternalError(format!("Failed to create DataFrame: {}", e)))
    }
}

impl Reader for DuckDbReader<'_> {
    fn execute(&self, sql: &str) -> Result<DataFrame> {
        if is_statement_without_rows(sql) {
            self.conn
                .execute_batch(sql)
                .map_err(|e| DataSourceError::ExecutionError(format!("Failed to execute statement: {}", e)))?;
            return Ok(DataFrame::empty());
        }

        match self.describe(sql) {
            Ok(schema) if !schema.is_empty() => {
                debug!("Result schema: {:?}", schema);
                self.execute_described(sql, &schema)
            }
            Ok(_) => self.execute_undescribed(sql),
            Err(e) => {
                debug!("DESCRIBE unavailable, typing from the executed statement: {}", e);
                self.execute_undescribed(sql)
            }
        }
    }

    fn tables(&self) -> Result<Vec<String>> {
        self.string_column(
            "SELECT DISTINCT table_name FROM information_schema.tables \
             WHERE table_schema NOT IN ('information_schema', 'pg_catalog') \
             ORDER BY table_name",
            None,
        )
    }

    fn columns(&self, table: &str) -> Result<Vec<String>> {
        self.string_column(
            "SELECT column_name FROM information_schema.columns \
             WHERE table_name = ? ORDER BY ordinal_position",
            Some(table),
        )
    }
}
