//! JSON encoding of result frames
//!
//! Frames are encoded column-wise:
//!
//! ```json
//! {"refId": "A", "fields": [{"name": "big", "type": "string", "values": ["92233720368547758080", null]}]}
//! ```
//!
//! String values are never reinterpreted as numbers, so converted huge
//! integers keep their exact digits.

use crate::{DataFrame, DataSourceError, Result};
use polars::prelude::*;
use serde_json::{json, Map, Value};

/// Frame-level type tag of a column
pub fn field_kind(dtype: &DataType) -> &'static str {
    match dtype {
        DataType::Boolean => "boolean",
        DataType::String => "string",
        DataType::Date | DataType::Datetime(_, _) => "time",
        DataType::Time => "string",
        dt if dt.is_float() || dt.is_integer() => "number",
        _ => "other",
    }
}

fn cast_error(target: &str, e: PolarsError) -> DataSourceError {
    DataSourceError::InternalError(format!("Failed to cast to {}: {}", target, e))
}

/// All values of a series as JSON
fn series_values(series: &Series) -> Result<Vec<Value>> {
    use DataType::*;

    let values = match series.dtype() {
        Int8 => series.i8().map_err(|e| cast_error("i8", e))?.into_iter().map(|v| json!(v)).collect(),
        Int16 => series.i16().map_err(|e| cast_error("i16", e))?.into_iter().map(|v| json!(v)).collect(),
        Int32 => series.i32().map_err(|e| cast_error("i32", e))?.into_iter().map(|v| json!(v)).collect(),
        Int64 => series.i64().map_err(|e| cast_error("i64", e))?.into_iter().map(|v| json!(v)).collect(),
        Float64 => series.f64().map_err(|e| cast_error("f64", e))?.into_iter().map(|v| json!(v)).collect(),
        Boolean => series.bool().map_err(|e| cast_error("bool", e))?.into_iter().map(|v| json!(v)).collect(),
        String => series.str().map_err(|e| cast_error("string", e))?.into_iter().map(|v| json!(v)).collect(),
        Date => {
            let ca = series.date().map_err(|e| cast_error("date", e))?;
            let unix_epoch = chrono::NaiveDate::from_ymd_opt(1970, 1, 1)
                .ok_or_else(|| DataSourceError::InternalError("Invalid epoch".to_string()))?;
            ca.physical()
                .into_iter()
                .map(|days| {
                    days.map(|d| {
                        let date = unix_epoch + chrono::Duration::days(d as i64);
                        json!(date.format("%Y-%m-%d").to_string())
                    })
                    .unwrap_or(Value::Null)
                })
                .collect()
        }
        Datetime(time_unit, _) => {
            let ca = series.datetime().map_err(|e| cast_error("datetime", e))?;
            ca.physical()
                .into_iter()
                .map(|timestamp| {
                    timestamp
                        .and_then(|ts| {
                            let micros = match time_unit {
                                TimeUnit::Microseconds => ts,
                                TimeUnit::Milliseconds => ts * 1_000,
                                TimeUnit::Nanoseconds => ts / 1_000,
                            };
                            chrono::DateTime::<chrono::Utc>::from_timestamp_micros(micros)
                        })
                        .map(|dt| json!(dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()))
                        .unwrap_or(Value::Null)
                })
                .collect()
        }
        Time => {
            // Nanoseconds since midnight
            let ca = series.time().map_err(|e| cast_error("time", e))?;
            ca.physical()
                .into_iter()
                .map(|nanos| {
                    nanos
                        .map(|n| {
                            let hours = n / 3_600_000_000_000;
                            let minutes = (n % 3_600_000_000_000) / 60_000_000_000;
                            let seconds = (n % 60_000_000_000) / 1_000_000_000;
                            let millis = (n % 1_000_000_000) / 1_000_000;
                            json!(format!("{:02}:{:02}:{:02}.{:03}", hours, minutes, seconds, millis))
                        })
                        .unwrap_or(Value::Null)
                })
                .collect()
        }
        _ => (0..series.len())
            .map(|idx| match series.get(idx) {
                Ok(AnyValue::Null) => Value::Null,
                Ok(v) => json!(v.to_string()),
                Err(_) => Value::Null,
            })
            .collect(),
    };

    Ok(values)
}

/// Encode a frame column-wise, tagged with the query's ref id
pub fn frame_to_json(ref_id: &str, df: &DataFrame) -> Result<Value> {
    let mut fields = Vec::with_capacity(df.width());

    for column in df.get_columns() {
        let series = column.as_materialized_series();
        let mut field = Map::new();
        field.insert("name".to_string(), json!(series.name().as_str()));
        field.insert("type".to_string(), json!(field_kind(series.dtype())));
        field.insert("values".to_string(), Value::Array(series_values(series)?));
        fields.push(Value::Object(field));
    }

    Ok(json!({
        "refId": ref_id,
        "fields": fields,
    }))
}
