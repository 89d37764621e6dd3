//! Type converter registry
//!
//! DuckDB has column types with no direct counterpart in the result frame
//! model. Each [`Converter`] rule maps a DuckDB type name to a nullable
//! output [`FieldType`] together with a conversion function.
//!
//! Lookup order:
//! 1. Exact type-name rules (case-insensitive)
//! 2. Pattern rules, first match wins (`DECIMAL(p,s)` carries its own suffix)
//! 3. No rule: the column passes through with its native type

use crate::{DataSourceError, Result};
use regex::Regex;
use serde::Serialize;

/// Output type of a converted column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FieldType {
    NullableString,
    NullableFloat64,
    NullableInt16,
}

/// How a column's raw values are scanned before conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanKind {
    /// 128-bit integer
    HugeInt,
    /// Fixed-point decimal
    Decimal,
    /// Textual rendering of the value
    Text,
}

/// Fixed-point decimal as scanned from DuckDB: `mantissa * 10^-scale`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeDecimal {
    pub mantissa: i128,
    pub scale: u32,
}

impl NativeDecimal {
    pub fn new(mantissa: i128, scale: u32) -> Self {
        Self { mantissa, scale }
    }

    pub fn to_f64(&self) -> f64 {
        self.mantissa as f64 / 10f64.powi(self.scale as i32)
    }
}

/// A scanned value awaiting conversion
#[derive(Debug, Clone, PartialEq)]
pub enum NativeValue {
    Null,
    HugeInt(i128),
    Decimal(NativeDecimal),
    Text(String),
}

/// A converted, nullable output value
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    String(Option<String>),
    Float64(Option<f64>),
    Int16(Option<i16>),
}

impl FieldValue {
    pub fn field_type(&self) -> FieldType {
        match self {
            FieldValue::String(_) => FieldType::NullableString,
            FieldValue::Float64(_) => FieldType::NullableFloat64,
            FieldValue::Int16(_) => FieldType::NullableInt16,
        }
    }
}

/// How a rule selects DuckDB type names
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeMatcher {
    Exact(&'static str),
    Pattern(&'static str),
}

/// A single conversion rule
#[derive(Debug, Clone, Copy)]
pub struct Converter {
    pub name: &'static str,
    pub matcher: TypeMatcher,
    pub scan: ScanKind,
    pub output: FieldType,
    pub convert: fn(&NativeValue) -> Result<FieldValue>,
}

fn unexpected(expected: &str, value: &NativeValue) -> DataSourceError {
    DataSourceError::ConversionError(format!("expected {} value, got {:?}", expected, value))
}

fn huge_int_to_string(value: &NativeValue) -> Result<FieldValue> {
    match value {
        NativeValue::Null => Ok(FieldValue::String(None)),
        NativeValue::HugeInt(v) => Ok(FieldValue::String(Some(v.to_string()))),
        other => Err(unexpected("HUGEINT", other)),
    }
}

fn decimal_to_f64(value: &NativeValue) -> Result<FieldValue> {
    match value {
        NativeValue::Null => Ok(FieldValue::Float64(None)),
        NativeValue::Decimal(d) => Ok(FieldValue::Float64(Some(d.to_f64()))),
        other => Err(unexpected("DECIMAL", other)),
    }
}

fn text_to_f64(value: &NativeValue) -> Result<FieldValue> {
    match value {
        NativeValue::Null => Ok(FieldValue::Float64(None)),
        NativeValue::Text(s) => s.trim().parse::<f64>().map(|v| FieldValue::Float64(Some(v))).map_err(|e| {
            DataSourceError::ConversionError(format!("cannot parse {:?} as float: {}", s, e))
        }),
        other => Err(unexpected("text", other)),
    }
}

fn text_to_i16(value: &NativeValue) -> Result<FieldValue> {
    match value {
        NativeValue::Null => Ok(FieldValue::Int16(None)),
        NativeValue::Text(s) => s.trim().parse::<i16>().map(|v| FieldValue::Int16(Some(v))).map_err(|e| {
            DataSourceError::ConversionError(format!("cannot parse {:?} as 16-bit integer: {}", s, e))
        }),
        other => Err(unexpected("text", other)),
    }
}

const fn float_alias(name: &'static str, type_name: &'static str) -> Converter {
    Converter {
        name,
        matcher: TypeMatcher::Exact(type_name),
        scan: ScanKind::Text,
        output: FieldType::NullableFloat64,
        convert: text_to_f64,
    }
}

const fn small_int_alias(name: &'static str, type_name: &'static str) -> Converter {
    Converter {
        name,
        matcher: TypeMatcher::Exact(type_name),
        scan: ScanKind::Text,
        output: FieldType::NullableInt16,
        convert: text_to_i16,
    }
}

/// Built-in conversion rules
pub const DEFAULT_CONVERTERS: &[Converter] = &[
    // No numeric field type is wide enough for HUGEINT
    Converter {
        name: "handle HUGEINT",
        matcher: TypeMatcher::Exact("HUGEINT"),
        scan: ScanKind::HugeInt,
        output: FieldType::NullableString,
        convert: huge_int_to_string,
    },
    Converter {
        name: "nullable decimal",
        matcher: TypeMatcher::Pattern(r"(?i)^DECIMAL.*"),
        scan: ScanKind::Decimal,
        output: FieldType::NullableFloat64,
        convert: decimal_to_f64,
    },
    float_alias("handle FLOAT8", "FLOAT8"),
    float_alias("handle FLOAT", "FLOAT"),
    float_alias("handle FLOAT4", "FLOAT4"),
    float_alias("handle REAL", "REAL"),
    small_int_alias("handle TINYINT", "TINYINT"),
    small_int_alias("handle INT1", "INT1"),
    small_int_alias("handle SMALLINT", "SMALLINT"),
    small_int_alias("handle INT2", "INT2"),
    small_int_alias("handle SHORT", "SHORT"),
];

/// Ordered, immutable set of conversion rules
#[derive(Debug, Clone)]
pub struct ConverterRegistry {
    converters: Vec<Converter>,
    patterns: Vec<(usize, Regex)>,
}

impl Default for ConverterRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_CONVERTERS.to_vec()).expect("Invalid built-in converter pattern")
    }
}

impl ConverterRegistry {
    /// Build a registry, compiling every pattern rule
    pub fn new(converters: Vec<Converter>) -> Result<Self> {
        let mut patterns = Vec::new();
        for (idx, converter) in converters.iter().enumerate() {
            if let TypeMatcher::Pattern(pattern) = converter.matcher {
                let regex = Regex::new(pattern).map_err(|e| {
                    DataSourceError::InternalError(format!(
                        "Invalid type pattern for converter '{}': {}",
                        converter.name, e
                    ))
                })?;
                patterns.push((idx, regex));
            }
        }
        Ok(Self {
            converters,
            patterns,
        })
    }

    pub fn converters(&self) -> &[Converter] {
        &self.converters
    }

    /// Find the rule for a DuckDB type name
    pub fn lookup(&self, type_name: &str) -> Option<&Converter> {
        let type_name = type_name.trim();

        let exact = self.converters.iter().find(|c| match c.matcher {
            TypeMatcher::Exact(name) => name.eq_ignore_ascii_case(type_name),
            TypeMatcher::Pattern(_) => false,
        });
        if exact.is_some() {
            return exact;
        }

        self.patterns
            .iter()
            .find(|(_, regex)| regex.is_match(type_name))
            .map(|(idx, _)| &self.converters[*idx])
    }

    /// Convert a value of `type_name`
    ///
    /// Returns `Ok(None)` when no rule applies and the value passes through.
    pub fn convert(&self, type_name: &str, value: &NativeValue) -> Result<Option<FieldValue>> {
        match self.lookup(type_name) {
            Some(converter) => (converter.convert)(value).map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_huge_int_above_i64_is_exact() {
        let registry = ConverterRegistry::default();
        let value = (i64::MAX as i128) * 4 + 3;
        let out = registry
            .convert("HUGEINT", &NativeValue::HugeInt(value))
            .unwrap();
        assert_eq!(
            out,
            Some(FieldValue::String(Some("36893488147419103231".to_string())))
        );

        let min = registry
            .convert("HUGEINT", &NativeValue::HugeInt(i128::MIN))
            .unwrap();
        assert_eq!(
            min,
            Some(FieldValue::String(Some(i128::MIN.to_string())))
        );
    }

    #[test]
    fn test_null_huge_int_is_null_string() {
        let registry = ConverterRegistry::default();
        let out = registry.convert("HUGEINT", &NativeValue::Null).unwrap();
        assert_eq!(out, Some(FieldValue::String(None)));
    }

    #[test]
    fn test_decimal_to_float() {
        let registry = ConverterRegistry::default();
        let out = registry
            .convert("DECIMAL(10,2)", &NativeValue::Decimal(NativeDecimal::new(12345, 2)))
            .unwrap();
        match out {
            Some(FieldValue::Float64(Some(v))) => assert!((v - 123.45).abs() < 1e-9),
            other => panic!("unexpected conversion: {:?}", other),
        }

        let null = registry.convert("DECIMAL(18,3)", &NativeValue::Null).unwrap();
        assert_eq!(null, Some(FieldValue::Float64(None)));
    }

    #[test]
    fn test_decimal_matched_by_pattern() {
        let registry = ConverterRegistry::default();
        for name in ["DECIMAL", "DECIMAL(38,10)", "decimal(4,1)"] {
            let converter = registry.lookup(name).unwrap();
            assert_eq!(converter.output, FieldType::NullableFloat64);
            assert_eq!(converter.scan, ScanKind::Decimal);
        }
    }

    #[test]
    fn test_narrow_int_parsing() {
        let registry = ConverterRegistry::default();
        let out = registry
            .convert("SMALLINT", &NativeValue::Text("32000".to_string()))
            .unwrap();
        assert_eq!(out, Some(FieldValue::Int16(Some(32000))));

        let out = registry
            .convert("TINYINT", &NativeValue::Text("-128".to_string()))
            .unwrap();
        assert_eq!(out, Some(FieldValue::Int16(Some(-128))));
    }

    #[test]
    fn test_narrow_int_parse_failure_is_error() {
        let registry = ConverterRegistry::default();
        let err = registry
            .convert("SMALLINT", &NativeValue::Text("abc".to_string()))
            .unwrap_err();
        assert!(matches!(err, DataSourceError::ConversionError(_)));

        let overflow = registry.convert("INT2", &NativeValue::Text("40000".to_string()));
        assert!(overflow.is_err());
    }

    #[test]
    fn test_float_aliases() {
        let registry = ConverterRegistry::default();
        for name in ["FLOAT", "FLOAT4", "REAL", "FLOAT8"] {
            let out = registry
                .convert(name, &NativeValue::Text("0.25".to_string()))
                .unwrap();
            assert_eq!(out, Some(FieldValue::Float64(Some(0.25))));
        }
        let err = registry.convert("FLOAT", &NativeValue::Text("1.2.3".to_string()));
        assert!(err.is_err());
    }

    #[test]
    fn test_unknown_types_pass_through() {
        let registry = ConverterRegistry::default();
        assert!(registry.lookup("VARCHAR").is_none());
        assert!(registry.lookup("BIGINT").is_none());
        let out = registry
            .convert("INTEGER", &NativeValue::Text("1".to_string()))
            .unwrap();
        assert_eq!(out, None);
    }

    #[test]
    fn test_exact_rules_take_precedence_over_patterns() {
        fn always_null(_: &NativeValue) -> Result<FieldValue> {
            Ok(FieldValue::String(None))
        }
        let registry = ConverterRegistry::new(vec![
            Converter {
                name: "catch-all",
                matcher: TypeMatcher::Pattern(".*"),
                scan: ScanKind::Text,
                output: FieldType::NullableString,
                convert: always_null,
            },
            DEFAULT_CONVERTERS[0],
        ])
        .unwrap();

        assert_eq!(registry.lookup("HUGEINT").unwrap().name, "handle HUGEINT");
        assert_eq!(registry.lookup("VARCHAR").unwrap().name, "catch-all");
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let result = ConverterRegistry::new(vec![Converter {
            name: "broken",
            matcher: TypeMatcher::Pattern("DECIMAL("),
            scan: ScanKind::Decimal,
            output: FieldType::NullableFloat64,
            convert: decimal_to_f64,
        }]);
        assert!(result.is_err());
    }

    #[test]
    fn test_conversion_is_deterministic() {
        let registry = ConverterRegistry::default();
        let value = NativeValue::Decimal(NativeDecimal::new(-987654321, 4));
        let first = registry.convert("DECIMAL(12,4)", &value).unwrap();
        let second = registry.convert("DECIMAL(12,4)", &value).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.unwrap().field_type(), FieldType::NullableFloat64);
    }

    #[test]
    fn test_wrong_native_value_is_error() {
        let registry = ConverterRegistry::default();
        let err = registry.convert("HUGEINT", &NativeValue::Text("1".to_string()));
        assert!(err.is_err());
    }
}
