//! Data source instance settings
//!
//! The host hands every data source instance an opaque payload: plain JSON
//! settings plus a map of decrypted secrets. This module decodes both into
//! [`PluginSettings`].

use crate::{DataSourceError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Key of the MotherDuck token inside the decrypted secure JSON map
pub const MOTHERDUCK_TOKEN_KEY: &str = "motherDuckToken";

/// Raw data source instance payload as delivered by the host
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceInstanceSettings {
    /// Stable identifier of the data source
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub name: String,
    /// Last modification time (milliseconds since epoch)
    #[serde(default)]
    pub updated: i64,
    #[serde(default)]
    pub json_data: serde_json::Value,
    #[serde(default)]
    pub decrypted_secure_json_data: HashMap<String, String>,
}

/// Typed data source configuration
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PluginSettings {
    /// Database target: a file path, empty for in-memory, or `md:<catalog>`
    pub path: String,
    /// SQL run once after the connector boots
    pub init_sql: String,
    #[serde(skip)]
    pub secrets: SecretPluginSettings,
}

#[derive(Clone, Default, PartialEq)]
pub struct SecretPluginSettings {
    pub motherduck_token: String,
}

impl fmt::Debug for SecretPluginSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = if self.motherduck_token.is_empty() {
            "<unset>"
        } else {
            "<redacted>"
        };
        f.debug_struct("SecretPluginSettings")
            .field("motherduck_token", &token)
            .finish()
    }
}

/// Decode an instance payload into [`PluginSettings`]
///
/// A missing or `null` JSON payload yields the defaults (in-memory database,
/// no init SQL). Anything other than a JSON object is rejected.
pub fn load_settings(instance: &DataSourceInstanceSettings) -> Result<PluginSettings> {
    let mut settings = match &instance.json_data {
        serde_json::Value::Null => PluginSettings::default(),
        value @ serde_json::Value::Object(_) => PluginSettings::deserialize(value)
            .map_err(|e| {
                DataSourceError::SettingsError(format!("Failed to decode JSON data: {}", e))
            })?,
        other => {
            return Err(DataSourceError::SettingsError(format!(
                "Expected JSON object for data source settings, got: {}",
                other
            )))
        }
    };

    settings.secrets = SecretPluginSettings {
        motherduck_token: instance
            .decrypted_secure_json_data
            .get(MOTHERDUCK_TOKEN_KEY)
            .cloned()
            .unwrap_or_default(),
    };

    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn instance(json_data: serde_json::Value) -> DataSourceInstanceSettings {
        DataSourceInstanceSettings {
            uid: "duckdb-1".to_string(),
            json_data,
            ..Default::default()
        }
    }

    #[test]
    fn test_load_full_settings() {
        let mut raw = instance(json!({
            "path": "md:sample_data",
            "initSql": "SET threads = 4;"
        }));
        raw.decrypted_secure_json_data
            .insert(MOTHERDUCK_TOKEN_KEY.to_string(), "secret".to_string());

        let settings = load_settings(&raw).unwrap();
        assert_eq!(settings.path, "md:sample_data");
        assert_eq!(settings.init_sql, "SET threads = 4;");
        assert_eq!(settings.secrets.motherduck_token, "secret");
    }

    #[test]
    fn test_missing_fields_default_to_empty() {
        let settings = load_settings(&instance(json!({}))).unwrap();
        assert_eq!(settings, PluginSettings::default());

        let settings = load_settings(&instance(serde_json::Value::Null)).unwrap();
        assert_eq!(settings.path, "");
        assert_eq!(settings.secrets.motherduck_token, "");
    }

    #[test]
    fn test_non_object_payload_rejected() {
        let result = load_settings(&instance(json!(["md:sample"])));
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Expected JSON object"));
    }

    #[test]
    fn test_wrong_field_type_rejected() {
        let result = load_settings(&instance(json!({ "path": 42 })));
        assert!(matches!(result, Err(DataSourceError::SettingsError(_))));
    }

    #[test]
    fn test_token_not_in_debug_output() {
        let secrets = SecretPluginSettings {
            motherduck_token: "very-secret".to_string(),
        };
        let rendered = format!("{:?}", secrets);
        assert!(!rendered.contains("very-secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_instance_payload_deserializes_camel_case() {
        let raw: DataSourceInstanceSettings = serde_json::from_value(json!({
            "uid": "abc",
            "updated": 1700000000000i64,
            "jsonData": { "path": "data.duckdb" },
            "decryptedSecureJsonData": { "motherDuckToken": "t" }
        }))
        .unwrap();

        assert_eq!(raw.uid, "abc");
        assert_eq!(raw.updated, 1_700_000_000_000);
        let settings = load_settings(&raw).unwrap();
        assert_eq!(settings.path, "data.duckdb");
        assert_eq!(settings.secrets.motherduck_token, "t");
    }
}
