use serde_json::ser::PrettyFormatter;
use serde_json::{Map, Value};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("JSON file not found at {0}")]
    NotFound(PathBuf),

    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid JSON data - {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// Last exchange-rate document, kept as raw JSON so unknown fields survive
#[derive(Clone, Debug, PartialEq)]
pub struct RatesSnapshot {
    document: Value,
}

impl RatesSnapshot {
    pub fn from_value(document: Value) -> Self {
        RatesSnapshot { document }
    }

    pub fn parse(text: &str) -> Result<Self, StoreError> {
        Ok(Self::from_value(serde_json::from_str(text)?))
    }

    pub fn document(&self) -> &Value {
        &self.document
    }

    /// Currency code to rate, sorted by code. Non-numeric entries are skipped.
    pub fn rates(&self) -> BTreeMap<String, f64> {
        self.document
            .get("rates")
            .and_then(Value::as_object)
            .map(|rates: &Map<String, Value>| {
                rates
                    .iter()
                    .filter_map(|(code, rate)| rate.as_f64().map(|r| (code.clone(), r)))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn base_code(&self) -> &str {
        self.document
            .get("base_code")
            .and_then(Value::as_str)
            .unwrap_or("USD")
    }

    pub fn last_updated(&self) -> &str {
        self.document
            .get("time_last_update_utc")
            .and_then(Value::as_str)
            .unwrap_or("Unknown")
    }

    /// Four-space indented JSON for display and for the file on disk
    pub fn pretty(&self) -> Result<String, StoreError> {
        let mut out = Vec::new();
        let mut ser =
            serde_json::Serializer::with_formatter(&mut out, PrettyFormatter::with_indent(b"    "));
        self.document.serialize(&mut ser)?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}

/// The single JSON file mirroring the last fetched data set
#[derive(Clone, Debug)]
pub struct RatesStore {
    path: PathBuf,
}

impl RatesStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        RatesStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<RatesSnapshot, StoreError> {
        debug!("Attempting to load JSON data from {}", self.path.display());
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(self.path.clone()))
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        RatesSnapshot::parse(&text)
    }

    /// Overwrites the file wholesale. A crash mid-write can leave it truncated.
    pub async fn save(&self, snapshot: &RatesSnapshot) -> Result<(), StoreError> {
        let text = snapshot.pretty()?;
        tokio::fs::write(&self.path, text)
            .await
            .map_err(|source| StoreError::Io {
                path: self.path.clone(),
                source,
            })?;
        info!("Data successfully saved to {}", self.path.display());
        Ok(())
    }

    /// Parses `source` and replaces the stored data with it
    pub async fn import(&self, source: &Path) -> Result<RatesSnapshot, StoreError> {
        let text = tokio::fs::read_to_string(source)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => StoreError::NotFound(source.to_path_buf()),
                _ => StoreError::Io {
                    path: source.to_path_buf(),
                    source: e,
                },
            })?;
        let snapshot = RatesSnapshot::parse(&text)?;
        self.save(&snapshot).await?;
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> RatesSnapshot {
        RatesSnapshot::from_value(json!({
            "result": "success",
            "base_code": "EUR",
            "time_last_update_utc": "Fri, 02 May 2025 00:02:31 +0000",
            "rates": { "USD": 1.13, "EUR": 1, "GBP": 0.85, "BAD": "n/a" }
        }))
    }

    #[test]
    fn rates_are_sorted_and_numeric_only() {
        let rates = sample().rates();
        assert_eq!(
            rates.keys().cloned().collect::<Vec<_>>(),
            vec!["EUR", "GBP", "USD"]
        );
        assert_eq!(rates["EUR"], 1.0);
    }

    #[test]
    fn missing_fields_fall_back() {
        let empty = RatesSnapshot::from_value(json!({}));
        assert_eq!(empty.base_code(), "USD");
        assert_eq!(empty.last_updated(), "Unknown");
        assert!(empty.rates().is_empty());
    }

    #[test]
    fn pretty_uses_four_spaces() {
        let text = RatesSnapshot::from_value(json!({"a": 1})).pretty().unwrap();
        assert_eq!(text, "{\n    \"a\": 1\n}");
    }

    #[tokio::test]
    async fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = RatesStore::new(dir.path().join("any_api.json"));
        store.save(&sample()).await.unwrap();
        assert_eq!(store.load().await.unwrap(), sample());
    }

    #[tokio::test]
    async fn load_reports_missing_and_malformed_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = RatesStore::new(dir.path().join("any_api.json"));
        let missing = store.load().await.unwrap_err();
        assert!(missing.to_string().starts_with("JSON file not found at"));

        tokio::fs::write(store.path(), "{not json").await.unwrap();
        assert!(matches!(
            store.load().await,
            Err(StoreError::InvalidJson(_))
        ));
    }

    #[tokio::test]
    async fn import_rejects_bad_input_and_keeps_old_data() {
        let dir = tempfile::tempdir().unwrap();
        let store = RatesStore::new(dir.path().join("any_api.json"));
        store.save(&sample()).await.unwrap();

        let bad = dir.path().join("bad.json");
        tokio::fs::write(&bad, "[1,").await.unwrap();
        assert!(store.import(&bad).await.is_err());
        assert_eq!(store.load().await.unwrap(), sample());

        let good = dir.path().join("good.json");
        tokio::fs::write(&good, r#"{"base_code":"GBP","rates":{"USD":1.3}}"#)
            .await
            .unwrap();
        let imported = store.import(&good).await.unwrap();
        assert_eq!(imported.base_code(), "GBP");
        assert_eq!(store.load().await.unwrap().base_code(), "GBP");
    }
}
