//! Per-channel append-only JSON series store.
//!
//! Every channel owns one file, `<data_dir>/<login>.json`, shaped as
//! `{ "<login>": [ ChannelSnapshot, ... ] }`. Appends rewrite the file through a
//! temporary file and a rename so a crash never leaves a half-written series.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::models::ChannelSnapshot;

/// Errors raised by the series store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// I/O error when reading or writing series files
    #[error("File I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Serialization of the series failed
    #[error("JSON serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Login cannot be used as a file name
    #[error("Invalid channel login: '{login}'")]
    InvalidLogin { login: String },
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Append-only per-channel record store.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    /// Read the whole series of a channel. `None` when no series exists yet.
    async fn read_series(&self, login: &str) -> Result<Option<Vec<ChannelSnapshot>>, StoreError>;

    /// Append records to a channel series and return the new series length.
    async fn append(&self, login: &str, records: &[ChannelSnapshot]) -> Result<usize, StoreError>;
}

/// File-backed [`PersistenceSink`].
#[derive(Debug)]
pub struct JsonFileStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the series file for a login.
    pub fn series_path(&self, login: &str) -> Result<PathBuf, StoreError> {
        validate_login(login)?;
        Ok(self.dir.join(format!("{login}.json")))
    }

    async fn load(&self, login: &str, path: &Path) -> Result<Loaded, StoreError> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Loaded::Missing),
            Err(e) => return Err(StoreError::io(path, e)),
        };

        match parse_series(login, &content) {
            Ok(records) => Ok(Loaded::Series(records)),
            Err(reason) => {
                tracing::warn!(
                    channel = %login,
                    path = %path.display(),
                    "⚠️ Malformed series file, treating as empty: {}",
                    reason
                );
                Ok(Loaded::Malformed)
            }
        }
    }
}

enum Loaded {
    Missing,
    Malformed,
    Series(Vec<ChannelSnapshot>),
}

/// Twitch logins are limited to ASCII alphanumerics and underscores.
fn validate_login(login: &str) -> Result<(), StoreError> {
    let valid = !login.is_empty()
        && login
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidLogin {
            login: login.to_string(),
        })
    }
}

fn parse_series(login: &str, content: &str) -> Result<Vec<ChannelSnapshot>, String> {
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }

    let value: Value = serde_json::from_str(content).map_err(|e| e.to_string())?;
    let Value::Object(mut map) = value else {
        return Err("top-level value is not an object".to_string());
    };

    let Some(series) = map.remove(login) else {
        return Ok(Vec::new());
    };

    serde_json::from_value(series).map_err(|e| e.to_string())
}

#[async_trait]
impl PersistenceSink for JsonFileStore {
    async fn read_series(&self, login: &str) -> Result<Option<Vec<ChannelSnapshot>>, StoreError> {
        let path = self.series_path(login)?;
        match self.load(login, &path).await? {
            Loaded::Missing => Ok(None),
            Loaded::Malformed => Ok(Some(Vec::new())),
            Loaded::Series(records) => Ok(Some(records)),
        }
    }

    async fn append(&self, login: &str, records: &[ChannelSnapshot]) -> Result<usize, StoreError> {
        let path = self.series_path(login)?;
        let _guard = self.write_lock.lock().await;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StoreError::io(&self.dir, e))?;

        let mut series = match self.load(login, &path).await? {
            Loaded::Missing => {
                tracing::info!(channel = %login, "📁 Creating new series file");
                Vec::new()
            }
            Loaded::Malformed => {
                let backup = path.with_extension("json.corrupt");
                tokio::fs::rename(&path, &backup)
                    .await
                    .map_err(|e| StoreError::io(&path, e))?;
                tracing::warn!(
                    channel = %login,
                    backup = %backup.display(),
                    "⚠️ Malformed series preserved before rewrite"
                );
                Vec::new()
            }
            Loaded::Series(records) => records,
        };
        series.extend_from_slice(records);

        let mut document = Map::new();
        document.insert(login.to_string(), serde_json::to_value(&series)?);
        let body = serde_json::to_string_pretty(&Value::Object(document))?;

        let temp = path.with_extension("json.tmp");
        tokio::fs::write(&temp, body)
            .await
            .map_err(|e| StoreError::io(&temp, e))?;
        tokio::fs::rename(&temp, &path)
            .await
            .map_err(|e| StoreError::io(&path, e))?;

        tracing::debug!(channel = %login, records = series.len(), "💾 Series appended");
        Ok(series.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChannelActivity;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn snapshot(minute: u32, messages: u32) -> ChannelSnapshot {
        ChannelSnapshot::merge(
            None,
            ChannelActivity {
                messages_per_minute: messages,
                unique_users: 0,
            },
            Utc.with_ymd_and_hms(2025, 9, 7, 14, minute, 0).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_read_missing_series_returns_none() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path());
        assert!(store.read_series("forsen").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_append_keeps_tick_order() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path().join("streams"));

        assert_eq!(store.append("forsen", &[snapshot(0, 1)]).await.unwrap(), 1);
        assert_eq!(store.append("forsen", &[snapshot(10, 2)]).await.unwrap(), 2);

        let series = store.read_series("forsen").await.unwrap().unwrap();
        let counts: Vec<u32> = series.iter().map(|s| s.messages_per_minute).collect();
        assert_eq!(counts, vec![1, 2]);

        let raw = std::fs::read_to_string(dir.path().join("streams/forsen.json")).unwrap();
        let value: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["forsen"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_malformed_file_is_treated_as_empty() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path());
        std::fs::write(dir.path().join("forsen.json"), "{ not json").unwrap();

        assert_eq!(store.read_series("forsen").await.unwrap(), Some(Vec::new()));

        assert_eq!(store.append("forsen", &[snapshot(0, 3)]).await.unwrap(), 1);
        assert!(dir.path().join("forsen.json.corrupt").exists());
        assert_eq!(store.read_series("forsen").await.unwrap().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejects_path_like_login() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path());
        let result = store.append("../etc", &[snapshot(0, 1)]).await;
        assert!(matches!(result, Err(StoreError::InvalidLogin { .. })));
    }
}
