//! アプリケーション設定管理モジュール
//!
//! XDGディレクトリを使用した設定ファイル（TOML）の読み込みと検証を提供します。
//! Twitchの認証情報は環境変数 `TWITCH_CLIENT_ID` / `TWITCH_CLIENT_SECRET` で上書きできます。

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// 設定値の検証エラー
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("'{field}' must be greater than zero")]
    Zero { field: &'static str },

    #[error("scheduler interval of {minutes} minutes does not divide an hour")]
    UnalignedInterval { minutes: u32 },

    #[error("no channels to monitor")]
    NoChannels,
}

/// チェッカー（IRC監視）設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckerConfig {
    /// 起動時にIRC接続を有効化するか
    pub enabled: bool,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// 接続プール設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// 1接続あたりの最大チャンネル数
    pub max_group_size: usize,
    /// 一度にJOINするチャンネル数
    pub join_batch_size: usize,
    /// JOINバッチ間の待機時間（秒）
    pub join_batch_delay_secs: u64,
    /// チャットフィードのWebSocket URL
    pub feed_url: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_group_size: 30,
            join_batch_size: 10,
            join_batch_delay_secs: 10,
            feed_url: "wss://irc-ws.chat.twitch.tv:443".to_string(),
        }
    }
}

impl PoolConfig {
    pub fn join_batch_delay(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.join_batch_delay_secs)
    }
}

/// スケジューラ設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// 境界の間隔（分）。60を割り切れる値のみ。
    pub interval_minutes: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_minutes: 10,
        }
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(u64::from(self.interval_minutes) * 60)
    }
}

/// Twitch API設定
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TwitchConfig {
    pub client_id: String,
    pub client_secret: String,
    pub api_base_url: String,
    pub token_url: String,
    /// 1リクエストあたりの最大件数（Helixの上限は100、運用値は50）
    pub batch_size: usize,
    /// 識別情報キャッシュの有効期間（時間）
    pub identity_ttl_hours: i64,
    pub request_timeout_ms: u64,
}

impl std::fmt::Debug for TwitchConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TwitchConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("api_base_url", &self.api_base_url)
            .field("token_url", &self.token_url)
            .field("batch_size", &self.batch_size)
            .field("identity_ttl_hours", &self.identity_ttl_hours)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .finish()
    }
}

impl Default for TwitchConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            api_base_url: "https://api.twitch.tv/helix".to_string(),
            token_url: "https://id.twitch.tv/oauth2/token".to_string(),
            batch_size: 50,
            identity_ttl_hours: 24,
            request_timeout_ms: 15000,
        }
    }
}

impl TwitchConfig {
    pub fn identity_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.identity_ttl_hours)
    }

    pub fn has_credentials(&self) -> bool {
        !self.client_id.is_empty() && !self.client_secret.is_empty()
    }
}

/// 保存先設定
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StorageConfig {
    /// チャンネル別JSONの保存先（Noneの場合はXDGデータディレクトリ）
    pub data_dir: Option<PathBuf>,
    /// 識別情報キャッシュファイル（Noneの場合はデータディレクトリ直下）
    pub identity_cache_file: Option<PathBuf>,
}

/// ログ設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// カスタムログディレクトリ（Noneの場合はXDGデフォルト使用）
    pub log_dir: Option<PathBuf>,
    /// ログレベル (trace/debug/info/warn/error)
    pub log_level: String,
    /// ファイル出力有効化
    pub enable_file_logging: bool,
    /// 保存するログファイル数上限
    pub max_log_files: u32,
    /// 古いログファイル自動削除
    pub auto_cleanup_enabled: bool,
    /// ログファイル名の接頭辞（内部管理用）
    pub log_file_prefix: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            log_level: "info".to_string(),
            enable_file_logging: false,
            max_log_files: 30,
            auto_cleanup_enabled: true,
            log_file_prefix: "viewboi".to_string(),
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// 監視対象チャンネル
    pub channels: Vec<String>,
    pub checker: CheckerConfig,
    pub pool: PoolConfig,
    pub scheduler: SchedulerConfig,
    pub twitch: TwitchConfig,
    pub storage: StorageConfig,
    pub log: LogConfig,
}

impl AppConfig {
    /// 環境変数による上書きを適用
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(id) = lookup("TWITCH_CLIENT_ID").filter(|v| !v.is_empty()) {
            self.twitch.client_id = id;
        }
        if let Some(secret) = lookup("TWITCH_CLIENT_SECRET").filter(|v| !v.is_empty()) {
            self.twitch.client_secret = secret;
        }
    }

    /// 設定値の整合性を検証
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channels.is_empty() {
            return Err(ConfigError::NoChannels);
        }
        let sizes = [
            ("pool.max_group_size", self.pool.max_group_size),
            ("pool.join_batch_size", self.pool.join_batch_size),
            ("twitch.batch_size", self.twitch.batch_size),
        ];
        for (field, value) in sizes {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }
        if self.twitch.identity_ttl_hours <= 0 {
            return Err(ConfigError::Zero {
                field: "twitch.identity_ttl_hours",
            });
        }
        let minutes = self.scheduler.interval_minutes;
        if minutes == 0 {
            return Err(ConfigError::Zero {
                field: "scheduler.interval_minutes",
            });
        }
        if 60 % minutes != 0 {
            return Err(ConfigError::UnalignedInterval { minutes });
        }
        Ok(())
    }

    /// 監視対象チャンネル（正規化・重複除去済み、入力順を維持）
    pub fn roster(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        self.channels
            .iter()
            .map(|c| crate::models::normalize_login(c))
            .filter(|c| !c.is_empty() && seen.insert(c.clone()))
            .collect()
    }

    pub fn data_dir(&self) -> PathBuf {
        self.storage
            .data_dir
            .clone()
            .or_else(|| project_dirs().map(|dirs| dirs.data_dir().join("streams")))
            .unwrap_or_else(|| PathBuf::from("streamsData"))
    }

    pub fn identity_cache_file(&self) -> PathBuf {
        self.storage
            .identity_cache_file
            .clone()
            .unwrap_or_else(|| self.data_dir().join("streamers_info.json"))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log
            .log_dir
            .clone()
            .or_else(|| project_dirs().map(|dirs| dirs.data_dir().join("logs")))
            .unwrap_or_else(|| PathBuf::from("logs"))
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("dev", "viewboi", "viewboi")
}

/// 設定管理マネージャー
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// XDG設定ディレクトリの設定ファイルを使う
    pub fn new() -> Result<Self> {
        let config_path = Self::default_config_path()?;
        Ok(Self { config_path })
    }

    /// 指定パスの設定ファイルを使う
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: path.into(),
        }
    }

    fn default_config_path() -> Result<PathBuf> {
        let dirs = project_dirs().context("Failed to get project directories")?;
        let config_file = dirs.config_dir().join("config.toml");
        debug!("Config file path: {}", config_file.display());
        Ok(config_file)
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// 設定を読み込み（ファイルが無ければデフォルト）、環境変数を適用
    pub fn load_config(&self) -> Result<AppConfig> {
        let mut config = if self.config_path.exists() {
            let content = fs::read_to_string(&self.config_path).with_context(|| {
                format!("Failed to read config file: {}", self.config_path.display())
            })?;
            let config: AppConfig = toml::from_str(&content).with_context(|| {
                format!("Failed to parse config file: {}", self.config_path.display())
            })?;
            info!("✅ Configuration loaded from: {}", self.config_path.display());
            config
        } else {
            info!(
                "Config file not found, using default settings: {}",
                self.config_path.display()
            );
            AppConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// 設定を保存
    pub fn save_config(&self, config: &AppConfig) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }
        let content = toml::to_string_pretty(config).context("Failed to serialize config")?;
        fs::write(&self.config_path, content).with_context(|| {
            format!("Failed to write config file: {}", self.config_path.display())
        })?;
        info!("💾 Configuration saved to: {}", self.config_path.display());
        Ok(())
    }
}
