//! 保存済みシリーズの統計と履歴
//!
//! 統計は配信中（`is_active`）のレコードのみを対象とし、結果は24時間キャッシュする。

use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

use crate::api::IdentityResolver;
use crate::cache::TtlCache;
use crate::clock::Clock;
use crate::io::{PersistenceSink, StoreError};
use crate::models::{normalize_login, round2, ChannelSnapshot, IdentityRecord};

/// 統計・履歴キャッシュの有効期間（時間）
pub const HISTORY_CACHE_TTL_HOURS: i64 = 24;

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("No history recorded for channel '{login}'")]
    NotFound { login: String },

    #[error("Failed to read history: {0}")]
    Store(#[from] StoreError),
}

/// チャンネル統計
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelStatistics {
    /// ログイン名
    pub login: String,
    /// 表示名
    pub display_name: String,
    /// アバター画像URL
    pub avatar: String,
    /// 平均視聴者数
    pub avg_viewers: u64,
    /// 最大視聴者数
    pub max_viewers: u64,
    /// 平均メッセージ数/分
    pub messages_per_minute: u32,
    /// 平均ユニークユーザー数
    pub unique_users: u32,
    /// 平均チャット参加率（%、小数点以下2桁）
    pub chatters_percentage: f64,
}

impl ChannelStatistics {
    /// シリーズから統計を計算する。配信中のレコードが無ければゼロ。
    pub fn from_series(
        login: &str,
        identity: Option<&IdentityRecord>,
        series: &[ChannelSnapshot],
    ) -> Self {
        let active: Vec<&ChannelSnapshot> = series.iter().filter(|s| s.is_active).collect();
        let mean = |value: fn(&ChannelSnapshot) -> f64| {
            if active.is_empty() {
                0.0
            } else {
                active.iter().map(|&s| value(s)).sum::<f64>() / active.len() as f64
            }
        };

        Self {
            login: identity.map_or_else(|| login.to_string(), |i| i.login.clone()),
            display_name: identity.map_or_else(|| login.to_string(), |i| i.display_name.clone()),
            avatar: identity.map(|i| i.avatar_url.clone()).unwrap_or_default(),
            avg_viewers: mean(|s| s.viewer_count as f64).round() as u64,
            max_viewers: active.iter().map(|s| s.viewer_count).max().unwrap_or(0),
            messages_per_minute: mean(|s| f64::from(s.messages_per_minute)).round() as u32,
            unique_users: mean(|s| f64::from(s.unique_users)).round() as u32,
            chatters_percentage: round2(mean(|s| s.chatters_percentage)),
        }
    }
}

/// 1チャンネルの履歴
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelHistory {
    pub statistics: ChannelStatistics,
    pub identity: Option<IdentityRecord>,
    pub series: Vec<ChannelSnapshot>,
}

/// 読み取り側のクエリサービス
pub struct HistoryService {
    resolver: Arc<IdentityResolver>,
    store: Arc<dyn PersistenceSink>,
    roster: Vec<String>,
    overview: TtlCache<(), Vec<ChannelStatistics>>,
    histories: TtlCache<String, ChannelHistory>,
}

impl std::fmt::Debug for HistoryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryService")
            .field("roster", &self.roster.len())
            .field("cached_histories", &self.histories.len())
            .finish_non_exhaustive()
    }
}

impl HistoryService {
    pub fn new(
        resolver: Arc<IdentityResolver>,
        store: Arc<dyn PersistenceSink>,
        roster: Vec<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let ttl = chrono::Duration::hours(HISTORY_CACHE_TTL_HOURS);
        Self {
            resolver,
            store,
            roster,
            overview: TtlCache::new(ttl, Arc::clone(&clock)),
            histories: TtlCache::new(ttl, clock),
        }
    }

    /// 全監視チャンネルの統計
    ///
    /// 識別情報かシリーズのどちらかが無いチャンネルは除外する。
    pub async fn all_statistics(&self) -> Result<Vec<ChannelStatistics>, HistoryError> {
        if let Some(cached) = self.overview.get(&()) {
            tracing::debug!("📋 Statistics served from cache");
            return Ok(cached);
        }

        let resolution = self.resolver.resolve(&self.roster).await;
        let mut statistics = Vec::with_capacity(resolution.records.len());
        for login in &resolution.failed {
            tracing::warn!(channel = %login, "👤 Identity not found, skipping statistics");
        }

        for identity in &resolution.records {
            match self.store.read_series(&identity.login).await {
                Ok(Some(series)) => statistics.push(ChannelStatistics::from_series(
                    &identity.login,
                    Some(identity),
                    &series,
                )),
                Ok(None) => tracing::info!(channel = %identity.login, "📭 No series recorded yet"),
                Err(e) => tracing::warn!(channel = %identity.login, "⚠️ Skipping statistics: {}", e),
            }
        }

        tracing::info!("📊 Computed statistics for {} channels", statistics.len());
        self.overview.insert((), statistics.clone());
        Ok(statistics)
    }

    /// 1チャンネルの履歴と統計
    pub async fn channel_history(&self, login: &str) -> Result<ChannelHistory, HistoryError> {
        let login = normalize_login(login);
        if let Some(cached) = self.histories.get(&login) {
            tracing::debug!(channel = %login, "📋 History served from cache");
            return Ok(cached);
        }

        let series = match self.store.read_series(&login).await {
            Ok(Some(series)) => series,
            Ok(None) | Err(StoreError::InvalidLogin { .. }) => {
                return Err(HistoryError::NotFound { login });
            }
            Err(e) => return Err(e.into()),
        };

        let identity = self
            .resolver
            .resolve(std::slice::from_ref(&login))
            .await
            .records
            .into_iter()
            .next();
        let history = ChannelHistory {
            statistics: ChannelStatistics::from_series(&login, identity.as_ref(), &series),
            identity,
            series,
        };

        self.histories.insert(login, history.clone());
        Ok(history)
    }

    pub fn invalidate(&self) {
        self.overview.invalidate_all();
        self.histories.invalidate_all();
    }
}
