//! チャンネル識別情報・ライブ情報の解決
//!
//! 識別情報（id、表示名、アバター）は24時間キャッシュし、
//! ライブ情報（視聴者数、タイトル、ゲーム）は毎回取得する。
//! どちらもバッチサイズごとに分割し、全バッチを並行に発行する。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::api::helix::{ApiError, StreamData, UserData};
use crate::cache::is_expired;
use crate::clock::Clock;
use crate::models::{normalize_login, IdentityRecord, LivenessRecord};

/// 識別情報・ライブ情報の外部ソース
#[async_trait]
pub trait LiveDataSource: Send + Sync {
    async fn fetch_users(&self, logins: &[String]) -> Result<Vec<UserData>, ApiError>;
    async fn fetch_streams(&self, user_ids: &[String]) -> Result<Vec<StreamData>, ApiError>;
}

/// 部分的な解決結果
///
/// `records`は入力順。`failed`は解決できなかった入力（入力順）。
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution<T> {
    pub records: Vec<T>,
    pub failed: Vec<String>,
}

impl<T> Resolution<T> {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

impl UserData {
    fn into_record(self, cached_at: DateTime<Utc>) -> IdentityRecord {
        IdentityRecord {
            id: self.id,
            login: normalize_login(&self.login),
            display_name: self.display_name,
            avatar_url: self.profile_image_url,
            cached_at,
        }
    }
}

impl From<StreamData> for LivenessRecord {
    fn from(stream: StreamData) -> Self {
        Self {
            id: stream.user_id,
            login: normalize_login(&stream.user_login),
            viewer_count: stream.viewer_count,
            title: stream.title,
            game_name: stream.game_name,
        }
    }
}

/// 識別情報リゾルバ
pub struct IdentityResolver {
    source: Arc<dyn LiveDataSource>,
    clock: Arc<dyn Clock>,
    ttl: chrono::Duration,
    batch_size: usize,
    cache: RwLock<HashMap<String, IdentityRecord>>,
    cache_file: Option<PathBuf>,
}

impl std::fmt::Debug for IdentityResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityResolver")
            .field("ttl", &self.ttl)
            .field("batch_size", &self.batch_size)
            .field("cached", &self.cache.read().len())
            .field("cache_file", &self.cache_file)
            .finish()
    }
}

impl IdentityResolver {
    pub fn new(
        source: Arc<dyn LiveDataSource>,
        clock: Arc<dyn Clock>,
        ttl: chrono::Duration,
        batch_size: usize,
    ) -> Self {
        Self {
            source,
            clock,
            ttl,
            batch_size: batch_size.max(1),
            cache: RwLock::new(HashMap::new()),
            cache_file: None,
        }
    }

    /// キャッシュファイルを読み込み、以後の更新で書き戻す
    pub async fn with_cache_file(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let loaded = load_cache_file(&path).await;
        if !loaded.is_empty() {
            tracing::info!(
                "📂 Loaded {} cached identities from {}",
                loaded.len(),
                path.display()
            );
        }
        *self.cache.write() = loaded;
        self.cache_file = Some(path);
        self
    }

    /// キャッシュ済みの識別情報（期限に関係なく）
    pub fn cached(&self, login: &str) -> Option<IdentityRecord> {
        self.cache.read().get(&normalize_login(login)).cloned()
    }

    /// ログイン名を識別情報に解決する
    pub async fn resolve(&self, logins: &[String]) -> Resolution<IdentityRecord> {
        let now = self.clock.now();
        let wanted = dedup_logins(logins);

        let mut found: HashMap<String, IdentityRecord> = HashMap::new();
        let mut queued: Vec<String> = Vec::new();
        {
            let cache = self.cache.read();
            for login in &wanted {
                match cache.get(login) {
                    Some(record) if !is_expired(record.cached_at, now, self.ttl) => {
                        found.insert(login.clone(), record.clone());
                    }
                    _ => queued.push(login.clone()),
                }
            }
        }

        if !queued.is_empty() {
            let batches: Vec<&[String]> = queued.chunks(self.batch_size).collect();
            tracing::info!(
                "👥 Refreshing {} identities in {} batches ({} cache hits)",
                queued.len(),
                batches.len(),
                found.len()
            );

            let results = join_all(batches.iter().map(|batch| self.source.fetch_users(batch))).await;

            let mut fresh: Vec<IdentityRecord> = Vec::new();
            for (index, result) in results.into_iter().enumerate() {
                match result {
                    Ok(users) => fresh.extend(users.into_iter().map(|u| u.into_record(now))),
                    Err(e) => tracing::warn!(
                        batch = index + 1,
                        "⚠️ Identity batch of {} logins failed: {}",
                        batches[index].len(),
                        e
                    ),
                }
            }

            if !fresh.is_empty() {
                {
                    let mut cache = self.cache.write();
                    for record in &fresh {
                        cache.insert(record.login.clone(), record.clone());
                    }
                }
                self.save_cache_file().await;
            }

            for record in fresh {
                found.insert(record.login.clone(), record);
            }
        }

        ordered_resolution(wanted, found)
    }

    /// ユーザーIDのライブ情報を取得する（キャッシュしない）
    ///
    /// 配信していないチャンネルは`records`に含まれず、`failed`にも入らない。
    pub async fn resolve_liveness(&self, ids: &[String]) -> Resolution<LivenessRecord> {
        let mut seen = HashSet::new();
        let ids: Vec<String> = ids
            .iter()
            .filter(|id| !id.is_empty() && seen.insert(id.as_str()))
            .cloned()
            .collect();
        if ids.is_empty() {
            return Resolution {
                records: Vec::new(),
                failed: Vec::new(),
            };
        }

        let batches: Vec<&[String]> = ids.chunks(self.batch_size).collect();
        tracing::debug!("📡 Polling liveness for {} ids in {} batches", ids.len(), batches.len());
        let results = join_all(batches.iter().map(|batch| self.source.fetch_streams(batch))).await;

        let mut live: HashMap<String, LivenessRecord> = HashMap::new();
        let mut failed: HashSet<&str> = HashSet::new();
        for (batch, result) in batches.iter().zip(results) {
            match result {
                Ok(streams) => {
                    for stream in streams {
                        live.insert(stream.user_id.clone(), stream.into());
                    }
                }
                Err(e) => {
                    tracing::warn!("⚠️ Liveness batch of {} ids failed: {}", batch.len(), e);
                    failed.extend(batch.iter().map(String::as_str));
                }
            }
        }

        let mut records = Vec::new();
        let mut failed_ids = Vec::new();
        for id in &ids {
            if failed.contains(id.as_str()) {
                failed_ids.push(id.clone());
            } else if let Some(record) = live.remove(id) {
                records.push(record);
            }
        }

        Resolution {
            records,
            failed: failed_ids,
        }
    }

    async fn save_cache_file(&self) {
        let Some(path) = &self.cache_file else {
            return;
        };

        let body = {
            let cache = self.cache.read();
            let ordered: BTreeMap<&String, &IdentityRecord> = cache.iter().collect();
            serde_json::to_string_pretty(&ordered)
        };

        let result = match body {
            Ok(body) => write_cache_file(path, body).await,
            Err(e) => Err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        };
        if let Err(e) = result {
            tracing::warn!("⚠️ Failed to save identity cache {}: {}", path.display(), e);
        }
    }
}

fn dedup_logins(logins: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    logins
        .iter()
        .map(|l| normalize_login(l))
        .filter(|l| !l.is_empty() && seen.insert(l.clone()))
        .collect()
}

fn ordered_resolution(
    wanted: Vec<String>,
    mut found: HashMap<String, IdentityRecord>,
) -> Resolution<IdentityRecord> {
    let mut records = Vec::with_capacity(wanted.len());
    let mut failed = Vec::new();
    for login in wanted {
        match found.remove(&login) {
            Some(record) => records.push(record),
            None => failed.push(login),
        }
    }
    if !failed.is_empty() {
        tracing::warn!("⚠️ Unresolved channels: {}", failed.join(", "));
    }
    Resolution { records, failed }
}

async fn load_cache_file(path: &Path) -> HashMap<String, IdentityRecord> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return HashMap::new(),
        Err(e) => {
            tracing::warn!("⚠️ Failed to read identity cache {}: {}", path.display(), e);
            return HashMap::new();
        }
    };

    match serde_json::from_str::<HashMap<String, IdentityRecord>>(&content) {
        Ok(map) => map
            .into_values()
            .map(|record| (normalize_login(&record.login), record))
            .collect(),
        Err(e) => {
            tracing::warn!("⚠️ Ignoring malformed identity cache {}: {}", path.display(), e);
            HashMap::new()
        }
    }
}

async fn write_cache_file(path: &Path, body: String) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let temp = path.with_extension("json.tmp");
    tokio::fs::write(&temp, body).await?;
    tokio::fs::rename(&temp, path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    /// 呼び出し回数を数える偽のHelix
    #[derive(Default)]
    struct FakeSource {
        user_calls: AtomicUsize,
        stream_calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl FakeSource {
        async fn enter(&self) {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl LiveDataSource for FakeSource {
        async fn fetch_users(&self, logins: &[String]) -> Result<Vec<UserData>, ApiError> {
            self.user_calls.fetch_add(1, Ordering::SeqCst);
            self.enter().await;
            if logins.iter().any(|l| l == "broken") {
                return Err(ApiError::Status {
                    status: 500,
                    body: "boom".to_string(),
                });
            }
            Ok(logins
                .iter()
                .filter(|l| !l.starts_with("ghost"))
                .map(|l| UserData {
                    id: format!("id-{l}"),
                    login: l.clone(),
                    display_name: l.to_uppercase(),
                    profile_image_url: format!("https://cdn/{l}.png"),
                })
                .collect())
        }

        async fn fetch_streams(&self, user_ids: &[String]) -> Result<Vec<StreamData>, ApiError> {
            self.stream_calls.fetch_add(1, Ordering::SeqCst);
            self.enter().await;
            // 逆順で返しても入力順に並ぶこと
            Ok(user_ids
                .iter()
                .rev()
                .filter(|id| !id.ends_with("offline"))
                .map(|id| StreamData {
                    user_id: id.clone(),
                    user_login: id.trim_start_matches("id-").to_string(),
                    viewer_count: 100,
                    title: "live".to_string(),
                    game_name: "Just Chatting".to_string(),
                })
                .collect())
        }
    }

    fn setup() -> (Arc<FakeSource>, Arc<ManualClock>, IdentityResolver) {
        let source = Arc::new(FakeSource::default());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 9, 7, 14, 0, 0).unwrap(),
        ));
        let resolver = IdentityResolver::new(
            source.clone(),
            clock.clone(),
            chrono::Duration::hours(24),
            50,
        );
        (source, clock, resolver)
    }

    fn logins(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_hit_within_ttl_issues_no_calls() {
        let (source, clock, resolver) = setup();
        let channels = logins(&["forsen", "xqc"]);

        let first = resolver.resolve(&channels).await;
        assert!(first.is_complete());
        assert_eq!(source.user_calls.load(Ordering::SeqCst), 1);

        clock.advance(chrono::Duration::hours(24));
        let second = resolver.resolve(&logins(&["#Forsen", "XQC"])).await;
        assert_eq!(second.records, first.records);
        assert_eq!(source.user_calls.load(Ordering::SeqCst), 1);

        clock.advance(chrono::Duration::seconds(1));
        resolver.resolve(&channels).await;
        assert_eq!(source.user_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_are_dispatched_concurrently() {
        let (source, _clock, resolver) = setup();
        let channels: Vec<String> = (0..120).map(|i| format!("chan{i}")).collect();

        let resolution = resolver.resolve(&channels).await;

        assert_eq!(source.user_calls.load(Ordering::SeqCst), 3);
        assert_eq!(source.max_in_flight.load(Ordering::SeqCst), 3);
        let resolved: Vec<&str> = resolution.records.iter().map(|r| r.login.as_str()).collect();
        let expected: Vec<&str> = channels.iter().map(String::as_str).collect();
        assert_eq!(resolved, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_batch_only_affects_its_members() {
        let (_source, _clock, resolver) = setup();
        let mut channels: Vec<String> = (0..49).map(|i| format!("ok{i}")).collect();
        channels.push("broken".to_string());
        channels.push("afterbatch".to_string());

        let resolution = resolver.resolve(&channels).await;

        assert_eq!(resolution.failed.len(), 50);
        assert_eq!(resolution.failed.last().map(String::as_str), Some("broken"));
        assert_eq!(resolution.records.len(), 1);
        assert_eq!(resolution.records[0].login, "afterbatch");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_login_is_reported_as_failed() {
        let (_source, _clock, resolver) = setup();
        let resolution = resolver.resolve(&logins(&["forsen", "ghost1", "xqc"])).await;

        assert_eq!(resolution.failed, vec!["ghost1".to_string()]);
        let resolved: Vec<&str> = resolution.records.iter().map(|r| r.login.as_str()).collect();
        assert_eq!(resolved, vec!["forsen", "xqc"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_is_ordered_and_never_cached() {
        let (source, _clock, resolver) = setup();
        let ids = logins(&["id-a", "id-b-offline", "id-c"]);

        let first = resolver.resolve_liveness(&ids).await;
        resolver.resolve_liveness(&ids).await;

        assert_eq!(source.stream_calls.load(Ordering::SeqCst), 2);
        let live: Vec<&str> = first.records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(live, vec!["id-a", "id-c"]);
        assert!(first.is_complete());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_file_survives_restart() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("streamers_info.json");

        let (source, clock, resolver) = setup();
        let resolver = resolver.with_cache_file(&path).await;
        resolver.resolve(&logins(&["forsen"])).await;
        assert!(path.exists());

        let restarted = IdentityResolver::new(
            source.clone(),
            clock.clone(),
            chrono::Duration::hours(24),
            50,
        )
        .with_cache_file(&path)
        .await;
        assert_eq!(restarted.cached("forsen").map(|r| r.id), Some("id-forsen".to_string()));

        restarted.resolve(&logins(&["forsen"])).await;
        assert_eq!(source.user_calls.load(Ordering::SeqCst), 1);
    }
}
