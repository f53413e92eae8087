//! パイプライン統合テスト
//!
//! 偽のチャットフィードとHelixソースで、受信から保存・集計までを通しで確認する。

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_test::assert_ok;

use viewboi::{
    api::{
        helix::{StreamData, UserData},
        ApiError, LiveDataSource,
    },
    clock::{Clock, ManualClock},
    config::AppConfig,
    feed::{FeedClient, FeedError, FeedEvent, FeedHandle, FeedSubscription},
    models::MessageEvent,
    HistoryError, Monitor,
};

fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 9, 1, 14, 3, 0).unwrap()
}

#[derive(Default)]
struct FakeHandle {
    joined: Mutex<Vec<String>>,
}

#[async_trait]
impl FeedHandle for FakeHandle {
    async fn join(&self, channels: &[String]) -> Result<(), FeedError> {
        self.joined.lock().extend_from_slice(channels);
        Ok(())
    }

    async fn close(&self) {}
}

/// 購読ごとの送信側を保持し、テストからイベントを流し込めるフィード
#[derive(Default)]
struct FakeFeed {
    senders: Mutex<Vec<mpsc::UnboundedSender<FeedEvent>>>,
    handles: Mutex<Vec<Arc<FakeHandle>>>,
}

impl FakeFeed {
    fn push(&self, event: MessageEvent) {
        let senders = self.senders.lock();
        let sender = senders.first().expect("no subscription");
        sender.send(FeedEvent::Message(event)).expect("subscription closed");
    }

    fn subscriptions(&self) -> usize {
        self.senders.lock().len()
    }

    fn joined(&self) -> Vec<String> {
        self.handles
            .lock()
            .iter()
            .flat_map(|h| h.joined.lock().clone())
            .collect()
    }
}

#[async_trait]
impl FeedClient for FakeFeed {
    async fn subscribe(&self, _group_id: usize) -> Result<FeedSubscription, FeedError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Arc::new(FakeHandle::default());
        self.senders.lock().push(tx);
        self.handles.lock().push(Arc::clone(&handle));
        Ok(FeedSubscription {
            handle,
            events: UnboundedReceiverStream::new(rx),
        })
    }
}

/// forsenは配信中、xqcはオフライン
#[derive(Default)]
struct FakeHelix {
    user_calls: AtomicUsize,
    stream_calls: AtomicUsize,
}

#[async_trait]
impl LiveDataSource for FakeHelix {
    async fn fetch_users(&self, logins: &[String]) -> Result<Vec<UserData>, ApiError> {
        self.user_calls.fetch_add(1, Ordering::SeqCst);
        Ok(logins
            .iter()
            .map(|login| UserData {
                id: format!("id-{login}"),
                login: login.clone(),
                display_name: login.to_uppercase(),
                profile_image_url: format!("https://cdn.example/{login}.png"),
            })
            .collect())
    }

    async fn fetch_streams(&self, user_ids: &[String]) -> Result<Vec<StreamData>, ApiError> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        Ok(user_ids
            .iter()
            .filter(|id| id.as_str() == "id-forsen")
            .map(|id| StreamData {
                user_id: id.clone(),
                user_login: "forsen".to_string(),
                viewer_count: 1000,
                title: "bajs".to_string(),
                game_name: "Minecraft".to_string(),
            })
            .collect())
    }
}

fn test_config(dir: &Path, checker_enabled: bool) -> AppConfig {
    let mut config = AppConfig::default();
    config.channels = vec!["#Forsen".to_string(), "xqc".to_string()];
    config.checker.enabled = checker_enabled;
    config.storage.data_dir = Some(dir.join("streams"));
    config.storage.identity_cache_file = Some(dir.join("streamers_info.json"));
    config
}

async fn build_monitor(
    config: AppConfig,
    clock: Arc<ManualClock>,
    feed: Arc<FakeFeed>,
    helix: Arc<FakeHelix>,
) -> Monitor {
    let clock: Arc<dyn Clock> = clock;
    Monitor::build(config, clock, feed, helix).await
}

async fn wait_for_pending(monitor: &Monitor, expected: usize) {
    for _ in 0..200 {
        if monitor.aggregator().pending_len() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "expected {expected} pending messages, found {}",
        monitor.aggregator().pending_len()
    );
}

#[tokio::test]
async fn test_chat_to_snapshot_pipeline() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(start_time()));
    let feed = Arc::new(FakeFeed::default());
    let helix = Arc::new(FakeHelix::default());
    let monitor = build_monitor(
        test_config(dir.path(), true),
        Arc::clone(&clock),
        Arc::clone(&feed),
        Arc::clone(&helix),
    )
    .await;

    let status = assert_ok!(monitor.start().await);
    assert!(status.enabled);
    assert_eq!(status.channel_counts(), vec![2]);
    monitor.pool().wait_for_joins().await;
    assert_eq!(feed.joined(), vec!["forsen".to_string(), "xqc".to_string()]);

    let now = clock.now();
    feed.push(MessageEvent::new("#forsen", "alice", now));
    feed.push(MessageEvent::new("#forsen", "bob", now));
    feed.push(MessageEvent::new("#forsen", "alice", now));
    feed.push(MessageEvent::new("#xqc", "carol", now));
    wait_for_pending(&monitor, 4).await;

    let live = monitor.live_chat_stats();
    assert_eq!(live["forsen"].total_messages, 3);
    assert_eq!(live["forsen"].unique_users, 2);
    assert_eq!(live["xqc"].total_messages, 1);

    let summary = monitor.poll_once().await;
    assert!(monitor.live_chat_stats().is_empty());
    assert_eq!(summary.resolved, 2);
    assert_eq!(summary.live, 1);
    assert_eq!(summary.persisted, 2);
    assert!(summary.failed_identities.is_empty());
    assert!(!summary.requeued);

    let file = dir.path().join("streams").join("forsen.json");
    let document: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&file).unwrap()).unwrap();
    let records = document["forsen"].as_array().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["viewer_count"], 1000);
    assert_eq!(records[0]["messages_per_minute"], 3);
    assert_eq!(records[0]["unique_users"], 2);
    assert_eq!(records[0]["chatters_percentage"], 0.2);
    assert_eq!(records[0]["is_active"], true);

    let offline = assert_ok!(monitor.history().channel_history("xqc").await);
    assert_eq!(offline.series.len(), 1);
    assert!(!offline.series[0].is_active);
    assert_eq!(offline.series[0].viewer_count, 0);
    assert_eq!(offline.series[0].messages_per_minute, 1);
    assert_eq!(offline.statistics.avg_viewers, 0);

    let statistics = assert_ok!(monitor.history().all_statistics().await);
    let forsen = statistics.iter().find(|s| s.login == "forsen").unwrap();
    assert_eq!(forsen.display_name, "FORSEN");
    assert_eq!(forsen.avg_viewers, 1000);
    assert_eq!(forsen.max_viewers, 1000);
    assert_eq!(forsen.messages_per_minute, 3);
    assert_eq!(forsen.chatters_percentage, 0.2);

    monitor.shutdown().await;
    assert!(!monitor.pool().is_enabled());
}

#[tokio::test]
async fn test_checker_disabled_still_records_liveness() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(start_time()));
    let feed = Arc::new(FakeFeed::default());
    let helix = Arc::new(FakeHelix::default());
    let monitor = build_monitor(
        test_config(dir.path(), false),
        clock,
        Arc::clone(&feed),
        helix,
    )
    .await;

    let status = assert_ok!(monitor.start().await);
    assert!(!status.enabled);
    assert_eq!(feed.subscriptions(), 0);

    let summary = monitor.poll_once().await;
    assert_eq!(summary.persisted, 2);

    let history = assert_ok!(monitor.history().channel_history("forsen").await);
    assert_eq!(history.series[0].viewer_count, 1000);
    assert_eq!(history.series[0].messages_per_minute, 0);
    assert_eq!(history.series[0].chatters_percentage, 0.0);

    monitor.shutdown().await;
}

#[tokio::test]
async fn test_restart_reuses_identity_cache_and_appends() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(start_time()));

    let first_helix = Arc::new(FakeHelix::default());
    let first = build_monitor(
        test_config(dir.path(), false),
        Arc::clone(&clock),
        Arc::new(FakeFeed::default()),
        Arc::clone(&first_helix),
    )
    .await;
    first.poll_once().await;
    assert_eq!(first_helix.user_calls.load(Ordering::SeqCst), 1);
    first.shutdown().await;

    clock.advance(chrono::Duration::minutes(10));
    let second_helix = Arc::new(FakeHelix::default());
    let second = build_monitor(
        test_config(dir.path(), false),
        Arc::clone(&clock),
        Arc::new(FakeFeed::default()),
        Arc::clone(&second_helix),
    )
    .await;
    let summary = second.poll_once().await;
    assert_eq!(summary.resolved, 2);
    assert_eq!(second_helix.user_calls.load(Ordering::SeqCst), 0);
    assert_eq!(second_helix.stream_calls.load(Ordering::SeqCst), 1);

    let history = assert_ok!(second.history().channel_history("forsen").await);
    assert_eq!(history.series.len(), 2);
    assert!(history.series[0].timestamp < history.series[1].timestamp);
}

#[tokio::test]
async fn test_history_for_unknown_channel_is_not_found() {
    let dir = TempDir::new().unwrap();
    let monitor = build_monitor(
        test_config(dir.path(), false),
        Arc::new(ManualClock::new(start_time())),
        Arc::new(FakeFeed::default()),
        Arc::new(FakeHelix::default()),
    )
    .await;

    let result = monitor.history().channel_history("nobody").await;
    assert!(matches!(result, Err(HistoryError::NotFound { login }) if login == "nobody"));
}
