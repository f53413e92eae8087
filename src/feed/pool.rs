//! 接続プール
//!
//! 監視チャンネルを最大`max_group_size`件のグループに分け、グループごとに
//! 1本のフィード接続を開く。JOINは`join_batch_size`件ずつ、バッチ間に
//! 固定の待機を入れて1つのバックグラウンドタスクが順に発行する。

use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{FeedClient, FeedError, FeedEvent, FeedHandle, FeedSubscription};
use crate::analytics::TimeBucketAggregator;
use crate::config::PoolConfig;
use crate::models::normalize_login;

/// プール操作のエラー
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("All {groups} connection groups failed to connect: {source}")]
    AllGroupsFailed {
        groups: usize,
        #[source]
        source: FeedError,
    },
}

/// グループの状態
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupStatus {
    pub id: usize,
    pub channels: Vec<String>,
    pub joined: usize,
    pub connected: bool,
}

/// プールの状態
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub enabled: bool,
    pub groups: Vec<GroupStatus>,
}

impl PoolStatus {
    fn disabled() -> Self {
        Self {
            enabled: false,
            groups: Vec::new(),
        }
    }

    /// グループごとのチャンネル数
    pub fn channel_counts(&self) -> Vec<usize> {
        self.groups.iter().map(|g| g.channels.len()).collect()
    }
}

struct ChannelGroup {
    id: usize,
    channels: Vec<String>,
    handle: Arc<dyn FeedHandle>,
    joined: Arc<AtomicUsize>,
    connected: Arc<AtomicBool>,
    forwarder: JoinHandle<()>,
}

struct ActivePool {
    groups: Vec<ChannelGroup>,
    shutdown: watch::Sender<bool>,
    joiner: JoinHandle<()>,
    joins_done: watch::Receiver<bool>,
}

struct JoinPlan {
    group_id: usize,
    channels: Vec<String>,
    handle: Arc<dyn FeedHandle>,
    joined: Arc<AtomicUsize>,
}

/// グループ化されたフィード接続の管理
pub struct ConnectionPool {
    feed: Arc<dyn FeedClient>,
    aggregator: Arc<TimeBucketAggregator>,
    config: PoolConfig,
    lifecycle: tokio::sync::Mutex<()>,
    active: Mutex<Option<ActivePool>>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.config)
            .field("status", &self.status())
            .finish()
    }
}

impl ConnectionPool {
    pub fn new(
        feed: Arc<dyn FeedClient>,
        aggregator: Arc<TimeBucketAggregator>,
        config: PoolConfig,
    ) -> Self {
        Self {
            feed,
            aggregator,
            config,
            lifecycle: tokio::sync::Mutex::new(()),
            active: Mutex::new(None),
        }
    }

    /// チャンネルを分割して接続を開き、JOINを開始する
    ///
    /// JOINはバックグラウンドで進むため、戻り値の`joined`は0から増えていく。
    /// 既に有効な場合は現在の状態を返す。
    pub async fn enable(&self, channels: &[String]) -> Result<PoolStatus, PoolError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.active.lock().is_some() {
            tracing::info!("ℹ️ Connection pool already enabled");
            return Ok(self.status());
        }

        let roster = dedup_channels(channels);
        let partitions: Vec<Vec<String>> = roster
            .chunks(self.config.max_group_size.max(1))
            .map(<[String]>::to_vec)
            .collect();
        tracing::info!(
            "🚀 Enabling connection pool: {} channels in {} groups",
            roster.len(),
            partitions.len()
        );

        let total = partitions.len();
        let mut groups = Vec::with_capacity(total);
        let mut last_error = None;
        for (index, channels) in partitions.into_iter().enumerate() {
            let id = index + 1;
            match self.feed.subscribe(id).await {
                Ok(subscription) => groups.push(self.spawn_group(id, channels, subscription)),
                Err(e) => {
                    tracing::error!(
                        group = id,
                        "❌ Failed to open connection for {} channels: {}",
                        channels.len(),
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        if groups.is_empty() {
            if let Some(source) = last_error {
                return Err(PoolError::AllGroupsFailed {
                    groups: total,
                    source,
                });
            }
        }

        let plan = groups
            .iter()
            .map(|g| JoinPlan {
                group_id: g.id,
                channels: g.channels.clone(),
                handle: Arc::clone(&g.handle),
                joined: Arc::clone(&g.joined),
            })
            .collect();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (done_tx, joins_done) = watch::channel(false);
        let joiner = tokio::spawn(drive_joins(
            plan,
            self.config.join_batch_size.max(1),
            self.config.join_batch_delay(),
            shutdown_rx,
            done_tx,
        ));

        *self.active.lock() = Some(ActivePool {
            groups,
            shutdown,
            joiner,
            joins_done,
        });
        Ok(self.status())
    }

    /// 全接続を閉じる。未発行のJOINは破棄される。
    pub async fn disable(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let Some(active) = self.active.lock().take() else {
            tracing::debug!("Connection pool already disabled");
            return;
        };

        let _ = active.shutdown.send(true);
        if let Err(e) = active.joiner.await {
            tracing::warn!("⚠️ Join task ended abnormally: {}", e);
        }

        for group in &active.groups {
            group.handle.close().await;
        }
        for group in active.groups {
            group.forwarder.abort();
            tracing::debug!(group = group.id, "🔌 Group closed");
        }
        tracing::info!("🛑 Connection pool disabled");
    }

    pub fn status(&self) -> PoolStatus {
        let active = self.active.lock();
        let Some(active) = active.as_ref() else {
            return PoolStatus::disabled();
        };

        PoolStatus {
            enabled: true,
            groups: active
                .groups
                .iter()
                .map(|g| GroupStatus {
                    id: g.id,
                    channels: g.channels.clone(),
                    joined: g.joined.load(Ordering::SeqCst),
                    connected: g.connected.load(Ordering::SeqCst),
                })
                .collect(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.active.lock().is_some()
    }

    /// バックグラウンドのJOINが終わる（または中断される）まで待つ
    pub async fn wait_for_joins(&self) {
        let receiver = self.active.lock().as_ref().map(|a| a.joins_done.clone());
        if let Some(mut receiver) = receiver {
            let _ = receiver.wait_for(|done| *done).await;
        }
    }

    fn spawn_group(
        &self,
        id: usize,
        channels: Vec<String>,
        subscription: FeedSubscription,
    ) -> ChannelGroup {
        let connected = Arc::new(AtomicBool::new(true));
        let forwarder = tokio::spawn(forward_events(
            id,
            subscription.events,
            Arc::clone(&self.aggregator),
            Arc::clone(&connected),
        ));

        ChannelGroup {
            id,
            channels,
            handle: subscription.handle,
            joined: Arc::new(AtomicUsize::new(0)),
            connected,
            forwarder,
        }
    }
}

fn dedup_channels(channels: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    channels
        .iter()
        .map(|c| normalize_login(c))
        .filter(|c| !c.is_empty() && seen.insert(c.clone()))
        .collect()
}

async fn forward_events(
    group_id: usize,
    mut events: impl futures_util::Stream<Item = FeedEvent> + Unpin,
    aggregator: Arc<TimeBucketAggregator>,
    connected: Arc<AtomicBool>,
) {
    while let Some(event) = events.next().await {
        match event {
            FeedEvent::Message(message) => aggregator.ingest(message),
            FeedEvent::Connected => {
                connected.store(true, Ordering::SeqCst);
                tracing::debug!(group = group_id, "✅ Feed connected");
            }
            FeedEvent::Disconnected { reason } => {
                connected.store(false, Ordering::SeqCst);
                tracing::warn!(group = group_id, "⚠️ Feed disconnected: {}", reason);
            }
            FeedEvent::Error { message } => {
                tracing::warn!(group = group_id, "⚠️ Feed error: {}", message);
            }
        }
    }
    tracing::debug!(group = group_id, "Feed event stream ended");
}

async fn drive_joins(
    plan: Vec<JoinPlan>,
    batch_size: usize,
    delay: Duration,
    mut shutdown: watch::Receiver<bool>,
    done: watch::Sender<bool>,
) {
    let mut first = true;
    for group in plan {
        let batches: Vec<&[String]> = group.channels.chunks(batch_size).collect();
        for (index, batch) in batches.iter().enumerate() {
            if !first {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => {
                        tracing::info!("⏹️ Pending joins cancelled");
                        return;
                    }
                }
            }
            first = false;
            if *shutdown.borrow() {
                return;
            }

            let result = tokio::select! {
                result = group.handle.join(batch) => result,
                _ = shutdown.changed() => {
                    tracing::info!("⏹️ Pending joins cancelled");
                    return;
                }
            };

            match result {
                Ok(()) => {
                    group.joined.fetch_add(batch.len(), Ordering::SeqCst);
                    tracing::info!(
                        group = group.group_id,
                        "📥 Joined batch {}/{} ({} channels)",
                        index + 1,
                        batches.len(),
                        batch.len()
                    );
                }
                Err(e) => tracing::warn!(
                    group = group.group_id,
                    "⚠️ Join batch {}/{} failed, skipping: {}",
                    index + 1,
                    batches.len(),
                    e
                ),
            }
        }
    }

    tracing::info!("✅ All join batches dispatched");
    let _ = done.send(true);
}
