//! 監視プロセス全体の組み立て
//!
//! 設定からHTTPクライアント、リゾルバ、ストア、集計器、接続プール、
//! スケジューラを構築し、起動と停止の順序を管理する。

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::analytics::{HistoryService, LiveChatStats, TimeBucketAggregator};
use crate::api::{HelixClient, IdentityResolver, LiveDataSource};
use crate::clock::{Clock, SystemClock};
use crate::config::AppConfig;
use crate::feed::irc::ReconnectPolicy;
use crate::feed::{ConnectionPool, FeedClient, PoolStatus, TwitchIrcFeed};
use crate::io::JsonFileStore;
use crate::scheduler::{DecadeScheduler, TickSummary};
use crate::ViewboiResult;

#[derive(Debug)]
struct PoolRetry {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// 監視サービス
#[derive(Debug)]
pub struct Monitor {
    config: AppConfig,
    roster: Vec<String>,
    aggregator: Arc<TimeBucketAggregator>,
    pool: Arc<ConnectionPool>,
    pool_retry: Mutex<Option<PoolRetry>>,
    scheduler: DecadeScheduler,
    history: HistoryService,
}

impl Monitor {
    /// 本番用の構成（Twitch Helix + Twitch IRC + システム時計）
    pub async fn from_config(config: AppConfig) -> ViewboiResult<Self> {
        config.validate()?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let source = Arc::new(HelixClient::new(&config.twitch, Arc::clone(&clock))?);
        let feed = Arc::new(TwitchIrcFeed::new(&config.pool, Arc::clone(&clock)));
        Ok(Self::build(config, clock, feed, source).await)
    }

    /// 外部依存を差し替えて構築する
    pub async fn build(
        config: AppConfig,
        clock: Arc<dyn Clock>,
        feed: Arc<dyn FeedClient>,
        source: Arc<dyn LiveDataSource>,
    ) -> Self {
        let roster = config.roster();
        let aggregator = Arc::new(TimeBucketAggregator::new(Arc::clone(&clock)));
        let resolver = Arc::new(
            IdentityResolver::new(
                source,
                Arc::clone(&clock),
                config.twitch.identity_ttl(),
                config.twitch.batch_size,
            )
            .with_cache_file(config.identity_cache_file())
            .await,
        );
        let store = Arc::new(JsonFileStore::new(config.data_dir()));

        let pool = Arc::new(ConnectionPool::new(
            feed,
            Arc::clone(&aggregator),
            config.pool.clone(),
        ));
        let scheduler = DecadeScheduler::new(
            Arc::clone(&aggregator),
            Arc::clone(&resolver),
            store.clone(),
            roster.clone(),
            Arc::clone(&clock),
            config.scheduler.interval(),
        );
        let history = HistoryService::new(resolver, store, roster.clone(), clock);

        tracing::info!(
            "🛠️ Monitor ready: {} channels, data in {}",
            roster.len(),
            config.data_dir().display()
        );

        Self {
            config,
            roster,
            aggregator,
            pool,
            pool_retry: Mutex::new(None),
            scheduler,
            history,
        }
    }

    /// チャット監視（有効な場合）とスケジューラを開始する
    ///
    /// チャット接続が全て失敗してもスケジューラは開始し、
    /// 接続はバックグラウンドで再試行する。
    pub async fn start(&self) -> ViewboiResult<PoolStatus> {
        let status = if self.config.checker.enabled {
            match self.pool.enable(&self.roster).await {
                Ok(status) => status,
                Err(e) => {
                    tracing::error!("❌ Chat pool unavailable, retrying in background: {}", e);
                    self.spawn_pool_retry();
                    self.pool.status()
                }
            }
        } else {
            tracing::info!("ℹ️ Chat checker disabled, only polling liveness");
            self.pool.status()
        };

        let first_fire = self.scheduler.start();
        tracing::info!("🚀 Monitor started, first tick at {}", first_fire);
        Ok(status)
    }

    /// スケジューラ、接続プールの順に停止する
    pub async fn shutdown(&self) {
        tracing::info!("🛑 Shutting down monitor");
        let retry = self.pool_retry.lock().take();
        if let Some(retry) = retry {
            let _ = retry.shutdown.send(true);
            if let Err(e) = retry.task.await {
                tracing::warn!("⚠️ Pool retry task ended abnormally: {}", e);
            }
        }
        self.scheduler.stop().await;
        self.pool.disable().await;
    }

    /// 境界を待たずに1ティック実行する
    pub async fn poll_once(&self) -> TickSummary {
        self.scheduler.run_tick_now().await
    }

    /// まだバケット化されていないチャットのチャンネル別統計
    pub fn live_chat_stats(&self) -> BTreeMap<String, LiveChatStats> {
        self.aggregator.live_stats()
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn roster(&self) -> &[String] {
        &self.roster
    }

    pub fn aggregator(&self) -> &Arc<TimeBucketAggregator> {
        &self.aggregator
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn scheduler(&self) -> &DecadeScheduler {
        &self.scheduler
    }

    pub fn history(&self) -> &HistoryService {
        &self.history
    }

    fn spawn_pool_retry(&self) {
        let mut slot = self.pool_retry.lock();
        if slot.is_some() {
            return;
        }
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(retry_enable(
            Arc::clone(&self.pool),
            self.roster.clone(),
            ReconnectPolicy::default(),
            shutdown_rx,
        ));
        *slot = Some(PoolRetry { shutdown, task });
    }
}

async fn retry_enable(
    pool: Arc<ConnectionPool>,
    roster: Vec<String>,
    policy: ReconnectPolicy,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempt = 0;
    loop {
        let delay = policy.delay(attempt);
        tracing::info!("🔄 Retrying chat pool in {:?} (attempt {})", delay, attempt + 1);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => return,
        }

        match pool.enable(&roster).await {
            Ok(status) => {
                tracing::info!(
                    "✅ Chat pool enabled after {} retries: groups={:?}",
                    attempt + 1,
                    status.channel_counts()
                );
                return;
            }
            Err(e) => {
                tracing::warn!("⚠️ Chat pool retry failed: {}", e);
                attempt = attempt.saturating_add(1);
            }
        }
    }
}
