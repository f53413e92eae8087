//! 10分境界スケジューラ
//!
//! UTCエポック基準の10分境界（xx:00, xx:10, ...）ごとに1回ティックを実行する。
//! ティックは集計ウィンドウの回収、識別情報とライブ情報の解決、マージ、永続化を行う。
//!
//! 次の発火時刻は前回の予定時刻に間隔を足して求めるため、ティックの処理時間で
//! ずれが蓄積しない。ティックが間隔を超えた場合は即座に次を実行し、
//! 飛ばした境界は積み上げない。

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::analytics::TimeBucketAggregator;
use crate::api::IdentityResolver;
use crate::clock::Clock;
use crate::io::PersistenceSink;
use crate::models::{ChannelActivity, ChannelSnapshot, LivenessRecord};

/// `now`から次の境界までの待ち時間。境界ちょうどなら1間隔分待つ。
pub fn delay_until_next_boundary(now: DateTime<Utc>, interval: Duration) -> Duration {
    let interval_ms = (interval.as_millis() as i64).max(1);
    let remainder = now.timestamp_millis().rem_euclid(interval_ms);
    Duration::from_millis((interval_ms - remainder) as u64)
}

/// `now`より後の最初の境界
pub fn next_boundary(now: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    now + to_chrono(delay_until_next_boundary(now, interval))
}

/// `now`以前の最後の境界
pub fn previous_boundary(now: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    let interval_ms = (interval.as_millis() as i64).max(1);
    now - chrono::Duration::milliseconds(now.timestamp_millis().rem_euclid(interval_ms))
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}

/// スケジューラの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, derive_more::Display)]
pub enum SchedulerState {
    Idle,
    WaitingForBoundary,
    Polling,
    Merging,
    Persisting,
    Stopped,
}

/// 1ティックの結果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    pub fired_at: DateTime<Utc>,
    /// 識別情報を解決できたチャンネル数
    pub resolved: usize,
    /// 配信中のチャンネル数
    pub live: usize,
    /// 保存できたスナップショット数
    pub persisted: usize,
    pub failed_identities: Vec<String>,
    /// ライブ情報の取得に失敗してスキップしたチャンネル
    pub skipped: Vec<String>,
    /// 保存に失敗したチャンネル
    pub persist_failures: Vec<String>,
    /// ウィンドウを集計器に戻したか
    pub requeued: bool,
}

struct TickRunner {
    aggregator: Arc<TimeBucketAggregator>,
    resolver: Arc<IdentityResolver>,
    store: Arc<dyn PersistenceSink>,
    roster: Vec<String>,
    clock: Arc<dyn Clock>,
    state: RwLock<SchedulerState>,
    tick_lock: tokio::sync::Mutex<()>,
}

impl TickRunner {
    fn set_state(&self, state: SchedulerState) {
        *self.state.write() = state;
    }

    async fn run_tick(&self) -> TickSummary {
        let _tick = self.tick_lock.lock().await;
        let fired_at = self.clock.now();
        tracing::info!("⏱️ Tick started at {}", fired_at);

        let flushed = self.aggregator.force_flush();
        let window = self.aggregator.snapshot_and_reset();
        tracing::debug!(
            "🧺 Collected window: {} channels ({} flushed at boundary)",
            window.len(),
            flushed
        );

        self.set_state(SchedulerState::Polling);
        let identities = self.resolver.resolve(&self.roster).await;
        let ids: Vec<String> = identities.records.iter().map(|r| r.id.clone()).collect();
        let liveness = self.resolver.resolve_liveness(&ids).await;

        self.set_state(SchedulerState::Merging);
        let failed_ids: HashSet<&str> = liveness.failed.iter().map(String::as_str).collect();
        let live_by_id: HashMap<&str, &LivenessRecord> = liveness
            .records
            .iter()
            .map(|record| (record.id.as_str(), record))
            .collect();

        let mut summary = TickSummary {
            fired_at,
            resolved: identities.records.len(),
            live: 0,
            persisted: 0,
            failed_identities: identities.failed.clone(),
            skipped: Vec::new(),
            persist_failures: Vec::new(),
            requeued: false,
        };

        let mut snapshots = Vec::with_capacity(identities.records.len());
        for identity in &identities.records {
            if failed_ids.contains(identity.id.as_str()) {
                tracing::warn!(channel = %identity.login, "⚠️ Liveness unavailable, skipping this tick");
                summary.skipped.push(identity.login.clone());
                continue;
            }

            let buckets = window.get(&identity.login).map_or(&[][..], Vec::as_slice);
            let live = live_by_id.get(identity.id.as_str()).copied();
            let snapshot = ChannelSnapshot::merge(live, ChannelActivity::from_buckets(buckets), fired_at);
            if snapshot.is_active {
                summary.live += 1;
            }

            tracing::debug!(
                channel = %identity.login,
                live = snapshot.is_active,
                viewers = snapshot.viewer_count,
                messages_per_minute = snapshot.messages_per_minute,
                unique_users = snapshot.unique_users,
                chatters = snapshot.chatters_percentage,
                "📈 {} {}",
                identity.display_name,
                if snapshot.is_active { "🟢" } else { "🔴" }
            );
            snapshots.push((identity.login.clone(), snapshot));
        }

        if snapshots.is_empty() && !self.roster.is_empty() {
            tracing::warn!("⚠️ No channel could be resolved, keeping chat window for the next tick");
            self.aggregator.requeue(window);
            summary.requeued = true;
            return summary;
        }

        self.set_state(SchedulerState::Persisting);
        for (login, snapshot) in snapshots {
            match self.store.append(&login, std::slice::from_ref(&snapshot)).await {
                Ok(_) => summary.persisted += 1,
                Err(e) => {
                    tracing::error!(channel = %login, "❌ Failed to persist snapshot: {}", e);
                    summary.persist_failures.push(login);
                }
            }
        }

        tracing::info!(
            "✅ Tick finished: {} resolved, {} live, {} persisted, {} failed",
            summary.resolved,
            summary.live,
            summary.persisted,
            summary.failed_identities.len() + summary.skipped.len() + summary.persist_failures.len()
        );
        summary
    }
}

struct RunningLoop {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// 10分境界で発火するスケジューラ
pub struct DecadeScheduler {
    runner: Arc<TickRunner>,
    interval: Duration,
    running: Mutex<Option<RunningLoop>>,
}

impl std::fmt::Debug for DecadeScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecadeScheduler")
            .field("interval", &self.interval)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl DecadeScheduler {
    pub fn new(
        aggregator: Arc<TimeBucketAggregator>,
        resolver: Arc<IdentityResolver>,
        store: Arc<dyn PersistenceSink>,
        roster: Vec<String>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Self {
        Self {
            runner: Arc::new(TickRunner {
                aggregator,
                resolver,
                store,
                roster,
                clock,
                state: RwLock::new(SchedulerState::Idle),
                tick_lock: tokio::sync::Mutex::new(()),
            }),
            interval,
            running: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SchedulerState {
        *self.runner.state.read()
    }

    /// タイマーを開始し、最初の発火時刻を返す
    pub fn start(&self) -> DateTime<Utc> {
        let first_fire = next_boundary(self.runner.clock.now(), self.interval);
        let mut running = self.running.lock();
        if running.is_some() {
            tracing::warn!("Scheduler already running");
            return first_fire;
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        self.runner.set_state(SchedulerState::WaitingForBoundary);
        let task = tokio::spawn(run_loop(
            Arc::clone(&self.runner),
            self.interval,
            first_fire,
            shutdown_rx,
        ));
        *running = Some(RunningLoop { shutdown, task });
        first_fire
    }

    /// タイマーを止める。実行中のティックは最後まで実行される。
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            self.runner.set_state(SchedulerState::Stopped);
            return;
        };

        let _ = running.shutdown.send(true);
        if let Err(e) = running.task.await {
            tracing::warn!("⚠️ Scheduler task ended abnormally: {}", e);
        }
        self.runner.set_state(SchedulerState::Stopped);
        tracing::info!("🛑 Scheduler stopped");
    }

    /// 境界を待たずに1ティック実行する
    pub async fn run_tick_now(&self) -> TickSummary {
        let summary = self.runner.run_tick().await;
        let resting = if self.running.lock().is_some() {
            SchedulerState::WaitingForBoundary
        } else {
            SchedulerState::Idle
        };
        self.runner.set_state(resting);
        summary
    }
}

async fn run_loop(
    runner: Arc<TickRunner>,
    interval: Duration,
    first_fire: DateTime<Utc>,
    mut shutdown: watch::Receiver<bool>,
) {
    let step = to_chrono(interval);
    let mut next_fire = first_fire;

    loop {
        runner.set_state(SchedulerState::WaitingForBoundary);
        let wait = (next_fire - runner.clock.now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        tracing::info!("⏰ Next tick at {} (in {} seconds)", next_fire, wait.as_secs());

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown.changed() => return,
        }

        runner.run_tick().await;
        if *shutdown.borrow() {
            return;
        }

        next_fire += step;
        let now = runner.clock.now();
        if now >= next_fire {
            let skipped = (now - next_fire).num_milliseconds() / step.num_milliseconds().max(1);
            tracing::warn!(
                "⚠️ Tick overran its interval, firing immediately ({} boundaries skipped)",
                skipped
            );
            next_fire = previous_boundary(now, interval);
        }
    }
}
