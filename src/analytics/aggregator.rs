//! チャットメッセージの時間バケット集計
//!
//! 受信メッセージを一時ログに貯め、最古のメッセージから1分経過した時点で
//! チャンネルごとの`MinuteBucket`に畳み込む。バケットは10分ウィンドウの
//! アキュムレータに積まれ、スケジューラが`snapshot_and_reset`で回収する。
//!
//! 一時ログとアキュムレータは単一のロックで保護されるため、
//! 取り込み・フラッシュ・スナップショットはそれぞれ不可分に実行される。

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crate::clock::Clock;
use crate::models::{MessageEvent, MinuteBucket};

/// バケット幅（秒）
pub const BUCKET_WIDTH_SECS: i64 = 60;

/// チャンネル → クローズ済みバケット列
pub type TenMinuteWindow = HashMap<String, Vec<MinuteBucket>>;

/// 未集計ログに対するライブ統計
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LiveChatStats {
    pub total_messages: u32,
    pub unique_users: u32,
    pub last_message_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct AggregatorState {
    pending: Vec<MessageEvent>,
    accumulators: TenMinuteWindow,
}

impl AggregatorState {
    /// 一時ログをチャンネル別に集計してバケットを閉じる
    fn close_minute(&mut self, now: DateTime<Utc>) -> usize {
        let Some(started_at) = self.pending.first().map(|event| event.timestamp) else {
            return 0;
        };

        let mut grouped: BTreeMap<String, (u32, HashSet<String>)> = BTreeMap::new();
        for event in self.pending.drain(..) {
            let entry = grouped.entry(event.channel).or_default();
            entry.0 += 1;
            entry.1.insert(event.user);
        }

        let closed = grouped.len();
        for (channel, (message_count, users)) in grouped {
            let bucket = MinuteBucket {
                message_count,
                unique_users: users.len() as u32,
                started_at,
                ended_at: now,
            };

            tracing::debug!(
                channel = %channel,
                messages = bucket.message_count,
                unique_users = bucket.unique_users,
                "⏱️ Minute bucket closed"
            );

            self.accumulators.entry(channel).or_default().push(bucket);
        }

        closed
    }
}

/// 1分/10分の時間バケット集計器
#[derive(Debug)]
pub struct TimeBucketAggregator {
    clock: Arc<dyn Clock>,
    bucket_width: chrono::Duration,
    state: Mutex<AggregatorState>,
}

impl TimeBucketAggregator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            bucket_width: chrono::Duration::seconds(BUCKET_WIDTH_SECS),
            state: Mutex::new(AggregatorState::default()),
        }
    }

    /// メッセージを取り込み、最古の未集計メッセージが1分以上前ならバケットを閉じる
    pub fn ingest(&self, event: MessageEvent) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.pending.push(event);

        let anchor = state.pending[0].timestamp;
        if now.signed_duration_since(anchor) >= self.bucket_width {
            state.close_minute(now);
        }
    }

    /// 経過時間に関係なく現在の一時ログをバケット化する
    ///
    /// 閉じたバケット数（チャンネル数）を返す。
    pub fn force_flush(&self) -> usize {
        let now = self.clock.now();
        self.state.lock().close_minute(now)
    }

    /// 10分ウィンドウの内容を取り出し、アキュムレータを空にする
    pub fn snapshot_and_reset(&self) -> TenMinuteWindow {
        std::mem::take(&mut self.state.lock().accumulators)
    }

    /// 破棄されたウィンドウを現在のアキュムレータの前に戻す
    pub fn requeue(&self, window: TenMinuteWindow) {
        let mut state = self.state.lock();
        for (channel, mut buckets) in window {
            let current = state.accumulators.entry(channel).or_default();
            buckets.append(current);
            *current = buckets;
        }
    }

    /// まだバケット化されていないメッセージのチャンネル別統計
    pub fn live_stats(&self) -> BTreeMap<String, LiveChatStats> {
        let state = self.state.lock();
        let mut users: HashMap<&str, HashSet<&str>> = HashMap::new();
        let mut stats: BTreeMap<String, LiveChatStats> = BTreeMap::new();

        for event in &state.pending {
            users
                .entry(event.channel.as_str())
                .or_default()
                .insert(event.user.as_str());

            let entry = stats
                .entry(event.channel.clone())
                .or_insert_with(|| LiveChatStats {
                    total_messages: 0,
                    unique_users: 0,
                    last_message_at: event.timestamp,
                });
            entry.total_messages += 1;
            entry.last_message_at = event.timestamp;
        }

        for (channel, entry) in stats.iter_mut() {
            entry.unique_users = users.get(channel.as_str()).map_or(0, |u| u.len() as u32);
        }

        stats
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }
}
