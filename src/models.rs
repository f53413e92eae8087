//! パイプライン全体で共有するデータモデル

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// チャンネル名を正規化（先頭の`#`を除去して小文字化）
pub fn normalize_login(raw: &str) -> String {
    raw.trim().trim_start_matches('#').to_ascii_lowercase()
}

/// チャットフィードから受信した1件のメッセージ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEvent {
    pub channel: String,
    pub user: String,
    pub timestamp: DateTime<Utc>,
}

impl MessageEvent {
    pub fn new(channel: &str, user: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            channel: normalize_login(channel),
            user: user.to_ascii_lowercase(),
            timestamp,
        }
    }
}

/// 1分間バケットの集計結果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinuteBucket {
    pub message_count: u32,
    pub unique_users: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

/// 10分ウィンドウのチャット活動（バケットの平均値）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelActivity {
    pub messages_per_minute: u32,
    pub unique_users: u32,
}

impl ChannelActivity {
    /// バケット列から平均を計算する。バケットが無ければゼロ扱い。
    ///
    /// ユニークユーザー数は分単位の値の平均であり、10分間の真のユニーク数ではない。
    pub fn from_buckets(buckets: &[MinuteBucket]) -> Self {
        if buckets.is_empty() {
            return Self::default();
        }

        let count = buckets.len() as f64;
        let messages: u64 = buckets.iter().map(|b| u64::from(b.message_count)).sum();
        let users: u64 = buckets.iter().map(|b| u64::from(b.unique_users)).sum();

        Self {
            messages_per_minute: (messages as f64 / count).round() as u32,
            unique_users: (users as f64 / count).round() as u32,
        }
    }
}

/// チャンネルの識別情報（24時間キャッシュ対象）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub id: String,
    pub login: String,
    pub display_name: String,
    pub avatar_url: String,
    pub cached_at: DateTime<Utc>,
}

/// 配信中チャンネルのライブ情報（キャッシュしない）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivenessRecord {
    pub id: String,
    pub login: String,
    pub viewer_count: u64,
    pub title: String,
    pub game_name: String,
}

/// 10分ごとに永続化されるチャンネルのスナップショット
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub game_name: String,
    #[serde(default)]
    pub viewer_count: u64,
    #[serde(default, alias = "messagesPerMinute")]
    pub messages_per_minute: u32,
    #[serde(default, alias = "uniqueUsers")]
    pub unique_users: u32,
    #[serde(default, alias = "chattersPercentage")]
    pub chatters_percentage: f64,
    #[serde(default)]
    pub is_active: bool,
    pub timestamp: DateTime<Utc>,
}

impl ChannelSnapshot {
    /// ライブ情報とチャット活動をマージしてスナップショットを作成
    pub fn merge(
        liveness: Option<&LivenessRecord>,
        activity: ChannelActivity,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let viewer_count = liveness.map(|l| l.viewer_count).unwrap_or(0);

        Self {
            title: liveness.map(|l| l.title.clone()).unwrap_or_default(),
            game_name: liveness.map(|l| l.game_name.clone()).unwrap_or_default(),
            viewer_count,
            messages_per_minute: activity.messages_per_minute,
            unique_users: activity.unique_users,
            chatters_percentage: chatters_percentage(activity.unique_users, viewer_count),
            is_active: liveness.is_some(),
            timestamp,
        }
    }
}

/// 視聴者に対するチャット参加者の割合（小数点以下2桁）
pub fn chatters_percentage(unique_users: u32, viewer_count: u64) -> f64 {
    if viewer_count == 0 {
        return 0.0;
    }
    round2(f64::from(unique_users) * 100.0 / viewer_count as f64)
}

/// 小数点以下2桁に丸める
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn bucket(messages: u32, users: u32) -> MinuteBucket {
        MinuteBucket {
            message_count: messages,
            unique_users: users,
            started_at: ts(0),
            ended_at: ts(60),
        }
    }

    #[test]
    fn test_normalize_login() {
        assert_eq!(normalize_login("#ForSen"), "forsen");
        assert_eq!(normalize_login("  xqc "), "xqc");
    }

    #[test]
    fn test_chatters_percentage_two_decimals() {
        assert_eq!(chatters_percentage(5, 1000), 0.5);
        assert_eq!(chatters_percentage(1, 3), 33.33);
        assert_eq!(chatters_percentage(2, 3), 66.67);
        assert_eq!(chatters_percentage(10, 0), 0.0);
    }

    #[test]
    fn test_activity_from_buckets_rounds_average() {
        let activity = ChannelActivity::from_buckets(&[bucket(10, 3), bucket(15, 4)]);
        assert_eq!(activity.messages_per_minute, 13); // 12.5 → 13
        assert_eq!(activity.unique_users, 4); // 3.5 → 4
    }

    #[test]
    fn test_activity_without_buckets_is_zero() {
        assert_eq!(ChannelActivity::from_buckets(&[]), ChannelActivity::default());
    }

    #[test]
    fn test_merge_offline_channel() {
        let snapshot = ChannelSnapshot::merge(
            None,
            ChannelActivity {
                messages_per_minute: 4,
                unique_users: 2,
            },
            ts(0),
        );
        assert!(!snapshot.is_active);
        assert_eq!(snapshot.viewer_count, 0);
        assert_eq!(snapshot.title, "");
        assert_eq!(snapshot.game_name, "");
        assert_eq!(snapshot.chatters_percentage, 0.0);
        assert_eq!(snapshot.messages_per_minute, 4);
    }

    #[test]
    fn test_merge_live_channel() {
        let live = LivenessRecord {
            id: "1".to_string(),
            login: "forsen".to_string(),
            viewer_count: 1000,
            title: "title".to_string(),
            game_name: "Minecraft".to_string(),
        };
        let snapshot = ChannelSnapshot::merge(
            Some(&live),
            ChannelActivity {
                messages_per_minute: 30,
                unique_users: 5,
            },
            ts(0),
        );
        assert!(snapshot.is_active);
        assert_eq!(snapshot.chatters_percentage, 0.5);
        assert_eq!(snapshot.game_name, "Minecraft");
    }

    #[test]
    fn test_snapshot_accepts_camel_case_fields() {
        let json = r#"{
            "title": "",
            "game_name": "",
            "viewer_count": 0,
            "messagesPerMinute": 7,
            "uniqueUsers": 3,
            "chattersPercentage": 0,
            "is_active": false,
            "timestamp": "2025-09-07T14:10:00.000Z"
        }"#;
        let snapshot: ChannelSnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(snapshot.messages_per_minute, 7);
        assert_eq!(snapshot.unique_users, 3);
    }

    #[test]
    fn test_snapshot_serializes_snake_case() {
        let snapshot = ChannelSnapshot::merge(None, ChannelActivity::default(), ts(0));
        let value = serde_json::to_value(&snapshot).unwrap();
        assert!(value.get("messages_per_minute").is_some());
        assert!(value.get("chatters_percentage").is_some());
    }
}
