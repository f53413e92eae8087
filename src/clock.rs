//! 壁時計の抽象化
//!
//! スケジューラ・集計・キャッシュは`Clock`経由で現在時刻を取得するため、
//! テストでは実時間を待たずに時刻を進められる。

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fmt::Debug;

/// 現在時刻の供給元
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// システム時計
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// 手動で進める時計（テスト用）
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// tokioの時計に追従する壁時計
///
/// `tokio::time::pause()`下では仮想時間と一緒に進むので、
/// スケジューラの境界計算を決定的に検証できる。
#[derive(Debug)]
pub struct TokioClock {
    wall_origin: DateTime<Utc>,
    origin: tokio::time::Instant,
}

impl TokioClock {
    pub fn starting_at(wall_origin: DateTime<Utc>) -> Self {
        Self {
            wall_origin,
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = tokio::time::Instant::now().duration_since(self.origin);
        self.wall_origin + chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    #[test]
    fn test_manual_clock_advance() {
        let start = Utc.with_ymd_and_hms(2025, 9, 7, 14, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        clock.advance(chrono::Duration::seconds(90));
        assert_eq!(clock.now(), start + chrono::Duration::seconds(90));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_follows_paused_time() {
        let start = Utc.with_ymd_and_hms(2025, 9, 7, 14, 0, 0).unwrap();
        let clock = TokioClock::starting_at(start);

        tokio::time::sleep(Duration::from_secs(600)).await;

        assert_eq!(clock.now(), start + chrono::Duration::minutes(10));
    }
}
