//! TTL付きのシンプルなメモリキャッシュ

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use crate::clock::Clock;

/// エントリの経過時間が`ttl`を超えていれば期限切れ
pub fn is_expired(inserted_at: DateTime<Utc>, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
    now.signed_duration_since(inserted_at) > ttl
}

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    inserted_at: DateTime<Utc>,
}

/// 読み取り側のユースケース用キャッシュ（履歴・統計）
#[derive(Debug)]
pub struct TtlCache<K, V> {
    ttl: chrono::Duration,
    clock: Arc<dyn Clock>,
    entries: RwLock<HashMap<K, Entry<V>>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new(ttl: chrono::Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// 有効なエントリのみ返す
    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        self.entries
            .read()
            .get(key)
            .filter(|entry| !is_expired(entry.inserted_at, now, self.ttl))
            .map(|entry| entry.value.clone())
    }

    pub fn insert(&self, key: K, value: V) {
        let inserted_at = self.clock.now();
        self.entries
            .write()
            .insert(key, Entry { value, inserted_at });
    }

    pub fn invalidate_all(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    #[test]
    fn test_entry_expires_after_ttl() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 9, 7, 0, 0, 0).unwrap(),
        ));
        let cache: TtlCache<String, u32> = TtlCache::new(chrono::Duration::hours(24), clock.clone());

        cache.insert("streams".to_string(), 42);
        clock.advance(chrono::Duration::hours(24));
        assert_eq!(cache.get(&"streams".to_string()), Some(42));

        clock.advance(chrono::Duration::seconds(1));
        assert_eq!(cache.get(&"streams".to_string()), None);
    }

    #[test]
    fn test_invalidate_all() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache: TtlCache<u8, u8> = TtlCache::new(chrono::Duration::minutes(1), clock);
        cache.insert(1, 1);
        assert!(!cache.is_empty());
        cache.invalidate_all();
        assert!(cache.is_empty());
    }
}
