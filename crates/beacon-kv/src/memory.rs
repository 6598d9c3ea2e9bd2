// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory [`Kv`] with TTLs evaluated against an injected clock.

use crate::{Kv, KvError};
use async_trait::async_trait;
use beacon_core::{Clock, SystemClock};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Inner {
    strings: HashMap<String, Entry>,
    lists: HashMap<String, VecDeque<String>>,
    zsets: HashMap<String, Vec<(f64, String)>>,
}

/// In-memory KV store. Clones share storage.
#[derive(Clone)]
pub struct MemoryKv {
    inner: Arc<Mutex<Inner>>,
    clock: Arc<dyn Clock>,
    /// When set, every operation fails with `Unavailable`. Lets tests drive
    /// outage paths.
    down: Arc<Mutex<bool>>,
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MemoryKv {
    /// Create a store that evaluates TTLs against `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            clock,
            down: Arc::new(Mutex::new(false)),
        }
    }

    /// Simulate an outage (`true`) or recovery (`false`).
    pub fn set_down(&self, down: bool) {
        *self.down.lock().expect("kv lock poisoned") = down;
    }

    fn check_up(&self) -> Result<(), KvError> {
        if *self.down.lock().expect("kv lock poisoned") {
            return Err(KvError::Unavailable("memory kv marked down".into()));
        }
        Ok(())
    }

    fn live_entry<'a>(
        strings: &'a mut HashMap<String, Entry>,
        key: &str,
        now: DateTime<Utc>,
    ) -> Option<&'a Entry> {
        let expired = strings
            .get(key)
            .is_some_and(|e| e.expires_at.is_some_and(|at| at <= now));
        if expired {
            strings.remove(key);
        }
        strings.get(key)
    }

    fn ttl_instant(&self, ttl: Duration) -> DateTime<Utc> {
        self.clock.now() + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero())
    }
}

#[async_trait]
impl Kv for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        self.check_up()?;
        let now = self.clock.now();
        let mut inner = self.inner.lock().expect("kv lock poisoned");
        Ok(Self::live_entry(&mut inner.strings, key, now).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        self.check_up()?;
        let mut inner = self.inner.lock().expect("kv lock poisoned");
        inner.strings.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError> {
        self.check_up()?;
        let expires_at = Some(self.ttl_instant(ttl));
        let mut inner = self.inner.lock().expect("kv lock poisoned");
        inner.strings.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn set_nx_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        self.check_up()?;
        let now = self.clock.now();
        let expires_at = Some(self.ttl_instant(ttl));
        let mut inner = self.inner.lock().expect("kv lock poisoned");
        if Self::live_entry(&mut inner.strings, key, now).is_some() {
            return Ok(false);
        }
        inner.strings.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(true)
    }

    async fn incr_ttl(&self, key: &str, ttl: Duration) -> Result<i64, KvError> {
        self.check_up()?;
        let now = self.clock.now();
        let expires_at = Some(self.ttl_instant(ttl));
        let mut inner = self.inner.lock().expect("kv lock poisoned");
        let next = match Self::live_entry(&mut inner.strings, key, now) {
            Some(e) => e.value.parse::<i64>().unwrap_or(0) + 1,
            None => 1,
        };
        let keep_expiry = inner.strings.get(key).and_then(|e| e.expires_at);
        inner.strings.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                // First increment starts the window; later ones keep it.
                expires_at: if next == 1 { expires_at } else { keep_expiry },
            },
        );
        Ok(next)
    }

    async fn del(&self, key: &str) -> Result<bool, KvError> {
        self.check_up()?;
        let mut inner = self.inner.lock().expect("kv lock poisoned");
        let existed = inner.strings.remove(key).is_some()
            | inner.lists.remove(key).is_some()
            | inner.zsets.remove(key).is_some();
        Ok(existed)
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<(), KvError> {
        self.check_up()?;
        let mut inner = self.inner.lock().expect("kv lock poisoned");
        inner
            .lists
            .entry(key.to_string())
            .or_default()
            .push_front(value.to_string());
        Ok(())
    }

    async fn rpop(&self, key: &str) -> Result<Option<String>, KvError> {
        self.check_up()?;
        let mut inner = self.inner.lock().expect("kv lock poisoned");
        Ok(inner.lists.get_mut(key).and_then(|l| l.pop_back()))
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, KvError> {
        self.check_up()?;
        let inner = self.inner.lock().expect("kv lock poisoned");
        let Some(list) = inner.lists.get(key) else {
            return Ok(vec![]);
        };
        let len = list.len() as i64;
        if len == 0 {
            return Ok(vec![]);
        }
        let from = if start < 0 { (len + start).max(0) } else { start };
        let to = if stop < 0 { len + stop } else { stop.min(len - 1) };
        if from >= len || from > to || to < 0 {
            return Ok(vec![]);
        }
        Ok(list
            .iter()
            .skip(from as usize)
            .take((to - from + 1) as usize)
            .cloned()
            .collect())
    }

    async fn llen(&self, key: &str) -> Result<usize, KvError> {
        self.check_up()?;
        let inner = self.inner.lock().expect("kv lock poisoned");
        Ok(inner.lists.get(key).map_or(0, VecDeque::len))
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), KvError> {
        self.check_up()?;
        let mut inner = self.inner.lock().expect("kv lock poisoned");
        let set = inner.zsets.entry(key.to_string()).or_default();
        set.retain(|(_, m)| m != member);
        set.push((score, member.to_string()));
        set.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        Ok(())
    }

    async fn zrangebyscore(
        &self,
        key: &str,
        max: f64,
        limit: usize,
    ) -> Result<Vec<String>, KvError> {
        self.check_up()?;
        let inner = self.inner.lock().expect("kv lock poisoned");
        Ok(inner
            .zsets
            .get(key)
            .map(|set| {
                set.iter()
                    .filter(|(score, _)| *score <= max)
                    .take(limit)
                    .map(|(_, m)| m.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, KvError> {
        self.check_up()?;
        let mut inner = self.inner.lock().expect("kv lock poisoned");
        let Some(set) = inner.zsets.get_mut(key) else {
            return Ok(false);
        };
        let before = set.len();
        set.retain(|(_, m)| m != member);
        Ok(set.len() < before)
    }

    async fn zcard(&self, key: &str) -> Result<usize, KvError> {
        self.check_up()?;
        let inner = self.inner.lock().expect("kv lock poisoned");
        Ok(inner.zsets.get(key).map_or(0, Vec::len))
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        self.check_up()?;
        let now = self.clock.now();
        let mut inner = self.inner.lock().expect("kv lock poisoned");
        // Sweep expired string keys so claim scans observe TTL expiry.
        let expired: Vec<String> = inner
            .strings
            .iter()
            .filter(|(_, e)| e.expires_at.is_some_and(|at| at <= now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            inner.strings.remove(&key);
        }
        let mut keys: Vec<String> = inner
            .strings
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::ManualClock;
    use chrono::TimeZone as _;

    fn manual() -> (MemoryKv, ManualClock) {
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let clock = ManualClock::at(start);
        (MemoryKv::new(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn ttl_expires_with_virtual_time() {
        let (kv, clock) = manual();
        kv.set_ttl("k", "v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v"));
        clock.advance(chrono::Duration::seconds(61));
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_nx_is_first_writer_wins_until_expiry() {
        let (kv, clock) = manual();
        assert!(kv.set_nx_ttl("n", "a", Duration::from_secs(30)).await.unwrap());
        assert!(!kv.set_nx_ttl("n", "b", Duration::from_secs(30)).await.unwrap());
        assert_eq!(kv.get("n").await.unwrap().as_deref(), Some("a"));
        clock.advance(chrono::Duration::seconds(31));
        assert!(kv.set_nx_ttl("n", "b", Duration::from_secs(30)).await.unwrap());
    }

    #[tokio::test]
    async fn incr_ttl_counts_within_window() {
        let (kv, clock) = manual();
        assert_eq!(kv.incr_ttl("c", Duration::from_secs(60)).await.unwrap(), 1);
        assert_eq!(kv.incr_ttl("c", Duration::from_secs(60)).await.unwrap(), 2);
        clock.advance(chrono::Duration::seconds(30));
        // Window is anchored to the first increment.
        assert_eq!(kv.incr_ttl("c", Duration::from_secs(60)).await.unwrap(), 3);
        clock.advance(chrono::Duration::seconds(31));
        assert_eq!(kv.incr_ttl("c", Duration::from_secs(60)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn list_fifo_through_lpush_rpop() {
        let (kv, _) = manual();
        kv.lpush("q", "first").await.unwrap();
        kv.lpush("q", "second").await.unwrap();
        assert_eq!(kv.llen("q").await.unwrap(), 2);
        assert_eq!(kv.rpop("q").await.unwrap().as_deref(), Some("first"));
        assert_eq!(kv.rpop("q").await.unwrap().as_deref(), Some("second"));
        assert_eq!(kv.rpop("q").await.unwrap(), None);
    }

    #[tokio::test]
    async fn lrange_supports_negative_indexes() {
        let (kv, _) = manual();
        for v in ["c", "b", "a"] {
            kv.lpush("l", v).await.unwrap();
        }
        assert_eq!(kv.lrange("l", 0, -1).await.unwrap(), vec!["a", "b", "c"]);
        assert_eq!(kv.lrange("l", 1, 1).await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn zset_orders_by_score_and_filters_by_max() {
        let (kv, _) = manual();
        kv.zadd("z", 30.0, "late").await.unwrap();
        kv.zadd("z", 10.0, "early").await.unwrap();
        kv.zadd("z", 20.0, "mid").await.unwrap();
        assert_eq!(
            kv.zrangebyscore("z", 20.0, 10).await.unwrap(),
            vec!["early", "mid"]
        );
        assert!(kv.zrem("z", "early").await.unwrap());
        assert_eq!(kv.zcard("z").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn scan_prefix_drops_expired_claims() {
        let (kv, clock) = manual();
        kv.set_ttl("claim:a", "1", Duration::from_secs(10)).await.unwrap();
        kv.set("claim:b", "2").await.unwrap();
        kv.set("other", "3").await.unwrap();
        assert_eq!(
            kv.scan_prefix("claim:").await.unwrap(),
            vec!["claim:a", "claim:b"]
        );
        clock.advance(chrono::Duration::seconds(11));
        assert_eq!(kv.scan_prefix("claim:").await.unwrap(), vec!["claim:b"]);
    }

    #[tokio::test]
    async fn outage_mode_fails_everything() {
        let (kv, _) = manual();
        kv.set_down(true);
        assert!(matches!(
            kv.get("k").await,
            Err(KvError::Unavailable(_))
        ));
        kv.set_down(false);
        assert!(kv.get("k").await.is_ok());
    }
}
