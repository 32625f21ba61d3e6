//! Auth cache — size-bounded store of serialized passdb replies.
//!
//! Keys are materialized cache-key templates; values are the reply
//! blobs described in the cache contract: first tab-separated field is
//! the `{scheme}hash` password ("" for a NULL password, whole value ""
//! for a negative entry), the rest are extra fields, optionally a
//! trailing `nodelay`. Entries past their TTL are kept until size
//! pressure evicts them so they can serve as backend-outage fallbacks.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct CacheNode {
    value: String,
    created: Instant,
    /// position marker into the LRU queue
    seq: u64,
    /// last verify against this entry succeeded; a later mismatch
    /// invalidates the hit (password probably changed)
    last_success: bool,
}

struct CacheInner {
    map: HashMap<String, CacheNode>,
    /// LRU order as (seq, key); stale pairs are skipped on eviction
    order: VecDeque<(u64, String)>,
    seq: u64,
    bytes: usize,
}

/// Result of a cache lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHit {
    pub value: String,
    pub expired: bool,
    pub last_success: bool,
}

pub struct AuthCache {
    inner: Mutex<CacheInner>,
    max_bytes: usize,
    ttl: Duration,
    neg_ttl: Duration,
}

fn entry_size(key: &str, value: &str) -> usize {
    key.len() + value.len() + std::mem::size_of::<CacheNode>()
}

impl AuthCache {
    pub fn new(max_bytes: usize, ttl: Duration, neg_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                map: HashMap::new(),
                order: VecDeque::new(),
                seq: 0,
                bytes: 0,
            }),
            max_bytes,
            ttl,
            neg_ttl,
        }
    }

    /// Look up `key`, refreshing its LRU position. `expired` is set
    /// when the entry is past its TTL (negative TTL for negative
    /// entries); the caller decides whether an expired hit is usable.
    pub fn lookup(&self, key: &str) -> Option<CacheHit> {
        let mut inner = self.inner.lock().unwrap();
        let seq = inner.seq + 1;
        inner.seq = seq;
        let node = inner.map.get_mut(key)?;
        node.seq = seq;
        let ttl = if node.value.is_empty() {
            self.neg_ttl
        } else {
            self.ttl
        };
        let hit = CacheHit {
            value: node.value.clone(),
            expired: node.created.elapsed() >= ttl,
            last_success: node.last_success,
        };
        inner.order.push_back((seq, key.to_string()));
        Some(hit)
    }

    /// Insert or replace an entry, evicting least-recently-used
    /// entries while over the size bound.
    pub fn insert(&self, key: &str, value: &str) {
        let password_part = value.split('\t').next().unwrap_or("");
        if password_part.contains('\n') {
            panic!("cache insert for {key:?}: password contains LF");
        }

        let mut inner = self.inner.lock().unwrap();
        let seq = inner.seq + 1;
        inner.seq = seq;
        if let Some(old) = inner.map.remove(key) {
            inner.bytes -= entry_size(key, &old.value);
        }
        inner.bytes += entry_size(key, value);
        inner.map.insert(
            key.to_string(),
            CacheNode {
                value: value.to_string(),
                created: Instant::now(),
                seq,
                last_success: false,
            },
        );
        inner.order.push_back((seq, key.to_string()));

        while inner.bytes > self.max_bytes {
            let Some((seq, victim)) = inner.order.pop_front() else {
                break;
            };
            let current = inner.map.get(&victim).map(|n| n.seq);
            if current == Some(seq) {
                let node = inner.map.remove(&victim).unwrap();
                inner.bytes -= entry_size(&victim, &node.value);
            }
        }
    }

    /// Record whether the last password verify against `key` succeeded.
    pub fn set_last_success(&self, key: &str, success: bool) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(node) = inner.map.get_mut(key) {
            node.last_success = success;
        }
    }

    pub fn remove(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(node) = inner.map.remove(key) {
            inner.bytes -= entry_size(key, &node.value);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes_used(&self) -> usize {
        self.inner.lock().unwrap().bytes
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, key: &str, age: Duration) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(node) = inner.map.get_mut(key) {
            node.created = Instant::now() - age;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> AuthCache {
        AuthCache::new(64 * 1024, Duration::from_secs(60), Duration::from_secs(30))
    }

    // ─── Hits and misses ─────────────────────────────────────────────────

    #[test]
    fn miss_on_unknown_key() {
        assert_eq!(cache().lookup("nobody"), None);
    }

    #[test]
    fn insert_then_lookup_within_ttl() {
        let c = cache();
        c.insert("alice/imap", "{PLAIN}secret\tuid=1000");
        let hit = c.lookup("alice/imap").unwrap();
        assert_eq!(hit.value, "{PLAIN}secret\tuid=1000");
        assert!(!hit.expired);
    }

    #[test]
    fn repeated_insert_is_idempotent() {
        let c = cache();
        c.insert("k", "{PLAIN}pw");
        c.insert("k", "{PLAIN}pw");
        let hit = c.lookup("k").unwrap();
        assert_eq!(hit.value, "{PLAIN}pw");
        assert!(!hit.expired);
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn replacement_updates_value_and_bytes() {
        let c = cache();
        c.insert("k", "{PLAIN}one");
        let before = c.bytes_used();
        c.insert("k", "{PLAIN}a-much-longer-password-value");
        assert!(c.bytes_used() > before);
        assert_eq!(c.lookup("k").unwrap().value, "{PLAIN}a-much-longer-password-value");
    }

    // ─── TTL / expiry ────────────────────────────────────────────────────

    #[test]
    fn expired_entry_is_flagged_not_dropped() {
        let c = cache();
        c.insert("k", "{PLAIN}pw");
        c.backdate("k", Duration::from_secs(120));
        let hit = c.lookup("k").unwrap();
        assert!(hit.expired);
        assert_eq!(hit.value, "{PLAIN}pw");
    }

    #[test]
    fn negative_entries_use_negative_ttl() {
        let c = cache();
        c.insert("k", "");
        c.backdate("k", Duration::from_secs(45));
        // 45s: past neg_ttl (30s) but under positive ttl (60s)
        assert!(c.lookup("k").unwrap().expired);

        c.insert("p", "{PLAIN}pw");
        c.backdate("p", Duration::from_secs(45));
        assert!(!c.lookup("p").unwrap().expired);
    }

    // ─── last_success tracking ───────────────────────────────────────────

    #[test]
    fn last_success_round_trip() {
        let c = cache();
        c.insert("k", "{PLAIN}pw");
        assert!(!c.lookup("k").unwrap().last_success);
        c.set_last_success("k", true);
        assert!(c.lookup("k").unwrap().last_success);
        c.set_last_success("k", false);
        assert!(!c.lookup("k").unwrap().last_success);
    }

    #[test]
    fn reinsert_clears_last_success() {
        let c = cache();
        c.insert("k", "{PLAIN}pw");
        c.set_last_success("k", true);
        c.insert("k", "{PLAIN}pw2");
        assert!(!c.lookup("k").unwrap().last_success);
    }

    // ─── Eviction ────────────────────────────────────────────────────────

    #[test]
    fn lru_eviction_under_size_pressure() {
        let c = AuthCache::new(
            3 * entry_size("user0", "{PLAIN}password-0"),
            Duration::from_secs(60),
            Duration::from_secs(30),
        );
        for i in 0..3 {
            c.insert(&format!("user{i}"), &format!("{{PLAIN}}password-{i}"));
        }
        // touch user0 so user1 is the least recently used
        c.lookup("user0").unwrap();
        c.insert("user3", "{PLAIN}password-3");

        assert!(c.lookup("user0").is_some());
        assert!(c.lookup("user1").is_none());
        assert!(c.lookup("user3").is_some());
    }

    #[test]
    fn eviction_keeps_bytes_bounded() {
        let max = 4 * entry_size("key000", "{PLAIN}pw000\tuid=1000");
        let c = AuthCache::new(max, Duration::from_secs(60), Duration::from_secs(30));
        for i in 0..100 {
            c.insert(&format!("key{i:03}"), &format!("{{PLAIN}}pw{i:03}\tuid=1000"));
        }
        assert!(c.bytes_used() <= max);
        assert!(c.len() <= 4);
        // most recent entry always survives
        assert!(c.lookup("key099").is_some());
    }

    #[test]
    #[should_panic]
    fn lf_in_password_portion_aborts() {
        cache().insert("k", "{PLAIN}bad\npw\tuid=1");
    }

    #[test]
    fn remove_deletes_entry() {
        let c = cache();
        c.insert("k", "{PLAIN}pw");
        c.remove("k");
        assert!(c.lookup("k").is_none());
        assert_eq!(c.bytes_used(), 0);
    }
}
