use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::fakeip::FakeIpPool;
use crate::query::QType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CacheKey {
    qname: String,
    qtype: CacheQType,
}

/// `QType` isn't `Hash`/`Eq` (it doesn't need to be for the query path),
/// so the cache indexes on this small mirror instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum CacheQType {
    A,
}

impl CacheKey {
    fn new(qname: &str, qtype: QType) -> Option<Self> {
        match qtype {
            QType::A => Some(CacheKey {
                qname: qname.to_string(),
                qtype: CacheQType::A,
            }),
            QType::Other => None,
        }
    }
}

struct CacheEntry {
    ip: Ipv4Addr,
    expiry_at: Instant,
    pool_ref: Option<Arc<FakeIpPool>>,
}

/// Min-heap key: earliest `expiry_at` first. Stale entries (key already
/// removed or shortened by the time they're popped) are silently
/// skipped -- the heap is allowed to be a superset of what's live.
#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct HeapKey(Reverse<Instant>, String, u8);

struct CacheInner {
    by_key: HashMap<CacheKey, Vec<CacheEntry>>,
    heap: BinaryHeap<HeapKey>,
}

/// The TTL-indexed answer cache (component B).
pub struct Cache {
    inner: Mutex<CacheInner>,
}

impl Default for Cache {
    fn default() -> Self {
        Cache {
            inner: Mutex::new(CacheInner {
                by_key: HashMap::new(),
                heap: BinaryHeap::new(),
            }),
        }
    }
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    /// §4.4 `cache`: append each `(ip, ttl)`, duplicates allowed.
    pub fn cache(
        &self,
        qname: &str,
        qtype: QType,
        answer: &[(Ipv4Addr, u32)],
        pool_ref: Option<Arc<FakeIpPool>>,
    ) {
        let Some(key) = CacheKey::new(qname, qtype) else {
            return;
        };
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        let list = inner.by_key.entry(key.clone()).or_default();
        for &(ip, ttl) in answer {
            let expiry_at = now + Duration::from_secs(ttl as u64);
            list.push(CacheEntry {
                ip,
                expiry_at,
                pool_ref: pool_ref.clone(),
            });
            inner
                .heap
                .push(HeapKey(Reverse(expiry_at), key.qname.clone(), 0));
        }
    }

    /// §4.4 `get`: only non-expired entries, TTL recomputed from now.
    pub fn get(&self, qname: &str, qtype: QType) -> Vec<(Ipv4Addr, u32)> {
        let Some(key) = CacheKey::new(qname, qtype) else {
            return Vec::new();
        };
        let now = Instant::now();
        let inner = self.inner.lock().unwrap();
        let Some(list) = inner.by_key.get(&key) else {
            return Vec::new();
        };
        list.iter()
            .filter(|e| e.expiry_at > now)
            .map(|e| (e.ip, (e.expiry_at - now).as_secs() as u32))
            .collect()
    }

    /// Periodic cleanup task body (§4.4). Pops everything already due,
    /// partitions each touched key's list into live/expired, and tells
    /// any fake-IP pool behind an expired entry to release its claim.
    pub fn cleanup(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();

        let mut touched: Vec<String> = Vec::new();
        while let Some(top) = inner.heap.peek() {
            if top.0 .0 > now {
                break;
            }
            let HeapKey(_, qname, _) = inner.heap.pop().unwrap();
            touched.push(qname);
        }

        for qname in touched {
            let key = CacheKey {
                qname: qname.clone(),
                qtype: CacheQType::A,
            };
            let Some(list) = inner.by_key.get_mut(&key) else {
                continue;
            };
            let mut live = Vec::with_capacity(list.len());
            for entry in list.drain(..) {
                if entry.expiry_at > now {
                    live.push(entry);
                } else if let Some(pool) = &entry.pool_ref {
                    pool.unregister(&qname);
                }
            }
            *list = live;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn get_before_ttl_elapses_returns_remaining_ttl() {
        let cache = Cache::new();
        cache.cache("foo", QType::A, &[(Ipv4Addr::new(1, 2, 3, 4), 100)], None);
        let got = cache.get("foo", QType::A);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, Ipv4Addr::new(1, 2, 3, 4));
        assert!(got[0].1 <= 100);
    }

    #[test]
    fn get_after_ttl_elapses_returns_nothing() {
        let cache = Cache::new();
        cache.cache("foo", QType::A, &[(Ipv4Addr::new(1, 2, 3, 4), 0)], None);
        sleep(Duration::from_millis(5));
        assert!(cache.get("foo", QType::A).is_empty());
    }

    #[test]
    fn cleanup_removes_expired_and_keeps_live() {
        let cache = Cache::new();
        cache.cache("foo", QType::A, &[(Ipv4Addr::new(1, 1, 1, 1), 0)], None);
        cache.cache("foo", QType::A, &[(Ipv4Addr::new(2, 2, 2, 2), 100)], None);
        sleep(Duration::from_millis(5));
        cache.cleanup();
        let got = cache.get("foo", QType::A);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, Ipv4Addr::new(2, 2, 2, 2));
    }

    #[test]
    fn cleanup_unregisters_fake_ip_pool_on_expiry() {
        use crate::fakeip::{FakeIpPool, NullNatSink};
        use std::sync::Arc;

        let pool = Arc::new(FakeIpPool::new(
            "198.19.0.0/24".parse().unwrap(),
            Arc::new(NullNatSink),
        ));
        let fake = pool.register("foo", Ipv4Addr::new(9, 9, 9, 9)).unwrap();

        let cache = Cache::new();
        cache.cache("foo", QType::A, &[(fake, 0)], Some(pool.clone()));
        sleep(Duration::from_millis(5));
        cache.cleanup();

        // after unregister, registering a fresh domain recycles the ip
        let recycled = pool.register("bar", Ipv4Addr::new(8, 8, 8, 8)).unwrap();
        assert_eq!(fake, recycled);
    }
}
