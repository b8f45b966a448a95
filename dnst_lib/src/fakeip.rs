use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, RwLock};

use ipnet::Ipv4Net;

/// The external kernel-NAT integration (component D). Concrete
/// implementations live in the binary crate and shell out to something
/// like `nft`; tests inject a `mockall`-generated mock instead.
#[cfg_attr(test, mockall::automock)]
pub trait NatSink: Send + Sync {
    fn add(&self, fake: Ipv4Addr, real: Ipv4Addr);
    fn delete(&self, fake: Ipv4Addr);
    fn flush(&self);
}

/// A NAT sink that does nothing, for tests and for running without root
/// privileges to touch the firewall.
#[derive(Debug, Default)]
pub struct NullNatSink;

impl NatSink for NullNatSink {
    fn add(&self, _fake: Ipv4Addr, _real: Ipv4Addr) {}
    fn delete(&self, _fake: Ipv4Addr) {}
    fn flush(&self) {}
}

/// One synthetic address, bijective with exactly one real IP while live.
#[derive(Debug, Clone)]
struct FakeIp {
    fake_ip: Ipv4Addr,
    real_ip: Ipv4Addr,
    domains: HashSet<String>,
}

impl FakeIp {
    fn is_free(&self) -> bool {
        self.domains.is_empty()
    }
}

struct PoolInner {
    recycled: Vec<Ipv4Addr>,
    /// Lazily-consumed remaining host addresses, skipping `.0`/`.255`
    /// last octets. Kept as an iterator-like cursor rather than a
    /// materialized `Vec` so pools over large CIDRs stay cheap.
    next_host: Box<dyn Iterator<Item = Ipv4Addr> + Send>,
    by_domain: HashMap<String, Ipv4Addr>,
    by_real: HashMap<Ipv4Addr, Ipv4Addr>,
    entries: HashMap<Ipv4Addr, FakeIp>,
}

/// One allocator per CIDR (component C). `register`/`unregister` are the
/// only mutating entry points and both take the single internal lock for
/// a short, non-suspending critical section.
pub struct FakeIpPool {
    pub network: Ipv4Net,
    nat: Arc<dyn NatSink>,
    inner: Mutex<PoolInner>,
}

fn host_generator(network: Ipv4Net) -> Box<dyn Iterator<Item = Ipv4Addr> + Send> {
    Box::new(network.hosts().filter(|ip| {
        let last = ip.octets()[3];
        last != 0 && last != 255
    }))
}

impl FakeIpPool {
    pub fn new(network: Ipv4Net, nat: Arc<dyn NatSink>) -> Self {
        FakeIpPool {
            network,
            nat,
            inner: Mutex::new(PoolInner {
                recycled: Vec::new(),
                next_host: host_generator(network),
                by_domain: HashMap::new(),
                by_real: HashMap::new(),
                entries: HashMap::new(),
            }),
        }
    }

    /// §4.5 `register`: idempotent per `(domain, real_ip)`, with LIFO
    /// reuse of recycled fake IPs.
    pub fn register(&self, domain: &str, real_ip: Ipv4Addr) -> Option<Ipv4Addr> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(&fake_ip) = inner.by_domain.get(domain) {
            let existing_real = inner.entries.get(&fake_ip).map(|e| e.real_ip);
            if existing_real == Some(real_ip) {
                return Some(fake_ip);
            }
            // stale mapping for a changed A record: release and retry.
            Self::unregister_locked(&mut inner, &self.nat, domain);
        }

        if let Some(&fake_ip) = inner.by_real.get(&real_ip) {
            inner.by_domain.insert(domain.to_string(), fake_ip);
            if let Some(entry) = inner.entries.get_mut(&fake_ip) {
                entry.domains.insert(domain.to_string());
            }
            return Some(fake_ip);
        }

        let fake_ip = if let Some(ip) = inner.recycled.pop() {
            ip
        } else {
            inner.next_host.next()?
        };

        let entry = FakeIp {
            fake_ip,
            real_ip,
            domains: HashSet::from([domain.to_string()]),
        };
        inner.by_domain.insert(domain.to_string(), fake_ip);
        inner.by_real.insert(real_ip, fake_ip);
        inner.entries.insert(fake_ip, entry);
        self.nat.add(fake_ip, real_ip);
        Some(fake_ip)
    }

    /// §4.5 `unregister`.
    pub fn unregister(&self, domain: &str) {
        let mut inner = self.inner.lock().unwrap();
        Self::unregister_locked(&mut inner, &self.nat, domain);
    }

    fn unregister_locked(inner: &mut PoolInner, nat: &Arc<dyn NatSink>, domain: &str) {
        let Some(fake_ip) = inner.by_domain.remove(domain) else {
            return;
        };
        let free_now = if let Some(entry) = inner.entries.get_mut(&fake_ip) {
            entry.domains.remove(domain);
            entry.is_free()
        } else {
            false
        };
        if free_now {
            if let Some(entry) = inner.entries.remove(&fake_ip) {
                inner.by_real.remove(&entry.real_ip);
            }
            nat.delete(fake_ip);
            inner.recycled.push(fake_ip);
        }
    }

    #[cfg(test)]
    fn domain_real_ip(&self, domain: &str) -> Option<Ipv4Addr> {
        let inner = self.inner.lock().unwrap();
        let fake_ip = *inner.by_domain.get(domain)?;
        inner.entries.get(&fake_ip).map(|e| e.real_ip)
    }
}

/// Pool-of-pools keyed by CIDR, so repeated `fakeip N` actions across
/// rules share a single `FakeIpPool` per CIDR the way the distilled
/// source's module-level `fake_ip_pools` dict does.
#[derive(Default)]
pub struct FakeIpRegistry {
    pools: RwLock<HashMap<Ipv4Net, Arc<FakeIpPool>>>,
}

impl FakeIpRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pool_for(&self, network: Ipv4Net, nat: &Arc<dyn NatSink>) -> Arc<FakeIpPool> {
        if let Some(pool) = self.pools.read().unwrap().get(&network) {
            return pool.clone();
        }
        let mut pools = self.pools.write().unwrap();
        pools
            .entry(network)
            .or_insert_with(|| Arc::new(FakeIpPool::new(network, nat.clone())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net() -> Ipv4Net {
        "198.19.0.0/29".parse().unwrap()
    }

    #[test]
    fn register_is_idempotent_for_same_domain_and_real_ip() {
        let pool = FakeIpPool::new(net(), Arc::new(NullNatSink));
        let a = pool.register("foo.com", Ipv4Addr::new(203, 0, 113, 5)).unwrap();
        let b = pool.register("foo.com", Ipv4Addr::new(203, 0, 113, 5)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn register_skips_broadcast_and_network_octets() {
        let pool = FakeIpPool::new(net(), Arc::new(NullNatSink));
        for i in 0..4 {
            let ip = pool
                .register(&format!("d{i}.com"), Ipv4Addr::new(10, 0, 0, i))
                .unwrap();
            let last = ip.octets()[3];
            assert_ne!(last, 0);
            assert_ne!(last, 255);
        }
    }

    #[test]
    fn changed_real_ip_reassigns_fake_ip_mapping() {
        let pool = FakeIpPool::new(net(), Arc::new(NullNatSink));
        pool.register("foo.com", Ipv4Addr::new(1, 1, 1, 1)).unwrap();
        pool.register("foo.com", Ipv4Addr::new(2, 2, 2, 2)).unwrap();
        assert_eq!(
            pool.domain_real_ip("foo.com"),
            Some(Ipv4Addr::new(2, 2, 2, 2))
        );
    }

    #[test]
    fn unregister_recycles_fake_ip_lifo() {
        let pool = FakeIpPool::new(net(), Arc::new(NullNatSink));
        let fip = pool.register("foo.com", Ipv4Addr::new(1, 1, 1, 1)).unwrap();
        pool.unregister("foo.com");
        let next = pool.register("bar.com", Ipv4Addr::new(2, 2, 2, 2)).unwrap();
        assert_eq!(fip, next);
    }

    #[test]
    fn shared_real_ip_across_domains_reuses_fake_ip() {
        let pool = FakeIpPool::new(net(), Arc::new(NullNatSink));
        let a = pool.register("a.com", Ipv4Addr::new(9, 9, 9, 9)).unwrap();
        let b = pool.register("b.com", Ipv4Addr::new(9, 9, 9, 9)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn pool_exhaustion_returns_none() {
        // /30 network has exactly 2 usable host addresses, neither of
        // which ends in .0/.255 by construction of this particular net.
        let tiny: Ipv4Net = "10.0.0.0/30".parse().unwrap();
        let pool = FakeIpPool::new(tiny, Arc::new(NullNatSink));
        let mut allocated = 0;
        for i in 0..8u8 {
            if pool
                .register(&format!("d{i}.com"), Ipv4Addr::new(10, 0, 0, 100 + i))
                .is_some()
            {
                allocated += 1;
            }
        }
        assert!(allocated <= 2);
    }

    #[test]
    fn nat_sink_receives_add_and_delete() {
        let mut mock = MockNatSink::new();
        mock.expect_add()
            .withf(|f: &Ipv4Addr, r: &Ipv4Addr| *r == Ipv4Addr::new(203, 0, 113, 5) && !f.is_unspecified())
            .times(1)
            .return_const(());
        mock.expect_delete().times(1).return_const(());

        let pool = FakeIpPool::new(net(), Arc::new(mock));
        pool.register("foo.com", Ipv4Addr::new(203, 0, 113, 5));
        pool.unregister("foo.com");
    }

    #[test]
    fn registry_shares_one_pool_per_cidr() {
        let registry = FakeIpRegistry::new();
        let nat: Arc<dyn NatSink> = Arc::new(NullNatSink);
        let p1 = registry.pool_for(net(), &nat);
        let p2 = registry.pool_for(net(), &nat);
        assert!(Arc::ptr_eq(&p1, &p2));
    }
}
