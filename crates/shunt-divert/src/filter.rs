//! Destination-IP and owning-process filter predicates.
//!
//! Both filters are populated at startup and read concurrently by the
//! classifier afterwards.

use std::collections::HashSet;
use std::net::IpAddr;

use ipnet::IpNet;
use parking_lot::RwLock;

#[derive(Default)]
struct IpFilterInner {
    nets: Vec<IpNet>,
    exact: HashSet<IpAddr>,
}

/// Set of destination addresses that force a divert verdict.
#[derive(Default)]
pub struct IpFilter {
    inner: RwLock<IpFilterInner>,
}

impl IpFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a CIDR network.
    pub fn add(&self, net: IpNet) {
        self.inner.write().nets.push(net);
    }

    /// Adds a single address.
    pub fn add_addr(&self, ip: IpAddr) {
        self.inner.write().exact.insert(ip);
    }

    pub fn lookup(&self, ip: IpAddr) -> bool {
        let inner = self.inner.read();
        inner.exact.contains(&ip) || inner.nets.iter().any(|net| net.contains(&ip))
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.inner.read();
        inner.nets.is_empty() && inner.exact.is_empty()
    }

    /// Drops every entry. Idempotent; called once during device close.
    pub fn close(&self) {
        let mut inner = self.inner.write();
        inner.nets.clear();
        inner.exact.clear();
    }
}

/// Set of process ids whose flows are diverted.
#[derive(Default)]
pub struct AppFilter {
    pids: RwLock<HashSet<u32>>,
}

impl AppFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, pid: u32) {
        self.pids.write().insert(pid);
    }

    pub fn lookup(&self, pid: u32) -> bool {
        self.pids.read().contains(&pid)
    }

    pub fn is_empty(&self) -> bool {
        self.pids.read().is_empty()
    }

    pub fn clear(&self) {
        self.pids.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cidr_and_exact_lookups() {
        let filter = IpFilter::new();
        filter.add("8.8.8.0/24".parse().unwrap());
        filter.add_addr("1.1.1.1".parse().unwrap());

        assert!(filter.lookup("8.8.8.8".parse().unwrap()));
        assert!(filter.lookup("8.8.8.200".parse().unwrap()));
        assert!(filter.lookup("1.1.1.1".parse().unwrap()));
        assert!(!filter.lookup("9.9.9.9".parse().unwrap()));
    }

    #[test]
    fn test_ipv6_networks() {
        let filter = IpFilter::new();
        filter.add("2001:4860::/32".parse().unwrap());

        assert!(filter.lookup("2001:4860:4860::8888".parse().unwrap()));
        assert!(!filter.lookup("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn test_close_clears_everything() {
        let filter = IpFilter::new();
        filter.add("10.0.0.0/8".parse().unwrap());
        assert!(!filter.is_empty());

        filter.close();
        assert!(filter.is_empty());
        assert!(!filter.lookup("10.1.2.3".parse().unwrap()));

        // A second close is a no-op.
        filter.close();
    }

    #[test]
    fn test_pid_lookups() {
        let filter = AppFilter::new();
        assert!(filter.is_empty());

        filter.add(1234);
        assert!(filter.lookup(1234));
        assert!(!filter.lookup(4321));

        filter.clear();
        assert!(!filter.lookup(1234));
    }
}
