//! Upstream cluster and host handles the pool consumes: resource ceilings
//! and pre-resolved stat bundles.

use crate::metrics::{self, Counter, Histogram};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// One admission-controlled resource with a fixed ceiling.
pub struct Resource {
    max: u64,
    cur: AtomicI64,
}

impl Resource {
    pub fn new(max: u64) -> Self {
        Self { max, cur: AtomicI64::new(0) }
    }

    #[inline]
    pub fn max(&self) -> u64 {
        self.max
    }

    #[inline]
    pub fn can_create(&self) -> bool {
        self.cur.load(Ordering::Relaxed) < self.max as i64
    }

    #[inline]
    pub fn increase(&self) {
        self.cur.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn decrease(&self) {
        self.cur.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn current(&self) -> i64 {
        self.cur.load(Ordering::Relaxed)
    }
}

/// Per-cluster ceilings: upstream connections and in-flight requests.
pub struct ResourceManager {
    pub connections: Resource,
    pub requests: Resource,
}

impl ResourceManager {
    pub fn new(max_connections: u64, max_requests: u64) -> Self {
        Self {
            connections: Resource::new(max_connections),
            requests: Resource::new(max_requests),
        }
    }
}

/// Upstream request/connection counters resolved once per host.
pub struct HostStats {
    pub upstream_connection_total: Arc<Counter>,
    pub upstream_connection_active: Arc<Counter>,
    pub upstream_connection_con_fail: Arc<Counter>,
    pub upstream_connection_local_close_with_active_request: Arc<Counter>,
    pub upstream_connection_remote_close_with_active_request: Arc<Counter>,
    pub upstream_request_total: Arc<Counter>,
    pub upstream_request_active: Arc<Counter>,
    pub upstream_request_local_reset: Arc<Counter>,
    pub upstream_request_remote_reset: Arc<Counter>,
    pub upstream_request_timeout: Arc<Counter>,
    pub upstream_request_failure_eject: Arc<Counter>,
    pub upstream_request_pending_overflow: Arc<Counter>,
    pub upstream_request_duration: Arc<Histogram>,
}

fn new_host_stats(cluster_name: &str, addr: &str) -> HostStats {
    let s = metrics::new_host_stats(cluster_name, addr);
    HostStats {
        upstream_connection_total: s.counter(metrics::UPSTREAM_CONNECTION_TOTAL),
        upstream_connection_active: s.counter(metrics::UPSTREAM_CONNECTION_ACTIVE),
        upstream_connection_con_fail: s.counter(metrics::UPSTREAM_CONNECTION_CON_FAIL),
        upstream_connection_local_close_with_active_request: s
            .counter(metrics::UPSTREAM_CONNECTION_LOCAL_CLOSE_WITH_ACTIVE_REQUEST),
        upstream_connection_remote_close_with_active_request: s
            .counter(metrics::UPSTREAM_CONNECTION_REMOTE_CLOSE_WITH_ACTIVE_REQUEST),
        upstream_request_total: s.counter(metrics::UPSTREAM_REQUEST_TOTAL),
        upstream_request_active: s.counter(metrics::UPSTREAM_REQUEST_ACTIVE),
        upstream_request_local_reset: s.counter(metrics::UPSTREAM_REQUEST_LOCAL_RESET),
        upstream_request_remote_reset: s.counter(metrics::UPSTREAM_REQUEST_REMOTE_RESET),
        upstream_request_timeout: s.counter(metrics::UPSTREAM_REQUEST_TIMEOUT),
        upstream_request_failure_eject: s.counter(metrics::UPSTREAM_REQUEST_FAILURE_EJECT),
        upstream_request_pending_overflow: s.counter(metrics::UPSTREAM_REQUEST_PENDING_OVERFLOW),
        upstream_request_duration: s.histogram(metrics::UPSTREAM_REQUEST_DURATION),
    }
}

/// Cluster-wide view of the same counters, plus connection byte totals
/// shared by every connection of the cluster.
pub struct ClusterStats {
    pub upstream_connection_total: Arc<Counter>,
    pub upstream_connection_active: Arc<Counter>,
    pub upstream_connection_con_fail: Arc<Counter>,
    pub upstream_connection_local_close_with_active_request: Arc<Counter>,
    pub upstream_connection_remote_close_with_active_request: Arc<Counter>,
    pub upstream_bytes_read_total: Arc<Counter>,
    pub upstream_bytes_write_total: Arc<Counter>,
    pub upstream_request_total: Arc<Counter>,
    pub upstream_request_active: Arc<Counter>,
    pub upstream_request_local_reset: Arc<Counter>,
    pub upstream_request_remote_reset: Arc<Counter>,
    pub upstream_request_timeout: Arc<Counter>,
    pub upstream_request_failure_eject: Arc<Counter>,
    pub upstream_request_pending_overflow: Arc<Counter>,
    pub upstream_request_duration: Arc<Histogram>,
}

fn new_cluster_stats(cluster_name: &str) -> ClusterStats {
    let s = metrics::new_cluster_stats(cluster_name);
    ClusterStats {
        upstream_connection_total: s.counter(metrics::UPSTREAM_CONNECTION_TOTAL),
        upstream_connection_active: s.counter(metrics::UPSTREAM_CONNECTION_ACTIVE),
        upstream_connection_con_fail: s.counter(metrics::UPSTREAM_CONNECTION_CON_FAIL),
        upstream_connection_local_close_with_active_request: s
            .counter(metrics::UPSTREAM_CONNECTION_LOCAL_CLOSE_WITH_ACTIVE_REQUEST),
        upstream_connection_remote_close_with_active_request: s
            .counter(metrics::UPSTREAM_CONNECTION_REMOTE_CLOSE_WITH_ACTIVE_REQUEST),
        upstream_bytes_read_total: s.counter(metrics::UPSTREAM_BYTES_READ_TOTAL),
        upstream_bytes_write_total: s.counter(metrics::UPSTREAM_BYTES_WRITE_TOTAL),
        upstream_request_total: s.counter(metrics::UPSTREAM_REQUEST_TOTAL),
        upstream_request_active: s.counter(metrics::UPSTREAM_REQUEST_ACTIVE),
        upstream_request_local_reset: s.counter(metrics::UPSTREAM_REQUEST_LOCAL_RESET),
        upstream_request_remote_reset: s.counter(metrics::UPSTREAM_REQUEST_REMOTE_RESET),
        upstream_request_timeout: s.counter(metrics::UPSTREAM_REQUEST_TIMEOUT),
        upstream_request_failure_eject: s.counter(metrics::UPSTREAM_REQUEST_FAILURE_EJECT),
        upstream_request_pending_overflow: s.counter(metrics::UPSTREAM_REQUEST_PENDING_OVERFLOW),
        upstream_request_duration: s.histogram(metrics::UPSTREAM_REQUEST_DURATION),
    }
}

pub struct ClusterInfo {
    pub name: String,
    pub resource_manager: ResourceManager,
    pub stats: ClusterStats,
}

impl ClusterInfo {
    pub fn new(name: &str, max_connections: u64, max_requests: u64) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            resource_manager: ResourceManager::new(max_connections, max_requests),
            stats: new_cluster_stats(name),
        })
    }
}

/// One upstream address inside a cluster.
pub struct Host {
    pub address: String,
    pub cluster: Arc<ClusterInfo>,
    pub stats: HostStats,
}

impl Host {
    pub fn new(address: &str, cluster: Arc<ClusterInfo>) -> Arc<Self> {
        let stats = new_host_stats(&cluster.name, address);
        Arc::new(Self { address: address.to_string(), cluster, stats })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_ceiling() {
        let r = Resource::new(2);
        assert!(r.can_create());
        r.increase();
        r.increase();
        assert!(!r.can_create());
        r.decrease();
        assert!(r.can_create());
        assert_eq!(r.current(), 1);
    }

    #[test]
    fn test_host_stats_shared_with_cluster_registry() {
        let cluster = ClusterInfo::new("test_cluster_stats", 4, 16);
        let host = Host::new("127.0.0.1:9999", cluster.clone());
        host.stats.upstream_request_total.inc(1);
        cluster.stats.upstream_request_total.inc(1);
        // both resolve from the registry, so a second host on the same
        // address observes the same counters
        let again = Host::new("127.0.0.1:9999", cluster);
        assert_eq!(again.stats.upstream_request_total.count(), 1);
    }
}
