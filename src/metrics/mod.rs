//! Process-wide metrics: atomic counters and gauges, sampled histograms,
//! and a registry of stat bundles keyed by type and labels.
//!
//! Hot paths never touch the registry: callers resolve `Arc` handles once
//! (see [crate::cluster::HostStats]) and bump atomics after that.

pub mod transfer;

use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

pub const METRICS_TYPE_HOST: &str = "host";
pub const METRICS_TYPE_CLUSTER: &str = "cluster";

pub const LABEL_CLUSTER: &str = "cluster";
pub const LABEL_ADDRESS: &str = "address";

pub const UPSTREAM_CONNECTION_TOTAL: &str = "upstream_connection_total";
pub const UPSTREAM_CONNECTION_ACTIVE: &str = "upstream_connection_active";
pub const UPSTREAM_CONNECTION_CON_FAIL: &str = "upstream_connection_con_fail";
pub const UPSTREAM_CONNECTION_LOCAL_CLOSE_WITH_ACTIVE_REQUEST: &str =
    "upstream_connection_local_close_with_active_request";
pub const UPSTREAM_CONNECTION_REMOTE_CLOSE_WITH_ACTIVE_REQUEST: &str =
    "upstream_connection_remote_close_with_active_request";
pub const UPSTREAM_BYTES_READ_TOTAL: &str = "upstream_bytes_read_total";
pub const UPSTREAM_BYTES_WRITE_TOTAL: &str = "upstream_bytes_write_total";
pub const UPSTREAM_REQUEST_TOTAL: &str = "upstream_request_total";
pub const UPSTREAM_REQUEST_ACTIVE: &str = "upstream_request_active";
pub const UPSTREAM_REQUEST_LOCAL_RESET: &str = "upstream_request_local_reset";
pub const UPSTREAM_REQUEST_REMOTE_RESET: &str = "upstream_request_remote_reset";
pub const UPSTREAM_REQUEST_TIMEOUT: &str = "upstream_request_timeout";
pub const UPSTREAM_REQUEST_FAILURE_EJECT: &str = "upstream_request_failure_eject";
pub const UPSTREAM_REQUEST_PENDING_OVERFLOW: &str = "upstream_request_pending_overflow";
pub const UPSTREAM_REQUEST_DURATION: &str = "upstream_request_duration";

const HISTOGRAM_SAMPLE_LIMIT: usize = 1024;

#[derive(Default)]
pub struct Counter(AtomicI64);

impl Counter {
    #[inline]
    pub fn inc(&self, n: i64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn dec(&self, n: i64) {
        self.0.fetch_sub(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn count(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
pub struct Gauge(AtomicI64);

impl Gauge {
    #[inline]
    pub fn update(&self, v: i64) {
        self.0.store(v, Ordering::Relaxed);
    }

    #[inline]
    pub fn value(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A histogram keeping a bounded sample of observed values.
#[derive(Default)]
pub struct Histogram {
    sample: Mutex<Vec<i64>>,
}

impl Histogram {
    pub fn update(&self, v: i64) {
        let mut sample = self.sample.lock().unwrap();
        if sample.len() >= HISTOGRAM_SAMPLE_LIMIT {
            sample.remove(0);
        }
        sample.push(v);
    }

    pub fn sample_values(&self) -> Vec<i64> {
        self.sample.lock().unwrap().clone()
    }
}

/// One bundle of metrics sharing a type ("host", "cluster", ...) and a
/// label set. Handles returned by `counter`/`gauge`/`histogram` are stable
/// for the process lifetime.
pub struct Stats {
    typ: String,
    labels: Vec<(String, String)>,
    counters: Mutex<FxHashMap<String, Arc<Counter>>>,
    gauges: Mutex<FxHashMap<String, Arc<Gauge>>>,
    histograms: Mutex<FxHashMap<String, Arc<Histogram>>>,
}

impl Stats {
    fn new(typ: &str, labels: Vec<(String, String)>) -> Self {
        Self {
            typ: typ.to_string(),
            labels,
            counters: Mutex::new(FxHashMap::default()),
            gauges: Mutex::new(FxHashMap::default()),
            histograms: Mutex::new(FxHashMap::default()),
        }
    }

    #[inline]
    pub fn typ(&self) -> &str {
        &self.typ
    }

    #[inline]
    pub fn labels(&self) -> &[(String, String)] {
        &self.labels
    }

    pub fn counter(&self, key: &str) -> Arc<Counter> {
        let mut m = self.counters.lock().unwrap();
        if let Some(c) = m.get(key) {
            return c.clone();
        }
        let c = Arc::new(Counter::default());
        m.insert(key.to_string(), c.clone());
        c
    }

    pub fn gauge(&self, key: &str) -> Arc<Gauge> {
        let mut m = self.gauges.lock().unwrap();
        if let Some(g) = m.get(key) {
            return g.clone();
        }
        let g = Arc::new(Gauge::default());
        m.insert(key.to_string(), g.clone());
        g
    }

    pub fn histogram(&self, key: &str) -> Arc<Histogram> {
        let mut m = self.histograms.lock().unwrap();
        if let Some(h) = m.get(key) {
            return h.clone();
        }
        let h = Arc::new(Histogram::default());
        m.insert(key.to_string(), h.clone());
        h
    }

    pub fn each_counter(&self, mut f: impl FnMut(&str, &Counter)) {
        for (k, c) in self.counters.lock().unwrap().iter() {
            f(k, c);
        }
    }

    pub fn each_gauge(&self, mut f: impl FnMut(&str, &Gauge)) {
        for (k, g) in self.gauges.lock().unwrap().iter() {
            f(k, g);
        }
    }

    pub fn each_histogram(&self, mut f: impl FnMut(&str, &Histogram)) {
        for (k, h) in self.histograms.lock().unwrap().iter() {
            f(k, h);
        }
    }
}

fn registry() -> &'static Mutex<Vec<Arc<Stats>>> {
    static REGISTRY: OnceLock<Mutex<Vec<Arc<Stats>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(Vec::new()))
}

/// Find or create the stats bundle for a type + label set. Labels are
/// sorted so key identity does not depend on caller order.
pub fn get_or_create(typ: &str, labels: &[(&str, &str)]) -> Arc<Stats> {
    let mut labels: Vec<(String, String)> =
        labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    labels.sort();
    let mut reg = registry().lock().unwrap();
    for s in reg.iter() {
        if s.typ == typ && s.labels == labels {
            return s.clone();
        }
    }
    let s = Arc::new(Stats::new(typ, labels));
    reg.push(s.clone());
    s
}

/// Snapshot of every registered bundle, for the transfer path.
pub fn get_all() -> Vec<Arc<Stats>> {
    registry().lock().unwrap().clone()
}

/// Drop every registration. Test teardown only; live `Arc` handles keep
/// working but are no longer reachable from the registry.
pub fn reset_all() {
    registry().lock().unwrap().clear();
}

pub fn new_host_stats(cluster: &str, addr: &str) -> Arc<Stats> {
    get_or_create(METRICS_TYPE_HOST, &[(LABEL_CLUSTER, cluster), (LABEL_ADDRESS, addr)])
}

pub fn new_cluster_stats(cluster: &str) -> Arc<Stats> {
    get_or_create(METRICS_TYPE_CLUSTER, &[(LABEL_CLUSTER, cluster)])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_gauge() {
        let s = get_or_create("test_counter_gauge", &[("k", "v")]);
        let c = s.counter("reqs");
        c.inc(3);
        c.dec(1);
        assert_eq!(c.count(), 2);
        // same handle on re-resolve
        assert_eq!(s.counter("reqs").count(), 2);
        let g = s.gauge("depth");
        g.update(42);
        assert_eq!(g.value(), 42);
    }

    #[test]
    fn test_registry_identity() {
        let a = get_or_create("test_registry", &[("a", "1"), ("b", "2")]);
        let b = get_or_create("test_registry", &[("b", "2"), ("a", "1")]);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_histogram_sample() {
        let h = Histogram::default();
        for i in 0..10 {
            h.update(i);
        }
        assert_eq!(h.sample_values().len(), 10);
    }
}
