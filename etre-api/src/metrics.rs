//! Process-wide metrics store.
//!
//! One owned object carried on `AppState` — never a global. Counters are
//! lock-free atomics; the short-lived lock guards only group membership,
//! which changes rarely (fan-out of reads/writes never takes it after the
//! first request for a group).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

/// Counters for one caller metric group.
#[derive(Debug, Default)]
pub struct GroupMetrics {
    pub read: AtomicU64,
    pub insert: AtomicU64,
    pub update: AtomicU64,
    pub delete: AtomicU64,
    pub delete_label: AtomicU64,
    pub error: AtomicU64,
    pub sla_miss: AtomicU64,
}

impl GroupMetrics {
    fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "read": self.read.load(Ordering::Relaxed),
            "insert": self.insert.load(Ordering::Relaxed),
            "update": self.update.load(Ordering::Relaxed),
            "delete": self.delete.load(Ordering::Relaxed),
            "delete-label": self.delete_label.load(Ordering::Relaxed),
            "error": self.error.load(Ordering::Relaxed),
            "query-latency-sla-miss": self.sla_miss.load(Ordering::Relaxed),
        })
    }
}

/// In-memory metrics store.
pub struct Metrics {
    query_latency_sla: Duration,
    groups: Mutex<HashMap<String, Arc<GroupMetrics>>>,
    pub cdc_writes: AtomicU64,
    pub cdc_write_errors: AtomicU64,
    pub cdc_fallback_writes: AtomicU64,
    pub cdc_clients: AtomicU64,
}

impl Metrics {
    pub fn new(query_latency_sla: Duration) -> Self {
        Self {
            query_latency_sla,
            groups: Mutex::new(HashMap::new()),
            cdc_writes: AtomicU64::new(0),
            cdc_write_errors: AtomicU64::new(0),
            cdc_fallback_writes: AtomicU64::new(0),
            cdc_clients: AtomicU64::new(0),
        }
    }

    /// Counters for a metric group, created on first use.
    pub fn group(&self, name: &str) -> Arc<GroupMetrics> {
        let mut groups = self.groups.lock();
        if let Some(group) = groups.get(name) {
            return Arc::clone(group);
        }
        let group = Arc::new(GroupMetrics::default());
        groups.insert(name.to_string(), Arc::clone(&group));
        group
    }

    /// Record a query's latency against the configured SLA.
    pub fn observe_query_latency(&self, group: &str, latency: Duration) {
        if latency > self.query_latency_sla {
            self.group(group).sla_miss.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> serde_json::Value {
        let groups: serde_json::Map<String, serde_json::Value> = self
            .groups
            .lock()
            .iter()
            .map(|(name, group)| (name.clone(), group.snapshot()))
            .collect();
        serde_json::json!({
            "groups": groups,
            "cdc": {
                "writes": self.cdc_writes.load(Ordering::Relaxed),
                "write-errors": self.cdc_write_errors.load(Ordering::Relaxed),
                "fallback-writes": self.cdc_fallback_writes.load(Ordering::Relaxed),
                "clients": self.cdc_clients.load(Ordering::Relaxed),
            },
        })
    }
}
