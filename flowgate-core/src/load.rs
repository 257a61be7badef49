//! Per-replica in-flight load accounting.
//!
//! Load is tracked as the sum of declared demands of in-flight requests, not
//! as a raw connection count. Every dispatch credits the chosen replica's row
//! and every reply debits it, so `rate_sum` is exactly the declared demand
//! currently executing there. The power-of-two policies compare rows through
//! the query primitives below.

use crate::classes::ClassTable;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// In-flight totals for one replica.
#[derive(Debug, Clone)]
pub struct ReplicaLoad {
    /// In-flight request count per job-length group.
    pub reqs: Vec<u64>,
    /// Sum of declared rates of in-flight requests.
    pub rate_sum: i64,
    /// Total in-flight request count; always equals `reqs.iter().sum()`.
    pub job_num: u64,
}

impl ReplicaLoad {
    fn zeroed(groups: usize) -> Self {
        Self {
            reqs: vec![0; groups],
            rate_sum: 0,
            job_num: 0,
        }
    }
}

/// Table of every replica this activator has dispatched to, keyed by IP.
/// Rows are created lazily on first credit and never collected within a
/// process lifetime.
#[derive(Debug)]
pub struct ReplicaLoadTable {
    classes: Arc<ClassTable>,
    rows: RwLock<HashMap<String, ReplicaLoad>>,
}

impl ReplicaLoadTable {
    pub fn new(classes: Arc<ClassTable>) -> Self {
        Self {
            classes,
            rows: RwLock::new(HashMap::new()),
        }
    }

    /// Credit a dispatched request. Rates outside the group edges leave the
    /// table untouched.
    pub fn add_req(&self, ip: &str, rate: u32) {
        let Some(group) = self.classes.group_index(rate) else {
            tracing::warn!(ip, rate, "rate outside group edges, load not tracked");
            return;
        };
        let mut rows = self.rows.write().unwrap_or_else(|e| e.into_inner());
        let row = rows
            .entry(ip.to_string())
            .or_insert_with(|| ReplicaLoad::zeroed(self.classes.group_count()));
        row.reqs[group] += 1;
        row.rate_sum += i64::from(rate);
        row.job_num += 1;
    }

    /// Debit a completed request; the exact inverse of [`Self::add_req`].
    /// A debit that would drive any counter negative is dropped.
    pub fn del_req(&self, ip: &str, rate: u32) {
        let Some(group) = self.classes.group_index(rate) else {
            return;
        };
        let mut rows = self.rows.write().unwrap_or_else(|e| e.into_inner());
        let Some(row) = rows.get_mut(ip) else {
            tracing::warn!(ip, rate, "debit for unknown replica dropped");
            return;
        };
        if row.reqs[group] == 0 || row.job_num == 0 || row.rate_sum < i64::from(rate) {
            tracing::warn!(ip, rate, "debit would underflow, dropped");
            return;
        }
        row.reqs[group] -= 1;
        row.rate_sum -= i64::from(rate);
        row.job_num -= 1;
    }

    /// The replica with the smaller in-flight rate sum; ties go to `ip1`.
    /// Unknown replicas count as idle.
    pub fn choose_by_rate<'a>(&self, ip1: &'a str, ip2: &'a str) -> &'a str {
        if self.rate_sum(ip2) < self.rate_sum(ip1) {
            ip2
        } else {
            ip1
        }
    }

    /// Same comparison on the in-flight request count.
    pub fn choose_by_job_num<'a>(&self, ip1: &'a str, ip2: &'a str) -> &'a str {
        if self.job_num(ip2) < self.job_num(ip1) {
            ip2
        } else {
            ip1
        }
    }

    /// Whether the replica has any declared demand in flight.
    pub fn is_busy(&self, ip: &str) -> bool {
        self.rate_sum(ip) != 0
    }

    /// The idle one of the pair, preferring `ip1`; `None` when both busy.
    pub fn choose_idle<'a>(&self, ip1: &'a str, ip2: &'a str) -> Option<&'a str> {
        if !self.is_busy(ip1) {
            Some(ip1)
        } else if !self.is_busy(ip2) {
            Some(ip2)
        } else {
            None
        }
    }

    pub fn rate_sum(&self, ip: &str) -> i64 {
        self.rows
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(ip)
            .map(|row| row.rate_sum)
            .unwrap_or(0)
    }

    pub fn job_num(&self, ip: &str) -> u64 {
        self.rows
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(ip)
            .map(|row| row.job_num)
            .unwrap_or(0)
    }

    /// Snapshot of one row, for tests and introspection handlers.
    pub fn snapshot(&self, ip: &str) -> Option<ReplicaLoad> {
        self.rows
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(ip)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> ReplicaLoadTable {
        ReplicaLoadTable::new(Arc::new(ClassTable::alu_default()))
    }

    fn assert_consistent(row: &ReplicaLoad) {
        assert_eq!(row.reqs.iter().sum::<u64>(), row.job_num);
        assert!(row.rate_sum >= 0);
    }

    #[test]
    fn test_credit_and_debit_round_trip() {
        let table = table();
        table.add_req("10.0.0.1", 1000);
        table.add_req("10.0.0.1", 300);

        let row = table.snapshot("10.0.0.1").unwrap();
        assert_eq!(row.rate_sum, 1300);
        assert_eq!(row.job_num, 2);
        assert_consistent(&row);

        table.del_req("10.0.0.1", 1000);
        table.del_req("10.0.0.1", 300);
        let row = table.snapshot("10.0.0.1").unwrap();
        assert_eq!(row.rate_sum, 0);
        assert_eq!(row.job_num, 0);
        assert_consistent(&row);
    }

    #[test]
    fn test_debit_underflow_is_dropped() {
        let table = table();
        table.del_req("10.0.0.9", 500);
        assert!(table.snapshot("10.0.0.9").is_none());

        table.add_req("10.0.0.9", 500);
        // Different group than what is in flight: bucket would underflow.
        table.del_req("10.0.0.9", 100);
        let row = table.snapshot("10.0.0.9").unwrap();
        assert_eq!(row.rate_sum, 500);
        assert_consistent(&row);
    }

    #[test]
    fn test_out_of_range_rate_ignored() {
        let table = table();
        table.add_req("10.0.0.2", 999_999);
        assert!(table.snapshot("10.0.0.2").is_none());
    }

    #[test]
    fn test_choose_by_rate_prefers_lighter() {
        let table = table();
        table.add_req("a", 1000);
        table.add_req("b", 100);
        assert_eq!(table.choose_by_rate("a", "b"), "b");
        assert_eq!(table.choose_by_rate("b", "a"), "b");
        // Tie goes to the first argument.
        assert_eq!(table.choose_by_rate("c", "d"), "c");
    }

    #[test]
    fn test_choose_by_job_num() {
        let table = table();
        table.add_req("a", 100);
        table.add_req("a", 100);
        table.add_req("b", 5000);
        assert_eq!(table.choose_by_job_num("a", "b"), "b");
    }

    #[test]
    fn test_idle_queries() {
        let table = table();
        table.add_req("busy", 200);
        assert!(table.is_busy("busy"));
        assert!(!table.is_busy("idle"));
        assert_eq!(table.choose_idle("idle", "busy"), Some("idle"));
        assert_eq!(table.choose_idle("busy", "idle"), Some("idle"));
        assert_eq!(table.choose_idle("busy", "busy"), None);

        table.add_req("idle2", 100);
        table.del_req("idle2", 100);
        assert_eq!(table.choose_idle("busy", "idle2"), Some("idle2"));
    }
}
