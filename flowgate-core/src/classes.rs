//! Service-class tables.
//!
//! Every request carries a declared `rate`: an integer tag for its service
//! demand, mapped here to an expected execution time. Rates are additionally
//! bucketed into job-length groups; the group edges drive both the per-group
//! in-flight counters of the replica load table and the size-interval
//! admission thresholds.

use serde::{Deserialize, Serialize};

/// One declared service class.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ServiceClass {
    /// The rate tag requests carry in `X-Rate`.
    pub rate: u32,
    /// Expected execution time in milliseconds for this class.
    pub expected_exec_ms: f64,
}

/// Ordered class list plus the job-length group edges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassTable {
    classes: Vec<ServiceClass>,
    /// Exclusive upper bound of each group: group `i` holds rates in
    /// `[edges[i-1], edges[i])`. Must be strictly ascending.
    joblen_edges: Vec<u32>,
}

impl ClassTable {
    pub fn new(classes: Vec<ServiceClass>, joblen_edges: Vec<u32>) -> Self {
        debug_assert!(joblen_edges.windows(2).all(|w| w[0] < w[1]));
        Self {
            classes,
            joblen_edges,
        }
    }

    /// The 20-class table used by the ALU benchmark mode. Rates double as
    /// expected execution times: the ALU workload runs for as many
    /// milliseconds as its tag declares.
    pub fn alu_default() -> Self {
        let rates: [u32; 20] = [
            100, 200, 300, 400, 500, 700, 1000, 1300, 1600, 2000, 2500, 3000, 3500, 4000, 5000,
            6000, 7000, 8000, 9000, 10000,
        ];
        Self::new(
            rates
                .iter()
                .map(|&rate| ServiceClass {
                    rate,
                    expected_exec_ms: rate as f64,
                })
                .collect(),
            vec![200, 500, 1000, 2000, 4000, 8000, 10_001],
        )
    }

    /// Group edges covering the real-world execution-time range (the zipf and
    /// power-law tails are drawn from 1..=30000 ms).
    pub fn real_world_default() -> Self {
        Self::new(Vec::new(), vec![2, 5, 10, 50, 100, 500, 1000, 5000, 10_000, 30_001])
    }

    /// Number of job-length groups; sizes the per-replica counter arrays.
    pub fn group_count(&self) -> usize {
        self.joblen_edges.len()
    }

    /// Smallest group index whose edge exceeds `rate`, or `None` when the
    /// rate is out of range. Callers treat `None` as "ignore update".
    pub fn group_index(&self, rate: u32) -> Option<usize> {
        self.joblen_edges.iter().position(|&edge| edge > rate)
    }

    /// Upper edge of the shortest-but-one group, the baseline subtracted from
    /// real-world delay budgets.
    pub fn short_edge(&self) -> u32 {
        self.joblen_edges.get(1).copied().unwrap_or(0)
    }

    /// Expected execution time for a declared rate. Exact class match wins;
    /// unknown rates fall back to the rate itself (real-world tags are
    /// execution times in milliseconds).
    pub fn expected_exec_ms(&self, rate: u32) -> f64 {
        self.classes
            .iter()
            .find(|c| c.rate == rate)
            .map(|c| c.expected_exec_ms)
            .unwrap_or(rate as f64)
    }

    /// Representative execution time for a whole group: the midpoint of the
    /// group's rate interval.
    pub fn group_expected_exec_ms(&self, group: usize) -> f64 {
        let upper = match self.joblen_edges.get(group) {
            Some(&edge) => edge as f64,
            None => return 0.0,
        };
        let lower = if group == 0 {
            0.0
        } else {
            self.joblen_edges[group - 1] as f64
        };
        (lower + upper) / 2.0
    }

    pub fn classes(&self) -> &[ServiceClass] {
        &self.classes
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_index_boundaries() {
        let table = ClassTable::alu_default();
        assert_eq!(table.group_index(0), Some(0));
        assert_eq!(table.group_index(199), Some(0));
        assert_eq!(table.group_index(200), Some(1));
        assert_eq!(table.group_index(9999), Some(6));
        assert_eq!(table.group_index(10_000), Some(6));
        // Beyond every edge: out of range.
        assert_eq!(table.group_index(10_001), None);
        assert_eq!(table.group_index(u32::MAX), None);
    }

    #[test]
    fn test_expected_exec_exact_and_fallback() {
        let table = ClassTable::alu_default();
        assert_eq!(table.expected_exec_ms(700), 700.0);
        // Not a declared class: fall back to the tag value.
        assert_eq!(table.expected_exec_ms(123), 123.0);
    }

    #[test]
    fn test_group_expected_exec_midpoints() {
        let table = ClassTable::real_world_default();
        assert_eq!(table.group_expected_exec_ms(0), 1.0); // [0, 2)
        assert_eq!(table.group_expected_exec_ms(1), 3.5); // [2, 5)
        assert_eq!(table.group_expected_exec_ms(9), 20_000.5); // [10000, 30001)
        assert_eq!(table.group_expected_exec_ms(10), 0.0);
    }

    #[test]
    fn test_alu_table_shape() {
        let table = ClassTable::alu_default();
        assert_eq!(table.classes().len(), 20);
        assert_eq!(table.group_count(), 7);
        assert_eq!(table.short_edge(), 500);
    }
}
