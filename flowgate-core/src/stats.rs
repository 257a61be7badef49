//! Rolling execution statistics.
//!
//! The admission disciplines adapt their release delays to what the cluster
//! has been executing: the ALU delay budget subtracts the running average
//! execution time. Totals only grow; they are rebuilt from zero on restart.

use std::sync::RwLock;

#[derive(Debug, Default, Clone, Copy)]
struct Totals {
    total_job_num: u64,
    total_exec_time_ms: f64,
    max_exec_time_ms: f64,
}

/// Process-wide execution totals, credited once per dispatched request.
#[derive(Debug, Default)]
pub struct ExecStats {
    totals: RwLock<Totals>,
}

impl ExecStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one dispatched job with its expected execution time.
    pub fn add_job(&self, exec_time_ms: f64) {
        let mut totals = self.totals.write().unwrap_or_else(|e| e.into_inner());
        totals.total_job_num += 1;
        totals.total_exec_time_ms += exec_time_ms;
        if exec_time_ms > totals.max_exec_time_ms {
            totals.max_exec_time_ms = exec_time_ms;
        }
    }

    pub fn total_job_num(&self) -> u64 {
        self.read().total_job_num
    }

    pub fn max_exec_time_ms(&self) -> f64 {
        self.read().max_exec_time_ms
    }

    /// Mean execution time over everything dispatched so far, 0 when idle.
    pub fn avg_exec_time_ms(&self) -> f64 {
        let totals = self.read();
        if totals.total_job_num == 0 {
            0.0
        } else {
            totals.total_exec_time_ms / totals.total_job_num as f64
        }
    }

    fn read(&self) -> Totals {
        *self.totals.read().unwrap_or_else(|e| e.into_inner())
    }
}

/// Last-arrival bookkeeping. The two fields are guarded independently;
/// readers observing a mismatched pair treat it as "no previous arrival".
#[derive(Debug, Default)]
pub struct ArrivalTracker {
    last_rate: RwLock<Option<u32>>,
    last_arrive_ms: RwLock<Option<f64>>,
}

impl ArrivalTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, rate: u32, arrive_ms: f64) {
        *self.last_rate.write().unwrap_or_else(|e| e.into_inner()) = Some(rate);
        *self
            .last_arrive_ms
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(arrive_ms);
    }

    pub fn last_rate(&self) -> Option<u32> {
        *self.last_rate.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn last_arrive_ms(&self) -> Option<f64> {
        *self.last_arrive_ms.read().unwrap_or_else(|e| e.into_inner())
    }
}
