//! The admission queue.
//!
//! Requests are parked here between arrival and dispatch. Each unit owns a
//! release deadline; a single manager task drains every unit whose deadline
//! has passed and hands it to the dispatcher. The queue is a binary heap
//! keyed by `(release_deadline, enqueue_order)`: the FIFO discipline breaks
//! deadline ties oldest-first, the preempting disciplines newest-first, so a
//! freshly arrived short job is never starved behind older long jobs whose
//! timers fired in the same tick.

use crate::classes::ClassTable;
use crate::dispatch::DispatchItem;
use crate::error::{AdmissionError, DispatchError};
use crate::stats::{ArrivalTracker, ExecStats};
use crate::unit::SchedulingUnit;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Release delays never exceed this, however heavy the declared demand.
const MAX_RELEASE_DELAY_MS: f64 = 4000.0;

/// How a pending request earns its release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Discipline {
    /// Arrival order, no delays, no preemption.
    Fifo,
    /// New arrivals bypass a strictly heavier head; everything else waits a
    /// fixed `1000/λ` ms.
    SimplePreempt,
    /// Size-interval thresholds: the shortest classes dispatch immediately,
    /// longer ones wait in proportion to how likely a shorter job is to
    /// arrive within their budget.
    SizeInterval,
}

/// Admission tuning, resolved once at startup.
#[derive(Debug, Clone)]
pub struct AdmissionParams {
    pub discipline: Discipline,
    /// Hard cap on queued units; arrivals beyond it are rejected.
    pub capacity: usize,
    /// Expected arrivals per second.
    pub lambda: f64,
    /// Additive delay-budget shaping constant for the active regime.
    pub varx: f64,
    /// Multiplicative release-delay shaping constant for the active regime.
    pub vary: f64,
    /// Fixed wait used by the simple-preempt discipline and the bounded-wait
    /// policy; `1000/λ` ms.
    pub max_waiting_time: Duration,
    /// Whether the size-interval budget uses the ALU form (expected exec
    /// minus observed average) instead of the real-world form (rate minus
    /// the short-group edge).
    pub alu_budget: bool,
}

/// What `add_req` did with the unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Sent straight to the dispatcher, never queued.
    Dispatched,
    /// Parked with a release deadline.
    Enqueued { delay: Duration },
    /// Queue at capacity; the unit's completion was failed with `QueueFull`.
    Rejected,
}

#[derive(Debug)]
struct PendingUnit {
    release_at: Instant,
    /// Pop priority among equal deadlines; smaller pops first.
    order: u64,
    seq: u64,
    unit: SchedulingUnit,
}

impl PartialEq for PendingUnit {
    fn eq(&self, other: &Self) -> bool {
        self.release_at == other.release_at && self.order == other.order
    }
}

impl Eq for PendingUnit {}

impl PartialOrd for PendingUnit {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingUnit {
    fn cmp(&self, other: &Self) -> Ordering {
        // Earliest deadline first, then smallest order key; BinaryHeap is a
        // max-heap, so compare the other way around.
        (other.release_at, other.order).cmp(&(self.release_at, self.order))
    }
}

enum Decision {
    /// Dispatch without queueing. `bypass` marks a simple-preempt overtake.
    Immediate { bypass: bool },
    Delay(Duration),
}

/// Bounded admission queue with per-unit release deadlines.
#[derive(Debug)]
pub struct AdmissionQueue {
    params: AdmissionParams,
    classes: Arc<ClassTable>,
    stats: Arc<ExecStats>,
    arrivals: ArrivalTracker,
    dispatch_tx: mpsc::UnboundedSender<DispatchItem>,
    heap: Mutex<BinaryHeap<PendingUnit>>,
    notify: Notify,
    seq: AtomicU64,
}

impl AdmissionQueue {
    pub fn new(
        params: AdmissionParams,
        classes: Arc<ClassTable>,
        stats: Arc<ExecStats>,
        dispatch_tx: mpsc::UnboundedSender<DispatchItem>,
    ) -> Arc<Self> {
        Arc::new(Self {
            params,
            classes,
            stats,
            arrivals: ArrivalTracker::new(),
            dispatch_tx,
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            seq: AtomicU64::new(0),
        })
    }

    /// Admit one unit: dispatch it immediately, park it with a release
    /// deadline, or reject it when the queue is at capacity. Rejection fails
    /// the unit's completion channel; the queue itself is left untouched.
    pub fn add_req(&self, mut unit: SchedulingUnit) -> Admission {
        self.arrivals.record(unit.meta.rate, unit.meta.arrive_ts_ms);

        match self.decide(unit.meta.rate) {
            Decision::Immediate { bypass } => {
                if bypass {
                    unit.meta.last_rate = Some("1".to_string());
                }
                debug!(rate = unit.meta.rate, bypass, "dispatching without queueing");
                self.send_to_dispatcher(unit);
                Admission::Dispatched
            }
            Decision::Delay(delay) => {
                let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
                let order = if self.lifo_bias() { u64::MAX - seq } else { seq };
                let pending = PendingUnit {
                    release_at: Instant::now() + delay,
                    order,
                    seq,
                    unit,
                };

                let mut heap = self.lock_heap();
                if heap.len() >= self.params.capacity {
                    drop(heap);
                    warn!(
                        capacity = self.params.capacity,
                        "admission queue full, rejecting request"
                    );
                    pending.unit.complete(Err(DispatchError::Admission(
                        AdmissionError::QueueFull {
                            capacity: self.params.capacity,
                        },
                    )));
                    return Admission::Rejected;
                }
                heap.push(pending);
                drop(heap);
                self.notify.notify_one();
                Admission::Enqueued { delay }
            }
        }
    }

    /// Rate of the next unit in release order, if any.
    pub fn peek_head_rate(&self) -> Option<u32> {
        self.lock_heap().peek().map(|p| p.unit.meta.rate)
    }

    /// Atomically remove the head when its rate satisfies `pred`. Used by
    /// the bounded-wait policy to let a shorter job overtake mid-wait.
    pub fn steal_head_if(&self, pred: impl FnOnce(u32) -> bool) -> Option<SchedulingUnit> {
        let mut heap = self.lock_heap();
        if pred(heap.peek()?.unit.meta.rate) {
            Some(heap.pop()?.unit)
        } else {
            None
        }
    }

    pub fn pending(&self) -> usize {
        self.lock_heap().len()
    }

    pub fn arrivals(&self) -> &ArrivalTracker {
        &self.arrivals
    }

    /// Run the release loop on its own task.
    pub fn spawn_manager(self: &Arc<Self>) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move { queue.run().await })
    }

    async fn run(self: Arc<Self>) {
        info!(
            discipline = ?self.params.discipline,
            capacity = self.params.capacity,
            "admission queue manager started"
        );
        loop {
            match self.release_due() {
                Some(next) => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep_until(next) => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }

    /// Pop every unit whose deadline has passed and hand it to the
    /// dispatcher; returns the next pending deadline.
    fn release_due(&self) -> Option<Instant> {
        let now = Instant::now();
        let mut due = Vec::new();
        let next = {
            let mut heap = self.lock_heap();
            while heap.peek().is_some_and(|p| p.release_at <= now) {
                if let Some(pending) = heap.pop() {
                    due.push(pending);
                }
            }
            heap.peek().map(|p| p.release_at)
        };

        // Units released in the same tick race for replicas; the newest
        // insertion goes first under the preempting disciplines.
        if self.lifo_bias() {
            due.sort_by(|a, b| b.seq.cmp(&a.seq));
        }
        for pending in due {
            self.send_to_dispatcher(pending.unit);
        }
        next
    }

    fn send_to_dispatcher(&self, unit: SchedulingUnit) {
        if self
            .dispatch_tx
            .send(DispatchItem {
                unit,
                policy_override: None,
            })
            .is_err()
        {
            warn!("dispatcher channel closed, dropping released unit");
        }
    }

    fn decide(&self, rate: u32) -> Decision {
        match self.params.discipline {
            Discipline::Fifo => Decision::Delay(Duration::ZERO),
            Discipline::SimplePreempt => match self.peek_head_rate() {
                Some(head_rate) if head_rate > rate => Decision::Immediate { bypass: true },
                _ => Decision::Delay(self.params.max_waiting_time),
            },
            Discipline::SizeInterval => self.size_interval_decision(rate),
        }
    }

    /// The size-interval threshold: the shortest two groups, and any job
    /// whose delay budget is too small to make waiting worthwhile, dispatch
    /// immediately; everyone else waits `vary · ln(λD/1000) / D` of its own
    /// expected execution time, capped at 4 s.
    fn size_interval_decision(&self, rate: u32) -> Decision {
        let group = self
            .classes
            .group_index(rate)
            .unwrap_or_else(|| self.classes.group_count().saturating_sub(1));
        if group <= 1 {
            return Decision::Immediate { bypass: false };
        }

        let budget_ms = if self.params.alu_budget {
            self.classes.expected_exec_ms(rate) - self.stats.avg_exec_time_ms()
                + self.params.varx
        } else {
            rate as f64 - self.classes.short_edge() as f64 + self.params.varx
        };
        if self.params.lambda * budget_ms < 1000.0 {
            return Decision::Immediate { bypass: false };
        }

        let delay_ms = (self.params.vary * (self.params.lambda * budget_ms / 1000.0).ln()
            / budget_ms
            * self.classes.group_expected_exec_ms(group))
        .min(MAX_RELEASE_DELAY_MS)
        .max(0.0);
        Decision::Delay(Duration::from_secs_f64(delay_ms / 1000.0))
    }

    fn lifo_bias(&self) -> bool {
        !matches!(self.params.discipline, Discipline::Fifo)
    }

    fn lock_heap(&self) -> std::sync::MutexGuard<'_, BinaryHeap<PendingUnit>> {
        self.heap.lock().unwrap_or_else(|e| e.into_inner())
    }
}
