//! Load-balancing policies.
//!
//! Every policy is a selection functor over the revision's replica set: it
//! returns the chosen tracker plus a release callback, invoked when the
//! request completes. Only the capacity-reserving weighted policy returns a
//! real callback; the rest are no-ops. Early-binding policies decide from
//! the load table as it stands; late-binding policies wait for idleness, and
//! the bounded-wait policy additionally lets a shorter queued job overtake
//! it mid-wait.

use crate::dispatch::DispatchItem;
use crate::load::ReplicaLoadTable;
use crate::queue::AdmissionQueue;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

/// Pause between probes when a policy spins waiting for idleness.
const SPIN_YIELD: Duration = Duration::from_millis(1);

/// How long the bounded-wait policy waits for a preempted unit to bind
/// before resuming its own wait.
const PREEMPT_BINDING_WAIT: Duration = Duration::from_secs(5);

/// One backend replica as the balancer sees it.
#[derive(Debug)]
pub struct PodTracker {
    /// `host:port` of the replica.
    pub dest: String,
    /// Capacity-reservation counter, used only by the weighted policy.
    weight: AtomicI32,
}

impl PodTracker {
    pub fn new(dest: impl Into<String>) -> Self {
        Self {
            dest: dest.into(),
            weight: AtomicI32::new(0),
        }
    }

    /// The host part of `dest`, the key into the load table.
    pub fn ip(&self) -> &str {
        self.dest.split(':').next().unwrap_or(&self.dest)
    }

    fn weight(&self) -> i32 {
        self.weight.load(Ordering::Relaxed)
    }

    fn increase_weight(&self) {
        self.weight.fetch_add(1, Ordering::Relaxed);
    }

    fn decrease_weight(&self) {
        self.weight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Callback invoked when the dispatched request completes.
pub type Release = Box<dyn FnOnce() + Send + Sync>;

fn noop() -> Release {
    Box::new(|| {})
}

/// The selection policies a request can be dispatched with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyKind {
    /// Uniform random pick.
    Random,
    /// Power-of-two-choices on the reservation weight.
    WeightedChoice2,
    /// Cursor walk with no idleness check.
    RoundRobin,
    /// Cursor walk that waits for a non-busy replica.
    LateRoundRobin,
    /// Late round-robin with a hard deadline, then an unconditional pick.
    FixedWaitRoundRobin,
    /// Power-of-two-choices on the in-flight rate sum.
    Choice2ByLoad,
    /// Two candidates, waiting until one is idle.
    LateChoice2,
    /// Two candidates with a bounded wait and mid-wait preemption.
    BoundedWaitChoice2,
}

impl PolicyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Random => "random",
            Self::WeightedChoice2 => "weighted-choice2",
            Self::RoundRobin => "round-robin",
            Self::LateRoundRobin => "late-round-robin",
            Self::FixedWaitRoundRobin => "fixed-wait-round-robin",
            Self::Choice2ByLoad => "choice2",
            Self::LateChoice2 => "late-choice2",
            Self::BoundedWaitChoice2 => "bounded-wait-choice2",
        }
    }
}

impl FromStr for PolicyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "random" => Ok(Self::Random),
            "weighted-choice2" => Ok(Self::WeightedChoice2),
            "round-robin" => Ok(Self::RoundRobin),
            "late-round-robin" => Ok(Self::LateRoundRobin),
            "fixed-wait-round-robin" => Ok(Self::FixedWaitRoundRobin),
            "choice2" => Ok(Self::Choice2ByLoad),
            "late-choice2" => Ok(Self::LateChoice2),
            "bounded-wait-choice2" => Ok(Self::BoundedWaitChoice2),
            other => Err(format!("unknown lb policy {other:?}")),
        }
    }
}

/// Runs the selection policies. One balancer serves the whole process; the
/// round-robin cursor and the preemption plumbing live here.
pub struct Balancer {
    load: Arc<ReplicaLoadTable>,
    queue: Arc<AdmissionQueue>,
    injector: mpsc::UnboundedSender<DispatchItem>,
    rr_cursor: Mutex<usize>,
    /// Ceiling for the bounded-wait policy, `1000/λ` ms.
    max_waiting_time: Duration,
    /// Deadline for the fixed-wait round-robin scan.
    fixed_wait: Duration,
}

impl std::fmt::Debug for Balancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Balancer")
            .field("max_waiting_time", &self.max_waiting_time)
            .field("fixed_wait", &self.fixed_wait)
            .finish_non_exhaustive()
    }
}

impl Balancer {
    pub fn new(
        load: Arc<ReplicaLoadTable>,
        queue: Arc<AdmissionQueue>,
        injector: mpsc::UnboundedSender<DispatchItem>,
        max_waiting_time: Duration,
        fixed_wait: Duration,
    ) -> Self {
        Self {
            load,
            queue,
            injector,
            rr_cursor: Mutex::new(0),
            max_waiting_time,
            fixed_wait,
        }
    }

    /// Select a replica for a request with the given declared rate. Returns
    /// `None` only when the target list is empty.
    pub async fn pick(
        &self,
        kind: PolicyKind,
        targets: &[Arc<PodTracker>],
        rate: u32,
    ) -> (Release, Option<Arc<PodTracker>>) {
        if targets.is_empty() {
            return (noop(), None);
        }
        match kind {
            PolicyKind::Random => self.random(targets),
            PolicyKind::WeightedChoice2 => self.weighted_choice2(targets),
            PolicyKind::RoundRobin => self.round_robin(targets),
            PolicyKind::LateRoundRobin => self.late_round_robin(targets).await,
            PolicyKind::FixedWaitRoundRobin => self.fixed_wait_round_robin(targets).await,
            PolicyKind::Choice2ByLoad => self.choice2_by_load(targets),
            PolicyKind::LateChoice2 => self.late_choice2(targets).await,
            PolicyKind::BoundedWaitChoice2 => self.bounded_wait_choice2(targets, rate).await,
        }
    }

    fn random(&self, targets: &[Arc<PodTracker>]) -> (Release, Option<Arc<PodTracker>>) {
        let mut rng = rand::rng();
        let pick = targets[rng.random_range(0..targets.len())].clone();
        (noop(), Some(pick))
    }

    fn weighted_choice2(&self, targets: &[Arc<PodTracker>]) -> (Release, Option<Arc<PodTracker>>) {
        if targets.len() == 1 {
            let pick = targets[0].clone();
            pick.increase_weight();
            let released = pick.clone();
            return (Box::new(move || released.decrease_weight()), Some(pick));
        }

        let (r1, r2) = draw_two(targets.len());
        let mut pick = targets[r1].clone();
        let alt = targets[r2].clone();
        // The weight read races with concurrent increments; tolerable since
        // this policy only serves unlimited-concurrency revisions.
        if pick.weight() > alt.weight() {
            pick = alt;
        } else if pick.weight() == alt.weight() && rand::rng().random_bool(0.5) {
            pick = alt;
        }
        pick.increase_weight();
        let released = pick.clone();
        (Box::new(move || released.decrease_weight()), Some(pick))
    }

    fn round_robin(&self, targets: &[Arc<PodTracker>]) -> (Release, Option<Arc<PodTracker>>) {
        let mut cursor = self.lock_cursor();
        let idx = *cursor % targets.len();
        *cursor = (idx + 1) % targets.len();
        (noop(), Some(targets[idx].clone()))
    }

    async fn late_round_robin(
        &self,
        targets: &[Arc<PodTracker>],
    ) -> (Release, Option<Arc<PodTracker>>) {
        loop {
            if let Some(pick) = self.scan_for_idle(targets) {
                return (noop(), Some(pick));
            }
            tokio::time::sleep(SPIN_YIELD).await;
        }
    }

    async fn fixed_wait_round_robin(
        &self,
        targets: &[Arc<PodTracker>],
    ) -> (Release, Option<Arc<PodTracker>>) {
        let deadline = Instant::now() + self.fixed_wait;
        loop {
            if let Some(pick) = self.scan_for_idle(targets) {
                return (noop(), Some(pick));
            }
            if Instant::now() >= deadline {
                // Out of patience: take whatever the cursor points at.
                let idx = *self.lock_cursor() % targets.len();
                return (noop(), Some(targets[idx].clone()));
            }
            tokio::time::sleep(SPIN_YIELD).await;
        }
    }

    /// One cursor pass over the targets; picks and advances past the first
    /// non-busy replica.
    fn scan_for_idle(&self, targets: &[Arc<PodTracker>]) -> Option<Arc<PodTracker>> {
        let mut cursor = self.lock_cursor();
        let start = *cursor % targets.len();
        for i in 0..targets.len() {
            let idx = (start + i) % targets.len();
            if !self.load.is_busy(targets[idx].ip()) {
                *cursor = (idx + 1) % targets.len();
                return Some(targets[idx].clone());
            }
        }
        None
    }

    fn choice2_by_load(&self, targets: &[Arc<PodTracker>]) -> (Release, Option<Arc<PodTracker>>) {
        if targets.len() == 1 {
            return (noop(), Some(targets[0].clone()));
        }
        let (r1, r2) = draw_two(targets.len());
        let (pick1, pick2) = (targets[r1].clone(), targets[r2].clone());
        let chosen = if self.load.choose_by_rate(pick1.ip(), pick2.ip()) == pick1.ip() {
            pick1
        } else {
            pick2
        };
        (noop(), Some(chosen))
    }

    async fn late_choice2(&self, targets: &[Arc<PodTracker>]) -> (Release, Option<Arc<PodTracker>>) {
        if targets.len() == 1 {
            return (noop(), Some(targets[0].clone()));
        }
        let (r1, r2) = draw_two(targets.len());
        let (pick1, pick2) = (targets[r1].clone(), targets[r2].clone());
        loop {
            match self.load.choose_idle(pick1.ip(), pick2.ip()) {
                Some(ip) if ip == pick1.ip() => return (noop(), Some(pick1)),
                Some(_) => return (noop(), Some(pick2)),
                None => tokio::time::sleep(SPIN_YIELD).await,
            }
        }
    }

    /// Wait up to `max_waiting_time` for one of two candidates to go idle.
    /// While waiting, any queued job shorter than this one is stolen from
    /// the queue head and dispatched ahead (with the simple power-of-two
    /// policy); the wait clock is frozen for the handover. On deadline the
    /// lighter candidate wins.
    async fn bounded_wait_choice2(
        &self,
        targets: &[Arc<PodTracker>],
        rate: u32,
    ) -> (Release, Option<Arc<PodTracker>>) {
        if targets.len() == 1 {
            return (noop(), Some(targets[0].clone()));
        }
        let (r1, r2) = draw_two(targets.len());
        let (pick1, pick2) = (targets[r1].clone(), targets[r2].clone());

        let mut deadline = Instant::now() + self.max_waiting_time;
        loop {
            if Instant::now() >= deadline {
                let chosen = if self.load.choose_by_rate(pick1.ip(), pick2.ip()) == pick1.ip() {
                    pick1
                } else {
                    pick2
                };
                return (noop(), Some(chosen));
            }

            if self
                .queue
                .peek_head_rate()
                .is_some_and(|head_rate| head_rate < rate)
            {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if let Some(mut stolen) = self.queue.steal_head_if(|head_rate| head_rate < rate) {
                    debug!(
                        own_rate = rate,
                        stolen_rate = stolen.meta.rate,
                        "letting a shorter queued job overtake"
                    );
                    stolen.meta.last_rate = Some(rate.to_string());
                    let mut binding = stolen.subscribe_binding();
                    if self
                        .injector
                        .send(DispatchItem {
                            unit: stolen,
                            policy_override: Some(PolicyKind::Choice2ByLoad),
                        })
                        .is_ok()
                    {
                        let _ = tokio::time::timeout(
                            PREEMPT_BINDING_WAIT,
                            binding.wait_for(|bound| *bound),
                        )
                        .await;
                    }
                }
                deadline = Instant::now() + remaining;
                continue;
            }

            match self.load.choose_idle(pick1.ip(), pick2.ip()) {
                Some(ip) if ip == pick1.ip() => return (noop(), Some(pick1)),
                Some(_) => return (noop(), Some(pick2)),
                None => tokio::time::sleep(SPIN_YIELD).await,
            }
        }
    }

    fn lock_cursor(&self) -> std::sync::MutexGuard<'_, usize> {
        self.rr_cursor.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Two distinct uniform indices in `0..len`. Shifting the second draw past
/// the first keeps it uniform over the remaining `len - 1` slots.
fn draw_two(len: usize) -> (usize, usize) {
    debug_assert!(len >= 2);
    let mut rng = rand::rng();
    let r1 = rng.random_range(0..len);
    let mut r2 = rng.random_range(0..len - 1);
    if r2 >= r1 {
        r2 += 1;
    }
    (r1, r2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classes::ClassTable;
    use crate::queue::{AdmissionParams, AdmissionQueue, Discipline};
    use crate::stats::ExecStats;
    use crate::unit::{ProxyPayload, RequestMeta, RevisionId, SchedulingUnit};

    fn balancer() -> (Balancer, mpsc::UnboundedReceiver<DispatchItem>, Arc<ReplicaLoadTable>) {
        let classes = Arc::new(ClassTable::alu_default());
        let load = Arc::new(ReplicaLoadTable::new(classes.clone()));
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = AdmissionQueue::new(
            AdmissionParams {
                discipline: Discipline::SimplePreempt,
                capacity: 64,
                lambda: 50.0,
                varx: 750.0,
                vary: 40.0,
                max_waiting_time: Duration::from_millis(20),
                alu_budget: false,
            },
            classes,
            Arc::new(ExecStats::new()),
            tx.clone(),
        );
        (
            Balancer::new(
                load.clone(),
                queue,
                tx,
                Duration::from_millis(20),
                Duration::from_millis(20),
            ),
            rx,
            load,
        )
    }

    fn targets(dests: &[&str]) -> Vec<Arc<PodTracker>> {
        dests.iter().map(|d| Arc::new(PodTracker::new(*d))).collect()
    }

    #[test]
    fn test_policy_wire_names_round_trip() {
        for kind in [
            PolicyKind::Random,
            PolicyKind::WeightedChoice2,
            PolicyKind::RoundRobin,
            PolicyKind::LateRoundRobin,
            PolicyKind::FixedWaitRoundRobin,
            PolicyKind::Choice2ByLoad,
            PolicyKind::LateChoice2,
            PolicyKind::BoundedWaitChoice2,
        ] {
            assert_eq!(kind.as_str().parse::<PolicyKind>().unwrap(), kind);
        }
        assert!("no-such-policy".parse::<PolicyKind>().is_err());
    }

    #[test]
    fn test_draw_two_distinct_and_uniform() {
        let mut seen = [[0u32; 4]; 4];
        for _ in 0..4000 {
            let (r1, r2) = draw_two(4);
            assert_ne!(r1, r2);
            seen[r1][r2] += 1;
        }
        // All 12 ordered pairs occur.
        for r1 in 0..4 {
            for r2 in 0..4 {
                if r1 != r2 {
                    assert!(seen[r1][r2] > 0, "pair ({r1},{r2}) never drawn");
                }
            }
        }
    }

    #[tokio::test]
    async fn test_choice2_by_load_prefers_lighter() {
        let (balancer, _rx, load) = balancer();
        let targets = targets(&["10.0.0.1:80", "10.0.0.2:80"]);
        load.add_req("10.0.0.1", 1000);
        load.add_req("10.0.0.2", 50);

        for _ in 0..16 {
            let (_, pick) = balancer
                .pick(PolicyKind::Choice2ByLoad, &targets, 500)
                .await;
            assert_eq!(pick.unwrap().ip(), "10.0.0.2");
        }
    }

    #[tokio::test]
    async fn test_late_choice2_returns_idle() {
        let (balancer, _rx, load) = balancer();
        let targets = targets(&["10.0.0.1:80", "10.0.0.2:80"]);
        load.add_req("10.0.0.1", 200);

        let (_, pick) = balancer.pick(PolicyKind::LateChoice2, &targets, 500).await;
        assert_eq!(pick.unwrap().ip(), "10.0.0.2");
    }

    #[tokio::test]
    async fn test_weighted_choice2_reserves_and_releases() {
        let (balancer, _rx, _load) = balancer();
        let targets = targets(&["10.0.0.1:80", "10.0.0.2:80"]);

        let (release, pick) = balancer
            .pick(PolicyKind::WeightedChoice2, &targets, 500)
            .await;
        let pick = pick.unwrap();
        assert_eq!(pick.weight(), 1);

        // The loaded replica loses the next draw.
        let (release2, other) = balancer
            .pick(PolicyKind::WeightedChoice2, &targets, 500)
            .await;
        let other = other.unwrap();
        assert_ne!(other.dest, pick.dest);

        release();
        release2();
        assert_eq!(pick.weight(), 0);
        assert_eq!(other.weight(), 0);
    }

    #[tokio::test]
    async fn test_round_robin_cycles() {
        let (balancer, _rx, _load) = balancer();
        let targets = targets(&["a:80", "b:80", "c:80"]);
        let mut order = Vec::new();
        for _ in 0..6 {
            let (_, pick) = balancer.pick(PolicyKind::RoundRobin, &targets, 100).await;
            order.push(pick.unwrap().ip().to_string());
        }
        assert_eq!(order, ["a", "b", "c", "a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_late_round_robin_skips_busy() {
        let (balancer, _rx, load) = balancer();
        let targets = targets(&["a:80", "b:80", "c:80"]);
        load.add_req("a", 400);

        let (_, pick) = balancer.pick(PolicyKind::LateRoundRobin, &targets, 100).await;
        assert_eq!(pick.unwrap().ip(), "b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_wait_round_robin_gives_up() {
        let (balancer, _rx, load) = balancer();
        let targets = targets(&["a:80", "b:80"]);
        load.add_req("a", 400);
        load.add_req("b", 400);

        let started = Instant::now();
        let (_, pick) = balancer
            .pick(PolicyKind::FixedWaitRoundRobin, &targets, 100)
            .await;
        assert!(pick.is_some());
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_wait_falls_back_to_lighter() {
        let (balancer, _rx, load) = balancer();
        let targets = targets(&["a:80", "b:80"]);
        load.add_req("a", 500);
        load.add_req("b", 300);

        let (_, pick) = balancer
            .pick(PolicyKind::BoundedWaitChoice2, &targets, 500)
            .await;
        assert_eq!(pick.unwrap().ip(), "b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_wait_takes_idle_early() {
        let (balancer, _rx, load) = balancer();
        let targets = targets(&["a:80", "b:80"]);
        load.add_req("a", 500);

        let started = Instant::now();
        let (_, pick) = balancer
            .pick(PolicyKind::BoundedWaitChoice2, &targets, 500)
            .await;
        assert_eq!(pick.unwrap().ip(), "b");
        assert!(started.elapsed() < Duration::from_millis(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_wait_preempts_shorter_head() {
        let (balancer, mut rx, load) = balancer();
        let targets = targets(&["a:80", "b:80"]);
        load.add_req("a", 500);
        load.add_req("b", 500);

        // A shorter job is waiting at the queue head.
        let (short, _handle) = SchedulingUnit::new(
            RevisionId::new("default", "alu-1"),
            RequestMeta::new(100, PolicyKind::BoundedWaitChoice2),
            ProxyPayload::get("/"),
        );
        balancer.queue.add_req(short);
        assert_eq!(balancer.queue.pending(), 1);

        let waiter = tokio::spawn(async move {
            balancer
                .pick(PolicyKind::BoundedWaitChoice2, &targets, 500)
                .await
        });

        // The stolen head arrives at the dispatcher with the override and
        // the preempting request's rate recorded.
        let stolen = rx.recv().await.unwrap();
        assert_eq!(stolen.unit.meta.rate, 100);
        assert_eq!(stolen.unit.meta.last_rate.as_deref(), Some("500"));
        assert_eq!(stolen.policy_override, Some(PolicyKind::Choice2ByLoad));

        // Binding the stolen unit lets the outer wait resume; on deadline it
        // falls back to the lighter-loaded candidate.
        stolen.unit.mark_bound();
        let (_, pick) = waiter.await.unwrap();
        assert!(pick.is_some());
    }
}
