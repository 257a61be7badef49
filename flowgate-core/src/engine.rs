//! Engine assembly.
//!
//! Everything the original embedded in process-wide singletons lives here as
//! one explicit context: the load table, the execution statistics, the
//! admission queue, the balancer, and the throttler, wired together over the
//! dispatch channel and started as background tasks.

use crate::balance::Balancer;
use crate::classes::ClassTable;
use crate::config::EngineConfig;
use crate::dispatch::{DispatchItem, Dispatcher, Transport};
use crate::load::ReplicaLoadTable;
use crate::queue::{Admission, AdmissionQueue};
use crate::stats::ExecStats;
use crate::throttle::{PolicyThrottler, Throttler};
use crate::unit::{CompletionHandle, ProxyPayload, RequestMeta, RevisionId, SchedulingUnit};
use crate::workload::{CdfSet, WorkloadGenerator, WorkloadRegime};
use anyhow::Context;
use std::sync::Arc;
use tracing::info;

/// The admission/dispatch engine. Construct once with [`Engine::start`];
/// the frontend submits requests and awaits their completion handles.
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    classes: Arc<ClassTable>,
    load: Arc<ReplicaLoadTable>,
    stats: Arc<ExecStats>,
    queue: Arc<AdmissionQueue>,
    workload: Arc<WorkloadGenerator>,
    throttler: Arc<PolicyThrottler>,
}

impl Engine {
    /// Build the component graph and spawn the queue manager and dispatcher
    /// tasks. Must run inside a tokio runtime.
    pub fn start(config: EngineConfig, transport: Arc<dyn Transport>) -> anyhow::Result<Arc<Self>> {
        let classes = Arc::new(match config.regime {
            WorkloadRegime::AluUniform => ClassTable::alu_default(),
            _ => ClassTable::real_world_default(),
        });

        let cdfs = if config.regime.is_real_world() {
            CdfSet::load(&config.cdf_dir).with_context(|| {
                format!("loading workload CDFs from {}", config.cdf_dir.display())
            })?
        } else {
            CdfSet::default()
        };

        let load = Arc::new(ReplicaLoadTable::new(Arc::clone(&classes)));
        let stats = Arc::new(ExecStats::new());
        let workload = Arc::new(WorkloadGenerator::new(
            config.regime,
            Arc::clone(&classes),
            cdfs,
            config.workload_seed,
        ));

        let (dispatch_tx, dispatch_rx) = tokio::sync::mpsc::unbounded_channel::<DispatchItem>();

        let queue = AdmissionQueue::new(
            config.admission_params(),
            Arc::clone(&classes),
            Arc::clone(&stats),
            dispatch_tx.clone(),
        );

        let balancer = Arc::new(Balancer::new(
            Arc::clone(&load),
            Arc::clone(&queue),
            dispatch_tx,
            config.max_waiting_time(),
            config.fixed_wait(),
        ));
        let throttler = Arc::new(PolicyThrottler::new(balancer, config.acquire_timeout()));

        let dispatcher = Dispatcher::new(
            Arc::clone(&throttler) as Arc<dyn Throttler>,
            transport,
            Arc::clone(&load),
            Arc::clone(&stats),
            Arc::clone(&classes),
        );

        queue.spawn_manager();
        dispatcher.spawn(dispatch_rx);

        info!(
            discipline = ?config.discipline,
            policy = config.default_policy.as_str(),
            regime = ?config.regime,
            lambda = config.lambda,
            "engine started"
        );

        Ok(Arc::new(Self {
            config,
            classes,
            load,
            stats,
            queue,
            workload,
            throttler,
        }))
    }

    /// Submit one request. The unit enters the admission queue (or bypasses
    /// it, per discipline); the returned handle resolves exactly once with
    /// the dispatch outcome.
    pub fn submit(
        &self,
        rev: RevisionId,
        meta: RequestMeta,
        payload: ProxyPayload,
    ) -> (Admission, CompletionHandle) {
        let (unit, handle) = SchedulingUnit::new(rev, meta, payload);
        (self.queue.add_req(unit), handle)
    }

    /// Replace the replica set for a revision.
    pub fn set_targets(&self, rev: RevisionId, dests: Vec<String>) {
        self.throttler.set_targets(rev, dests);
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn classes(&self) -> &Arc<ClassTable> {
        &self.classes
    }

    pub fn load(&self) -> &Arc<ReplicaLoadTable> {
        &self.load
    }

    pub fn stats(&self) -> &Arc<ExecStats> {
        &self.stats
    }

    pub fn workload(&self) -> &Arc<WorkloadGenerator> {
        &self.workload
    }

    /// Units currently parked in the admission queue.
    pub fn queue_depth(&self) -> usize {
        self.queue.pending()
    }
}
