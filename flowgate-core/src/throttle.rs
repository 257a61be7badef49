//! Revision throttling: the gate between a released unit and its replica.
//!
//! The contract mirrors what the dispatcher needs and nothing more: hand me
//! a revision and a dispatch callback, call the callback at most once with a
//! `host:port` when a replica is available, and tell me why if you cannot.

use crate::balance::{Balancer, PodTracker, PolicyKind};
use crate::error::{ThrottlerError, TransportError};
use crate::unit::RevisionId;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// The dispatch callback: proxies the request to the destination the
/// throttler picked. Invoked at most once.
pub type DispatchFn =
    Box<dyn FnOnce(String) -> BoxFuture<'static, Result<(), TransportError>> + Send>;

/// Per-request scheduling context the throttler selects with.
#[derive(Debug, Clone, Copy)]
pub struct DispatchCx {
    pub rate: u32,
    pub policy: PolicyKind,
}

#[async_trait]
pub trait Throttler: Send + Sync {
    /// Acquire a replica for `rev` and run `dispatch` against it.
    async fn try_send(
        &self,
        rev: &RevisionId,
        cx: DispatchCx,
        dispatch: DispatchFn,
    ) -> Result<(), ThrottlerError>;
}

/// The in-process throttler: holds the known replica set per revision and
/// runs the configured balancing policy over it. Replica sets are swapped
/// wholesale by whatever discovery feeds this process.
pub struct PolicyThrottler {
    balancer: Arc<Balancer>,
    targets: DashMap<RevisionId, Arc<Vec<Arc<PodTracker>>>>,
    /// Ceiling on one acquisition, covering any late-binding spin.
    acquire_timeout: Duration,
}

impl std::fmt::Debug for PolicyThrottler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyThrottler")
            .field("revisions", &self.targets.len())
            .field("acquire_timeout", &self.acquire_timeout)
            .finish_non_exhaustive()
    }
}

impl PolicyThrottler {
    pub fn new(balancer: Arc<Balancer>, acquire_timeout: Duration) -> Self {
        Self {
            balancer,
            targets: DashMap::new(),
            acquire_timeout,
        }
    }

    /// Replace the replica set for a revision.
    pub fn set_targets(&self, rev: RevisionId, dests: Vec<String>) {
        let trackers: Vec<Arc<PodTracker>> =
            dests.into_iter().map(|d| Arc::new(PodTracker::new(d))).collect();
        debug!(rev = %rev, replicas = trackers.len(), "replica set updated");
        self.targets.insert(rev, Arc::new(trackers));
    }

    pub fn targets_for(&self, rev: &RevisionId) -> Option<Arc<Vec<Arc<PodTracker>>>> {
        self.targets.get(rev).map(|entry| entry.value().clone())
    }
}

#[async_trait]
impl Throttler for PolicyThrottler {
    async fn try_send(
        &self,
        rev: &RevisionId,
        cx: DispatchCx,
        dispatch: DispatchFn,
    ) -> Result<(), ThrottlerError> {
        let targets = self
            .targets_for(rev)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ThrottlerError::NoReplicas(rev.to_string()))?;

        let (release, pick) = tokio::time::timeout(
            self.acquire_timeout,
            self.balancer.pick(cx.policy, &targets, cx.rate),
        )
        .await
        .map_err(|_| ThrottlerError::DeadlineExceeded)?;

        let Some(pick) = pick else {
            return Err(ThrottlerError::NoReplicas(rev.to_string()));
        };

        let result = dispatch(pick.dest.clone()).await;
        release();
        result.map_err(ThrottlerError::Transport)
    }
}
