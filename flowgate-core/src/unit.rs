//! The scheduling unit: one admitted request on its way to a replica.

use crate::balance::PolicyKind;
use crate::error::DispatchError;
use bytes::Bytes;
use std::fmt;
use tokio::sync::{oneshot, watch};

/// Identifies the target function revision.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RevisionId {
    pub namespace: String,
    pub name: String,
}

impl RevisionId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Scheduling metadata stamped on every request by the frontend wrap.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    /// Declared service class tag.
    pub rate: u32,
    /// Arrival at the activator, unix milliseconds.
    pub arrive_ts_ms: f64,
    /// Rate tag of the request this one preempted, when admitted by
    /// preemption.
    pub last_rate: Option<String>,
    /// Sequence-head timestamp, set only on the tail of a real-world
    /// sequence.
    pub seq_start_ts_ms: Option<f64>,
    /// Load-balancing policy this unit should be dispatched with.
    pub policy: PolicyKind,
}

impl RequestMeta {
    pub fn new(rate: u32, policy: PolicyKind) -> Self {
        Self {
            rate,
            arrive_ts_ms: unix_millis(),
            last_rate: None,
            seq_start_ts_ms: None,
            policy,
        }
    }
}

/// The request material the dispatcher forwards to the chosen replica.
#[derive(Debug, Clone)]
pub struct ProxyPayload {
    pub method: http::Method,
    pub path_and_query: String,
    pub headers: http::HeaderMap,
    pub body: Bytes,
}

impl ProxyPayload {
    pub fn get(path_and_query: impl Into<String>) -> Self {
        Self {
            method: http::Method::GET,
            path_and_query: path_and_query.into(),
            headers: http::HeaderMap::new(),
            body: Bytes::new(),
        }
    }
}

/// What the replica answered.
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: http::StatusCode,
    pub headers: http::HeaderMap,
    pub body: Bytes,
}

/// Result delivered through a unit's completion channel.
pub type DispatchOutcome = Result<ProxyResponse, DispatchError>;

/// One request while it is owned by the engine: created by the frontend
/// wrap, parked in the admission queue until released, then owned by the
/// dispatcher until the completion sender is consumed.
#[derive(Debug)]
pub struct SchedulingUnit {
    pub rev: RevisionId,
    pub meta: RequestMeta,
    pub payload: ProxyPayload,
    completion: oneshot::Sender<DispatchOutcome>,
    binding_tx: watch::Sender<bool>,
}

/// The frontend's side of a submitted unit.
#[derive(Debug)]
pub struct CompletionHandle {
    /// Resolves exactly once with the dispatch outcome. Dropped by the
    /// frontend when its wall-clock ceiling fires; the engine's eventual
    /// send then fails harmlessly.
    pub outcome: oneshot::Receiver<DispatchOutcome>,
    /// Flips to `true` once the unit is bound to a replica.
    pub binding: watch::Receiver<bool>,
}

impl SchedulingUnit {
    pub fn new(
        rev: RevisionId,
        meta: RequestMeta,
        payload: ProxyPayload,
    ) -> (Self, CompletionHandle) {
        let (completion, outcome) = oneshot::channel();
        let (binding_tx, binding) = watch::channel(false);
        (
            Self {
                rev,
                meta,
                payload,
                completion,
                binding_tx,
            },
            CompletionHandle { outcome, binding },
        )
    }

    /// Watch the moment this unit is bound to a replica. Subscribe before
    /// handing the unit away; the signal is level-triggered, so a late
    /// subscriber still observes it.
    pub fn subscribe_binding(&self) -> watch::Receiver<bool> {
        self.binding_tx.subscribe()
    }

    /// Signal that a destination replica has accepted this unit.
    pub fn mark_bound(&self) {
        self.binding_tx.send_replace(true);
    }

    /// Deliver the final outcome, consuming the unit. The send fails only
    /// when the frontend already gave up on the request, which is fine.
    pub fn complete(self, outcome: DispatchOutcome) {
        let _ = self.completion.send(outcome);
    }
}

/// Current wall-clock time as fractional unix milliseconds, the format the
/// timestamp headers use.
pub fn unix_millis() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1000.0
}
