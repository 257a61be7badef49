//! Admission and dispatch engine for the Flowgate serverless ingress
//! activator.
//!
//! Requests for a function revision are held briefly in a central admission
//! queue, then dispatched to one of the revision's replicas. Admission is
//! size-aware — short jobs overtake longer ones that can afford to wait —
//! and dispatch balances load as the sum of in-flight declared demands via
//! power-of-two-choices, not raw connection counts.

pub mod balance;
pub mod classes;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod load;
pub mod queue;
pub mod stats;
pub mod throttle;
pub mod unit;
pub mod workload;

pub use balance::{Balancer, PodTracker, PolicyKind, Release};
pub use classes::{ClassTable, ServiceClass};
pub use config::EngineConfig;
pub use dispatch::{
    DispatchItem, Dispatcher, HEADER_ARRIVE_TIMESTAMP, HEADER_LAST_RATE, HEADER_RATE,
    HEADER_REQUEST_TIMESTAMP, HEADER_SEQ_START_TIME, Transport,
};
pub use engine::Engine;
pub use error::{AdmissionError, DispatchError, ThrottlerError, TransportError};
pub use load::{ReplicaLoad, ReplicaLoadTable};
pub use queue::{Admission, AdmissionParams, AdmissionQueue, Discipline};
pub use stats::{ArrivalTracker, ExecStats};
pub use throttle::{DispatchCx, DispatchFn, PolicyThrottler, Throttler};
pub use unit::{
    CompletionHandle, DispatchOutcome, ProxyPayload, ProxyResponse, RequestMeta, RevisionId,
    SchedulingUnit, unix_millis,
};
pub use workload::{Cdf, CdfSet, SequenceItem, SequencePlan, WorkloadGenerator, WorkloadRegime};
