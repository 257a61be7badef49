//! The dispatcher: takes released units off the queue, acquires a replica
//! through the throttler, credits the load table, and proxies the request.
//!
//! Every unit runs on its own task, so one slow replica never blocks the
//! release stream. The dispatcher also receives units injected around the
//! queue: simple-preempt bypasses and heads stolen mid-wait by the
//! bounded-wait policy.

use crate::balance::PolicyKind;
use crate::classes::ClassTable;
use crate::error::TransportError;
use crate::load::ReplicaLoadTable;
use crate::stats::ExecStats;
use crate::throttle::{DispatchCx, DispatchFn, Throttler};
use crate::unit::{ProxyPayload, ProxyResponse, SchedulingUnit, unix_millis};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Outbound header carrying the moment the proxy forwarded the request.
pub const HEADER_REQUEST_TIMESTAMP: &str = "x-request-timestamp";
/// Outbound header carrying the activator arrival time.
pub const HEADER_ARRIVE_TIMESTAMP: &str = "x-arrive-timestamp";
/// Declared service-class tag.
pub const HEADER_RATE: &str = "x-rate";
/// Rate of the request this one preempted; empty unless admitted by
/// preemption.
pub const HEADER_LAST_RATE: &str = "x-last-rate";
/// Sequence-head timestamp, non-zero only on the tail of a real-world
/// sequence.
pub const HEADER_SEQ_START_TIME: &str = "x-seq-start-time";

/// One unit on its way to the dispatcher, optionally with the policy forced
/// by whoever injected it.
#[derive(Debug)]
pub struct DispatchItem {
    pub unit: SchedulingUnit,
    pub policy_override: Option<PolicyKind>,
}

/// The transport that actually moves bytes to a replica. Implemented by the
/// host process; the engine never opens connections itself.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn proxy(
        &self,
        dest: &str,
        payload: &ProxyPayload,
    ) -> Result<ProxyResponse, TransportError>;
}

/// Routes released units onto per-unit dispatch tasks.
pub struct Dispatcher {
    throttler: Arc<dyn Throttler>,
    transport: Arc<dyn Transport>,
    load: Arc<ReplicaLoadTable>,
    stats: Arc<ExecStats>,
    classes: Arc<ClassTable>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(
        throttler: Arc<dyn Throttler>,
        transport: Arc<dyn Transport>,
        load: Arc<ReplicaLoadTable>,
        stats: Arc<ExecStats>,
        classes: Arc<ClassTable>,
    ) -> Arc<Self> {
        Arc::new(Self {
            throttler,
            transport,
            load,
            stats,
            classes,
        })
    }

    /// Consume the dispatch channel, spawning one task per unit.
    pub fn spawn(self: &Arc<Self>, rx: mpsc::UnboundedReceiver<DispatchItem>) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move { dispatcher.route(rx).await })
    }

    async fn route(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<DispatchItem>) {
        info!("dispatcher started");
        while let Some(item) = rx.recv().await {
            let dispatcher = Arc::clone(&self);
            tokio::spawn(async move { dispatcher.dispatch(item).await });
        }
        info!("dispatcher stopped");
    }

    /// Dispatch one unit end to end. The unit's completion channel resolves
    /// exactly once: either inside the proxy path or on the throttler error
    /// path, never both.
    pub async fn dispatch(self: Arc<Self>, item: DispatchItem) {
        let DispatchItem {
            unit,
            policy_override,
        } = item;
        let rev = unit.rev.clone();
        let cx = DispatchCx {
            rate: unit.meta.rate,
            policy: policy_override.unwrap_or(unit.meta.policy),
        };

        // The callback consumes the unit at most once; whatever is left in
        // the slot after a throttler failure still needs its completion.
        let slot = Arc::new(Mutex::new(Some(unit)));
        let cb_slot = Arc::clone(&slot);
        let this = Arc::clone(&self);
        let dispatch_fn: DispatchFn = Box::new(move |dest| {
            Box::pin(async move {
                let taken = cb_slot.lock().unwrap_or_else(|e| e.into_inner()).take();
                match taken {
                    Some(unit) => this.proxy_unit(unit, dest).await,
                    None => Ok(()),
                }
            })
        });

        if let Err(err) = self.throttler.try_send(&rev, cx, dispatch_fn).await {
            error!(rev = %rev, error = %err, "throttler try error");
            let leftover = slot.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(unit) = leftover {
                unit.complete(Err(err.into()));
            }
        }
    }

    async fn proxy_unit(
        &self,
        mut unit: SchedulingUnit,
        dest: String,
    ) -> Result<(), TransportError> {
        let ip = dest.split(':').next().unwrap_or(dest.as_str()).to_string();
        let rate = unit.meta.rate;

        self.load.add_req(&ip, rate);
        self.stats.add_job(self.classes.expected_exec_ms(rate));
        stamp_outbound_headers(&mut unit);
        // Bound to a replica: anyone waiting on this unit's admission can
        // proceed.
        unit.mark_bound();

        let result = self.transport.proxy(&dest, &unit.payload).await;
        self.load.del_req(&ip, rate);

        match result {
            Ok(response) => {
                unit.complete(Ok(response));
                Ok(())
            }
            Err(err) => {
                warn!(rev = %unit.rev, dest, error = %err, "proxy failed");
                unit.complete(Err(err.clone().into()));
                Err(err)
            }
        }
    }
}

fn stamp_outbound_headers(unit: &mut SchedulingUnit) {
    let headers = &mut unit.payload.headers;
    set_header(headers, HEADER_RATE, &unit.meta.rate.to_string());
    set_header(headers, HEADER_REQUEST_TIMESTAMP, &unix_millis().to_string());
    set_header(
        headers,
        HEADER_ARRIVE_TIMESTAMP,
        &unit.meta.arrive_ts_ms.to_string(),
    );
    set_header(
        headers,
        HEADER_LAST_RATE,
        unit.meta.last_rate.as_deref().unwrap_or(""),
    );
    if let Some(seq_start) = unit.meta.seq_start_ts_ms {
        set_header(headers, HEADER_SEQ_START_TIME, &seq_start.to_string());
    }
}

fn set_header(headers: &mut http::HeaderMap, name: &'static str, value: &str) {
    match http::HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(_) => warn!(name, value, "dropping unencodable header"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DispatchError, ThrottlerError};
    use crate::unit::{RequestMeta, RevisionId};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Throttler that always offers the same destination.
    struct FixedThrottler {
        dest: String,
    }

    #[async_trait]
    impl Throttler for FixedThrottler {
        async fn try_send(
            &self,
            _rev: &RevisionId,
            _cx: DispatchCx,
            dispatch: DispatchFn,
        ) -> Result<(), ThrottlerError> {
            dispatch(self.dest.clone())
                .await
                .map_err(ThrottlerError::Transport)
        }
    }

    /// Throttler that refuses every request.
    struct DeadThrottler;

    #[async_trait]
    impl Throttler for DeadThrottler {
        async fn try_send(
            &self,
            _rev: &RevisionId,
            _cx: DispatchCx,
            _dispatch: DispatchFn,
        ) -> Result<(), ThrottlerError> {
            Err(ThrottlerError::DeadlineExceeded)
        }
    }

    /// Transport that records what it proxied.
    #[derive(Default)]
    struct RecordingTransport {
        calls: AtomicU32,
        seen: Mutex<Vec<(String, http::HeaderMap)>>,
        fail: bool,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn proxy(
            &self,
            dest: &str,
            payload: &ProxyPayload,
        ) -> Result<ProxyResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen
                .lock()
                .unwrap()
                .push((dest.to_string(), payload.headers.clone()));
            if self.fail {
                return Err(TransportError::new(dest, "connection reset"));
            }
            Ok(ProxyResponse {
                status: http::StatusCode::OK,
                headers: http::HeaderMap::new(),
                body: bytes::Bytes::from_static(b"ok"),
            })
        }
    }

    fn dispatcher(
        throttler: Arc<dyn Throttler>,
        transport: Arc<RecordingTransport>,
    ) -> (Arc<Dispatcher>, Arc<ReplicaLoadTable>, Arc<ExecStats>) {
        let classes = Arc::new(ClassTable::alu_default());
        let load = Arc::new(ReplicaLoadTable::new(classes.clone()));
        let stats = Arc::new(ExecStats::new());
        (
            Dispatcher::new(throttler, transport, load.clone(), stats.clone(), classes),
            load,
            stats,
        )
    }

    fn item(rate: u32) -> (DispatchItem, crate::unit::CompletionHandle) {
        let (unit, handle) = SchedulingUnit::new(
            RevisionId::new("default", "alu-1"),
            RequestMeta::new(rate, PolicyKind::Choice2ByLoad),
            ProxyPayload::get("/compute"),
        );
        (
            DispatchItem {
                unit,
                policy_override: None,
            },
            handle,
        )
    }

    #[tokio::test]
    async fn test_successful_dispatch_credits_and_debits() {
        let transport = Arc::new(RecordingTransport::default());
        let (dispatcher, load, stats) = dispatcher(
            Arc::new(FixedThrottler {
                dest: "10.0.0.1:8080".into(),
            }),
            transport.clone(),
        );

        let (item, handle) = item(700);
        let mut binding = handle.binding;
        dispatcher.dispatch(item).await;

        let response = handle.outcome.await.unwrap().unwrap();
        assert_eq!(response.status, http::StatusCode::OK);
        assert!(*binding.borrow_and_update());

        // Load was credited for the duration of the proxy and debited after.
        assert_eq!(load.rate_sum("10.0.0.1"), 0);
        assert_eq!(load.job_num("10.0.0.1"), 0);
        assert_eq!(stats.total_job_num(), 1);
        assert_eq!(stats.avg_exec_time_ms(), 700.0);

        let seen = transport.seen.lock().unwrap();
        let (dest, headers) = &seen[0];
        assert_eq!(dest, "10.0.0.1:8080");
        assert_eq!(headers.get(HEADER_RATE).unwrap(), "700");
        assert_eq!(headers.get(HEADER_LAST_RATE).unwrap(), "");
        assert!(headers.contains_key(HEADER_REQUEST_TIMESTAMP));
        assert!(headers.contains_key(HEADER_ARRIVE_TIMESTAMP));
        assert!(!headers.contains_key(HEADER_SEQ_START_TIME));
    }

    #[tokio::test]
    async fn test_transport_error_completes_with_502() {
        let transport = Arc::new(RecordingTransport {
            fail: true,
            ..Default::default()
        });
        let (dispatcher, load, _stats) = dispatcher(
            Arc::new(FixedThrottler {
                dest: "10.0.0.1:8080".into(),
            }),
            transport.clone(),
        );

        let (item, handle) = item(700);
        dispatcher.dispatch(item).await;

        let outcome = handle.outcome.await.unwrap();
        let err = outcome.unwrap_err();
        assert!(matches!(err, DispatchError::Transport(_)));
        assert_eq!(err.status_code(), 502);
        // Exactly one transport call, and the debit still happened.
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert_eq!(load.rate_sum("10.0.0.1"), 0);
    }

    #[tokio::test]
    async fn test_throttler_error_completes_unit() {
        let transport = Arc::new(RecordingTransport::default());
        let (dispatcher, _load, stats) = dispatcher(Arc::new(DeadThrottler), transport.clone());

        let (item, handle) = item(700);
        dispatcher.dispatch(item).await;

        let outcome = handle.outcome.await.unwrap();
        let err = outcome.unwrap_err();
        assert!(matches!(err, DispatchError::ThrottlerDeadline));
        assert_eq!(err.status_code(), 503);
        // Never reached a replica.
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
        assert_eq!(stats.total_job_num(), 0);
    }

    #[tokio::test]
    async fn test_seq_start_header_only_when_present() {
        let transport = Arc::new(RecordingTransport::default());
        let (dispatcher, _load, _stats) = dispatcher(
            Arc::new(FixedThrottler {
                dest: "10.0.0.1:8080".into(),
            }),
            transport.clone(),
        );

        let (mut item, handle) = item(700);
        item.unit.meta.seq_start_ts_ms = Some(1234.5);
        item.unit.meta.last_rate = Some("500".into());
        dispatcher.dispatch(item).await;
        handle.outcome.await.unwrap().unwrap();

        let seen = transport.seen.lock().unwrap();
        let (_, headers) = &seen[0];
        assert_eq!(headers.get(HEADER_SEQ_START_TIME).unwrap(), "1234.5");
        assert_eq!(headers.get(HEADER_LAST_RATE).unwrap(), "500");
    }
}
