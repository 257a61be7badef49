//! The frontend wrap: turns each incoming HTTP request into one or more
//! scheduling units, submits them to the engine, and waits out the dispatch
//! with a wall-clock ceiling.
//!
//! Revision names select the workload mode: `alu-*` draws a uniform class
//! tag per call, `real-world-*` expands the call into a CDF-shaped
//! invocation sequence, and anything else passes the client's declared rate
//! through untouched.

use crate::AppState;
use crate::errors::{AppError, AppResult};
use axum::body::{Body, to_bytes};
use axum::extract::State;
use axum::http::Request;
use axum::response::{IntoResponse, Response};
use bytes::BytesMut;
use flowgate_core::{
    PolicyKind, ProxyPayload, ProxyResponse, RequestMeta, RevisionId, unix_millis,
};
use std::time::Duration;
use tracing::{debug, warn};

/// Revision the request targets, when the frontend proxy forwards it.
pub const HEADER_NAMESPACE: &str = "x-flowgate-namespace";
pub const HEADER_REVISION: &str = "x-flowgate-revision";
/// Per-request policy override.
pub const HEADER_LB_POLICY: &str = "x-lbpolicy";
/// Client-declared service class, honored only outside the benchmark modes.
pub const HEADER_RATE: &str = "x-rate";

const ALU_PREFIX: &str = "alu-";
const REAL_WORLD_PREFIX: &str = "real-world-";

pub async fn activate(State(state): State<AppState>, req: Request<Body>) -> Response {
    match handle(state, req).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn handle(state: AppState, req: Request<Body>) -> AppResult<Response> {
    let rev = resolve_revision(req.headers(), &state);
    let policy = resolve_policy(req.headers(), &state);

    let (parts, body) = req.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let body = to_bytes(body, state.config.max_body_bytes)
        .await
        .map_err(|err| AppError::bad_request(format!("failed to buffer request body: {err}")))?;

    let mut payload = ProxyPayload {
        method: parts.method,
        path_and_query,
        headers: parts.headers,
        body,
    };
    if state.config.passthrough_lb {
        set_passthrough_host(&mut payload, &rev);
    }

    if rev.name.starts_with(REAL_WORLD_PREFIX) {
        run_sequence(&state, rev, payload, policy).await
    } else if rev.name.starts_with(ALU_PREFIX) {
        run_alu(&state, rev, payload, policy).await
    } else {
        run_passthrough(&state, rev, payload, policy).await
    }
}

/// ALU mode: one uniform class draw per incoming call.
async fn run_alu(
    state: &AppState,
    rev: RevisionId,
    payload: ProxyPayload,
    policy: PolicyKind,
) -> AppResult<Response> {
    let rate = state.engine.workload().alu_rate();
    debug!(rev = %rev, rate, "generated alu rate");
    let meta = RequestMeta::new(rate, policy);
    let response = await_outcome(state, rev, meta, payload, false).await?;
    Ok(proxied(response))
}

/// Passthrough: the client's declared rate rides along unchanged.
async fn run_passthrough(
    state: &AppState,
    rev: RevisionId,
    payload: ProxyPayload,
    policy: PolicyKind,
) -> AppResult<Response> {
    let rate = payload
        .headers
        .get(HEADER_RATE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(1);
    let meta = RequestMeta::new(rate, policy);
    let response = await_outcome(state, rev, meta, payload, false).await?;
    Ok(proxied(response))
}

/// Real-world mode: expand the call into a planned sequence, dispatch the
/// elements one by one with their inter-arrival pauses, and answer with the
/// recorded bodies concatenated in order. The client's own rate tag is
/// ignored here.
async fn run_sequence(
    state: &AppState,
    rev: RevisionId,
    payload: ProxyPayload,
    policy: PolicyKind,
) -> AppResult<Response> {
    let plan = state.engine.workload().plan_sequence();
    if plan.is_empty() {
        return Err(AppError::internal("workload produced an empty sequence"));
    }
    debug!(rev = %rev, len = plan.len(), "planned real-world sequence");

    let seq_start_ms = unix_millis();
    let last = plan.len() - 1;
    let mut bodies = Vec::with_capacity(plan.len());

    for (i, item) in plan.items.iter().enumerate() {
        let mut meta = RequestMeta::new(item.rate, policy);
        if i == last {
            // End-to-end measurement rides on the tail element only.
            meta.seq_start_ts_ms = Some(seq_start_ms);
        }
        let response = await_outcome(state, rev.clone(), meta, payload.clone(), true).await?;
        bodies.push(response.body);

        if item.iat_ms > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(item.iat_ms / 1000.0)).await;
        }
    }

    let mut combined = BytesMut::new();
    for body in bodies {
        combined.extend_from_slice(&body);
    }
    Ok(Response::builder()
        .status(http::StatusCode::OK)
        .body(Body::from(combined.freeze()))
        .unwrap_or_else(|_| http::StatusCode::INTERNAL_SERVER_ERROR.into_response()))
}

/// Submit one unit and wait for its outcome under the mode's wall-clock
/// ceiling. On ceiling expiry the in-flight dispatch is left to drain; its
/// completion send lands on a dropped receiver.
async fn await_outcome(
    state: &AppState,
    rev: RevisionId,
    meta: RequestMeta,
    payload: ProxyPayload,
    real_world: bool,
) -> AppResult<ProxyResponse> {
    let ceiling = state.engine.config().wait_ceiling(real_world);
    let rate = meta.rate;
    let (_admission, handle) = state.engine.submit(rev.clone(), meta, payload);

    tokio::select! {
        outcome = handle.outcome => match outcome {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(AppError::internal("dispatch abandoned the request")),
        },
        _ = tokio::time::sleep(ceiling) => {
            warn!(rev = %rev, rate, ceiling_secs = ceiling.as_secs(), "request exceeded dispatch ceiling");
            Err(AppError::timeout("request exceeded the dispatch ceiling"))
        }
    }
}

fn resolve_revision(headers: &http::HeaderMap, state: &AppState) -> RevisionId {
    let namespace = headers
        .get(HEADER_NAMESPACE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(&state.config.default_namespace);
    let name = headers
        .get(HEADER_REVISION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(&state.config.default_revision);
    RevisionId::new(namespace, name)
}

fn resolve_policy(headers: &http::HeaderMap, state: &AppState) -> PolicyKind {
    headers
        .get(HEADER_LB_POLICY)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(state.engine.config().default_policy)
}

/// Address the replica through its private service hostname.
fn set_passthrough_host(payload: &mut ProxyPayload, rev: &RevisionId) {
    let host = format!("{}-private.{}", rev.name, rev.namespace);
    if let Ok(value) = http::HeaderValue::from_str(&host) {
        payload.headers.insert(http::header::HOST, value);
    }
}

fn proxied(response: ProxyResponse) -> Response {
    let mut builder = Response::builder().status(response.status);
    if let Some(headers) = builder.headers_mut() {
        headers.extend(response.headers);
    }
    builder
        .body(Body::from(response.body))
        .unwrap_or_else(|_| http::StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
