//! # Flowgate Server
//!
//! Serverless ingress activator with size-aware admission and
//! power-of-two-choices dispatch.
//!
//! ## Overview
//!
//! Requests for a function revision are admitted into a central queue,
//! held for as long as a shorter job plausibly arrives to overtake them,
//! then dispatched to one of the revision's replicas chosen by declared
//! in-flight demand. The server wires the engine crate to an axum frontend
//! and a reqwest reverse-proxy transport:
//!
//! - **Admission**: FIFO, simple-preempt, or size-interval disciplines
//! - **Dispatch**: random, round-robin, and power-of-two policy family
//! - **Workloads**: ALU uniform classes and CDF-driven real-world sequences

/// The frontend wrap and workload drivers
pub mod activation;

/// Server config
pub mod config;

/// Error types and handling
pub mod errors;

/// Reverse-proxy transport
pub mod proxy;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, put},
};
use clap::Parser;
use config::ServerConfig;
use flowgate_core::{Engine, EngineConfig, RevisionId};
use proxy::ReqwestTransport;
use serde_json::{Value, json};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command line arguments for the Flowgate activator
#[derive(Parser, Debug)]
#[command(name = "flowgate-server")]
#[command(about = "Serverless ingress activator with size-aware admission and P2C dispatch")]
struct Args {
    /// Server port (overrides config)
    #[arg(short, long, env = "SERVER_PORT")]
    port: Option<u16>,

    /// Server host (overrides config)
    #[arg(long, env = "SERVER_HOST")]
    host: Option<String>,
}

// Server application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub config: Arc<ServerConfig>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Load configuration from environment
    let mut config = ServerConfig::from_env()?;
    if let Some(port) = args.port {
        config.server_port = port;
    }
    if let Some(host) = args.host {
        config.server_host = host;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "flowgate_server=debug,flowgate_core=debug,tower_http=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let engine_config = EngineConfig::from_env()?;
    info!(
        discipline = ?engine_config.discipline,
        regime = ?engine_config.regime,
        lambda = engine_config.lambda,
        "engine configuration loaded"
    );

    let transport = Arc::new(ReqwestTransport::new(config.backend_tls)?);
    let engine = Engine::start(engine_config, transport)?;

    // Seed static replica sets; discovery can replace them at runtime.
    for (rev, dests) in config.seeded_targets()? {
        info!(rev = %rev, replicas = dests.len(), "seeding replica set");
        engine.set_targets(rev, dests);
    }

    let state = AppState {
        engine,
        config: Arc::new(config),
    };

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/internal/targets/{namespace}/{name}", put(set_targets))
        .fallback(activation::activate)
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let addr = format!(
        "{}:{}",
        state.config.server_host, state.config.server_port
    );
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("flowgate activator listening on {addr}");
    axum::serve(listener, app).await?;

    Ok(())
}

async fn healthz(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "queue_depth": state.engine.queue_depth(),
        "dispatched_jobs": state.engine.stats().total_job_num(),
    }))
}

/// Replace the replica set for one revision. This is the hook endpoint
/// discovery pushes through.
async fn set_targets(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    Json(dests): Json<Vec<String>>,
) -> StatusCode {
    let rev = RevisionId::new(namespace, name);
    info!(rev = %rev, replicas = dests.len(), "replica set updated via api");
    state.engine.set_targets(rev, dests);
    StatusCode::NO_CONTENT
}
