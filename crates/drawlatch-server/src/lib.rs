//! The Drawlatch remote server.
//!
//! Hosts the handshake endpoints, the per-session encrypted request path, the
//! webhook receiver, and the caller-facing tool surface (request pipeline,
//! event polling, admin management). One process hosts one server instance,
//! constructed explicitly at startup.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use drawlatch_config::RemoteConfig;
use drawlatch_crypto::{load_key_bundle, load_peer_fingerprints};
use drawlatch_ingest::IngestorManager;

pub mod admin;
pub mod health;
pub mod http;
pub mod pipeline;
pub mod rate_limit;
pub mod session;
pub mod tools;


pub use health::{load_health_snapshot, save_health_snapshot, TransportHealthSnapshot};
pub use http::{build_router, ServerState};
pub use pipeline::{HttpRequestInput, RequestPipeline, DEFAULT_DISPATCH_TIMEOUT};
pub use rate_limit::RateLimiter;
pub use session::SessionTable;
pub use tools::{dispatch_tool, ToolContext, ToolDeps};

/// Filesystem locations the admin tools mutate.
#[derive(Debug, Clone)]
pub struct ServerPaths {
    pub config_path: PathBuf,
    pub env_path: PathBuf,
}

/// Loads keys, builds the fingerprint-to-caller map, and assembles the
/// shared state. Ingestors are not started here; `run_remote_server` starts
/// them, and tests drive them directly.
pub fn build_server_state(config: RemoteConfig, paths: ServerPaths) -> Result<Arc<ServerState>> {
    let bundle = load_key_bundle(&config.local_keys_dir).with_context(|| {
        format!(
            "failed to load server keys from {}",
            config.local_keys_dir.display()
        )
    })?;

    let mut caller_fingerprints = BTreeMap::new();
    for (alias, caller) in &config.callers {
        let fingerprints = load_peer_fingerprints(&caller.peer_key_dir).with_context(|| {
            format!(
                "failed to load peer keys for caller '{}' from {}",
                alias,
                caller.peer_key_dir.display()
            )
        })?;
        if fingerprints.is_empty() {
            tracing::warn!(caller = %alias, "caller has no registered peer keys");
        }
        for fingerprint in fingerprints {
            caller_fingerprints.insert(fingerprint, alias.clone());
        }
    }

    let deps = ToolDeps {
        pipeline: RequestPipeline::new(DEFAULT_DISPATCH_TIMEOUT)?,
        limiter: RateLimiter::new(config.rate_limit_per_minute),
        manager: IngestorManager::new(),
        config_path: paths.config_path,
        env_path: paths.env_path,
        config,
    };

    Ok(Arc::new(ServerState {
        deps,
        bundle,
        caller_fingerprints,
        sessions: SessionTable::new(),
    }))
}

/// Binds, starts every configured ingestor, and serves until ctrl-c. On
/// shutdown the ingestors are stopped in parallel and in-flight requests
/// drain through axum's graceful shutdown.
pub async fn run_remote_server(config: RemoteConfig, paths: ServerPaths) -> Result<()> {
    let bind_addr = format!("{}:{}", config.host, config.port);
    let health_path = paths
        .config_path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| std::path::Path::new("."))
        .join(health::HEALTH_FILE_NAME);
    let state = build_server_state(config, paths)?;

    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind remote server on {}", bind_addr))?;
    let local_addr = listener
        .local_addr()
        .context("failed to resolve bound server address")?;

    state.deps.manager.start_all(&state.deps.config).await;
    persist_health(&health_path, &state);
    println!(
        "drawlatch remote listening: addr={} fingerprint={} callers={}",
        local_addr,
        state.bundle.fingerprint(),
        state.deps.config.callers.len()
    );

    let app = build_router(Arc::clone(&state));
    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;

    state.deps.manager.stop_all().await;
    persist_health(&health_path, &state);
    serve_result.context("remote server exited unexpectedly")?;
    Ok(())
}

/// Best effort: a failed health write never takes the server down.
fn persist_health(path: &std::path::Path, state: &ServerState) {
    let snapshot = TransportHealthSnapshot::capture(
        state.sessions.session_count(),
        state.deps.manager.all_statuses(),
    );
    if let Err(error) = save_health_snapshot(path, &snapshot) {
        tracing::warn!(error = %error, "failed to persist transport health snapshot");
    }
}
