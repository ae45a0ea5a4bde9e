//! Server lifecycle: bind, discovery record, graceful shutdown.

use std::path::PathBuf;
use std::time::Duration;

use crate::router::build_router;
use crate::state::AppState;

/// Where local processes look to find the running instance.
fn discovery_path(state: &AppState) -> PathBuf {
    if state.config.plugins.root.is_empty() {
        osaurus_plugins::PluginStore::default_root().join("instance.json")
    } else {
        PathBuf::from(&state.config.plugins.root).join("instance.json")
    }
}

fn write_discovery(path: &PathBuf, addr: std::net::SocketAddr) {
    let record = serde_json::json!({
        "port": addr.port(),
        "address": addr.ip().to_string(),
        "pid": std::process::id(),
        "started_at": chrono::Utc::now().to_rfc3339(),
    });
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    match std::fs::write(path, record.to_string()) {
        Ok(()) => tracing::debug!(path = %path.display(), "Discovery record written"),
        Err(e) => tracing::warn!(error = %e, "Could not write discovery record"),
    }
}

/// Run the HTTP server until ctrl-c or an explicit shutdown, then drain.
///
/// Shutdown order: stop accepting, cancel every in-flight pipeline through
/// the root token, wait for writers to drain up to the configured deadline,
/// remove the discovery record.
pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let addr = state.config.bind_address();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    tracing::info!(address = %local, "Osaurus listening");

    let discovery = discovery_path(&state);
    write_discovery(&discovery, local);

    let shutdown = state.shutdown.clone();
    let router = build_router(state.clone());
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupt received; shutting down");
            }
            _ = shutdown.cancelled() => {
                tracing::info!("Shutdown requested");
            }
        }
    });

    let result = server.await;

    // Cancel in-flight pipelines and give writers a bounded window to
    // flush their terminators.
    state.shutdown.cancel();
    let drain_deadline =
        tokio::time::Instant::now() + Duration::from_secs(state.config.server.drain_timeout_secs);
    while state.active.count() > 0 && tokio::time::Instant::now() < drain_deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let leftover = state.active.count();
    if leftover > 0 {
        tracing::warn!(leftover, "Writers still active at drain deadline");
    }

    if let Err(e) = std::fs::remove_file(&discovery) {
        tracing::debug!(error = %e, "Discovery record already gone");
    }
    tracing::info!("Osaurus stopped");
    result.map_err(Into::into)
}
