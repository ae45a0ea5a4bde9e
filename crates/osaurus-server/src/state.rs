//! Shared application state.
//!
//! Everything a request handler needs is constructed once at startup and
//! handed in by reference through axum's `State` extractor; there is no
//! global mutable state.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio_util::sync::CancellationToken;

use osaurus_core::ToolRegistry;
use osaurus_core::batch::register_batch_tool;
use osaurus_pipeline::backend::{BackendEvent, BackendFinish, InferenceBackend, ScriptedBackend};
use osaurus_plugins::{PluginLoader, PluginStore};

use crate::config::{BackendProvider, OsaurusConfig};

/// The sentinel model ids every catalog resolves to its primary backend.
pub const SENTINEL_MODELS: &[&str] = &["foundation", "default"];

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<OsaurusConfig>,
    pub registry: Arc<ToolRegistry>,
    pub loader: Arc<PluginLoader>,
    pub store: PluginStore,
    pub backends: Arc<Vec<Arc<dyn InferenceBackend>>>,
    pub active: ActiveRequests,
    /// Root cancellation token; shutdown cancels every in-flight pipeline
    /// through child tokens of this one.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Wire up the full service graph from configuration: registry (with
    /// the batch tool), plugin store + loader (installed plugins restored),
    /// and the configured backend.
    pub async fn bootstrap(config: OsaurusConfig) -> anyhow::Result<Self> {
        let registry = Arc::new(ToolRegistry::new());
        register_batch_tool(&registry).await?;

        let store_root = if config.plugins.root.is_empty() {
            PluginStore::default_root()
        } else {
            config.plugins.root.clone().into()
        };
        let store = PluginStore::new(store_root);
        store.init()?;

        let loader = Arc::new(PluginLoader::new(Arc::clone(&registry)));
        loader.load_installed(&store).await;

        let backends: Vec<Arc<dyn InferenceBackend>> = match config.backend.provider {
            BackendProvider::Stub => vec![Arc::new(stub_backend(&config.backend.model)) as _],
            // The remote adapter is an external collaborator; without one
            // wired in, every model resolves to UnknownModel.
            BackendProvider::OpenAiCompatible => Vec::new(),
        };

        Ok(Self {
            config: Arc::new(config),
            registry,
            loader,
            store,
            backends: Arc::new(backends),
            active: ActiveRequests::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Resolve a model id to the backend that serves it. The sentinels
    /// (`foundation`, `default`) resolve to the primary backend.
    pub async fn resolve_backend(&self, model_id: &str) -> Option<Arc<dyn InferenceBackend>> {
        if SENTINEL_MODELS.contains(&model_id) {
            return self.backends.first().cloned();
        }
        for backend in self.backends.iter() {
            if backend.models().await.iter().any(|m| m.id == model_id) {
                return Some(Arc::clone(backend));
            }
        }
        None
    }

    /// Every model id the gateway can serve, sentinel first.
    pub async fn model_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        if !self.backends.is_empty() {
            ids.push("foundation".to_string());
        }
        for backend in self.backends.iter() {
            for model in backend.models().await {
                if !ids.contains(&model.id) {
                    ids.push(model.id);
                }
            }
        }
        ids
    }
}

/// Demo completion the stub provider serves, so a bare `osaurus serve` can
/// answer chat requests end to end.
fn stub_backend(model: &str) -> ScriptedBackend {
    ScriptedBackend::new(
        model,
        vec![
            BackendEvent::TokenChunk("Hello from the Osaurus stub backend. ".into()),
            BackendEvent::TokenChunk("Configure a real provider to talk to a model.".into()),
            BackendEvent::Finish(BackendFinish::Stop),
        ],
    )
}

/// Atomic in-flight request counter, exposed for telemetry and drained by
/// graceful shutdown.
#[derive(Clone, Default)]
pub struct ActiveRequests {
    counter: Arc<AtomicU64>,
}

impl ActiveRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment; the returned guard decrements on drop (the final writer
    /// flush, for streaming responses).
    pub fn begin(&self) -> ActiveGuard {
        self.counter.fetch_add(1, Ordering::SeqCst);
        ActiveGuard {
            counter: Arc::clone(&self.counter),
        }
    }

    pub fn count(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }
}

pub struct ActiveGuard {
    counter: Arc<AtomicU64>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}
