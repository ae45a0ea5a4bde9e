//! Loads plugin dylibs and exposes their tools through the registry.
//!
//! Load sequence: open the library (lazy, local scope), resolve
//! `osaurus_plugin_entry`, call `init`, parse the manifest, register every
//! declared tool. Registration is atomic per plugin: if any tool fails to
//! register, the ones already added are rolled back and the plugin is not
//! recorded. Unload unregisters in reverse order; `destroy` runs exactly
//! once, after the last in-flight invocation releases its handle.

use std::collections::HashMap;
use std::ffi::CString;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::Mutex;

use osaurus_core::{
    CallerContext, CoreError, Provenance, ToolHandler, ToolRegistry, ToolSpec,
};

use crate::abi::{self, ENTRY_SYMBOL, EntryFn, INVOKE_KIND_TOOL, PluginApi, RawContext};
use crate::error::PluginError;
use crate::manifest::{PluginManifest, ToolDecl};
use crate::store::PluginStore;

/// The vtable, context, and library handle of one live plugin.
///
/// Dropping calls `destroy(ctx)` and then unmaps the library (field order:
/// the library member is declared last so it drops last). Handlers hold
/// `Arc<RawPlugin>` clones, so destruction waits for in-flight invocations.
struct RawPlugin {
    api: *const PluginApi,
    ctx: RawContext,
    library: Option<libloading::Library>,
}

// The plugin ABI requires entry points to be callable from any thread; the
// raw pointers never leave this module.
unsafe impl Send for RawPlugin {}
unsafe impl Sync for RawPlugin {}

impl RawPlugin {
    fn api(&self) -> &PluginApi {
        // Valid for the life of the library mapping, which this struct owns.
        unsafe { &*self.api }
    }
}

impl Drop for RawPlugin {
    fn drop(&mut self) {
        unsafe { (self.api().destroy)(self.ctx) };
    }
}

/// Registry handler forwarding one tool to its plugin's `invoke`.
struct PluginToolHandler {
    plugin: Arc<RawPlugin>,
    tool_id: String,
}

impl ToolHandler for PluginToolHandler {
    fn invoke<'a>(
        &'a self,
        arguments_json: &'a str,
        _ctx: &'a CallerContext,
    ) -> Pin<Box<dyn Future<Output = Result<String, CoreError>> + Send + 'a>> {
        let plugin = Arc::clone(&self.plugin);
        let tool_id = self.tool_id.clone();
        let payload = arguments_json.to_string();
        Box::pin(async move {
            // `invoke` may sit on blocking FFI; keep it off the async pool.
            tokio::task::spawn_blocking(move || invoke_tool(&plugin, &tool_id, &payload))
                .await
                .map_err(|e| CoreError::ToolFailed {
                    tool: self.tool_id.clone(),
                    detail: format!("invoke task failed: {e}"),
                })?
        })
    }
}

fn invoke_tool(plugin: &RawPlugin, tool_id: &str, payload: &str) -> Result<String, CoreError> {
    let tool_failed = |detail: String| CoreError::ToolFailed {
        tool: tool_id.to_string(),
        detail,
    };

    let kind = CString::new(INVOKE_KIND_TOOL).map_err(|e| tool_failed(e.to_string()))?;
    let id = CString::new(tool_id).map_err(|e| tool_failed(e.to_string()))?;
    let payload = CString::new(payload).map_err(|_| CoreError::InvalidArguments {
        tool: tool_id.to_string(),
        detail: "arguments contain a NUL byte".into(),
    })?;

    let api = plugin.api();
    let raw = unsafe { (api.invoke)(plugin.ctx, kind.as_ptr(), id.as_ptr(), payload.as_ptr()) };
    unsafe { abi::take_plugin_string(api, raw) }
        .ok_or_else(|| tool_failed("plugin returned no result".into()))
}

struct LivePlugin {
    manifest: PluginManifest,
    /// Registered names, in registration order.
    tool_names: Vec<String>,
    #[allow(dead_code)]
    plugin: Arc<RawPlugin>,
    path: PathBuf,
}

/// Summary of one loaded plugin, for diagnostics and the CLI.
#[derive(Debug, Clone)]
pub struct LoadedPluginInfo {
    pub plugin_id: String,
    pub version: String,
    pub tools: Vec<String>,
    pub path: PathBuf,
}

/// Owns every live plugin and its registry entries.
pub struct PluginLoader {
    registry: Arc<ToolRegistry>,
    plugins: Mutex<HashMap<String, LivePlugin>>,
}

impl PluginLoader {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            plugins: Mutex::new(HashMap::new()),
        }
    }

    /// Load the plugin dylib at `path` and register its tools.
    pub async fn load(&self, path: &Path) -> Result<String, PluginError> {
        let path_buf = path.to_path_buf();
        // dlopen/dlsym can block; isolate them on the blocking pool.
        let (plugin, manifest) =
            tokio::task::spawn_blocking(move || open_plugin(&path_buf))
                .await
                .map_err(|e| PluginError::PluginLoadFailed(format!("load task failed: {e}")))??;
        self.finish_load(plugin, manifest, path.to_path_buf()).await
    }

    /// Load every installed plugin's active version. Failures are logged and
    /// skipped; a broken plugin never takes the process down.
    pub async fn load_installed(&self, store: &PluginStore) {
        let installed = match store.list_installed() {
            Ok(installed) => installed,
            Err(e) => {
                tracing::warn!(error = %e, "Could not list installed plugins");
                return;
            }
        };

        for plugin in installed {
            let Some(path) = store.current_dylib_path(&plugin.plugin_id) else {
                tracing::warn!(
                    plugin_id = %plugin.plugin_id,
                    "No active version on disk; skipping"
                );
                continue;
            };
            match self.load(&path).await {
                Ok(plugin_id) => {
                    tracing::info!(plugin_id, path = %path.display(), "Plugin restored");
                }
                Err(e) => {
                    tracing::warn!(
                        plugin_id = %plugin.plugin_id,
                        error = %e,
                        "Failed to load plugin; skipping"
                    );
                }
            }
        }
    }

    /// Unload a plugin: unregister its tools (reverse order), then release
    /// the context and library handle.
    pub async fn unload(&self, plugin_id: &str) -> Result<(), PluginError> {
        let live = self
            .plugins
            .lock()
            .await
            .remove(plugin_id)
            .ok_or_else(|| PluginError::NotLoaded(plugin_id.to_string()))?;

        for name in live.tool_names.iter().rev() {
            self.registry.unregister(name).await;
        }
        tracing::info!(plugin_id, "Plugin unloaded");
        Ok(())
    }

    pub async fn unload_all(&self) {
        let ids: Vec<String> = self.plugins.lock().await.keys().cloned().collect();
        for id in ids {
            let _ = self.unload(&id).await;
        }
    }

    pub async fn list(&self) -> Vec<LoadedPluginInfo> {
        let plugins = self.plugins.lock().await;
        let mut infos: Vec<LoadedPluginInfo> = plugins
            .values()
            .map(|live| LoadedPluginInfo {
                plugin_id: live.manifest.plugin_id.clone(),
                version: live.manifest.version.clone(),
                tools: live.tool_names.clone(),
                path: live.path.clone(),
            })
            .collect();
        infos.sort_by(|a, b| a.plugin_id.cmp(&b.plugin_id));
        infos
    }

    /// Registration half of the load sequence, shared with tests that
    /// supply an in-process vtable.
    async fn finish_load(
        &self,
        plugin: RawPlugin,
        manifest: PluginManifest,
        path: PathBuf,
    ) -> Result<String, PluginError> {
        let plugin = Arc::new(plugin);
        let plugin_id = manifest.plugin_id.clone();

        if self.plugins.lock().await.contains_key(&plugin_id) {
            return Err(PluginError::AlreadyLoaded { plugin_id });
        }

        // All-or-nothing: roll back registered tools on any failure so a
        // plugin's tools become visible atomically.
        let mut registered: Vec<String> = Vec::new();
        for tool in &manifest.capabilities.tools {
            let handler = Arc::new(PluginToolHandler {
                plugin: Arc::clone(&plugin),
                tool_id: tool.id.clone(),
            });
            match self.register_tool(&manifest, tool, handler).await {
                Ok(name) => registered.push(name),
                Err(e) => {
                    for name in registered.iter().rev() {
                        self.registry.unregister(name).await;
                    }
                    return Err(e);
                }
            }
        }

        let mut plugins = self.plugins.lock().await;
        if plugins.contains_key(&plugin_id) {
            drop(plugins);
            for name in registered.iter().rev() {
                self.registry.unregister(name).await;
            }
            return Err(PluginError::AlreadyLoaded { plugin_id });
        }
        tracing::info!(
            plugin_id,
            version = %manifest.version,
            tools = registered.len(),
            "Plugin loaded"
        );
        plugins.insert(
            plugin_id.clone(),
            LivePlugin {
                manifest,
                tool_names: registered,
                plugin,
                path,
            },
        );
        Ok(plugin_id)
    }

    async fn register_tool(
        &self,
        manifest: &PluginManifest,
        tool: &ToolDecl,
        handler: Arc<PluginToolHandler>,
    ) -> Result<String, PluginError> {
        let spec = ToolSpec {
            name: tool.id.clone(),
            description: tool.description.clone().unwrap_or_default(),
            parameters: tool.parameters.clone(),
            permission_policy: tool.permission_policy,
            provenance: Provenance::ExternalPlugin {
                plugin_id: manifest.plugin_id.clone(),
                version: manifest.version.clone(),
            },
        };

        match self.registry.register(spec.clone(), handler.clone()).await {
            Ok(()) => Ok(tool.id.clone()),
            Err(CoreError::DuplicateName(_)) => {
                // Another plugin (or a builtin) owns the bare name; fall
                // back to the namespaced form.
                let namespaced = format!("{}.{}", manifest.plugin_id, tool.id);
                tracing::warn!(
                    plugin_id = %manifest.plugin_id,
                    tool_id = %tool.id,
                    namespaced = %namespaced,
                    "Tool name collision; registering namespaced"
                );
                let spec = ToolSpec {
                    name: namespaced.clone(),
                    ..spec
                };
                self.registry.register(spec, handler).await?;
                Ok(namespaced)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Blocking half of the load sequence: dlopen, entry symbol, init,
/// manifest.
fn open_plugin(path: &Path) -> Result<(RawPlugin, PluginManifest), PluginError> {
    // Lazy binding, local scope: a plugin's symbols must not leak into
    // other plugins' resolution.
    #[cfg(unix)]
    let library = unsafe {
        libloading::os::unix::Library::open(
            Some(path),
            libloading::os::unix::RTLD_LAZY | libloading::os::unix::RTLD_LOCAL,
        )
    }
    .map(libloading::Library::from)
    .map_err(|e| PluginError::PluginLoadFailed(format!("{}: {e}", path.display())))?;

    #[cfg(not(unix))]
    let library = unsafe { libloading::Library::new(path) }
        .map_err(|e| PluginError::PluginLoadFailed(format!("{}: {e}", path.display())))?;

    let api = {
        let entry: libloading::Symbol<'_, EntryFn> = unsafe { library.get(ENTRY_SYMBOL) }
            .map_err(|e| PluginError::PluginLoadFailed(format!("no entry symbol: {e}")))?;
        unsafe { entry() as *const PluginApi }
    };
    if api.is_null() {
        return Err(PluginError::PluginLoadFailed(
            "entry returned a null vtable".into(),
        ));
    }

    let ctx = unsafe { ((*api).init)() };
    if ctx.is_null() {
        return Err(PluginError::PluginInitFailed(
            "init returned a null context".into(),
        ));
    }

    // From here the context is owned by the RawPlugin; any error path below
    // releases it through Drop.
    let plugin = RawPlugin {
        api,
        ctx,
        library: Some(library),
    };

    let manifest_json = unsafe {
        let raw = (plugin.api().get_manifest)(plugin.ctx);
        abi::take_plugin_string(plugin.api(), raw)
    }
    .ok_or_else(|| PluginError::ManifestInvalid("get_manifest returned null".into()))?;

    let manifest: PluginManifest = serde_json::from_str(&manifest_json)
        .map_err(|e| PluginError::ManifestInvalid(e.to_string()))?;
    Ok((plugin, manifest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use osaurus_core::PermissionPolicy;
    use osaurus_core::registry::FnHandler;
    use std::ffi::{CStr, c_char};
    use std::sync::atomic::{AtomicUsize, Ordering};

    // ── An in-process fake plugin speaking the C ABI ──

    static DESTROY_COUNT: AtomicUsize = AtomicUsize::new(0);

    const MANIFEST: &str = r#"{
        "plugin_id": "dev.example.echo",
        "version": "0.1.0",
        "capabilities": {
            "tools": [
                {
                    "id": "echo_tool",
                    "description": "Echo the payload back",
                    "parameters": {
                        "type": "object",
                        "properties": { "msg": { "type": "string" } },
                        "required": ["msg"]
                    }
                },
                { "id": "null_tool" }
            ]
        }
    }"#;

    unsafe extern "C" fn fake_free(ptr: *const c_char) {
        if !ptr.is_null() {
            unsafe { drop(CString::from_raw(ptr as *mut c_char)) };
        }
    }
    unsafe extern "C" fn fake_init() -> RawContext {
        Box::into_raw(Box::new(0u8)) as RawContext
    }
    unsafe extern "C" fn fake_destroy(ctx: RawContext) {
        if !ctx.is_null() {
            let marker = unsafe { Box::from_raw(ctx as *mut u8) };
            // Only contexts created with a tracking marker count, so
            // parallel tests don't race on the shared counter.
            if *marker == 1 {
                DESTROY_COUNT.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
    unsafe extern "C" fn fake_get_manifest(_ctx: RawContext) -> *const c_char {
        CString::new(MANIFEST).unwrap().into_raw()
    }
    unsafe extern "C" fn fake_invoke(
        _ctx: RawContext,
        _kind: *const c_char,
        id: *const c_char,
        payload: *const c_char,
    ) -> *const c_char {
        let id = unsafe { CStr::from_ptr(id) }.to_string_lossy();
        if id == "null_tool" {
            return std::ptr::null();
        }
        let payload = unsafe { CStr::from_ptr(payload) }.to_string_lossy().into_owned();
        CString::new(payload).unwrap().into_raw()
    }

    static FAKE_API: PluginApi = PluginApi {
        free_string: fake_free,
        init: fake_init,
        destroy: fake_destroy,
        get_manifest: fake_get_manifest,
        invoke: fake_invoke,
    };

    fn fake_plugin() -> (RawPlugin, PluginManifest) {
        let ctx = unsafe { fake_init() };
        let plugin = RawPlugin {
            api: &FAKE_API,
            ctx,
            library: None,
        };
        let manifest: PluginManifest = serde_json::from_str(MANIFEST).unwrap();
        (plugin, manifest)
    }

    #[tokio::test]
    async fn load_registers_declared_tools() {
        let registry = Arc::new(ToolRegistry::new());
        let loader = PluginLoader::new(Arc::clone(&registry));

        let (plugin, manifest) = fake_plugin();
        let id = loader
            .finish_load(plugin, manifest, PathBuf::from("/fake/libecho.dylib"))
            .await
            .unwrap();
        assert_eq!(id, "dev.example.echo");

        let names: Vec<String> = registry.list().await.into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["echo_tool", "null_tool"]);

        let out = registry
            .execute("echo_tool", r#"{"msg":"hi"}"#, &CallerContext::mcp())
            .await
            .unwrap();
        assert_eq!(out, r#"{"msg":"hi"}"#);
    }

    #[tokio::test]
    async fn plugin_tools_carry_plugin_provenance() {
        let registry = Arc::new(ToolRegistry::new());
        let loader = PluginLoader::new(Arc::clone(&registry));
        let (plugin, manifest) = fake_plugin();
        loader
            .finish_load(plugin, manifest, PathBuf::new())
            .await
            .unwrap();

        let specs = registry.list().await;
        let echo = specs.iter().find(|s| s.name == "echo_tool").unwrap();
        assert_eq!(
            echo.provenance,
            Provenance::ExternalPlugin {
                plugin_id: "dev.example.echo".into(),
                version: "0.1.0".into(),
            }
        );
    }

    #[tokio::test]
    async fn invoke_failure_isolates_to_the_call() {
        let registry = Arc::new(ToolRegistry::new());
        let loader = PluginLoader::new(Arc::clone(&registry));
        let (plugin, manifest) = fake_plugin();
        loader
            .finish_load(plugin, manifest, PathBuf::new())
            .await
            .unwrap();

        let err = registry
            .execute("null_tool", "{}", &CallerContext::mcp())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ToolFailed { .. }));

        // The plugin stays loaded and its other tools keep working.
        assert_eq!(loader.list().await.len(), 1);
        assert!(
            registry
                .execute("echo_tool", r#"{"msg":"still here"}"#, &CallerContext::mcp())
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn unload_removes_tools_and_destroys_context_once() {
        let registry = Arc::new(ToolRegistry::new());
        let loader = PluginLoader::new(Arc::clone(&registry));
        let plugin = RawPlugin {
            api: &FAKE_API,
            ctx: Box::into_raw(Box::new(1u8)) as RawContext,
            library: None,
        };
        let manifest: PluginManifest = serde_json::from_str(MANIFEST).unwrap();
        loader
            .finish_load(plugin, manifest, PathBuf::new())
            .await
            .unwrap();

        let before = DESTROY_COUNT.load(Ordering::SeqCst);
        loader.unload("dev.example.echo").await.unwrap();

        assert!(registry.list().await.is_empty());
        assert_eq!(DESTROY_COUNT.load(Ordering::SeqCst), before + 1);

        assert!(matches!(
            loader.unload("dev.example.echo").await,
            Err(PluginError::NotLoaded(_))
        ));
    }

    #[tokio::test]
    async fn colliding_tool_names_are_namespaced() {
        let registry = Arc::new(ToolRegistry::new());
        registry
            .register(
                ToolSpec::builtin("echo_tool", "builtin echo", serde_json::json!({"type":"object"})),
                Arc::new(FnHandler::new(|_args, _ctx| Ok("builtin".into()))),
            )
            .await
            .unwrap();

        let loader = PluginLoader::new(Arc::clone(&registry));
        let (plugin, manifest) = fake_plugin();
        loader
            .finish_load(plugin, manifest, PathBuf::new())
            .await
            .unwrap();

        let names: Vec<String> = registry.list().await.into_iter().map(|s| s.name).collect();
        assert!(names.contains(&"dev.example.echo.echo_tool".to_string()));
        // The builtin keeps the bare name.
        let out = registry
            .execute("echo_tool", "{}", &CallerContext::mcp())
            .await
            .unwrap();
        assert_eq!(out, "builtin");
    }

    #[tokio::test]
    async fn double_load_is_rejected() {
        let registry = Arc::new(ToolRegistry::new());
        let loader = PluginLoader::new(Arc::clone(&registry));

        let (plugin, manifest) = fake_plugin();
        loader
            .finish_load(plugin, manifest, PathBuf::new())
            .await
            .unwrap();

        let (plugin, manifest) = fake_plugin();
        assert!(matches!(
            loader.finish_load(plugin, manifest, PathBuf::new()).await,
            Err(PluginError::AlreadyLoaded { .. })
        ));
    }

    #[tokio::test]
    async fn missing_dylib_fails_without_panicking() {
        let registry = Arc::new(ToolRegistry::new());
        let loader = PluginLoader::new(registry);
        let err = loader
            .load(Path::new("/nonexistent/libnothing.dylib"))
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::PluginLoadFailed(_)));
    }

    #[tokio::test]
    async fn manifest_permission_policy_is_enforced() {
        const GUARDED: &str = r#"{
            "plugin_id": "dev.example.guarded",
            "version": "0.1.0",
            "capabilities": { "tools": [
                { "id": "danger_tool", "permission_policy": "deny" }
            ]}
        }"#;
        let registry = Arc::new(ToolRegistry::new());
        let loader = PluginLoader::new(Arc::clone(&registry));

        let ctx = unsafe { fake_init() };
        let plugin = RawPlugin {
            api: &FAKE_API,
            ctx,
            library: None,
        };
        let manifest: PluginManifest = serde_json::from_str(GUARDED).unwrap();
        loader
            .finish_load(plugin, manifest, PathBuf::new())
            .await
            .unwrap();

        let specs = registry.list().await;
        assert_eq!(specs[0].permission_policy, PermissionPolicy::Deny);
        assert!(matches!(
            registry
                .execute("danger_tool", "{}", &CallerContext::mcp())
                .await,
            Err(CoreError::PolicyDenied { .. })
        ));
    }
}
