use thiserror::Error;

/// Errors from loading and driving plugin dylibs.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin load failed: {0}")]
    PluginLoadFailed(String),

    #[error("plugin init failed: {0}")]
    PluginInitFailed(String),

    #[error("plugin manifest invalid: {0}")]
    ManifestInvalid(String),

    #[error("plugin '{plugin_id}' is already loaded")]
    AlreadyLoaded { plugin_id: String },

    #[error("plugin '{0}' is not loaded")]
    NotLoaded(String),

    #[error("tool registration failed: {0}")]
    Registration(#[from] osaurus_core::CoreError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Errors from the plugin store and installer. These are returned to the
/// caller (the CLI); none of them leaves state mutated on disk.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no spec for plugin '{0}' in the index")]
    SpecNotFound(String),

    #[error("no artifact for {os}/{arch} in {plugin_id}@{version}")]
    NoMatchingArtifact {
        plugin_id: String,
        version: String,
        os: String,
        arch: String,
    },

    #[error("checksum mismatch for {url}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        url: String,
        expected: String,
        actual: String,
    },

    #[error("signature invalid: {0}")]
    SignatureInvalid(String),

    #[error("archive layout invalid: {0}")]
    LayoutInvalid(String),

    #[error("no previous version of '{0}' to roll back to")]
    NoPreviousVersion(String),

    #[error("plugin '{0}' is not installed")]
    NotInstalled(String),

    #[error("download failed for {url}: {detail}")]
    DownloadFailed { url: String, detail: String },

    #[error("receipt invalid at {path}: {detail}")]
    ReceiptInvalid { path: String, detail: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
