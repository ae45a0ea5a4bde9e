//! The central plugin index: spec types, fetch + cache, and version
//! resolution.

use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::StoreError;
use crate::store::PluginStore;

/// One plugin's entry in the central index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginSpec {
    /// Reverse-DNS id, e.g. `dev.example.echo`.
    pub plugin_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub versions: Vec<SpecVersion>,
    /// Scheme → key material (hex). Today only `ed25519` is understood.
    #[serde(default)]
    pub public_keys: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecVersion {
    pub version: Version,
    pub artifacts: Vec<SpecArtifact>,
    #[serde(default)]
    pub requires: Option<Requires>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecArtifact {
    pub os: String,
    pub arch: String,
    pub url: String,
    pub sha256: String,
    #[serde(default)]
    pub size: Option<u64>,
    /// Detached Ed25519 signature over the archive bytes, hex.
    #[serde(default)]
    pub signature: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Requires {
    #[serde(default)]
    pub min_host_version: Option<Version>,
}

/// Top-level shape of the index document.
#[derive(Debug, Deserialize)]
struct IndexDocument {
    plugins: Vec<PluginSpec>,
}

/// Fetches the central index and caches per-plugin specs on disk.
pub struct IndexClient {
    url: String,
    http: reqwest::Client,
}

impl IndexClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            http: reqwest::Client::new(),
        }
    }

    /// Fetch the index and refresh the on-disk spec cache.
    pub async fn refresh(&self, store: &PluginStore) -> Result<Vec<PluginSpec>, StoreError> {
        let response = self
            .http
            .get(&self.url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| StoreError::DownloadFailed {
                url: self.url.clone(),
                detail: e.to_string(),
            })?;
        let document: IndexDocument =
            response.json().await.map_err(|e| StoreError::DownloadFailed {
                url: self.url.clone(),
                detail: format!("index is not valid JSON: {e}"),
            })?;

        for spec in &document.plugins {
            let path = store.spec_cache_path(&spec.plugin_id);
            if let Err(e) = std::fs::write(&path, serde_json::to_string_pretty(spec)?) {
                tracing::warn!(plugin_id = %spec.plugin_id, error = %e, "Could not cache spec");
            }
        }
        tracing::debug!(plugins = document.plugins.len(), "Refreshed plugin index");
        Ok(document.plugins)
    }

    /// Locate the spec for one plugin, refreshing the index first. Falls
    /// back to the cached spec when the index is unreachable.
    pub async fn spec_for(
        &self,
        store: &PluginStore,
        plugin_id: &str,
    ) -> Result<PluginSpec, StoreError> {
        match self.refresh(store).await {
            Ok(specs) => specs
                .into_iter()
                .find(|s| s.plugin_id == plugin_id)
                .ok_or_else(|| StoreError::SpecNotFound(plugin_id.to_string())),
            Err(e) => {
                let cached = store.spec_cache_path(plugin_id);
                match std::fs::read_to_string(&cached) {
                    Ok(content) => {
                        tracing::warn!(
                            plugin_id,
                            error = %e,
                            "Index unreachable; using cached spec"
                        );
                        Ok(serde_json::from_str(&content)?)
                    }
                    Err(_) => Err(e),
                }
            }
        }
    }
}

/// Pick the version and artifact to install.
///
/// Versions requiring a newer host are filtered out, the rest are ordered
/// descending, then either the exact `preferred` version or the highest is
/// taken. Within the chosen version the artifact must match the host
/// `(os, arch)`.
pub fn resolve<'a>(
    spec: &'a PluginSpec,
    preferred: Option<&Version>,
    host_version: &Version,
    os: &str,
    arch: &str,
) -> Result<(&'a SpecVersion, &'a SpecArtifact), StoreError> {
    let mut candidates: Vec<&SpecVersion> = spec
        .versions
        .iter()
        .filter(|v| {
            v.requires
                .as_ref()
                .and_then(|r| r.min_host_version.as_ref())
                .is_none_or(|min| min <= host_version)
        })
        .collect();
    candidates.sort_by(|a, b| b.version.cmp(&a.version));

    let chosen = match preferred {
        Some(want) => candidates.iter().find(|v| &v.version == want).copied(),
        None => candidates.first().copied(),
    }
    .ok_or_else(|| StoreError::SpecNotFound(spec.plugin_id.clone()))?;

    let artifact = chosen
        .artifacts
        .iter()
        .find(|a| os_matches(&a.os, os) && arch_matches(&a.arch, arch))
        .ok_or_else(|| StoreError::NoMatchingArtifact {
            plugin_id: spec.plugin_id.clone(),
            version: chosen.version.to_string(),
            os: os.to_string(),
            arch: arch.to_string(),
        })?;

    Ok((chosen, artifact))
}

/// Index entries use either Go-style or Rust-style names; accept both.
fn os_matches(artifact_os: &str, host_os: &str) -> bool {
    fn normalize(os: &str) -> &str {
        match os {
            "darwin" => "macos",
            other => other,
        }
    }
    normalize(&artifact_os.to_ascii_lowercase()) == normalize(host_os)
}

fn arch_matches(artifact_arch: &str, host_arch: &str) -> bool {
    fn normalize(arch: &str) -> &str {
        match arch {
            "arm64" => "aarch64",
            "amd64" => "x86_64",
            other => other,
        }
    }
    normalize(&artifact_arch.to_ascii_lowercase()) == normalize(host_arch)
}
