//! Acquire, verify, and install plugin artifacts.
//!
//! The installer never leaves a partially installed version visible: every
//! failure after the version directory exists removes it again, and the
//! `current` pointer only moves after the receipt is durably on disk.

use std::path::{Path, PathBuf};

use ed25519_dalek::{Signature, VerifyingKey};
use semver::Version;

use crate::error::StoreError;
use crate::index::{IndexClient, PluginSpec, SpecArtifact, SpecVersion, resolve};
use crate::store::{ArtifactRecord, PluginStore, Receipt, hash_file};

/// What `install` reports back to the CLI.
#[derive(Debug, Clone)]
pub struct InstallOutcome {
    pub plugin_id: String,
    pub version: Version,
    pub dylib_sha256: String,
}

pub struct PluginInstaller {
    store: PluginStore,
    index: IndexClient,
    http: reqwest::Client,
    host_version: Version,
}

impl PluginInstaller {
    pub fn new(store: PluginStore, index: IndexClient) -> Self {
        // The crate version doubles as the host version plugins gate on.
        let host_version = env!("CARGO_PKG_VERSION")
            .parse()
            .unwrap_or_else(|_| Version::new(0, 0, 0));
        Self {
            store,
            index,
            http: reqwest::Client::new(),
            host_version,
        }
    }

    pub fn store(&self) -> &PluginStore {
        &self.store
    }

    /// Resolve, download, verify, and install one plugin.
    pub async fn install(
        &self,
        plugin_id: &str,
        preferred: Option<&Version>,
    ) -> Result<InstallOutcome, StoreError> {
        let spec = self.index.spec_for(&self.store, plugin_id).await?;
        let (version, artifact) = resolve(
            &spec,
            preferred,
            &self.host_version,
            std::env::consts::OS,
            std::env::consts::ARCH,
        )?;

        // Reinstalling an already-valid version only moves `current`.
        if self
            .store
            .read_receipt(plugin_id, &version.version)
            .is_ok()
        {
            self.store.set_current(plugin_id, &version.version)?;
            let receipt = self.store.read_receipt(plugin_id, &version.version)?;
            tracing::info!(plugin_id, version = %version.version, "Version already installed; current updated");
            return Ok(InstallOutcome {
                plugin_id: plugin_id.to_string(),
                version: version.version.clone(),
                dylib_sha256: receipt.dylib_sha256,
            });
        }

        let archive = self.download(&artifact.url).await?;
        self.install_archive(&spec, version, artifact, archive.path())
            .await
    }

    /// Upgrade one plugin, or every installed plugin, to its latest
    /// resolvable version. In the everything mode, per-plugin failures are
    /// logged and skipped.
    pub async fn upgrade(
        &self,
        plugin_id: Option<&str>,
    ) -> Result<Vec<InstallOutcome>, StoreError> {
        let targets: Vec<String> = match plugin_id {
            Some(id) => vec![id.to_string()],
            None => self
                .store
                .list_installed()?
                .into_iter()
                .map(|p| p.plugin_id)
                .collect(),
        };

        let mut outcomes = Vec::new();
        for id in &targets {
            match self.upgrade_one(id).await {
                Ok(Some(outcome)) => outcomes.push(outcome),
                Ok(None) => {
                    tracing::info!(plugin_id = %id, "Already at the latest version");
                }
                Err(e) if plugin_id.is_some() => return Err(e),
                Err(e) => {
                    tracing::warn!(plugin_id = %id, error = %e, "Upgrade failed; skipping");
                }
            }
        }
        Ok(outcomes)
    }

    async fn upgrade_one(&self, plugin_id: &str) -> Result<Option<InstallOutcome>, StoreError> {
        let latest = {
            let spec = self.index.spec_for(&self.store, plugin_id).await?;
            let (latest, _) = resolve(
                &spec,
                None,
                &self.host_version,
                std::env::consts::OS,
                std::env::consts::ARCH,
            )?;
            latest.version.clone()
        };
        let current = self.store.current_version(plugin_id);
        if current.as_ref() >= Some(&latest) {
            return Ok(None);
        }
        self.install(plugin_id, Some(&latest)).await.map(Some)
    }

    /// Verify and install an already-downloaded archive. Split from
    /// [`install`] so the acquire path is exercisable without a network.
    pub async fn install_archive(
        &self,
        spec: &PluginSpec,
        version: &SpecVersion,
        artifact: &SpecArtifact,
        archive: &Path,
    ) -> Result<InstallOutcome, StoreError> {
        // Checksum first: case-insensitive hex compare.
        let actual = hash_file(archive)?;
        if !actual.eq_ignore_ascii_case(&artifact.sha256) {
            return Err(StoreError::ChecksumMismatch {
                url: artifact.url.clone(),
                expected: artifact.sha256.clone(),
                actual,
            });
        }

        verify_signature(spec, artifact, archive)?;

        // Unpack and place the library. Everything below may block on file
        // I/O, and every failure after the version directory exists rolls
        // it back.
        let store = self.store.clone();
        let plugin_id = spec.plugin_id.clone();
        let semver = version.version.clone();
        let artifact = artifact.clone();
        let archive = archive.to_path_buf();

        tokio::task::spawn_blocking(move || {
            let result = place_library(&store, &plugin_id, &semver, &artifact, &archive);
            if result.is_err() {
                if let Err(cleanup) = store.remove_version(&plugin_id, &semver) {
                    tracing::warn!(
                        plugin_id,
                        version = %semver,
                        error = %cleanup,
                        "Could not clean up failed install"
                    );
                }
            }
            result
        })
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
    }

    /// Stream an artifact to a temp file.
    async fn download(&self, url: &str) -> Result<tempfile::NamedTempFile, StoreError> {
        use std::io::Write;

        let mut response = self
            .http
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| StoreError::DownloadFailed {
                url: url.to_string(),
                detail: e.to_string(),
            })?;

        let mut file = tempfile::NamedTempFile::new()?;
        while let Some(chunk) = response.chunk().await.map_err(|e| StoreError::DownloadFailed {
            url: url.to_string(),
            detail: e.to_string(),
        })? {
            file.as_file_mut().write_all(&chunk)?;
        }
        file.as_file_mut().sync_all()?;
        tracing::debug!(url, "Artifact downloaded");
        Ok(file)
    }
}

/// Steps 4–7 of the acquire sequence: unpack, copy into the version
/// directory, hash, write the receipt, flip `current`.
fn place_library(
    store: &PluginStore,
    plugin_id: &str,
    version: &Version,
    artifact: &SpecArtifact,
    archive: &Path,
) -> Result<InstallOutcome, StoreError> {
    let staging = tempfile::tempdir()?;
    let extracted = extract_single_library(archive, staging.path())?;
    let filename = extracted
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| StoreError::LayoutInvalid("library has no file name".into()))?;

    let version_dir = store.version_dir(plugin_id, version);
    std::fs::create_dir_all(&version_dir)?;
    let installed = version_dir.join(&filename);
    std::fs::copy(&extracted, &installed)?;
    clear_quarantine(&installed);

    let dylib_sha256 = hash_file(&installed)?;
    let receipt = Receipt {
        plugin_id: plugin_id.to_string(),
        version: version.to_string(),
        installed_at: chrono::Utc::now(),
        dylib_filename: filename,
        dylib_sha256: dylib_sha256.clone(),
        platform: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        artifact: ArtifactRecord {
            url: artifact.url.clone(),
            sha256: artifact.sha256.clone(),
            signature: artifact.signature.clone(),
        },
    };
    store.write_receipt(&receipt)?;
    store.set_current(plugin_id, version)?;

    tracing::info!(plugin_id, version = %version, "Plugin installed");
    Ok(InstallOutcome {
        plugin_id: plugin_id.to_string(),
        version: version.clone(),
        dylib_sha256,
    })
}

/// Locate exactly one shared library in the archive, at any depth, and
/// extract it into `dest_dir`.
fn extract_single_library(archive: &Path, dest_dir: &Path) -> Result<PathBuf, StoreError> {
    const LIBRARY_EXTENSIONS: &[&str] = &["dylib", "so", "dll"];

    let file = std::fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file)
        .map_err(|e| StoreError::LayoutInvalid(format!("not a zip archive: {e}")))?;

    let mut library: Option<(usize, String)> = None;
    for i in 0..zip.len() {
        let entry = zip
            .by_index(i)
            .map_err(|e| StoreError::LayoutInvalid(e.to_string()))?;
        if !entry.is_file() {
            continue;
        }
        let name = entry.name().to_string();
        let is_library = Path::new(&name)
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| LIBRARY_EXTENSIONS.contains(&e));
        if !is_library {
            continue;
        }
        let filename = Path::new(&name)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| StoreError::LayoutInvalid(format!("unusable entry name: {name}")))?;
        if library.is_some() {
            return Err(StoreError::LayoutInvalid(
                "archive contains more than one shared library".into(),
            ));
        }
        library = Some((i, filename));
    }

    let (index, filename) = library.ok_or_else(|| {
        StoreError::LayoutInvalid("archive contains no shared library".into())
    })?;

    let mut entry = zip
        .by_index(index)
        .map_err(|e| StoreError::LayoutInvalid(e.to_string()))?;
    let out_path = dest_dir.join(filename);
    let mut out = std::fs::File::create(&out_path)?;
    std::io::copy(&mut entry, &mut out)?;
    out.sync_all()?;
    Ok(out_path)
}

/// Verify the artifact's detached signature when the spec supplies both a
/// signature and key material.
///
/// No signature, or a signature with no declared keys at all, passes
/// (unsigned distribution). A signature whose scheme we cannot verify with
/// the declared keys fails closed.
fn verify_signature(
    spec: &PluginSpec,
    artifact: &SpecArtifact,
    archive: &Path,
) -> Result<(), StoreError> {
    let Some(signature_hex) = &artifact.signature else {
        return Ok(());
    };
    if spec.public_keys.is_empty() {
        tracing::debug!(
            plugin_id = %spec.plugin_id,
            "Signature present but spec declares no public keys; nothing to verify against"
        );
        return Ok(());
    }

    let Some(key_hex) = spec.public_keys.get("ed25519") else {
        let schemes: Vec<&str> = spec.public_keys.keys().map(String::as_str).collect();
        return Err(StoreError::SignatureInvalid(format!(
            "no ed25519 key among declared schemes [{}]; refusing to install signed artifact",
            schemes.join(", ")
        )));
    };

    let key_bytes: [u8; 32] = hex::decode(key_hex)
        .map_err(|e| StoreError::SignatureInvalid(format!("public key is not hex: {e}")))?
        .try_into()
        .map_err(|_| StoreError::SignatureInvalid("public key must be 32 bytes".into()))?;
    let key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| StoreError::SignatureInvalid(format!("public key rejected: {e}")))?;

    let signature_bytes: [u8; 64] = hex::decode(signature_hex)
        .map_err(|e| StoreError::SignatureInvalid(format!("signature is not hex: {e}")))?
        .try_into()
        .map_err(|_| StoreError::SignatureInvalid("signature must be 64 bytes".into()))?;
    let signature = Signature::from_bytes(&signature_bytes);

    let bytes = std::fs::read(archive)?;
    key.verify_strict(&bytes, &signature)
        .map_err(|_| StoreError::SignatureInvalid("signature does not match archive bytes".into()))
}

/// macOS tags downloads with a quarantine attribute that blocks `dlopen`.
/// Best effort; failure is not fatal.
#[cfg(target_os = "macos")]
fn clear_quarantine(path: &Path) {
    let _ = std::process::Command::new("xattr")
        .args(["-d", "com.apple.quarantine"])
        .arg(path)
        .output();
}

#[cfg(not(target_os = "macos"))]
fn clear_quarantine(_path: &Path) {}
