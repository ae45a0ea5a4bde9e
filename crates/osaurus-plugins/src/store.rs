//! The versioned on-disk plugin store.
//!
//! Layout under the store root (no sidecar database; receipts are the
//! authoritative record of installed state):
//!
//! ```text
//! {root}/
//!   Tools/{plugin_id}/{semver}/       - receipt.json + the shared library
//!   Tools/{plugin_id}/current         - pointer to the active version
//!   PluginSpecs/{plugin_id}.json      - cached central-index entry
//! ```
//!
//! On Unix `current` is a symlink; elsewhere it is a plain file holding the
//! version string. Readers handle both forms.

use std::path::{Path, PathBuf};

use semver::Version;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::StoreError;

pub const RECEIPT_FILE: &str = "receipt.json";
const CURRENT_LINK: &str = "current";

/// Authoritative record of one installed plugin version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    pub plugin_id: String,
    pub version: String,
    pub installed_at: chrono::DateTime<chrono::Utc>,
    pub dylib_filename: String,
    /// SHA-256 hex of the dylib as installed. `verify` recomputes and
    /// compares.
    pub dylib_sha256: String,
    pub platform: String,
    pub arch: String,
    pub artifact: ArtifactRecord,
}

/// Where the installed bytes came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub url: String,
    pub sha256: String,
    #[serde(default)]
    pub signature: Option<String>,
}

/// Installed state of one plugin, derived from receipts on disk.
#[derive(Debug, Clone)]
pub struct InstalledPlugin {
    pub plugin_id: String,
    /// Descending.
    pub versions: Vec<Version>,
    pub current: Option<Version>,
}

/// Outcome of `verify` for one installed version.
#[derive(Debug, Clone)]
pub struct VerifyReport {
    pub plugin_id: String,
    pub version: Version,
    pub ok: bool,
    pub detail: Option<String>,
}

#[derive(Clone)]
pub struct PluginStore {
    root: PathBuf,
}

impl PluginStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Platform application-support directory, `~/.osaurus` as a fallback.
    pub fn default_root() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".osaurus")
            })
            .join("osaurus")
    }

    pub fn init(&self) -> Result<(), StoreError> {
        std::fs::create_dir_all(self.tools_dir())?;
        std::fs::create_dir_all(self.specs_dir())?;
        Ok(())
    }

    pub fn tools_dir(&self) -> PathBuf {
        self.root.join("Tools")
    }

    pub fn specs_dir(&self) -> PathBuf {
        self.root.join("PluginSpecs")
    }

    pub fn plugin_dir(&self, plugin_id: &str) -> PathBuf {
        self.tools_dir().join(plugin_id)
    }

    pub fn version_dir(&self, plugin_id: &str, version: &Version) -> PathBuf {
        self.plugin_dir(plugin_id).join(version.to_string())
    }

    pub fn spec_cache_path(&self, plugin_id: &str) -> PathBuf {
        self.specs_dir().join(format!("{plugin_id}.json"))
    }

    fn current_path(&self, plugin_id: &str) -> PathBuf {
        self.plugin_dir(plugin_id).join(CURRENT_LINK)
    }

    // ── Receipts ──

    pub fn read_receipt(&self, plugin_id: &str, version: &Version) -> Result<Receipt, StoreError> {
        let path = self.version_dir(plugin_id, version).join(RECEIPT_FILE);
        let content =
            std::fs::read_to_string(&path).map_err(|e| StoreError::ReceiptInvalid {
                path: path.display().to_string(),
                detail: e.to_string(),
            })?;
        serde_json::from_str(&content).map_err(|e| StoreError::ReceiptInvalid {
            path: path.display().to_string(),
            detail: e.to_string(),
        })
    }

    /// Write a receipt with temp-file + fsync + rename so readers never see
    /// a torn receipt.
    pub fn write_receipt(&self, receipt: &Receipt) -> Result<(), StoreError> {
        let version: Version = receipt.version.parse().map_err(|e| {
            StoreError::ReceiptInvalid {
                path: receipt.version.clone(),
                detail: format!("not a semver: {e}"),
            }
        })?;
        let dir = self.version_dir(&receipt.plugin_id, &version);
        std::fs::create_dir_all(&dir)?;
        let tmp = dir.join(format!("{RECEIPT_FILE}.tmp"));
        {
            use std::io::Write;
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(serde_json::to_string_pretty(receipt)?.as_bytes())?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, dir.join(RECEIPT_FILE))?;
        Ok(())
    }

    // ── Installed-state derivation ──

    /// Versions of one plugin with a valid receipt, descending.
    pub fn installed_versions(&self, plugin_id: &str) -> Vec<Version> {
        let dir = self.plugin_dir(plugin_id);
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return Vec::new();
        };
        let mut versions: Vec<Version> = entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name();
                let version: Version = name.to_string_lossy().parse().ok()?;
                entry
                    .path()
                    .join(RECEIPT_FILE)
                    .exists()
                    .then_some(version)
            })
            .collect();
        versions.sort_by(|a, b| b.cmp(a));
        versions
    }

    /// All installed plugins, derived from receipts and `current` pointers.
    pub fn list_installed(&self) -> Result<Vec<InstalledPlugin>, StoreError> {
        let tools = self.tools_dir();
        if !tools.exists() {
            return Ok(Vec::new());
        }
        let mut plugins = Vec::new();
        for entry in std::fs::read_dir(&tools)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let plugin_id = entry.file_name().to_string_lossy().into_owned();
            let versions = self.installed_versions(&plugin_id);
            if versions.is_empty() {
                continue;
            }
            let current = self.current_version(&plugin_id);
            plugins.push(InstalledPlugin {
                plugin_id,
                versions,
                current,
            });
        }
        plugins.sort_by(|a, b| a.plugin_id.cmp(&b.plugin_id));
        Ok(plugins)
    }

    // ── The `current` pointer ──

    pub fn current_version(&self, plugin_id: &str) -> Option<Version> {
        let path = self.current_path(plugin_id);
        let target = match std::fs::read_link(&path) {
            Ok(link) => link.file_name()?.to_string_lossy().into_owned(),
            // Plain-file fallback (non-Unix installs).
            Err(_) => std::fs::read_to_string(&path).ok()?.trim().to_string(),
        };
        let version: Version = target.parse().ok()?;
        // A pointer at a directory without a valid receipt is dangling.
        self.read_receipt(plugin_id, &version).ok()?;
        Some(version)
    }

    /// Point `current` at `version`: remove the old pointer, create the new
    /// one.
    pub fn set_current(&self, plugin_id: &str, version: &Version) -> Result<(), StoreError> {
        let path = self.current_path(plugin_id);
        if std::fs::symlink_metadata(&path).is_ok() {
            std::fs::remove_file(&path)?;
        }
        #[cfg(unix)]
        std::os::unix::fs::symlink(version.to_string(), &path)?;
        #[cfg(not(unix))]
        std::fs::write(&path, version.to_string())?;
        Ok(())
    }

    /// Path to the dylib of an installed version, per its receipt.
    pub fn dylib_path(&self, plugin_id: &str, version: &Version) -> Result<PathBuf, StoreError> {
        let receipt = self.read_receipt(plugin_id, version)?;
        Ok(self
            .version_dir(plugin_id, version)
            .join(receipt.dylib_filename))
    }

    /// Path to the dylib of the active version, if any.
    pub fn current_dylib_path(&self, plugin_id: &str) -> Option<PathBuf> {
        let version = self.current_version(plugin_id)?;
        self.dylib_path(plugin_id, &version).ok()
    }

    // ── Operations ──

    /// Flip `current` to the next-most-recent installed version. The version
    /// rolled away from keeps its files.
    pub fn rollback(&self, plugin_id: &str) -> Result<Version, StoreError> {
        let versions = self.installed_versions(plugin_id);
        if versions.is_empty() {
            return Err(StoreError::NotInstalled(plugin_id.to_string()));
        }
        if versions.len() < 2 {
            return Err(StoreError::NoPreviousVersion(plugin_id.to_string()));
        }
        let target = versions[1].clone();
        self.set_current(plugin_id, &target)?;
        tracing::info!(plugin_id, version = %target, "Rolled back");
        Ok(target)
    }

    /// Recompute every installed dylib's SHA-256 and compare against its
    /// receipt.
    pub fn verify(&self) -> Result<Vec<VerifyReport>, StoreError> {
        let mut reports = Vec::new();
        for plugin in self.list_installed()? {
            for version in &plugin.versions {
                reports.push(self.verify_one(&plugin.plugin_id, version));
            }
        }
        Ok(reports)
    }

    fn verify_one(&self, plugin_id: &str, version: &Version) -> VerifyReport {
        let (ok, detail) = match self.read_receipt(plugin_id, version) {
            Ok(receipt) => {
                let dylib = self.version_dir(plugin_id, version).join(&receipt.dylib_filename);
                match hash_file(&dylib) {
                    Ok(actual) if actual.eq_ignore_ascii_case(&receipt.dylib_sha256) => {
                        (true, None)
                    }
                    Ok(actual) => (
                        false,
                        Some(format!(
                            "hash mismatch: receipt {}, on disk {actual}",
                            receipt.dylib_sha256
                        )),
                    ),
                    Err(e) => (false, Some(format!("cannot hash dylib: {e}"))),
                }
            }
            Err(e) => (false, Some(e.to_string())),
        };
        VerifyReport {
            plugin_id: plugin_id.to_string(),
            version: version.clone(),
            ok,
            detail,
        }
    }

    /// Remove an installed plugin or one version of it.
    ///
    /// `target` may be a plugin id, a directory name under `Tools/`, or a
    /// filesystem path (to a plugin dir or a version dir). Returns the ids
    /// whose state changed.
    pub fn uninstall(&self, target: &str) -> Result<Vec<String>, StoreError> {
        let as_path = PathBuf::from(target);
        let by_id = self.plugin_dir(target);

        if by_id.is_dir() {
            std::fs::remove_dir_all(&by_id)?;
            tracing::info!(plugin_id = target, "Uninstalled");
            return Ok(vec![target.to_string()]);
        }

        if as_path.is_dir() && as_path.starts_with(self.tools_dir()) {
            // A path: either Tools/<id> or Tools/<id>/<version>.
            let plugin_id = plugin_id_of_path(&self.tools_dir(), &as_path)
                .ok_or_else(|| StoreError::NotInstalled(target.to_string()))?;
            std::fs::remove_dir_all(&as_path)?;
            self.repair_current(&plugin_id)?;
            tracing::info!(plugin_id, path = %as_path.display(), "Uninstalled");
            return Ok(vec![plugin_id]);
        }

        Err(StoreError::NotInstalled(target.to_string()))
    }

    /// Remove one version directory, repairing `current` if it dangles.
    pub fn remove_version(&self, plugin_id: &str, version: &Version) -> Result<(), StoreError> {
        let dir = self.version_dir(plugin_id, version);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        self.repair_current(plugin_id)?;
        Ok(())
    }

    /// Re-point `current` at the newest remaining version, or drop it when
    /// nothing is left.
    fn repair_current(&self, plugin_id: &str) -> Result<(), StoreError> {
        if self.current_version(plugin_id).is_some() {
            return Ok(());
        }
        let path = self.current_path(plugin_id);
        if std::fs::symlink_metadata(&path).is_ok() {
            std::fs::remove_file(&path)?;
        }
        let versions = self.installed_versions(plugin_id);
        match versions.first() {
            Some(newest) => self.set_current(plugin_id, newest)?,
            None => {
                // Last version gone: drop the now-empty plugin dir.
                let dir = self.plugin_dir(plugin_id);
                if dir.exists() && std::fs::read_dir(&dir)?.next().is_none() {
                    std::fs::remove_dir(&dir)?;
                }
            }
        }
        Ok(())
    }
}

/// The plugin id a path under `Tools/` belongs to.
fn plugin_id_of_path(tools_dir: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(tools_dir).ok()?;
    Some(relative.components().next()?.as_os_str().to_string_lossy().into_owned())
}

/// SHA-256 hex of a file's bytes.
pub fn hash_file(path: &Path) -> Result<String, StoreError> {
    let bytes = std::fs::read(path)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}
