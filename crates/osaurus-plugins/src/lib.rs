//! External plugin system for Osaurus.
//!
//! Plugins are shared libraries speaking a five-function C ABI
//! ([`abi::PluginApi`]). They are distributed as ZIP archives described by a
//! central index, installed into a versioned on-disk store whose receipts
//! are the single source of truth, and loaded with `dlopen` so their tools
//! appear in the process-wide [`ToolRegistry`](osaurus_core::ToolRegistry).
//!
//! ```text
//! archive -> PluginInstaller -> Tools/<id>/<version>/ (receipt + dylib)
//!                                   -> PluginLoader (dlopen)
//!                                   -> ToolRegistry
//! ```

pub mod abi;
pub mod error;
pub mod index;
pub mod installer;
pub mod loader;
pub mod manifest;
pub mod store;

pub use error::{PluginError, StoreError};
pub use index::{IndexClient, PluginSpec};
pub use installer::{InstallOutcome, PluginInstaller};
pub use loader::{LoadedPluginInfo, PluginLoader};
pub use manifest::PluginManifest;
pub use store::{InstalledPlugin, PluginStore, Receipt, VerifyReport};
