use std::path::Path;

use serde::Deserialize;

/// `osaurus.toml`. Every field has a default, so an absent or empty file is
/// a valid configuration.
#[derive(Debug, Default, Deserialize)]
pub struct OsaurusConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub plugins: PluginsConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// `OSAURUS_PORT` overrides at load time.
    #[serde(default = "default_port")]
    pub port: u16,
    /// `false` binds 127.0.0.1; `true` exposes the server on 0.0.0.0.
    #[serde(default)]
    pub expose: bool,
    /// Origins allowed for CORS. Empty list: no CORS headers at all.
    /// A `*` entry allows any origin.
    #[serde(default)]
    pub cors_allowed_origins: Vec<String>,
    /// Deadline for non-streaming chat requests, seconds. Streaming
    /// requests are unbounded.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// How long shutdown waits for in-flight writers to drain, seconds.
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

fn default_port() -> u16 {
    1337
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_drain_timeout_secs() -> u64 {
    5
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            expose: false,
            cors_allowed_origins: Vec::new(),
            request_timeout_secs: default_request_timeout_secs(),
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub enum BackendProvider {
    /// Scripted stub; serves canned completions so the gateway runs without
    /// an inference runtime.
    #[serde(rename = "stub")]
    Stub,
    /// A remote OpenAI-compatible endpoint (adapter supplied externally).
    #[serde(rename = "openai-compatible")]
    OpenAiCompatible,
}

#[derive(Debug, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_provider")]
    pub provider: BackendProvider,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
}

fn default_provider() -> BackendProvider {
    BackendProvider::Stub
}
fn default_base_url() -> String {
    "http://localhost:8080/v1".into()
}
fn default_model() -> String {
    "default".into()
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            base_url: default_base_url(),
            model: default_model(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PluginsConfig {
    /// `OSAURUS_PLUGIN_INDEX` overrides at load time.
    #[serde(default = "default_index_url")]
    pub index_url: String,
    /// Store root. Empty: the platform application-support directory.
    #[serde(default)]
    pub root: String,
}

fn default_index_url() -> String {
    "https://plugins.osaurus.ai/index.json".into()
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            index_url: default_index_url(),
            root: String::new(),
        }
    }
}

impl OsaurusConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: OsaurusConfig = toml::from_str(&content)?;
        config.apply_env();
        Ok(config)
    }

    /// Defaults plus environment overrides; used when no config file exists.
    pub fn load_default() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        if let Ok(port) = std::env::var("OSAURUS_PORT") {
            match port.parse() {
                Ok(port) => self.server.port = port,
                Err(_) => tracing::warn!(value = %port, "Ignoring unparseable OSAURUS_PORT"),
            }
        }
        if let Ok(url) = std::env::var("OSAURUS_PLUGIN_INDEX") {
            self.plugins.index_url = url;
        }
    }

    pub fn bind_address(&self) -> std::net::SocketAddr {
        let host: std::net::IpAddr = if self.server.expose {
            std::net::Ipv4Addr::UNSPECIFIED.into()
        } else {
            std::net::Ipv4Addr::LOCALHOST.into()
        };
        (host, self.server.port).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_is_valid() {
        let config: OsaurusConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 1337);
        assert!(!config.server.expose);
        assert!(config.server.cors_allowed_origins.is_empty());
        assert_eq!(config.backend.provider, BackendProvider::Stub);
    }

    #[test]
    fn parses_full_config() {
        let toml_str = r#"
[server]
port = 4242
expose = true
cors_allowed_origins = ["http://localhost:3000", "*"]
request_timeout_secs = 60

[backend]
provider = "openai-compatible"
base_url = "http://localhost:11434/v1"
model = "llama3"

[plugins]
index_url = "https://example.com/index.json"
"#;
        let config: OsaurusConfig = toml_str.parse::<toml::Table>().unwrap().try_into().unwrap();
        assert_eq!(config.server.port, 4242);
        assert!(config.server.expose);
        assert_eq!(config.server.cors_allowed_origins.len(), 2);
        assert_eq!(config.backend.provider, BackendProvider::OpenAiCompatible);
        assert_eq!(config.backend.model, "llama3");
        assert_eq!(config.plugins.index_url, "https://example.com/index.json");
    }

    #[test]
    fn bind_address_follows_expose() {
        let mut config = OsaurusConfig::default();
        assert_eq!(config.bind_address().to_string(), "127.0.0.1:1337");
        config.server.expose = true;
        config.server.port = 9000;
        assert_eq!(config.bind_address().to_string(), "0.0.0.0:9000");
    }
}
