//! The Osaurus gateway server.
//!
//! One local HTTP port speaking three chat dialects (OpenAI, Anthropic,
//! Ollama) plus an MCP surface over HTTP and stdio. Requests are decoded to
//! the internal model, driven through the streaming pipeline against a
//! pluggable backend, and re-encoded by a dialect-matched writer.

pub mod config;
pub mod dialect;
pub mod handlers;
pub mod lifecycle;
pub mod mcp;
pub mod router;
pub mod state;
pub mod writers;

pub use config::OsaurusConfig;
pub use state::AppState;
