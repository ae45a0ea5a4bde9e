use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt};

use osaurus_plugins::{IndexClient, PluginInstaller, PluginStore};
use osaurus_server::config::OsaurusConfig;
use osaurus_server::state::AppState;
use osaurus_server::{lifecycle, mcp};

#[derive(Parser)]
#[command(name = "osaurus", about = "Osaurus — local LLM inference gateway")]
struct Cli {
    /// Path to osaurus.toml (defaults apply when absent).
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP gateway (the default).
    Serve {
        /// Override the configured port.
        #[arg(long)]
        port: Option<u16>,
        /// Bind 0.0.0.0 instead of 127.0.0.1.
        #[arg(long)]
        expose: bool,
    },
    /// Serve the tool registry over MCP on stdin/stdout.
    Mcp,
    /// Manage installed tool plugins.
    Tools {
        #[command(subcommand)]
        command: ToolsCommand,
    },
}

#[derive(Subcommand)]
enum ToolsCommand {
    /// Install a plugin from the central index.
    Install {
        plugin_id: String,
        /// Exact version to install; highest compatible otherwise.
        #[arg(long)]
        version: Option<String>,
    },
    /// Upgrade one plugin, or all installed plugins.
    Upgrade { plugin_id: Option<String> },
    /// Point `current` back at the previously installed version.
    Rollback { plugin_id: String },
    /// Remove a plugin by id, directory name, or path.
    Uninstall { target: String },
    /// Recompute installed dylib checksums against their receipts.
    Verify,
    /// List installed plugins and their active versions.
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so stdout stays clean for the MCP stdio transport.
    fmt()
        .with_env_filter(EnvFilter::from_env("OSAURUS_LOG"))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => OsaurusConfig::from_file(path)?,
        None => OsaurusConfig::load_default(),
    };

    match cli.command.unwrap_or(Command::Serve {
        port: None,
        expose: false,
    }) {
        Command::Serve { port, expose } => {
            let mut config = config;
            if let Some(port) = port {
                config.server.port = port;
            }
            if expose {
                config.server.expose = true;
            }
            let state = AppState::bootstrap(config).await?;
            lifecycle::serve(state).await
        }
        Command::Mcp => {
            let state = AppState::bootstrap(config).await?;
            mcp::serve_stdio(state.registry).await
        }
        Command::Tools { command } => {
            let root = if config.plugins.root.is_empty() {
                PluginStore::default_root()
            } else {
                PathBuf::from(&config.plugins.root)
            };
            let store = PluginStore::new(root);
            store.init()?;
            let installer =
                PluginInstaller::new(store, IndexClient::new(config.plugins.index_url.clone()));
            run_tools_command(&installer, command).await
        }
    }
}

async fn run_tools_command(installer: &PluginInstaller, command: ToolsCommand) -> Result<()> {
    match command {
        ToolsCommand::Install { plugin_id, version } => {
            let version = version
                .map(|v| v.parse::<semver::Version>())
                .transpose()?;
            let outcome = installer.install(&plugin_id, version.as_ref()).await?;
            println!("installed {}@{}", outcome.plugin_id, outcome.version);
        }
        ToolsCommand::Upgrade { plugin_id } => {
            let outcomes = installer.upgrade(plugin_id.as_deref()).await?;
            if outcomes.is_empty() {
                println!("nothing to upgrade");
            }
            for outcome in outcomes {
                println!("upgraded {} to {}", outcome.plugin_id, outcome.version);
            }
        }
        ToolsCommand::Rollback { plugin_id } => {
            let version = installer.store().rollback(&plugin_id)?;
            println!("rolled back {plugin_id} to {version}");
        }
        ToolsCommand::Uninstall { target } => {
            let removed = installer.store().uninstall(&target)?;
            for plugin_id in removed {
                println!("uninstalled {plugin_id}");
            }
        }
        ToolsCommand::Verify => {
            let reports = installer.store().verify()?;
            if reports.is_empty() {
                println!("no plugins installed");
            }
            for report in reports {
                let status = if report.ok { "OK" } else { "FAIL" };
                print!("{status}  {}@{}", report.plugin_id, report.version);
                match report.detail {
                    Some(detail) => println!("  ({detail})"),
                    None => println!(),
                }
            }
        }
        ToolsCommand::List => {
            let installed = installer.store().list_installed()?;
            if installed.is_empty() {
                println!("no plugins installed");
            }
            for plugin in installed {
                for version in &plugin.versions {
                    let marker = if Some(version) == plugin.current.as_ref() {
                        "*"
                    } else {
                        " "
                    };
                    println!("{marker} {}@{version}", plugin.plugin_id);
                }
            }
        }
    }
    Ok(())
}
