//! wsterm - terminal over WebSocket
//!
//! **Server mode** (`wsterm serve`): exposes a shell per WebSocket connection
//! on `/ws`, speaking the attach frame protocol.
//!
//! **Attach mode** (`wsterm attach`): connects the local terminal to a
//! running server and stays attached until the remote shell exits.

use clap::{Parser as ClapParser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wsterm::{
    client,
    config::{Config, ConfigError},
    server,
};

/// wsterm - terminal over WebSocket
#[derive(ClapParser, Debug)]
#[command(name = "wsterm", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(short = 'd', long, global = true)]
    debug: bool,

    /// Config file (defaults to $XDG_CONFIG_HOME/wsterm/config.toml)
    #[arg(long, global = true, env = "WSTERM_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve a shell per WebSocket connection
    Serve {
        /// Address to bind the HTTP/WebSocket server
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Shell to spawn (overrides config and $SHELL)
        #[arg(long)]
        shell: Option<String>,

        /// Working directory for spawned shells
        #[arg(long)]
        dir: Option<String>,
    },

    /// Attach the local terminal to a server
    Attach {
        /// Server address as host:port
        address: Option<String>,

        /// Only render remote output, never send local input
        #[arg(long)]
        receive_only: bool,
    },
}

#[derive(Error, Debug)]
pub enum WstermError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("server error: {0}")]
    Server(#[from] server::ServerError),

    #[error("client error: {0}")]
    Client(#[from] client::ClientError),

    #[error("task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

#[tokio::main]
async fn main() -> Result<(), WstermError> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let mut config = Config::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { bind, shell, dir } => {
            if bind.is_some() {
                config.server.bind = bind;
            }
            if shell.is_some() {
                config.server.shell = shell;
            }
            if dir.is_some() {
                config.server.working_dir = dir;
            }
            run_server(&config).await
        }
        Commands::Attach {
            address,
            receive_only,
        } => {
            if address.is_some() {
                config.client.address = address;
            }
            if receive_only {
                config.client.receive_only = true;
            }
            run_attach(&config).await
        }
    }
}

/// Logs go to stderr: stdout belongs to the attached terminal.
fn init_tracing(debug: bool) {
    let default_filter = if debug {
        "wsterm=debug,tower_http=debug"
    } else {
        "wsterm=info,tower_http=info"
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

// ── Server mode ────────────────────────────────────────────────────

async fn run_server(config: &Config) -> Result<(), WstermError> {
    let bind = config.bind_addr()?;
    let command = config.spawn_command()?;
    tracing::info!(%bind, shell = %command.shell_path(), "wsterm server starting");

    let state = server::AppState::new(command);
    let shutdown = state.shutdown.clone();
    let mut server_handle = tokio::spawn(server::serve(bind, state));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received Ctrl+C");
        }
        result = &mut server_handle => {
            // Bind failures end up here before any signal arrives.
            result??;
            return Ok(());
        }
    }

    // Open sockets get a close frame, then the listener stops.
    shutdown.cancel();
    server_handle.await??;

    tracing::info!("wsterm server stopped");
    Ok(())
}

// ── Attach mode ────────────────────────────────────────────────────

async fn run_attach(config: &Config) -> Result<(), WstermError> {
    let address = config.client_address();
    tracing::debug!(%address, receive_only = config.client.receive_only, "attaching");
    client::attach(address, config.client.receive_only).await?;
    Ok(())
}
