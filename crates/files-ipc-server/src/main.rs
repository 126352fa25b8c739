//! Standalone Files IPC server over a mock shell.
//!
//! Serves the full IPC surface without the file-manager host: one
//! in-memory shell backed by the real filesystem for metadata. Useful for
//! driving the protocol with external JSON-RPC clients during
//! development.
//!
//! ```text
//! files-ipc-server --state-dir /tmp/files-ipc --print-token
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use files_ipc_core::{FileTokenStore, IpcConfig, Rendezvous, TokenStore};
use files_ipc_server::adapter::InMemoryShellAdapter;
use files_ipc_server::{
    Coordinator, IpcService, MethodRegistry, PipeTransport, SessionRuntime, ShellDescriptor,
    ShellRegistry, UiQueue, WebSocketTransport,
};

/// Standalone Files IPC server (mock shell).
#[derive(Parser, Debug)]
#[command(name = "files-ipc-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Directory for the token store and rendezvous descriptor.
    /// Defaults to `<local-data-dir>/FilesIPC`.
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Preferred WebSocket port.
    #[arg(long, default_value_t = 52345)]
    ws_port: u16,

    /// Disable the pipe transport.
    #[arg(long)]
    no_pipe: bool,

    /// Disable the WebSocket transport.
    #[arg(long)]
    no_websocket: bool,

    /// Initial working directory of the mock shell.
    #[arg(long, default_value = "/")]
    shell_root: String,

    /// Print the access token to stdout after startup.
    #[arg(long)]
    print_token: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn state_dir(args: &Args) -> Result<PathBuf> {
    if let Some(dir) = &args.state_dir {
        return Ok(dir.clone());
    }
    let base = dirs::data_local_dir().context("no local data directory for this user")?;
    Ok(base.join("FilesIPC"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let state_dir = state_dir(&args)?;
    let store = Arc::new(FileTokenStore::open(&state_dir).context("failed to open token store")?);
    // The standalone server implies the opt-in the host settings page
    // would normally record.
    store.set_enabled(true)?;

    let config = Arc::new(IpcConfig::new());
    config.set_ws_preferred_port(args.ws_port);

    let registry = Arc::new(ShellRegistry::new());
    registry.register(ShellDescriptor {
        shell_id: "shell-1".to_string(),
        window_id: 1,
        tab_id: "tab-1".to_string(),
        adapter: Arc::new(InMemoryShellAdapter::new(args.shell_root.clone())),
        active: true,
    });
    registry.set_focused_window(Some(1));

    let coordinator = Arc::new(Coordinator::new(
        Arc::clone(&registry),
        UiQueue::spawn(),
        Arc::clone(&config),
    ));
    let runtime = SessionRuntime::new(
        config,
        Arc::new(MethodRegistry::with_defaults()),
        store,
        Arc::new(Rendezvous::new(&state_dir)),
        coordinator,
    );

    let mut transports: Vec<Arc<dyn files_ipc_server::TransportListener>> = Vec::new();
    if !args.no_websocket {
        transports.push(Arc::new(WebSocketTransport::new()));
    }
    if !args.no_pipe {
        transports.push(Arc::new(PipeTransport::new(&state_dir)));
    }

    let service = IpcService::new(runtime, transports);
    service.start().await.context("failed to start IPC service")?;

    info!(
        descriptor = %service.runtime().rendezvous().current_path().display(),
        "Files IPC server running; Ctrl-C to stop"
    );
    if args.print_token {
        println!("{}", service.runtime().current_token());
    }

    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;
    info!("shutting down");
    service.stop().await;
    Ok(())
}
