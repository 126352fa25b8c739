//! Shared scaffolding for transport integration tests: a full service
//! (runtime + coordinator + mock shell) over real listeners, plus a tiny
//! framed pipe client.
#![allow(dead_code)] // each test binary uses a different subset

use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use files_ipc_core::{InMemoryTokenStore, IpcConfig, Rendezvous};
use files_ipc_server::adapter::InMemoryShellAdapter;
use files_ipc_server::transport::pipe::PipeTransport;
use files_ipc_server::transport::websocket::WebSocketTransport;
use files_ipc_server::transport::TransportListener;
use files_ipc_server::{
    Coordinator, IpcService, MethodRegistry, SessionRuntime, ShellDescriptor, ShellRegistry,
    UiQueue,
};

/// Fixed token every test server accepts.
pub const TEST_TOKEN: &str = "integration-test-token";

pub struct TestServer {
    pub service: IpcService,
    pub config: Arc<IpcConfig>,
    pub ws_port: Option<u16>,
    pub pipe_path: Option<PathBuf>,
    _state_dir: TempDir,
}

impl TestServer {
    pub async fn stop(&self) {
        self.service.stop().await;
    }
}

/// Starts a full service over the requested transports.
///
/// The WebSocket preferred port is 0 so the OS always hands out a free
/// ephemeral port; the bound port is read back from the listener.
pub async fn start_server(
    websocket: bool,
    pipe: bool,
    configure: impl FnOnce(&IpcConfig),
) -> TestServer {
    let state_dir = TempDir::new().unwrap();
    let config = Arc::new(IpcConfig::new());
    config.set_ws_preferred_port(0);
    configure(&config);

    let registry = Arc::new(ShellRegistry::new());
    registry.register(ShellDescriptor {
        shell_id: "shell-1".to_string(),
        window_id: 1,
        tab_id: "tab-1".to_string(),
        adapter: Arc::new(InMemoryShellAdapter::new("/")),
        active: true,
    });
    registry.set_focused_window(Some(1));

    let coordinator = Arc::new(Coordinator::new(
        registry,
        UiQueue::spawn(),
        Arc::clone(&config),
    ));
    let runtime = SessionRuntime::new(
        Arc::clone(&config),
        Arc::new(MethodRegistry::with_defaults()),
        Arc::new(InMemoryTokenStore::with_token(TEST_TOKEN)),
        Arc::new(Rendezvous::new(state_dir.path())),
        coordinator,
    );

    let ws_transport = websocket.then(|| Arc::new(WebSocketTransport::new()));
    let pipe_transport = pipe.then(|| Arc::new(PipeTransport::new(state_dir.path())));

    let mut transports: Vec<Arc<dyn TransportListener>> = Vec::new();
    if let Some(ws) = &ws_transport {
        transports.push(Arc::clone(ws) as Arc<dyn TransportListener>);
    }
    if let Some(pipe) = &pipe_transport {
        transports.push(Arc::clone(pipe) as Arc<dyn TransportListener>);
    }

    let service = IpcService::new(runtime, transports);
    service.start().await.expect("service must start");

    TestServer {
        service,
        config,
        ws_port: ws_transport.and_then(|t| t.port()),
        pipe_path: pipe_transport.and_then(|t| t.socket_path()),
        _state_dir: state_dir,
    }
}

/// Minimal client for the length-prefixed pipe wire format.
pub struct PipeClient {
    stream: UnixStream,
}

impl PipeClient {
    pub async fn connect(path: &std::path::Path) -> Self {
        let stream = UnixStream::connect(path).await.expect("pipe connect");
        Self { stream }
    }

    /// Sends one framed JSON payload.
    pub async fn send(&mut self, json: &str) {
        let bytes = json.as_bytes();
        let mut frame = Vec::with_capacity(4 + bytes.len());
        frame.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        frame.extend_from_slice(bytes);
        self.stream.write_all(&frame).await.expect("pipe write");
    }

    /// Sends raw bytes, bypassing framing.
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("pipe write");
    }

    /// Reads one framed payload; `None` when the server closed the pipe.
    pub async fn recv(&mut self) -> Option<String> {
        let mut header = [0u8; 4];
        self.stream.read_exact(&mut header).await.ok()?;
        let length = u32::from_le_bytes(header) as usize;
        let mut body = vec![0u8; length];
        self.stream.read_exact(&mut body).await.ok()?;
        Some(String::from_utf8(body).expect("frames are UTF-8"))
    }

    /// Reads with a deadline; `None` on close, panics on timeout.
    pub async fn recv_timeout(&mut self) -> Option<String> {
        tokio::time::timeout(std::time::Duration::from_secs(5), self.recv())
            .await
            .expect("timed out waiting for a pipe frame")
    }
}

/// Builds a handshake request with the test token.
pub fn handshake_request(id: u64) -> String {
    format!(
        r#"{{"jsonrpc":"2.0","id":{id},"method":"handshake","params":{{"token":"{TEST_TOKEN}","clientInfo":"integration-test"}}}}"#
    )
}
