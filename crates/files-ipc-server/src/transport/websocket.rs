//! Loopback WebSocket listener.
//!
//! Binds `127.0.0.1` only — remote reachability is a non-goal and the
//! bind address is the enforcement. The preferred port (52345 by default)
//! is tried first, then the fallback range; whichever bound is published
//! to the rendezvous descriptor.
//!
//! Only WebSocket upgrades are served: any other HTTP request gets 400
//! immediately. Frames are text UTF-8 JSON; reassembly is bounded by the
//! configured maximum, and the underlying protocol stack fails the
//! connection when a message exceeds it. Binary frames are a protocol
//! violation and close the session.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use axum::extract::ws::{close_code, CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use files_ipc_core::config::WS_FALLBACK_PORT_RANGE;

use crate::runtime::SessionRuntime;
use crate::transport::{SessionSink, TransportError, TransportKind, TransportListener};

/// Shared state for the axum handlers.
#[derive(Clone)]
struct WsAppState {
    runtime: Arc<SessionRuntime>,
    cancel: CancellationToken,
}

/// Write half of one WebSocket connection.
struct WsSessionSink {
    sink: tokio::sync::Mutex<Option<SplitSink<WebSocket, WsMessage>>>,
}

#[async_trait::async_trait]
impl SessionSink for WsSessionSink {
    async fn send_frame(&self, payload: &str) -> Result<(), TransportError> {
        let mut guard = self.sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            return Err(TransportError::Closed);
        };
        sink.send(WsMessage::Text(payload.to_string()))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&self) {
        let mut guard = self.sink.lock().await;
        if let Some(mut sink) = guard.take() {
            let _ = sink.send(WsMessage::Close(None)).await;
        }
    }
}

/// State of a started listener.
struct WsListenerState {
    cancel: CancellationToken,
    port: u16,
}

/// The loopback WebSocket listener.
pub struct WebSocketTransport {
    state: Mutex<Option<WsListenerState>>,
}

impl WebSocketTransport {
    /// Creates an unstarted listener.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(None),
        }
    }

    /// The bound port of the running listener, if started.
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_ref()
            .map(|s| s.port)
    }

    /// Binds the preferred port, scanning the fallback range when taken.
    async fn bind_loopback(preferred: u16) -> Result<TcpListener, TransportError> {
        let preferred_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, preferred));
        match TcpListener::bind(preferred_addr).await {
            Ok(listener) => return Ok(listener),
            Err(err) => {
                debug!(port = preferred, error = %err, "preferred port taken; scanning fallback range");
            }
        }
        for port in WS_FALLBACK_PORT_RANGE {
            if let Ok(listener) = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port))).await
            {
                return Ok(listener);
            }
        }
        Err(TransportError::Bind {
            endpoint: format!(
                "127.0.0.1:{preferred} and fallback range {}..{}",
                WS_FALLBACK_PORT_RANGE.start, WS_FALLBACK_PORT_RANGE.end
            ),
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "no free port"),
        })
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Root handler: WebSocket upgrades proceed, anything else is 400.
async fn ws_handler(
    State(state): State<WsAppState>,
    upgrade: Option<WebSocketUpgrade>,
) -> Response {
    let Some(upgrade) = upgrade else {
        return (StatusCode::BAD_REQUEST, "WebSocket upgrade required").into_response();
    };
    let max = state.runtime.config().ws_max_message_bytes();
    upgrade
        .max_message_size(max)
        .on_upgrade(move |socket| serve_socket(socket, state))
}

/// Per-connection task: session registration and the receive loop.
async fn serve_socket(socket: WebSocket, state: WsAppState) {
    let (sink, mut stream): (SplitSink<WebSocket, WsMessage>, SplitStream<WebSocket>) =
        socket.split();
    let session_sink = Arc::new(WsSessionSink {
        sink: tokio::sync::Mutex::new(Some(sink)),
    });
    let session = state
        .runtime
        .register_session(TransportKind::WebSocket, session_sink.clone());

    loop {
        tokio::select! {
            () = state.cancel.cancelled() => break,
            () = session.cancellation().cancelled() => break,
            frame = stream.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    state.runtime.handle_frame(&session, &text).await;
                }
                Some(Ok(WsMessage::Binary(_))) => {
                    debug!(session = %session.id(), "closing WebSocket session: binary frame");
                    send_protocol_close(&session_sink).await;
                    break;
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {} // ping/pong answered by the stack
                Some(Err(err)) => {
                    // Oversize reassembly and protocol violations surface
                    // here; both are fatal to the session.
                    debug!(session = %session.id(), error = %err, "closing WebSocket session: receive error");
                    send_protocol_close(&session_sink).await;
                    break;
                }
            },
        }
    }

    state.runtime.remove_session(session.id());
    session.sink().close().await;
}

/// Best-effort close frame with a protocol-error status.
async fn send_protocol_close(sink: &Arc<WsSessionSink>) {
    let mut guard = sink.sink.lock().await;
    if let Some(mut inner) = guard.take() {
        let _ = inner
            .send(WsMessage::Close(Some(CloseFrame {
                code: close_code::PROTOCOL,
                reason: "protocol violation".into(),
            })))
            .await;
    }
}

#[async_trait::async_trait]
impl TransportListener for WebSocketTransport {
    fn name(&self) -> &'static str {
        "websocket"
    }

    async fn start(&self, runtime: Arc<SessionRuntime>) -> Result<(), TransportError> {
        let preferred = runtime.config().ws_preferred_port();
        let listener = Self::bind_loopback(preferred).await?;
        let port = listener.local_addr()?.port();

        let cancel = runtime.cancellation().child_token();
        {
            let mut state = self
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            *state = Some(WsListenerState {
                cancel: cancel.clone(),
                port,
            });
        }

        runtime
            .rendezvous()
            .update(Some(port), None, runtime.epoch())?;
        info!(port, "WebSocket listener bound");

        let app_state = WsAppState {
            runtime,
            cancel: cancel.clone(),
        };
        let app = Router::new()
            .route("/", any(ws_handler))
            .fallback(|| async { (StatusCode::BAD_REQUEST, "WebSocket upgrade required") })
            .with_state(app_state);

        tokio::spawn(async move {
            let shutdown = cancel.clone();
            let serve = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(err) = serve.await {
                warn!(error = %err, "WebSocket listener failed");
            }
            debug!("WebSocket accept loop stopped");
        });
        Ok(())
    }

    async fn stop(&self) {
        let state = {
            let mut state = self
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            state.take()
        };
        if let Some(state) = state {
            state.cancel.cancel();
            info!("WebSocket listener stopped");
        }
    }
}
