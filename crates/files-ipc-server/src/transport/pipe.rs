//! Per-user duplex pipe listener (Unix domain socket).
//!
//! The endpoint is a socket file named `Files_IPC_<user>_<random-128-bit-hex>`
//! in a per-user runtime directory. Two mechanisms restrict it to the
//! current user: the socket file is mode 0600, and every accepted peer's
//! `SO_PEERCRED` UID must equal the server's. There is deliberately no
//! deny rule anywhere — a deny-Everyone entry would also match the current
//! user through the Everyone group, which is exactly the pitfall this
//! transport must not reproduce. A second process of the same user always
//! connects.
//!
//! # Wire format
//!
//! ```text
//! +----------------------------+------------------+
//! | Length (4 bytes, LE)       | UTF-8 JSON       |
//! +----------------------------+------------------+
//! ```
//!
//! The length is validated before any allocation. A zero length, a length
//! above the configured cap, EOF mid-body, or a non-UTF-8 body is a
//! framing violation and closes the session without dispatch.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::codec::{Decoder, Encoder, Framed};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::runtime::SessionRuntime;
use crate::transport::{SessionSink, TransportError, TransportKind, TransportListener};

/// Length of the frame header (LE u32 length prefix).
const HEADER_LEN: usize = 4;

/// Length-prefixed frame codec for the pipe wire format.
///
/// Unlike a general-purpose codec, a zero-length frame is a violation
/// here: no JSON-RPC envelope is empty, so a zero prefix can only be a
/// corrupt or hostile stream.
#[derive(Debug, Clone)]
pub struct PipeFrameCodec {
    max_frame_bytes: usize,
}

impl PipeFrameCodec {
    /// Creates a codec bounded by `max_frame_bytes`.
    #[must_use]
    pub const fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }
}

impl Decoder for PipeFrameCodec {
    type Item = Bytes;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, TransportError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let length = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;

        // Validate before reserving or allocating anything.
        if length == 0 {
            return Err(TransportError::Framing("zero-length frame".to_string()));
        }
        if length > self.max_frame_bytes {
            return Err(TransportError::FrameTooLarge {
                size: length,
                max: self.max_frame_bytes,
            });
        }

        let total = HEADER_LEN + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(length).freeze()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, TransportError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(TransportError::Framing("EOF mid-frame".to_string())),
        }
    }
}

impl Encoder<Bytes> for PipeFrameCodec {
    type Error = TransportError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), TransportError> {
        if item.len() > self.max_frame_bytes {
            return Err(TransportError::FrameTooLarge {
                size: item.len(),
                max: self.max_frame_bytes,
            });
        }
        dst.reserve(HEADER_LEN + item.len());
        #[allow(clippy::cast_possible_truncation)] // bounded by max_frame_bytes
        dst.put_u32_le(item.len() as u32);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

impl Encoder<&str> for PipeFrameCodec {
    type Error = TransportError;

    fn encode(&mut self, item: &str, dst: &mut BytesMut) -> Result<(), TransportError> {
        self.encode(Bytes::copy_from_slice(item.as_bytes()), dst)
    }
}

/// Write half of one pipe connection.
///
/// The session-local mutex is the serialization point for writes; the
/// runtime's single send loop is the only caller, the mutex guards against
/// a late `close` racing a write.
struct PipeSessionSink {
    sink: tokio::sync::Mutex<Option<SplitSink<Framed<UnixStream, PipeFrameCodec>, Bytes>>>,
}

#[async_trait::async_trait]
impl SessionSink for PipeSessionSink {
    async fn send_frame(&self, payload: &str) -> Result<(), TransportError> {
        let mut guard = self.sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            return Err(TransportError::Closed);
        };
        sink.send(Bytes::copy_from_slice(payload.as_bytes()))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&self) {
        let mut guard = self.sink.lock().await;
        if let Some(mut sink) = guard.take() {
            let _ = sink.close().await;
        }
    }
}

/// State of a started listener.
struct PipeListenerState {
    cancel: CancellationToken,
    socket_path: PathBuf,
}

/// The per-user duplex pipe listener.
pub struct PipeTransport {
    dir: PathBuf,
    state: Mutex<Option<PipeListenerState>>,
}

impl PipeTransport {
    /// Creates a listener that will bind inside `dir`.
    ///
    /// The directory is created on start with owner-only permissions.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            state: Mutex::new(None),
        }
    }

    /// The socket path of the running listener, if started.
    #[must_use]
    pub fn socket_path(&self) -> Option<PathBuf> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_ref()
            .map(|s| s.socket_path.clone())
    }

    /// Builds the endpoint name: `Files_IPC_<user>_<random-128-bit-hex>`.
    fn endpoint_name() -> String {
        let user = std::env::var("USER")
            .ok()
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| nix::unistd::Uid::current().to_string());
        let mut random = [0u8; 16];
        OsRng.fill_bytes(&mut random);
        let hex: String = random.iter().map(|b| format!("{b:02x}")).collect();
        format!("Files_IPC_{user}_{hex}")
    }

    /// Per-connection task: credential check, framing, receive loop.
    async fn serve_connection(
        runtime: Arc<SessionRuntime>,
        stream: UnixStream,
        cancel: CancellationToken,
    ) {
        match stream.peer_cred() {
            Ok(cred) => {
                let own_uid = nix::unistd::Uid::current().as_raw();
                if cred.uid() != own_uid {
                    warn!(peer_uid = cred.uid(), own_uid, "rejecting pipe peer: UID mismatch");
                    return;
                }
            }
            Err(err) => {
                warn!(error = %err, "rejecting pipe peer: no credentials");
                return;
            }
        }

        let max = runtime.config().pipe_max_message_bytes();
        let framed = Framed::new(stream, PipeFrameCodec::new(max));
        let (sink, mut stream): (SplitSink<_, Bytes>, SplitStream<_>) = framed.split();
        let session_sink = Arc::new(PipeSessionSink {
            sink: tokio::sync::Mutex::new(Some(sink)),
        });
        let session = runtime.register_session(TransportKind::Pipe, session_sink);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = session.cancellation().cancelled() => break,
                frame = stream.next() => match frame {
                    Some(Ok(bytes)) => match std::str::from_utf8(&bytes) {
                        Ok(text) => runtime.handle_frame(&session, text).await,
                        Err(_) => {
                            debug!(session = %session.id(), "closing pipe session: non-UTF-8 frame");
                            break;
                        }
                    },
                    Some(Err(err)) => {
                        debug!(session = %session.id(), error = %err, "closing pipe session: framing violation");
                        break;
                    }
                    None => break,
                },
            }
        }

        runtime.remove_session(session.id());
        session.sink().close().await;
    }
}

#[async_trait::async_trait]
impl TransportListener for PipeTransport {
    fn name(&self) -> &'static str {
        "pipe"
    }

    async fn start(&self, runtime: Arc<SessionRuntime>) -> Result<(), TransportError> {
        use std::os::unix::fs::PermissionsExt;

        if !self.dir.exists() {
            std::fs::create_dir_all(&self.dir)?;
            std::fs::set_permissions(&self.dir, std::fs::Permissions::from_mode(0o700))?;
        }

        let socket_path = self.dir.join(Self::endpoint_name());
        let listener = UnixListener::bind(&socket_path).map_err(|source| TransportError::Bind {
            endpoint: socket_path.display().to_string(),
            source,
        })?;
        std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))?;

        let cancel = runtime.cancellation().child_token();
        {
            let mut state = self
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            *state = Some(PipeListenerState {
                cancel: cancel.clone(),
                socket_path: socket_path.clone(),
            });
        }

        runtime
            .rendezvous()
            .update(None, Some(&socket_path.display().to_string()), runtime.epoch())?;
        info!(path = %socket_path.display(), "pipe listener bound");

        let accept_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = accept_cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _addr)) => {
                            let runtime = Arc::clone(&runtime);
                            let cancel = accept_cancel.clone();
                            tokio::spawn(async move {
                                Self::serve_connection(runtime, stream, cancel).await;
                            });
                        }
                        Err(err) => {
                            warn!(error = %err, "pipe accept failed");
                        }
                    },
                }
            }
            debug!("pipe accept loop stopped");
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
            if let Err(err) = std::fs::remove_file(&state.socket_path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(error = %err, "failed to remove pipe socket file");
                }
            }
            info!("pipe listener stopped");
        }
    }
}
