//! Transport seams between the session runtime and the concrete listeners.
//!
//! The runtime never touches a socket. Each live connection hands it an
//! [`SessionSink`] for outbound frames, and each listener implements
//! [`TransportListener`] so the service facade can start and stop them
//! uniformly. Inbound frames flow the other way: the listener's read loop
//! calls `SessionRuntime::handle_frame` per message.

pub mod pipe;
pub mod websocket;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::runtime::SessionRuntime;

/// Which listener a session arrived through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Loopback WebSocket listener.
    WebSocket,
    /// Per-user duplex pipe (Unix domain socket) listener.
    Pipe,
    /// In-process sink used by tests.
    Memory,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WebSocket => write!(f, "websocket"),
            Self::Pipe => write!(f, "pipe"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

/// Transport-layer failures.
///
/// Any of these is fatal to the session that hit it; the runtime cancels
/// the session and the reaper collects the leftovers.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Underlying socket I/O failed.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer is gone or the write half was already shut down.
    #[error("transport closed")]
    Closed,

    /// A frame exceeded the configured maximum.
    #[error("frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge {
        /// Offending frame size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The byte stream violated the framing contract.
    #[error("framing violation: {0}")]
    Framing(String),

    /// The listener could not bind its endpoint.
    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        /// Human-readable endpoint description.
        endpoint: String,
        /// Underlying bind error.
        #[source]
        source: std::io::Error,
    },

    /// The bound endpoint could not be published to the rendezvous file.
    #[error("failed to publish endpoint: {0}")]
    Publish(#[from] files_ipc_core::RendezvousError),
}

/// Write half of one connection, owned by exactly one session.
///
/// `send_frame` is only ever called from the session's single send loop, so
/// implementations serialize writes with a session-local mutex and nothing
/// coarser.
#[async_trait]
pub trait SessionSink: Send + Sync {
    /// Writes one framed payload to the peer.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] when the write fails; the caller cancels
    /// the session in response.
    async fn send_frame(&self, payload: &str) -> Result<(), TransportError>;

    /// Closes the connection, flushing a close frame where the protocol has
    /// one. Idempotent.
    async fn close(&self);
}

/// A listener the service facade can start and stop.
#[async_trait]
pub trait TransportListener: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Binds the endpoint, publishes it to the rendezvous descriptor, and
    /// spawns the accept loop.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] when the endpoint cannot be bound or
    /// published.
    async fn start(&self, runtime: Arc<SessionRuntime>) -> Result<(), TransportError>;

    /// Stops accepting and tears the listener down. Sessions already
    /// accepted are closed by the runtime, not the listener.
    async fn stop(&self);
}

/// In-process [`SessionSink`] capturing frames for assertions.
///
/// Tests drive the runtime through this sink to exercise the protocol
/// without a socket; [`MemorySink::fail_writes`] simulates a dead peer.
#[derive(Default)]
pub struct MemorySink {
    frames: std::sync::Mutex<Vec<String>>,
    closed: std::sync::atomic::AtomicBool,
    fail_writes: std::sync::atomic::AtomicBool,
}

impl MemorySink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Everything sent so far.
    #[must_use]
    pub fn frames(&self) -> Vec<String> {
        self.frames
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Whether `close` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Makes every subsequent `send_frame` fail, as a dead peer would.
    pub fn fail_writes(&self) {
        self.fail_writes
            .store(true, std::sync::atomic::Ordering::Relaxed);
    }

    /// Waits until at least `count` frames have been sent.
    pub async fn wait_for_frames(&self, count: usize) -> Vec<String> {
        loop {
            let frames = self.frames();
            if frames.len() >= count {
                return frames;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl SessionSink for MemorySink {
    async fn send_frame(&self, payload: &str) -> Result<(), TransportError> {
        if self.fail_writes.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }
        self.frames
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(payload.to_string());
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, std::sync::atomic::Ordering::Relaxed);
    }
}
