//! Service facade tying the runtime and its transports together.
//!
//! The host enables remote control by building an [`IpcService`] and
//! calling [`start`](IpcService::start); disabling calls
//! [`stop`](IpcService::stop), which tears the listeners down, cancels
//! every session, and removes the rendezvous descriptor. Token rotation is
//! forwarded to the runtime so the epoch bump and the descriptor rewrite
//! stay in one place.

use std::sync::Arc;

use tracing::{info, warn};

use crate::runtime::{RuntimeError, SessionRuntime};
use crate::transport::{TransportError, TransportListener};

/// Errors from service lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The runtime refused to start or failed a store operation.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// A transport failed to bind or publish.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// The assembled IPC server: one runtime plus its transports.
pub struct IpcService {
    runtime: Arc<SessionRuntime>,
    transports: Vec<Arc<dyn TransportListener>>,
}

impl IpcService {
    /// Assembles a service; nothing is live until [`start`](Self::start).
    #[must_use]
    pub fn new(runtime: Arc<SessionRuntime>, transports: Vec<Arc<dyn TransportListener>>) -> Self {
        Self {
            runtime,
            transports,
        }
    }

    /// The underlying runtime, for event publishing and monitoring.
    #[must_use]
    pub fn runtime(&self) -> &Arc<SessionRuntime> {
        &self.runtime
    }

    /// Starts the runtime, then every transport.
    ///
    /// A transport that fails to start rolls the whole service back so the
    /// host never ends up half-listening.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::Disabled`] when remote control is off, or the first
    /// transport failure.
    pub async fn start(&self) -> Result<(), ServiceError> {
        self.runtime.start().await?;
        for transport in &self.transports {
            if let Err(err) = transport.start(Arc::clone(&self.runtime)).await {
                warn!(transport = transport.name(), error = %err, "transport failed to start; rolling back");
                self.stop().await;
                return Err(err.into());
            }
            info!(transport = transport.name(), "transport started");
        }
        Ok(())
    }

    /// Stops the transports, then the runtime (sessions, timers,
    /// rendezvous descriptor).
    pub async fn stop(&self) {
        for transport in &self.transports {
            transport.stop().await;
        }
        self.runtime.stop().await;
    }

    /// Rotates the shared secret; existing sessions expire on their next
    /// request.
    ///
    /// # Errors
    ///
    /// Fails only if persistence fails; the old token remains in force.
    pub fn rotate_token(&self) -> Result<String, ServiceError> {
        Ok(self.runtime.rotate_token()?)
    }
}
