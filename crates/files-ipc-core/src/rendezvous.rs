//! Rendezvous descriptor: the small JSON file local clients read to find
//! the server.
//!
//! The descriptor advertises the live WebSocket port and/or pipe name, the
//! token clients must present, the epoch, and the server pid. It is written
//! atomically (temp file in the same directory, then rename) with owner-only
//! permissions, so a reader either sees a complete descriptor or no file at
//! all.
//!
//! `delete` latches: once the descriptor has been removed by this instance,
//! later `update` calls are no-ops. Disabling remote control must not race
//! a transport that is still shutting down back into advertising itself.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// File name of the descriptor inside the per-user directory.
pub const DESCRIPTOR_FILE_NAME: &str = "ipc.info";

/// Errors from descriptor I/O.
#[derive(Debug, Error)]
pub enum RendezvousError {
    /// Reading or writing the descriptor failed.
    #[error("rendezvous I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The descriptor on disk is not valid JSON (ignored on merge, fatal
    /// only when a caller asks for a strict read).
    #[error("corrupt rendezvous descriptor: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// On-disk rendezvous descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Port of the loopback WebSocket listener, when bound.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub web_socket_port: Option<u16>,

    /// Pipe endpoint (full socket path), when bound.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipe_name: Option<String>,

    /// Token the server currently accepts.
    pub token: String,

    /// Epoch the token was issued under.
    pub epoch: u64,

    /// Pid of the serving process.
    pub server_pid: u32,

    /// When this descriptor was first written.
    pub created_utc: DateTime<Utc>,
}

/// Writer for the per-user rendezvous descriptor.
///
/// All writes go through one process-wide mutex (per instance; the host
/// creates exactly one), and the token is sticky for the lifetime of the
/// instance so the file can never advertise a credential the server does
/// not accept.
pub struct Rendezvous {
    path: PathBuf,
    state: Mutex<State>,
}

struct State {
    token: Option<String>,
    deleted: bool,
}

impl Rendezvous {
    /// Creates a writer for `<dir>/ipc.info`.
    #[must_use]
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(DESCRIPTOR_FILE_NAME),
            state: Mutex::new(State {
                token: None,
                deleted: false,
            }),
        }
    }

    /// The descriptor's path.
    #[must_use]
    pub fn current_path(&self) -> &Path {
        &self.path
    }

    /// Returns the token this instance will advertise.
    ///
    /// Resolution order: the sticky in-process token, then the token
    /// embedded in an existing descriptor, then a freshly generated one.
    /// The file itself is only (re)written by the next [`update`].
    ///
    /// [`update`]: Rendezvous::update
    ///
    /// # Errors
    ///
    /// Returns an error only if an existing descriptor cannot be read.
    pub fn get_or_create_token(&self) -> Result<String, RendezvousError> {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(token) = &state.token {
            return Ok(token.clone());
        }
        if let Some(existing) = self.read_descriptor() {
            state.token = Some(existing.token.clone());
            return Ok(existing.token);
        }
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        let token = URL_SAFE_NO_PAD.encode(bytes);
        state.token = Some(token.clone());
        Ok(token)
    }

    /// Pins the token this instance advertises.
    ///
    /// The runtime calls this once with the token-store secret before the
    /// first transport publishes, keeping the file and the store in
    /// lockstep. Sticky: later calls with a different token win (rotation),
    /// and [`get_or_create_token`](Rendezvous::get_or_create_token) returns
    /// the pinned value from then on.
    pub fn set_token(&self, token: impl Into<String>) {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        state.token = Some(token.into());
    }

    /// Merges transport fields into the descriptor and writes it atomically.
    ///
    /// Newer transport fields override older ones; fields passed as `None`
    /// are preserved from the existing file, so the WebSocket listener and
    /// the pipe listener can publish independently. No-op after
    /// [`delete`](Rendezvous::delete).
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor cannot be written.
    pub fn update(
        &self,
        ws_port: Option<u16>,
        pipe_name: Option<&str>,
        epoch: u64,
    ) -> Result<(), RendezvousError> {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if state.deleted {
            debug!("rendezvous descriptor already deleted; skipping update");
            return Ok(());
        }

        let existing = self.read_descriptor();
        let token = match &state.token {
            Some(token) => token.clone(),
            None => {
                let token = existing
                    .as_ref()
                    .map(|d| d.token.clone())
                    .unwrap_or_else(|| {
                        let mut bytes = [0u8; 32];
                        OsRng.fill_bytes(&mut bytes);
                        URL_SAFE_NO_PAD.encode(bytes)
                    });
                state.token = Some(token.clone());
                token
            }
        };

        let descriptor = Descriptor {
            web_socket_port: ws_port.or(existing.as_ref().and_then(|d| d.web_socket_port)),
            pipe_name: pipe_name
                .map(str::to_owned)
                .or(existing.as_ref().and_then(|d| d.pipe_name.clone())),
            token,
            epoch,
            server_pid: std::process::id(),
            created_utc: existing.map_or_else(Utc::now, |d| d.created_utc),
        };

        self.write_atomic(&descriptor)
    }

    /// Removes the descriptor and latches further updates off.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    pub fn delete(&self) -> Result<(), RendezvousError> {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        state.deleted = true;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Reads and parses the descriptor, tolerating absence and corruption.
    fn read_descriptor(&self) -> Option<Descriptor> {
        let bytes = fs::read(&self.path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(descriptor) => Some(descriptor),
            Err(err) => {
                warn!(error = %err, "ignoring corrupt rendezvous descriptor");
                None
            }
        }
    }

    /// Strict read for clients and tests: absent file is `Ok(None)`,
    /// corruption is an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn read(path: impl AsRef<Path>) -> Result<Option<Descriptor>, RendezvousError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(path)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Temp-file + rename in the descriptor's own directory, 0600.
    fn write_atomic(&self, descriptor: &Descriptor) -> Result<(), RendezvousError> {
        if let Some(parent) = self.path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
                fs::set_permissions(parent, fs::Permissions::from_mode(0o700))?;
            }
        }
        let bytes = serde_json::to_vec(descriptor)?;
        let tmp = self.path.with_extension("info.tmp");
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
