//! Shared-secret lifecycle: an encrypted-at-rest token plus a monotonic
//! epoch counter.
//!
//! The token is the only credential a client ever presents. It is a random
//! 32-byte value rendered as unpadded URL-safe base64, stored encrypted with
//! ChaCha20-Poly1305 under a key that never leaves the user's own 0600 key
//! file. Filesystem ownership is the user binding; there is no passphrase.
//!
//! The epoch starts at 1 and increments on every rotation. Sessions capture
//! the epoch at handshake time, so a rotation invalidates all existing
//! sessions on their next request without the store having to track them.
//!
//! # Rotation ordering
//!
//! The new token blob is persisted *before* the epoch is bumped. An epoch
//! that advanced without a decryptable token behind it would lock every
//! client out until the next restart, so persistence failure aborts the
//! rotation with the old token still in force.
//!
//! # Storage layout
//!
//! ```text
//! <dir>/secret.key     32-byte cipher key, mode 0600
//! <dir>/token.blob     JSON { nonce, ciphertext } (base64), mode 0600
//! <dir>/ipc.settings   JSON { enabled, epoch }, mode 0600
//! ```

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// Entropy of a generated token, in bytes.
const TOKEN_ENTROPY_BYTES: usize = 32;

/// ChaCha20-Poly1305 key length.
const KEY_BYTES: usize = 32;

/// ChaCha20-Poly1305 nonce length.
const NONCE_BYTES: usize = 12;

/// Errors from token persistence and crypto.
#[derive(Debug, Error)]
pub enum TokenStoreError {
    /// I/O failure reading or writing the store files.
    #[error("token store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The settings or blob file held unparseable JSON.
    #[error("corrupt token store file: {0}")]
    Corrupt(#[from] serde_json::Error),

    /// Encrypting the token failed.
    #[error("failed to encrypt token")]
    Encrypt,

    /// A store file was reachable by other users.
    #[error("insecure permissions on token store file: {path}")]
    InsecurePermissions {
        /// The offending path.
        path: String,
    },
}

/// Shared-secret store: opt-in flag, epoch counter, token lifecycle.
///
/// Implementations must be safe to share across threads; the runtime reads
/// the token once at start and on rotation, never per request.
pub trait TokenStore: Send + Sync {
    /// Whether remote control has been opted into.
    ///
    /// # Errors
    ///
    /// Returns an error if the persisted flag cannot be read.
    fn is_enabled(&self) -> Result<bool, TokenStoreError>;

    /// Persists the opt-in flag.
    ///
    /// # Errors
    ///
    /// Returns an error if the flag cannot be persisted.
    fn set_enabled(&self, enabled: bool) -> Result<(), TokenStoreError>;

    /// Current epoch; initializes to 1 on first read.
    ///
    /// # Errors
    ///
    /// Returns an error if the persisted epoch cannot be read or created.
    fn epoch(&self) -> Result<u64, TokenStoreError>;

    /// Returns the plaintext token, generating and persisting a fresh one
    /// (and resetting the epoch to 1) if none exists or the blob cannot be
    /// deciphered.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence of a fresh token fails.
    fn get_or_create_token(&self) -> Result<String, TokenStoreError>;

    /// Generates and persists a new token, then increments the epoch.
    ///
    /// # Errors
    ///
    /// Fails only if persistence fails, in which case the previous token
    /// and epoch remain in force.
    fn rotate_token(&self) -> Result<String, TokenStoreError>;
}

/// Generates a fresh token: 32 random bytes, unpadded URL-safe base64.
fn generate_token() -> String {
    let mut bytes = Zeroizing::new([0u8; TOKEN_ENTROPY_BYTES]);
    OsRng.fill_bytes(&mut *bytes);
    URL_SAFE_NO_PAD.encode(&*bytes)
}

/// On-disk shape of the encrypted token.
#[derive(Debug, Serialize, Deserialize)]
struct TokenBlob {
    /// Base64 (standard alphabet) nonce.
    nonce: String,
    /// Base64 (standard alphabet) ciphertext + tag.
    ciphertext: String,
}

/// On-disk shape of the settings file.
#[derive(Debug, Serialize, Deserialize)]
struct Settings {
    enabled: bool,
    epoch: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: false,
            epoch: 1,
        }
    }
}

/// File-backed [`TokenStore`].
///
/// All mutations run under one mutex; the store is consulted rarely
/// (enable, start, rotate), so contention is not a concern.
pub struct FileTokenStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl FileTokenStore {
    /// Opens (creating if needed) a store rooted at `dir`.
    ///
    /// The directory is created with mode 0700 and verified to be
    /// inaccessible to other users.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or carries group
    /// or world permission bits.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, TokenStoreError> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
            fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))?;
        }
        let mode = fs::metadata(&dir)?.permissions().mode();
        if mode & 0o077 != 0 {
            return Err(TokenStoreError::InsecurePermissions {
                path: dir.display().to_string(),
            });
        }
        Ok(Self {
            dir,
            lock: Mutex::new(()),
        })
    }

    fn key_path(&self) -> PathBuf {
        self.dir.join("secret.key")
    }

    fn blob_path(&self) -> PathBuf {
        self.dir.join("token.blob")
    }

    fn settings_path(&self) -> PathBuf {
        self.dir.join("ipc.settings")
    }

    /// Writes `contents` to `path` with mode 0600, replacing atomically.
    fn write_private(&self, path: &Path, contents: &[u8]) -> Result<(), TokenStoreError> {
        let tmp = path.with_extension("tmp");
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&tmp)?;
            file.write_all(contents)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Reads a store file after verifying it is owner-only.
    fn read_private(&self, path: &Path) -> Result<Option<Vec<u8>>, TokenStoreError> {
        if !path.exists() {
            return Ok(None);
        }
        let mode = fs::metadata(path)?.permissions().mode();
        if mode & 0o077 != 0 {
            return Err(TokenStoreError::InsecurePermissions {
                path: path.display().to_string(),
            });
        }
        Ok(Some(fs::read(path)?))
    }

    /// Loads the cipher key, generating one on first use.
    fn load_or_create_key(&self) -> Result<Zeroizing<[u8; KEY_BYTES]>, TokenStoreError> {
        if let Some(bytes) = self.read_private(&self.key_path())? {
            if bytes.len() == KEY_BYTES {
                let mut key = Zeroizing::new([0u8; KEY_BYTES]);
                key.copy_from_slice(&bytes);
                return Ok(key);
            }
            warn!("cipher key file has wrong length; regenerating");
        }
        let mut key = Zeroizing::new([0u8; KEY_BYTES]);
        OsRng.fill_bytes(&mut *key);
        self.write_private(&self.key_path(), &*key)?;
        Ok(key)
    }

    fn load_settings(&self) -> Result<Settings, TokenStoreError> {
        match self.read_private(&self.settings_path())? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Settings::default()),
        }
    }

    fn store_settings(&self, settings: &Settings) -> Result<(), TokenStoreError> {
        let bytes = serde_json::to_vec(settings)?;
        self.write_private(&self.settings_path(), &bytes)
    }

    /// Attempts to decrypt the persisted token blob. Any failure — missing
    /// file, bad JSON, bad base64, failed authentication tag — yields
    /// `None` so the caller falls back to generating a fresh token.
    fn try_decrypt_token(&self, key: &[u8; KEY_BYTES]) -> Option<String> {
        let bytes = self.read_private(&self.blob_path()).ok()??;
        let blob: TokenBlob = serde_json::from_slice(&bytes).ok()?;
        let nonce_bytes = STANDARD.decode(&blob.nonce).ok()?;
        if nonce_bytes.len() != NONCE_BYTES {
            return None;
        }
        let ciphertext = STANDARD.decode(&blob.ciphertext).ok()?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .ok()?;
        String::from_utf8(plaintext).ok()
    }

    /// Encrypts and persists `token` under `key`.
    fn store_token(&self, key: &[u8; KEY_BYTES], token: &str) -> Result<(), TokenStoreError> {
        let mut nonce_bytes = [0u8; NONCE_BYTES];
        OsRng.fill_bytes(&mut nonce_bytes);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), token.as_bytes())
            .map_err(|_| TokenStoreError::Encrypt)?;
        let blob = TokenBlob {
            nonce: STANDARD.encode(nonce_bytes),
            ciphertext: STANDARD.encode(ciphertext),
        };
        let bytes = serde_json::to_vec(&blob)?;
        self.write_private(&self.blob_path(), &bytes)
    }
}

impl TokenStore for FileTokenStore {
    fn is_enabled(&self) -> Result<bool, TokenStoreError> {
        let _guard = self.lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(self.load_settings()?.enabled)
    }

    fn set_enabled(&self, enabled: bool) -> Result<(), TokenStoreError> {
        let _guard = self.lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut settings = self.load_settings()?;
        settings.enabled = enabled;
        self.store_settings(&settings)
    }

    fn epoch(&self) -> Result<u64, TokenStoreError> {
        let _guard = self.lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let settings = self.load_settings()?;
        if !self.settings_path().exists() {
            self.store_settings(&settings)?;
        }
        Ok(settings.epoch)
    }

    fn get_or_create_token(&self) -> Result<String, TokenStoreError> {
        let _guard = self.lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let key = self.load_or_create_key()?;
        if let Some(token) = self.try_decrypt_token(&key) {
            return Ok(token);
        }
        debug!("no decryptable token at rest; generating a fresh one");
        let token = generate_token();
        self.store_token(&key, &token)?;
        let mut settings = self.load_settings()?;
        settings.epoch = 1;
        self.store_settings(&settings)?;
        Ok(token)
    }

    fn rotate_token(&self) -> Result<String, TokenStoreError> {
        let _guard = self.lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let key = self.load_or_create_key()?;
        let token = generate_token();
        // Token first, epoch second: see the module docs on rotation order.
        self.store_token(&key, &token)?;
        let mut settings = self.load_settings()?;
        settings.epoch += 1;
        self.store_settings(&settings)?;
        Ok(token)
    }
}

/// In-memory [`TokenStore`] for tests and the demo binary.
pub struct InMemoryTokenStore {
    state: Mutex<MemoryState>,
}

struct MemoryState {
    enabled: bool,
    epoch: u64,
    token: Option<String>,
}

impl InMemoryTokenStore {
    /// Creates a disabled store with no token.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                enabled: false,
                epoch: 1,
                token: None,
            }),
        }
    }

    /// Creates an enabled store with a fixed token, for tests that need a
    /// known credential.
    #[must_use]
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                enabled: true,
                epoch: 1,
                token: Some(token.into()),
            }),
        }
    }
}

impl Default for InMemoryTokenStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenStore for InMemoryTokenStore {
    fn is_enabled(&self) -> Result<bool, TokenStoreError> {
        Ok(self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner).enabled)
    }

    fn set_enabled(&self, enabled: bool) -> Result<(), TokenStoreError> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .enabled = enabled;
        Ok(())
    }

    fn epoch(&self) -> Result<u64, TokenStoreError> {
        Ok(self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner).epoch)
    }

    fn get_or_create_token(&self) -> Result<String, TokenStoreError> {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(token) = &state.token {
            return Ok(token.clone());
        }
        let token = generate_token();
        state.token = Some(token.clone());
        state.epoch = 1;
        Ok(token)
    }

    fn rotate_token(&self) -> Result<String, TokenStoreError> {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let token = generate_token();
        state.token = Some(token.clone());
        state.epoch += 1;
        Ok(token)
    }
}
