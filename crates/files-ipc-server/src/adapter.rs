//! The `ShellAdapter` capability: the narrow interface the IPC engine uses
//! to drive a host shell (one window/tab view of the file manager).
//!
//! The host owns the adapters; the engine only ever borrows them through
//! the shell registry and never retains one across a request boundary.
//! Everything the engine knows about the shell is in the DTOs below.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use files_ipc_core::sanitize::FailureClass;

/// Snapshot of a shell's view state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellState {
    /// Directory the shell is showing.
    pub current_path: String,
    /// Display name of that directory.
    pub name: String,
    /// Items in the current view.
    pub item_count: usize,
    /// Items currently selected.
    pub selected_count: usize,
    /// Whether back-navigation is possible.
    pub can_navigate_back: bool,
    /// Whether forward-navigation is possible.
    pub can_navigate_forward: bool,
}

/// One invokable command of the host's catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionDescriptor {
    /// Stable action identifier.
    pub id: String,
    /// Human-readable label.
    pub label: String,
    /// Whether the action is currently executable.
    pub enabled: bool,
}

/// Stat-like metadata for one path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemMetadata {
    /// Absolute path queried.
    pub path: String,
    /// Leaf name.
    pub name: String,
    /// Whether the item exists.
    pub exists: bool,
    /// Whether the item is a directory.
    pub is_dir: bool,
    /// Size in bytes for files.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    /// Last modification time, when available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_utc: Option<DateTime<Utc>>,
}

/// A failure raised by an adapter.
///
/// Domain failures carry a JSON-RPC code that survives to the wire; the
/// message is always sanitized first. Failures without a code are reported
/// as internal errors.
#[derive(Debug, Clone)]
pub struct AdapterError {
    /// Coarse class, used to collapse sensitive failures.
    pub class: FailureClass,
    /// JSON-RPC code to preserve, if this is a domain failure.
    pub code: Option<i64>,
    /// Unsanitized detail; never sent as-is.
    pub message: String,
}

impl AdapterError {
    /// A domain failure with a preserved JSON-RPC code.
    #[must_use]
    pub fn domain(code: i64, message: impl Into<String>) -> Self {
        Self {
            class: FailureClass::Other,
            code: Some(code),
            message: message.into(),
        }
    }

    /// An access-control failure; collapses on the wire.
    #[must_use]
    pub fn access_denied(message: impl Into<String>) -> Self {
        Self {
            class: FailureClass::AccessDenied,
            code: None,
            message: message.into(),
        }
    }

    /// An unclassified internal failure.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            class: FailureClass::Other,
            code: None,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for AdapterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AdapterError {}

/// Host-provided capability set the coordinator dispatches onto.
#[async_trait]
pub trait ShellAdapter: Send + Sync {
    /// Snapshot of the shell's view state.
    async fn get_state(&self) -> Result<ShellState, AdapterError>;

    /// The host's command catalog as visible to this shell.
    async fn list_actions(&self) -> Result<Vec<ActionDescriptor>, AdapterError>;

    /// Navigates the shell to an already-validated absolute path.
    async fn navigate(&self, path: &Path) -> Result<(), AdapterError>;

    /// Stat-like metadata for a batch of already-validated paths.
    async fn get_metadata(&self, paths: Vec<PathBuf>) -> Result<Vec<ItemMetadata>, AdapterError>;

    /// Executes a catalog action against this shell.
    ///
    /// The target shell is always explicit — the engine resolved it before
    /// the call — so implementations must not consult ambient focus.
    async fn execute_action(&self, action_id: &str) -> Result<Option<Value>, AdapterError>;
}

/// Self-contained [`ShellAdapter`] over an in-memory directory model.
///
/// Backs the demo binary and the integration tests: `navigate` updates the
/// state, `get_metadata` stats the real filesystem, and the action catalog
/// is a small fixed set.
pub struct InMemoryShellAdapter {
    state: Mutex<ShellState>,
    actions: Vec<ActionDescriptor>,
    executed: Mutex<Vec<String>>,
}

impl InMemoryShellAdapter {
    /// Creates an adapter rooted at `path`.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        let name = Path::new(&path)
            .file_name()
            .map_or_else(|| path.clone(), |n| n.to_string_lossy().into_owned());
        Self {
            state: Mutex::new(ShellState {
                current_path: path,
                name,
                item_count: 0,
                selected_count: 0,
                can_navigate_back: false,
                can_navigate_forward: false,
            }),
            actions: vec![
                ActionDescriptor {
                    id: "refresh".to_string(),
                    label: "Refresh".to_string(),
                    enabled: true,
                },
                ActionDescriptor {
                    id: "openSettings".to_string(),
                    label: "Open settings".to_string(),
                    enabled: true,
                },
                ActionDescriptor {
                    id: "formatDrive".to_string(),
                    label: "Format drive".to_string(),
                    enabled: false,
                },
            ],
            executed: Mutex::new(Vec::new()),
        }
    }

    /// Action ids executed so far, for assertions.
    #[must_use]
    pub fn executed_actions(&self) -> Vec<String> {
        self.executed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ShellAdapter for InMemoryShellAdapter {
    async fn get_state(&self) -> Result<ShellState, AdapterError> {
        Ok(self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone())
    }

    async fn list_actions(&self) -> Result<Vec<ActionDescriptor>, AdapterError> {
        Ok(self.actions.clone())
    }

    async fn navigate(&self, path: &Path) -> Result<(), AdapterError> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.current_path = path.to_string_lossy().into_owned();
        state.name = path
            .file_name()
            .map_or_else(|| state.current_path.clone(), |n| n.to_string_lossy().into_owned());
        state.can_navigate_back = true;
        state.can_navigate_forward = false;
        Ok(())
    }

    async fn get_metadata(&self, paths: Vec<PathBuf>) -> Result<Vec<ItemMetadata>, AdapterError> {
        let mut items = Vec::with_capacity(paths.len());
        for path in paths {
            let name = path
                .file_name()
                .map_or_else(|| path.to_string_lossy().into_owned(), |n| n.to_string_lossy().into_owned());
            match std::fs::metadata(&path) {
                Ok(meta) => items.push(ItemMetadata {
                    path: path.to_string_lossy().into_owned(),
                    name,
                    exists: true,
                    is_dir: meta.is_dir(),
                    size_bytes: meta.is_file().then(|| meta.len()),
                    modified_utc: meta.modified().ok().map(DateTime::<Utc>::from),
                }),
                Err(_) => items.push(ItemMetadata {
                    path: path.to_string_lossy().into_owned(),
                    name,
                    exists: false,
                    is_dir: false,
                    size_bytes: None,
                    modified_utc: None,
                }),
            }
        }
        Ok(items)
    }

    async fn execute_action(&self, action_id: &str) -> Result<Option<Value>, AdapterError> {
        let Some(action) = self.actions.iter().find(|a| a.id == action_id) else {
            return Err(AdapterError::domain(
                -32602,
                format!("unknown action: {action_id}"),
            ));
        };
        if !action.enabled {
            return Err(AdapterError::domain(
                -32602,
                format!("action not executable: {action_id}"),
            ));
        }
        self.executed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(action_id.to_string());
        Ok(None)
    }
}

/// Adapter whose calls resolve from a scripted table; for failure-path
/// tests.
pub struct ScriptedShellAdapter {
    results: Mutex<HashMap<&'static str, Result<Value, AdapterError>>>,
    delay: Option<std::time::Duration>,
}

impl ScriptedShellAdapter {
    /// Creates an adapter with no scripted results; every call fails with
    /// an internal error.
    #[must_use]
    pub fn new() -> Self {
        Self {
            results: Mutex::new(HashMap::new()),
            delay: None,
        }
    }

    /// Makes every call sleep before resolving, to exercise deadlines.
    #[must_use]
    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Scripts the outcome of one method.
    pub fn script(&self, method: &'static str, result: Result<Value, AdapterError>) {
        self.results
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(method, result);
    }

    async fn resolve(&self, method: &'static str) -> Result<Value, AdapterError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.results
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(method)
            .cloned()
            .unwrap_or_else(|| Err(AdapterError::internal(format!("unscripted call: {method}"))))
    }
}

impl Default for ScriptedShellAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ShellAdapter for ScriptedShellAdapter {
    async fn get_state(&self) -> Result<ShellState, AdapterError> {
        let value = self.resolve("getState").await?;
        serde_json::from_value(value).map_err(|e| AdapterError::internal(e.to_string()))
    }

    async fn list_actions(&self) -> Result<Vec<ActionDescriptor>, AdapterError> {
        let value = self.resolve("listActions").await?;
        serde_json::from_value(value).map_err(|e| AdapterError::internal(e.to_string()))
    }

    async fn navigate(&self, _path: &Path) -> Result<(), AdapterError> {
        self.resolve("navigate").await.map(|_| ())
    }

    async fn get_metadata(&self, _paths: Vec<PathBuf>) -> Result<Vec<ItemMetadata>, AdapterError> {
        let value = self.resolve("getMetadata").await?;
        serde_json::from_value(value).map_err(|e| AdapterError::internal(e.to_string()))
    }

    async fn execute_action(&self, _action_id: &str) -> Result<Option<Value>, AdapterError> {
        self.resolve("executeAction").await.map(Some)
    }
}
