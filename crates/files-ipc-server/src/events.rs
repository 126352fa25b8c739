//! Shell-side event surface: state changes fan out to subscribers as
//! JSON-RPC notifications.
//!
//! The host wires one [`ShellEventPublisher`] into its shells; every call
//! here ends in `SessionRuntime::broadcast`, which applies per-session
//! rate limiting and the lossy queue policy. Receivers must treat all of
//! these as eventually-consistent signals, not acknowledgements.
//!
//! `workingDirectoryChanged` additionally coalesces at the source: at most
//! one broadcast per 100 ms per shell, with a trailing flush so the final
//! state always goes out.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;

use crate::runtime::SessionRuntime;

/// Minimum spacing of `workingDirectoryChanged` broadcasts per shell.
pub const WORKING_DIR_COALESCE_WINDOW: Duration = Duration::from_millis(100);

/// One entry of a `selectionChanged` notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionItem {
    /// Absolute path of the selected item.
    pub path: String,
    /// Leaf name.
    pub name: String,
    /// Whether the item is a directory.
    pub is_dir: bool,
}

struct WorkingDirState {
    last_emit: Instant,
    pending: Option<serde_json::Value>,
    flusher_armed: bool,
}

/// Publisher handle the host's shells push state changes through.
#[derive(Clone)]
pub struct ShellEventPublisher {
    runtime: Arc<SessionRuntime>,
    working_dir: Arc<Mutex<HashMap<String, WorkingDirState>>>,
}

impl ShellEventPublisher {
    /// Creates a publisher bound to a runtime.
    #[must_use]
    pub fn new(runtime: Arc<SessionRuntime>) -> Self {
        Self {
            runtime,
            working_dir: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Publishes `workingDirectoryChanged`, coalesced per shell.
    ///
    /// Bursts inside the window collapse to the first and last change: the
    /// first goes out immediately, the latest is flushed when the window
    /// expires.
    pub fn working_directory_changed(
        &self,
        shell_id: &str,
        path: &str,
        name: Option<&str>,
        is_library: Option<bool>,
    ) {
        let mut params = json!({ "path": path });
        if let Some(name) = name {
            params["name"] = json!(name);
        }
        if let Some(is_library) = is_library {
            params["isLibrary"] = json!(is_library);
        }

        let mut map = self
            .working_dir
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let now = Instant::now();
        let state = map.entry(shell_id.to_string()).or_insert(WorkingDirState {
            last_emit: now.checked_sub(WORKING_DIR_COALESCE_WINDOW).unwrap_or(now),
            pending: None,
            flusher_armed: false,
        });

        if state.last_emit.elapsed() >= WORKING_DIR_COALESCE_WINDOW {
            state.last_emit = Instant::now();
            // A delayed flusher must not later emit an older change over
            // this one.
            state.pending = None;
            drop(map);
            self.runtime.broadcast("workingDirectoryChanged", params);
            return;
        }

        // Inside the window: remember only the latest and arm one flusher.
        state.pending = Some(params);
        if !state.flusher_armed {
            state.flusher_armed = true;
            let publisher = self.clone();
            let shell_id = shell_id.to_string();
            let delay = WORKING_DIR_COALESCE_WINDOW.saturating_sub(state.last_emit.elapsed());
            drop(map);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                publisher.flush_working_dir(&shell_id);
            });
        }
    }

    /// Emits the pending coalesced change for one shell, if any.
    fn flush_working_dir(&self, shell_id: &str) {
        let pending = {
            let mut map = self
                .working_dir
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let Some(state) = map.get_mut(shell_id) else {
                return;
            };
            state.flusher_armed = false;
            let pending = state.pending.take();
            if pending.is_some() {
                state.last_emit = Instant::now();
            }
            pending
        };
        if let Some(params) = pending {
            self.runtime.broadcast("workingDirectoryChanged", params);
        }
    }

    /// Publishes `navigationStateChanged`.
    pub fn navigation_state_changed(
        &self,
        can_navigate_back: bool,
        can_navigate_forward: bool,
        path: &str,
    ) {
        self.runtime.broadcast(
            "navigationStateChanged",
            json!({
                "canNavigateBack": can_navigate_back,
                "canNavigateForward": can_navigate_forward,
                "path": path,
            }),
        );
    }

    /// Publishes `selectionChanged`, truncating to the configured cap.
    pub fn selection_changed(&self, items: Vec<SelectionItem>) {
        let cap = self.runtime.config().selection_notification_cap();
        let truncated = items.len() > cap;
        let items: Vec<SelectionItem> = items.into_iter().take(cap).collect();
        self.runtime.broadcast(
            "selectionChanged",
            json!({ "items": items, "truncated": truncated }),
        );
    }

    /// Publishes `itemsChanged`.
    pub fn items_changed(&self, item_count: usize) {
        self.runtime
            .broadcast("itemsChanged", json!({ "itemCount": item_count }));
    }
}
