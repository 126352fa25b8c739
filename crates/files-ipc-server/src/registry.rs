//! Registry of live shells.
//!
//! The host registers a shell when a view opens and unregisters it before
//! the adapter is destroyed; the coordinator resolves request targets
//! against this table. At most one shell per window is active at any time,
//! and `set_active` maintains that atomically under the registry lock.

use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::adapter::ShellAdapter;

/// One registered shell.
#[derive(Clone)]
pub struct ShellDescriptor {
    /// Opaque shell id.
    pub shell_id: String,
    /// Hosting window.
    pub window_id: i64,
    /// Opaque tab id within the window.
    pub tab_id: String,
    /// The host capability the coordinator dispatches onto.
    pub adapter: Arc<dyn ShellAdapter>,
    /// Whether this is the window's active shell.
    pub active: bool,
}

impl std::fmt::Debug for ShellDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellDescriptor")
            .field("shell_id", &self.shell_id)
            .field("window_id", &self.window_id)
            .field("tab_id", &self.tab_id)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

/// Wire-facing summary of a shell, for `listShells`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellSummary {
    /// Opaque shell id.
    pub shell_id: String,
    /// Hosting window.
    pub window_id: i64,
    /// Opaque tab id.
    pub tab_id: String,
    /// Whether this is the window's active shell.
    pub active: bool,
}

struct RegistryInner {
    shells: Vec<ShellDescriptor>,
    focused_window: Option<i64>,
}

/// Thread-safe shell table.
pub struct ShellRegistry {
    inner: RwLock<RegistryInner>,
}

impl ShellRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                shells: Vec::new(),
                focused_window: None,
            }),
        }
    }

    /// Registers a shell, replacing any existing entry with the same id.
    ///
    /// If the descriptor is marked active, other shells in the same window
    /// are deactivated in the same critical section.
    pub fn register(&self, descriptor: ShellDescriptor) {
        let mut inner = self
            .inner
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.shells.retain(|s| s.shell_id != descriptor.shell_id);
        if descriptor.active {
            for shell in &mut inner.shells {
                if shell.window_id == descriptor.window_id {
                    shell.active = false;
                }
            }
        }
        inner.shells.push(descriptor);
    }

    /// Removes a shell. The host calls this before dropping the adapter.
    pub fn unregister(&self, shell_id: &str) {
        let mut inner = self
            .inner
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.shells.retain(|s| s.shell_id != shell_id);
    }

    /// Looks a shell up by id.
    #[must_use]
    pub fn get_by_id(&self, shell_id: &str) -> Option<ShellDescriptor> {
        let inner = self
            .inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.shells.iter().find(|s| s.shell_id == shell_id).cloned()
    }

    /// The active shell of `window_id`, if any.
    #[must_use]
    pub fn active_for_window(&self, window_id: i64) -> Option<ShellDescriptor> {
        let inner = self
            .inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        inner
            .shells
            .iter()
            .find(|s| s.window_id == window_id && s.active)
            .cloned()
    }

    /// Atomically makes `shell_id` the unique active shell of its window.
    ///
    /// Returns `false` when the shell is not registered.
    pub fn set_active(&self, shell_id: &str) -> bool {
        let mut inner = self
            .inner
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(window_id) = inner
            .shells
            .iter()
            .find(|s| s.shell_id == shell_id)
            .map(|s| s.window_id)
        else {
            return false;
        };
        for shell in &mut inner.shells {
            if shell.window_id == window_id {
                shell.active = shell.shell_id == shell_id;
            }
        }
        true
    }

    /// Records which window currently has host focus.
    pub fn set_focused_window(&self, window_id: Option<i64>) {
        let mut inner = self
            .inner
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.focused_window = window_id;
    }

    /// The focused window, if the host reported one.
    #[must_use]
    pub fn focused_window(&self) -> Option<i64> {
        self.inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .focused_window
    }

    /// Stable snapshot of all registered shells.
    #[must_use]
    pub fn list(&self) -> Vec<ShellDescriptor> {
        self.inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .shells
            .clone()
    }

    /// Wire-facing summaries, for `listShells`.
    #[must_use]
    pub fn summaries(&self) -> Vec<ShellSummary> {
        self.list()
            .into_iter()
            .map(|s| ShellSummary {
                shell_id: s.shell_id,
                window_id: s.window_id,
                tab_id: s.tab_id,
                active: s.active,
            })
            .collect()
    }
}

impl Default for ShellRegistry {
    fn default() -> Self {
        Self::new()
    }
}
