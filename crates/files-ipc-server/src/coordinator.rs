//! Request coordinator: routes validated requests onto shell adapters.
//!
//! The runtime has already parsed, authenticated, and rate-admitted the
//! request by the time it lands here. The coordinator resolves the target
//! shell, decodes the method's typed params (unknown fields ignored,
//! missing required fields are `InvalidParams`), runs the adapter call —
//! UI-bound methods through the [`UiQueue`], filesystem stats directly
//! under a deadline — and converts every failure into a wire-safe
//! [`DispatchFailure`].
//!
//! # Target resolution
//!
//! In order: explicit `targetShellId` in params; explicit `windowId` →
//! that window's active shell; the focused window's active shell; any
//! registered shell. No shell at all → `-32001 "No shell available"`.
//!
//! `executeAction` never consults ambient focus: the resolved shell is
//! passed explicitly, so IPC cannot accidentally execute against whatever
//! pane last held focus.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use files_ipc_core::message::codes;
use files_ipc_core::sanitize::{sanitize_failure, FailureClass};
use files_ipc_core::{normalize_request_path, IpcConfig, Message};

use crate::adapter::{AdapterError, ShellAdapter};
use crate::registry::{ShellDescriptor, ShellRegistry};
use crate::runtime::{DispatchFailure, RequestDispatcher};
use crate::session::ClientSession;
use crate::ui_queue::{UiQueue, UiQueueError};

/// Optional targeting fields accepted by every shell-bound method.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TargetParams {
    target_shell_id: Option<String>,
    window_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct NavigateParams {
    path: String,
}

#[derive(Debug, Deserialize)]
struct GetMetadataParams {
    paths: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteActionParams {
    action_id: String,
    target_shell_id: Option<String>,
}

/// Routes requests to shell adapters.
pub struct Coordinator {
    registry: Arc<ShellRegistry>,
    ui: UiQueue,
    config: Arc<IpcConfig>,
}

impl Coordinator {
    /// Creates a coordinator over the given shell registry.
    #[must_use]
    pub fn new(registry: Arc<ShellRegistry>, ui: UiQueue, config: Arc<IpcConfig>) -> Self {
        Self {
            registry,
            ui,
            config,
        }
    }

    /// The shell registry this coordinator resolves against.
    #[must_use]
    pub fn registry(&self) -> &Arc<ShellRegistry> {
        &self.registry
    }

    /// Resolves the target shell for a request.
    fn resolve_target(&self, params: Option<&Value>) -> Result<ShellDescriptor, DispatchFailure> {
        let target: TargetParams = params
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .unwrap_or_default()
            .unwrap_or_default();

        if let Some(shell_id) = &target.target_shell_id {
            if let Some(shell) = self.registry.get_by_id(shell_id) {
                return Ok(shell);
            }
            debug!(shell_id, "explicit target shell not registered; falling back");
        }
        if let Some(window_id) = target.window_id {
            if let Some(shell) = self.registry.active_for_window(window_id) {
                return Ok(shell);
            }
        }
        if let Some(window_id) = self.registry.focused_window() {
            if let Some(shell) = self.registry.active_for_window(window_id) {
                return Ok(shell);
            }
        }
        self.registry
            .list()
            .into_iter()
            .next()
            .ok_or_else(|| DispatchFailure::new(codes::AUTH_REQUIRED, "No shell available"))
    }

    /// Decodes typed params, mapping decode failures to `InvalidParams`.
    fn decode_params<T: serde::de::DeserializeOwned>(
        message: &Message,
    ) -> Result<T, DispatchFailure> {
        let params = message.params.clone().unwrap_or(Value::Null);
        serde_json::from_value(params).map_err(|err| {
            DispatchFailure::new(codes::INVALID_PARAMS, format!("Invalid params: {err}"))
        })
    }

    /// Runs a UI-bound adapter call through the serial queue.
    async fn on_ui<T, Fut, F>(&self, op: F) -> Result<T, DispatchFailure>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<T, AdapterError>> + Send + 'static,
        T: Send + 'static,
    {
        match self.ui.submit(op).await {
            Ok(result) => result.map_err(adapter_failure),
            Err(UiQueueError::Closed) => Err(DispatchFailure::new(
                codes::INTERNAL_ERROR,
                "Internal error",
            )),
            Err(UiQueueError::Failed) => Err(DispatchFailure::new(
                codes::INTERNAL_ERROR,
                "Internal error",
            )),
        }
    }

    async fn get_state(&self, message: &Message) -> Result<Value, DispatchFailure> {
        let shell = self.resolve_target(message.params.as_ref())?;
        let adapter = Arc::clone(&shell.adapter);
        let state = self.on_ui(move || async move { adapter.get_state().await }).await?;
        serde_json::to_value(state)
            .map_err(|_| DispatchFailure::new(codes::INTERNAL_ERROR, "Internal error"))
    }

    async fn list_actions(&self, message: &Message) -> Result<Value, DispatchFailure> {
        let shell = self.resolve_target(message.params.as_ref())?;
        let adapter = Arc::clone(&shell.adapter);
        let actions = self
            .on_ui(move || async move { adapter.list_actions().await })
            .await?;
        Ok(json!({ "actions": actions }))
    }

    fn list_shells(&self) -> Value {
        json!({ "shells": self.registry.summaries() })
    }

    async fn navigate(&self, message: &Message) -> Result<Value, DispatchFailure> {
        let params: NavigateParams = Self::decode_params(message)?;
        let path = normalize_request_path(&params.path)
            .map_err(|err| DispatchFailure::new(codes::INVALID_PARAMS, format!("Invalid path: {err}")))?;
        let shell = self.resolve_target(message.params.as_ref())?;
        let adapter = Arc::clone(&shell.adapter);
        self.on_ui(move || async move { adapter.navigate(&path).await })
            .await?;
        Ok(json!({ "status": "ok" }))
    }

    async fn get_metadata(&self, message: &Message) -> Result<Value, DispatchFailure> {
        let params: GetMetadataParams = Self::decode_params(message)?;
        let max_items = self.config.get_metadata_max_items();
        if params.paths.len() > max_items {
            return Err(DispatchFailure::new(
                codes::INVALID_PARAMS,
                format!("Too many paths: limit is {max_items}"),
            ));
        }
        let mut paths: Vec<PathBuf> = Vec::with_capacity(params.paths.len());
        for raw in &params.paths {
            let path = normalize_request_path(raw).map_err(|err| {
                DispatchFailure::new(codes::INVALID_PARAMS, format!("Invalid path: {err}"))
            })?;
            paths.push(path);
        }

        let shell = self.resolve_target(message.params.as_ref())?;
        let adapter = Arc::clone(&shell.adapter);
        let deadline = Duration::from_secs(self.config.get_metadata_timeout_secs());
        // Pure filesystem stats: no UI marshaling, just the deadline. The
        // timeout drops the adapter future, which is its cancellation.
        match tokio::time::timeout(deadline, adapter.get_metadata(paths)).await {
            Ok(Ok(items)) => serde_json::to_value(items)
                .map_err(|_| DispatchFailure::new(codes::INTERNAL_ERROR, "Internal error")),
            Ok(Err(err)) => Err(adapter_failure(err)),
            Err(_) => Err(DispatchFailure::new(
                codes::INTERNAL_ERROR,
                format!("getMetadata timed out after {}s", deadline.as_secs()),
            )),
        }
    }

    async fn execute_action(&self, message: &Message) -> Result<Value, DispatchFailure> {
        let params: ExecuteActionParams = Self::decode_params(message)?;
        let shell = match params
            .target_shell_id
            .as_deref()
            .and_then(|id| self.registry.get_by_id(id))
        {
            Some(shell) => shell,
            None => self.resolve_target(message.params.as_ref())?,
        };
        let adapter = Arc::clone(&shell.adapter);
        let action_id = params.action_id;
        let outcome = self
            .on_ui(move || async move { adapter.execute_action(&action_id).await })
            .await?;
        Ok(outcome.unwrap_or_else(|| json!({ "status": "ok" })))
    }
}

#[async_trait]
impl RequestDispatcher for Coordinator {
    async fn dispatch(
        &self,
        session: &Arc<ClientSession>,
        message: &Message,
    ) -> Result<Value, DispatchFailure> {
        let method = message.method.as_deref().unwrap_or_default();
        debug!(session = %session.id(), method, "dispatching request");
        match method {
            "getState" => self.get_state(message).await,
            "listActions" => self.list_actions(message).await,
            "listShells" => Ok(self.list_shells()),
            "navigate" => self.navigate(message).await,
            "getMetadata" => self.get_metadata(message).await,
            "executeAction" => self.execute_action(message).await,
            other => Err(DispatchFailure::new(codes::METHOD_NOT_FOUND, format!("Method not found: {other}"))),
        }
    }
}

/// Converts an adapter failure into a wire-safe dispatch failure.
///
/// Domain codes survive; everything else becomes an internal error. The
/// unsanitized detail is logged here and nowhere else.
fn adapter_failure(err: AdapterError) -> DispatchFailure {
    warn!(class = ?err.class, code = ?err.code, detail = %err.message, "adapter call failed");
    let message = sanitize_failure(err.class, &err.message);
    match (err.class, err.code) {
        (FailureClass::AccessDenied | FailureClass::Cryptographic, code) => {
            DispatchFailure::new(code.unwrap_or(codes::INTERNAL_ERROR), message)
        }
        (FailureClass::Other, Some(code)) => DispatchFailure::new(code, message),
        (FailureClass::Other, None) => DispatchFailure::new(codes::INTERNAL_ERROR, message),
    }
}
