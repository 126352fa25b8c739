//! Named method table with per-method policy.
//!
//! The runtime consults this registry before anything reaches the
//! coordinator: whether the method exists, whether it demands an
//! authenticated session, whether it may be invoked as a notification, an
//! optional raw-payload cap, and an optional authorization predicate.
//!
//! Registration happens at startup; duplicates overwrite. Nothing is
//! removed during normal operation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use files_ipc_core::Message;

use crate::session::ClientSession;

/// Maximum raw payload for `getMetadata` requests (2 MiB).
pub const GET_METADATA_MAX_PAYLOAD_BYTES: usize = 2 * 1024 * 1024;

/// Authorization predicate over (session, message).
pub type AuthorizePredicate = Arc<dyn Fn(&ClientSession, &Message) -> bool + Send + Sync>;

/// Policy for one named method. Immutable after registration.
#[derive(Clone)]
pub struct MethodDefinition {
    /// Method name as it appears on the wire.
    pub name: String,
    /// Whether the session must have completed a handshake.
    pub requires_auth: bool,
    /// Whether the method may be invoked without an id.
    pub allow_notifications: bool,
    /// Optional cap on the raw request payload, in bytes.
    pub max_payload_bytes: Option<usize>,
    /// Optional extra authorization check, run after the auth flag.
    pub authorize: Option<AuthorizePredicate>,
}

impl MethodDefinition {
    /// A request-only method requiring authentication, with no payload cap.
    #[must_use]
    pub fn authenticated(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            requires_auth: true,
            allow_notifications: false,
            max_payload_bytes: None,
            authorize: None,
        }
    }

    /// Sets the raw payload cap.
    #[must_use]
    pub fn with_max_payload(mut self, bytes: usize) -> Self {
        self.max_payload_bytes = Some(bytes);
        self
    }

    /// Attaches an authorization predicate.
    #[must_use]
    pub fn with_authorize(mut self, predicate: AuthorizePredicate) -> Self {
        self.authorize = Some(predicate);
        self
    }
}

impl std::fmt::Debug for MethodDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodDefinition")
            .field("name", &self.name)
            .field("requires_auth", &self.requires_auth)
            .field("allow_notifications", &self.allow_notifications)
            .field("max_payload_bytes", &self.max_payload_bytes)
            .field("has_authorize", &self.authorize.is_some())
            .finish()
    }
}

/// Thread-safe method table.
pub struct MethodRegistry {
    methods: RwLock<HashMap<String, Arc<MethodDefinition>>>,
}

impl MethodRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            methods: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a registry pre-populated with the IPC surface:
    ///
    /// | method        | auth | notifications | payload cap |
    /// |---------------|:----:|:-------------:|:-----------:|
    /// | handshake     |  no  |      no       |      —      |
    /// | getState      | yes  |      no       |      —      |
    /// | listActions   | yes  |      no       |      —      |
    /// | listShells    | yes  |      no       |      —      |
    /// | getMetadata   | yes  |      no       |    2 MiB    |
    /// | navigate      | yes  |      no       |      —      |
    /// | executeAction | yes  |      no       |      —      |
    #[must_use]
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register(MethodDefinition {
            name: "handshake".to_string(),
            requires_auth: false,
            allow_notifications: false,
            max_payload_bytes: None,
            authorize: None,
        });
        registry.register(MethodDefinition::authenticated("getState"));
        registry.register(MethodDefinition::authenticated("listActions"));
        registry.register(MethodDefinition::authenticated("listShells"));
        registry.register(
            MethodDefinition::authenticated("getMetadata")
                .with_max_payload(GET_METADATA_MAX_PAYLOAD_BYTES),
        );
        registry.register(MethodDefinition::authenticated("navigate"));
        registry.register(MethodDefinition::authenticated("executeAction"));
        registry
    }

    /// Registers a method; an existing definition with the same name is
    /// overwritten.
    pub fn register(&self, definition: MethodDefinition) {
        let mut methods = self
            .methods
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        methods.insert(definition.name.clone(), Arc::new(definition));
    }

    /// Looks a method up by wire name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<MethodDefinition>> {
        let methods = self
            .methods
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        methods.get(name).cloned()
    }
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
