//! Transport-agnostic session runtime.
//!
//! The runtime owns the live-session registry and everything protocol:
//! the receive path (parse, validate, authenticate, rate-limit, dispatch),
//! the handshake sub-protocol, per-session send loops, the keepalive timer,
//! and the reaper. Transports feed it connections and frames; the
//! coordinator sits behind the [`RequestDispatcher`] seam.
//!
//! # Receive path
//!
//! Per inbound frame, in order: parse; stamp activity; envelope shape;
//! handshake short-circuit; method lookup; authentication; authorization
//! predicate; epoch; rate limit; notification policy; payload cap;
//! dispatch. Requests get exactly one reply; notifications that fail any
//! policy gate are dropped silently.
//!
//! # Security Invariants
//!
//! - Token comparison is constant-time.
//! - A handshake notification never produces a reply, success or failure.
//! - After rotation, a stale session receives exactly one `-32004` and is
//!   then closed once the reply has flushed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use files_ipc_core::message::codes;
use files_ipc_core::{IpcConfig, Message, Rendezvous, RendezvousError, TokenStore, TokenStoreError};

use crate::methods::MethodRegistry;
use crate::session::{ClientSession, SessionId};
use crate::transport::{SessionSink, TransportKind};

/// Interval between `ping` broadcasts.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Interval between reaper sweeps.
pub const REAPER_INTERVAL: Duration = Duration::from_secs(60);

/// Inactivity threshold after which the reaper evicts a session.
pub const STALE_AFTER: Duration = Duration::from_secs(5 * 60);

/// Consecutive parse failures tolerated before the connection is closed.
pub const MAX_CONSECUTIVE_PARSE_ERRORS: u32 = 3;

/// Server identification string returned by the handshake.
pub const SERVER_INFO: &str = "Files IPC Server";

/// Failure surfaced by a dispatcher, already wire-safe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchFailure {
    /// JSON-RPC error code.
    pub code: i64,
    /// Sanitized message.
    pub message: String,
}

impl DispatchFailure {
    /// Convenience constructor.
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Seam between the runtime and the request coordinator.
#[async_trait]
pub trait RequestDispatcher: Send + Sync {
    /// Handles one validated, authenticated, rate-admitted request.
    ///
    /// # Errors
    ///
    /// Returns a [`DispatchFailure`] whose code and message go to the wire
    /// verbatim; sanitization is the dispatcher's responsibility.
    async fn dispatch(
        &self,
        session: &Arc<ClientSession>,
        message: &Message,
    ) -> Result<Value, DispatchFailure>;
}

/// Errors from runtime lifecycle operations.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Remote control has not been opted into.
    #[error("remote control is disabled")]
    Disabled,

    /// The token store failed.
    #[error(transparent)]
    TokenStore(#[from] TokenStoreError),

    /// The rendezvous descriptor failed.
    #[error(transparent)]
    Rendezvous(#[from] RendezvousError),
}

/// The transport-agnostic session runtime.
pub struct SessionRuntime {
    config: Arc<IpcConfig>,
    methods: Arc<MethodRegistry>,
    store: Arc<dyn TokenStore>,
    rendezvous: Arc<Rendezvous>,
    dispatcher: Arc<dyn RequestDispatcher>,
    sessions: Mutex<HashMap<SessionId, Arc<ClientSession>>>,
    current_token: RwLock<String>,
    epoch: AtomicU64,
    root_cancel: CancellationToken,
    running: AtomicBool,
}

impl SessionRuntime {
    /// Creates a runtime. Nothing is live until [`start`](Self::start).
    #[must_use]
    pub fn new(
        config: Arc<IpcConfig>,
        methods: Arc<MethodRegistry>,
        store: Arc<dyn TokenStore>,
        rendezvous: Arc<Rendezvous>,
        dispatcher: Arc<dyn RequestDispatcher>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            methods,
            store,
            rendezvous,
            dispatcher,
            sessions: Mutex::new(HashMap::new()),
            current_token: RwLock::new(String::new()),
            epoch: AtomicU64::new(0),
            root_cancel: CancellationToken::new(),
            running: AtomicBool::new(false),
        })
    }

    /// The shared config.
    #[must_use]
    pub fn config(&self) -> &Arc<IpcConfig> {
        &self.config
    }

    /// The rendezvous writer transports publish through.
    #[must_use]
    pub fn rendezvous(&self) -> &Arc<Rendezvous> {
        &self.rendezvous
    }

    /// Current epoch snapshot.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// The token currently accepted by handshakes.
    #[must_use]
    pub fn current_token(&self) -> String {
        self.current_token
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Whether [`start`](Self::start) has succeeded.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Root cancellation token; transports derive their own from it.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.root_cancel
    }

    /// Number of live sessions; for monitoring and tests.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Snapshots the token and epoch, pins the rendezvous token, and arms
    /// the keepalive and reaper timers.
    ///
    /// Refuses when remote control is disabled; transports are started
    /// separately by the service facade after this succeeds.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::Disabled`] when the opt-in flag is off, or a token
    /// store failure.
    pub async fn start(self: &Arc<Self>) -> Result<(), RuntimeError> {
        if !self.store.is_enabled()? {
            warn!("remote control is disabled; refusing to start IPC runtime");
            return Err(RuntimeError::Disabled);
        }

        let token = self.store.get_or_create_token()?;
        let epoch = self.store.epoch()?;
        *self
            .current_token
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = token.clone();
        self.epoch.store(epoch, Ordering::Release);
        self.rendezvous.set_token(token);
        self.running.store(true, Ordering::Release);

        let runtime = Arc::clone(self);
        tokio::spawn(async move { runtime.keepalive_loop().await });
        let runtime = Arc::clone(self);
        tokio::spawn(async move { runtime.reaper_loop().await });

        info!(epoch, "IPC session runtime started");
        Ok(())
    }

    /// Cancels the root token, closes every session, and removes the
    /// rendezvous descriptor.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.root_cancel.cancel();

        let sessions: Vec<Arc<ClientSession>> = {
            let mut map = self
                .sessions
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            map.drain().map(|(_, session)| session).collect()
        };
        for session in sessions {
            session.close();
            session.sink().close().await;
        }

        if let Err(err) = self.rendezvous.delete() {
            warn!(error = %err, "failed to delete rendezvous descriptor");
        }
        info!("IPC session runtime stopped");
    }

    /// Rotates the shared secret and bumps the epoch.
    ///
    /// Existing sessions keep their captured epoch and receive `-32004` on
    /// their next request. The rendezvous descriptor is rewritten with the
    /// new token and epoch, preserving published transport fields.
    ///
    /// # Errors
    ///
    /// Fails only if persistence fails; the old token stays in force then.
    pub fn rotate_token(&self) -> Result<String, RuntimeError> {
        let token = self.store.rotate_token()?;
        let epoch = self.store.epoch()?;
        *self
            .current_token
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = token.clone();
        self.epoch.store(epoch, Ordering::Release);
        self.rendezvous.set_token(token.clone());
        self.rendezvous.update(None, None, epoch)?;
        info!(epoch, "token rotated");
        Ok(token)
    }

    /// Registers a connection and spawns its send loop.
    ///
    /// Invariant: a session is present in the registry iff its transport
    /// is live; the transport's read loop must call
    /// [`remove_session`](Self::remove_session) on disconnect.
    #[must_use]
    pub fn register_session(
        self: &Arc<Self>,
        kind: TransportKind,
        sink: Arc<dyn SessionSink>,
    ) -> Arc<ClientSession> {
        let session = ClientSession::new(kind, sink, &self.config, &self.root_cancel);
        {
            let mut map = self
                .sessions
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            map.insert(session.id().clone(), Arc::clone(&session));
        }
        debug!(session = %session.id(), transport = %kind, "session registered");

        let runtime = Arc::clone(self);
        let for_loop = Arc::clone(&session);
        tokio::spawn(async move { runtime.run_send_loop(for_loop).await });
        session
    }

    /// Unregisters and closes a session.
    pub fn remove_session(&self, id: &SessionId) {
        let removed = {
            let mut map = self
                .sessions
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            map.remove(id)
        };
        if let Some(session) = removed {
            session.close();
            debug!(session = %id, "session removed");
        }
    }

    /// Handles one inbound frame from a transport read loop.
    pub async fn handle_frame(self: &Arc<Self>, session: &Arc<ClientSession>, raw: &str) {
        let message = match Message::from_json(raw.as_bytes()) {
            Ok(message) => {
                session.reset_parse_errors();
                message
            }
            Err(err) => {
                let streak = session.record_parse_error();
                debug!(session = %session.id(), streak, error = %err, "parse error");
                self.enqueue_reply(session, Message::error(None, codes::PARSE_ERROR, "Parse error"));
                if streak >= MAX_CONSECUTIVE_PARSE_ERRORS {
                    session.close_when_drained();
                }
                return;
            }
        };

        session.touch();
        let is_notification = message.is_notification();

        if !message.is_valid() {
            self.enqueue_reply(
                session,
                Message::error(message.id.clone(), codes::INVALID_REQUEST, "Invalid request"),
            );
            return;
        }

        if message.method.as_deref() == Some("handshake") {
            self.handle_handshake(session, &message);
            return;
        }

        let method_name = message.method.clone().unwrap_or_default();
        let Some(definition) = self.methods.get(&method_name) else {
            if !is_notification {
                self.enqueue_reply(
                    session,
                    Message::error(message.id.clone(), codes::METHOD_NOT_FOUND, "Method not found"),
                );
            }
            return;
        };

        if definition.requires_auth && !session.is_authenticated() {
            if !is_notification {
                self.enqueue_reply(
                    session,
                    Message::error(
                        message.id.clone(),
                        codes::AUTH_REQUIRED,
                        "Authentication required",
                    ),
                );
            }
            return;
        }

        if let Some(authorize) = &definition.authorize {
            if !authorize(session, &message) {
                if !is_notification {
                    self.enqueue_reply(
                        session,
                        Message::error(
                            message.id.clone(),
                            codes::INVALID_TOKEN,
                            "Authorization failed",
                        ),
                    );
                }
                return;
            }
        }

        if session.is_authenticated() && session.auth_epoch() != self.epoch() {
            if !is_notification {
                self.enqueue_reply(
                    session,
                    Message::error(message.id.clone(), codes::SESSION_EXPIRED, "Session expired"),
                );
            }
            session.close_when_drained();
            return;
        }

        if !session.try_consume() {
            if !is_notification {
                self.enqueue_reply(
                    session,
                    Message::error(message.id.clone(), codes::RATE_LIMITED, "Rate limit exceeded"),
                );
            }
            return;
        }

        if is_notification && !definition.allow_notifications {
            debug!(session = %session.id(), method = %method_name, "notification dropped by policy");
            return;
        }

        if let Some(max) = definition.max_payload_bytes {
            if raw.len() > max {
                if !is_notification {
                    self.enqueue_reply(
                        session,
                        Message::error(message.id.clone(), codes::INVALID_PARAMS, "Payload too large"),
                    );
                }
                return;
            }
        }

        match self.dispatcher.dispatch(session, &message).await {
            Ok(value) => {
                if !is_notification {
                    self.enqueue_reply(session, Message::result(message.id.clone(), value));
                }
            }
            Err(failure) => {
                if !is_notification {
                    self.enqueue_reply(
                        session,
                        Message::error(message.id.clone(), failure.code, failure.message),
                    );
                }
            }
        }
    }

    /// The handshake sub-protocol.
    ///
    /// Success is idempotent: repeating it on an authenticated session
    /// replies `authenticated` again and refreshes the captured epoch.
    /// Handshake notifications never get a reply.
    fn handle_handshake(&self, session: &Arc<ClientSession>, message: &Message) {
        let is_notification = message.is_notification();
        let presented = message
            .params
            .as_ref()
            .and_then(|params| params.get("token"))
            .and_then(Value::as_str);
        let Some(presented) = presented else {
            if !is_notification {
                self.enqueue_reply(
                    session,
                    Message::error(
                        message.id.clone(),
                        codes::INVALID_PARAMS,
                        "Invalid params: token required",
                    ),
                );
            }
            return;
        };

        let expected = self.current_token();
        if !constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
            if !is_notification {
                self.enqueue_reply(
                    session,
                    Message::error(message.id.clone(), codes::INVALID_TOKEN, "Invalid token"),
                );
            }
            return;
        }

        let epoch = self.epoch();
        session.mark_authenticated(epoch);
        if let Some(info) = message
            .params
            .as_ref()
            .and_then(|params| params.get("clientInfo"))
            .and_then(Value::as_str)
        {
            session.set_client_info(info.to_string());
        }
        info!(
            session = %session.id(),
            transport = %session.kind(),
            client = session.client_info().as_deref().unwrap_or("-"),
            "session authenticated"
        );

        if !is_notification {
            self.enqueue_reply(
                session,
                Message::result(
                    message.id.clone(),
                    json!({
                        "status": "authenticated",
                        "epoch": epoch,
                        "serverInfo": SERVER_INFO,
                    }),
                ),
            );
        }
    }

    /// Broadcasts a notification to every authenticated session.
    ///
    /// Each session pays one rate-limit token; sessions out of tokens or
    /// out of queue space simply miss this broadcast — drops are never
    /// retried and never block the caller.
    pub fn broadcast(&self, method: &str, params: Value) {
        let message = Message::notification(method, Some(params));
        let Ok(payload) = message.to_json_string() else {
            warn!(method, "failed to serialize broadcast");
            return;
        };
        let cap = self.config.per_session_queue_cap_bytes();

        let sessions: Vec<Arc<ClientSession>> = {
            let map = self
                .sessions
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            map.values().cloned().collect()
        };

        for session in sessions {
            if !session.is_authenticated() || session.is_cancelled() {
                continue;
            }
            if !session.try_consume() {
                debug!(session = %session.id(), method, "broadcast dropped: rate limited");
                continue;
            }
            if !session.queue().enqueue_notification(payload.clone(), method, cap) {
                debug!(session = %session.id(), method, "broadcast dropped: queue saturated");
            }
        }
    }

    /// Serializes a reply and puts it on the session's high-priority queue.
    fn enqueue_reply(&self, session: &Arc<ClientSession>, message: Message) {
        match message.to_json_string() {
            Ok(payload) => {
                session
                    .queue()
                    .enqueue_response(payload, self.config.per_session_queue_cap_bytes());
            }
            Err(err) => warn!(session = %session.id(), error = %err, "failed to serialize reply"),
        }
    }

    /// Per-session send loop: single dequeuer, strict response priority.
    async fn run_send_loop(self: Arc<Self>, session: Arc<ClientSession>) {
        let idle = Duration::from_millis(self.config.send_loop_idle_ms().max(1));
        'outer: loop {
            while let Some(frame) = session.queue().dequeue() {
                if let Err(err) = session.sink().send_frame(&frame.payload).await {
                    debug!(session = %session.id(), error = %err, "transport write failed");
                    session.close();
                    break 'outer;
                }
            }
            if session.should_close_when_drained() && session.queue().is_empty() {
                session.close();
            }
            if session.is_cancelled() {
                break;
            }
            tokio::select! {
                () = session.cancellation().cancelled() => break,
                () = session.queue().notified().notified() => {}
                () = tokio::time::sleep(idle) => {}
            }
        }
        session.sink().close().await;
    }

    /// Broadcasts `ping` on a fixed interval until shutdown.
    async fn keepalive_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await; // immediate first tick
        loop {
            tokio::select! {
                () = self.root_cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.broadcast("ping", json!({
                        "timestamp": chrono::Utc::now().to_rfc3339(),
                    }));
                }
            }
        }
    }

    /// Evicts cancelled and stale sessions on a fixed interval.
    async fn reaper_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(REAPER_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = self.root_cancel.cancelled() => break,
                _ = ticker.tick() => self.reap_once(),
            }
        }
    }

    /// One reaper sweep; separated out for tests.
    pub fn reap_once(&self) {
        let stale: Vec<Arc<ClientSession>> = {
            let map = self
                .sessions
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            map.values()
                .filter(|s| s.is_cancelled() || s.idle_for() > STALE_AFTER)
                .cloned()
                .collect()
        };
        for session in stale {
            info!(session = %session.id(), idle = ?session.idle_for(), "reaping session");
            self.remove_session(session.id());
        }
    }
}

/// Constant-time equality over byte strings of possibly different lengths.
///
/// Length is the only thing an attacker can learn; token values never
/// influence timing.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use files_ipc_core::InMemoryTokenStore;

    use super::*;
    use crate::transport::MemorySink;

    /// Dispatcher echoing the method name; requests never reach it unless
    /// every runtime gate passed.
    struct EchoDispatcher;

    #[async_trait]
    impl RequestDispatcher for EchoDispatcher {
        async fn dispatch(
            &self,
            _session: &Arc<ClientSession>,
            message: &Message,
        ) -> Result<Value, DispatchFailure> {
            Ok(json!({ "echo": message.method }))
        }
    }

    struct Harness {
        runtime: Arc<SessionRuntime>,
        store: Arc<InMemoryTokenStore>,
        _dir: TempDir,
    }

    async fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(InMemoryTokenStore::with_token("secret-token"));
        let runtime = SessionRuntime::new(
            Arc::new(IpcConfig::for_testing()),
            Arc::new(MethodRegistry::with_defaults()),
            store.clone(),
            Arc::new(Rendezvous::new(dir.path())),
            Arc::new(EchoDispatcher),
        );
        runtime.start().await.unwrap();
        Harness {
            runtime,
            store,
            _dir: dir,
        }
    }

    fn connect(harness: &Harness) -> (Arc<ClientSession>, Arc<MemorySink>) {
        let sink = MemorySink::new();
        let session = harness
            .runtime
            .register_session(TransportKind::Memory, sink.clone());
        (session, sink)
    }

    async fn send(harness: &Harness, session: &Arc<ClientSession>, raw: &str) {
        harness.runtime.handle_frame(session, raw).await;
    }

    fn parse_reply(frame: &str) -> Message {
        Message::from_json(frame.as_bytes()).unwrap()
    }

    #[tokio::test]
    async fn refuses_start_when_disabled() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(InMemoryTokenStore::new());
        let runtime = SessionRuntime::new(
            Arc::new(IpcConfig::for_testing()),
            Arc::new(MethodRegistry::with_defaults()),
            store,
            Arc::new(Rendezvous::new(dir.path())),
            Arc::new(EchoDispatcher),
        );
        assert!(matches!(runtime.start().await, Err(RuntimeError::Disabled)));
        assert!(!runtime.is_running());
    }

    #[tokio::test]
    async fn handshake_happy_path() {
        let harness = harness().await;
        let (session, sink) = connect(&harness);
        send(
            &harness,
            &session,
            r#"{"jsonrpc":"2.0","id":1,"method":"handshake","params":{"token":"secret-token"}}"#,
        )
        .await;

        let frames = sink.wait_for_frames(1).await;
        let reply = parse_reply(&frames[0]);
        assert_eq!(reply.id, Some(json!(1)));
        let result = reply.result.unwrap();
        assert_eq!(result["status"], "authenticated");
        assert_eq!(result["epoch"], 1);
        assert_eq!(result["serverInfo"], SERVER_INFO);
        assert!(session.is_authenticated());
        assert_eq!(session.auth_epoch(), 1);
    }

    #[tokio::test]
    async fn handshake_wrong_token() {
        let harness = harness().await;
        let (session, sink) = connect(&harness);
        send(
            &harness,
            &session,
            r#"{"jsonrpc":"2.0","id":"x","method":"handshake","params":{"token":"wrong"}}"#,
        )
        .await;

        let frames = sink.wait_for_frames(1).await;
        let reply = parse_reply(&frames[0]);
        assert_eq!(reply.id, Some(json!("x")));
        let error = reply.error.unwrap();
        assert_eq!(error.code, codes::INVALID_TOKEN);
        assert_eq!(error.message, "Invalid token");
        assert!(!session.is_authenticated());
    }

    #[tokio::test]
    async fn handshake_missing_token_param() {
        let harness = harness().await;
        let (session, sink) = connect(&harness);
        send(
            &harness,
            &session,
            r#"{"jsonrpc":"2.0","id":2,"method":"handshake","params":{}}"#,
        )
        .await;
        let frames = sink.wait_for_frames(1).await;
        assert_eq!(parse_reply(&frames[0]).error.unwrap().code, codes::INVALID_PARAMS);
        assert!(!session.is_authenticated());
    }

    #[tokio::test]
    async fn handshake_notification_gets_no_reply() {
        let harness = harness().await;
        let (session, sink) = connect(&harness);
        send(
            &harness,
            &session,
            r#"{"jsonrpc":"2.0","method":"handshake","params":{"token":"secret-token"}}"#,
        )
        .await;
        // Authenticated, but silent.
        assert!(session.is_authenticated());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sink.frames().is_empty());
    }

    #[tokio::test]
    async fn repeated_handshake_is_idempotent_success() {
        let harness = harness().await;
        let (session, sink) = connect(&harness);
        for id in 1..=2 {
            send(
                &harness,
                &session,
                &format!(
                    r#"{{"jsonrpc":"2.0","id":{id},"method":"handshake","params":{{"token":"secret-token"}}}}"#
                ),
            )
            .await;
        }
        let frames = sink.wait_for_frames(2).await;
        for frame in &frames {
            let reply = parse_reply(frame);
            assert_eq!(reply.result.unwrap()["status"], "authenticated");
        }
        assert!(session.is_authenticated());
    }

    #[tokio::test]
    async fn unauthenticated_request_is_rejected() {
        let harness = harness().await;
        let (session, sink) = connect(&harness);
        send(&harness, &session, r#"{"jsonrpc":"2.0","id":5,"method":"getState"}"#).await;
        let frames = sink.wait_for_frames(1).await;
        let error = parse_reply(&frames[0]).error.unwrap();
        assert_eq!(error.code, codes::AUTH_REQUIRED);
        assert_eq!(error.message, "Authentication required");
    }

    #[tokio::test]
    async fn unauthenticated_notification_is_silent() {
        let harness = harness().await;
        let (session, sink) = connect(&harness);
        send(&harness, &session, r#"{"jsonrpc":"2.0","method":"getState"}"#).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sink.frames().is_empty());
        assert!(!session.is_authenticated(), "no session mutation allowed");
    }

    #[tokio::test]
    async fn unknown_method_request() {
        let harness = harness().await;
        let (session, sink) = connect(&harness);
        send(
            &harness,
            &session,
            r#"{"jsonrpc":"2.0","id":5,"method":"thisMethodDoesNotExist"}"#,
        )
        .await;
        let frames = sink.wait_for_frames(1).await;
        assert_eq!(
            parse_reply(&frames[0]).error.unwrap().code,
            codes::METHOD_NOT_FOUND
        );
    }

    #[tokio::test]
    async fn unknown_method_notification_is_silent() {
        let harness = harness().await;
        let (session, sink) = connect(&harness);
        send(&harness, &session, r#"{"jsonrpc":"2.0","method":"nope"}"#).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sink.frames().is_empty());
    }

    #[tokio::test]
    async fn invalid_envelope_is_rejected() {
        let harness = harness().await;
        let (session, sink) = connect(&harness);
        send(
            &harness,
            &session,
            r#"{"jsonrpc":"2.0","id":1,"method":"m","result":{}}"#,
        )
        .await;
        let frames = sink.wait_for_frames(1).await;
        assert_eq!(
            parse_reply(&frames[0]).error.unwrap().code,
            codes::INVALID_REQUEST
        );
    }

    #[tokio::test]
    async fn parse_error_replies_with_null_id() {
        let harness = harness().await;
        let (session, sink) = connect(&harness);
        send(&harness, &session, "{nope").await;
        let frames = sink.wait_for_frames(1).await;
        let reply = parse_reply(&frames[0]);
        assert_eq!(reply.id, Some(Value::Null));
        assert_eq!(reply.error.unwrap().code, codes::PARSE_ERROR);
        assert!(!session.is_cancelled());
    }

    #[tokio::test]
    async fn repeated_parse_errors_close_the_session() {
        let harness = harness().await;
        let (session, _sink) = connect(&harness);
        for _ in 0..MAX_CONSECUTIVE_PARSE_ERRORS {
            send(&harness, &session, "garbage").await;
        }
        // The send loop drains the error replies, then honors the close.
        tokio::time::timeout(Duration::from_secs(1), session.cancellation().cancelled())
            .await
            .expect("session must close after repeated parse errors");
    }

    #[tokio::test]
    async fn rate_limit_flood() {
        let harness = harness().await;
        let (session, sink) = connect(&harness);
        send(
            &harness,
            &session,
            r#"{"jsonrpc":"2.0","id":0,"method":"handshake","params":{"token":"secret-token"}}"#,
        )
        .await;

        let burst = harness.runtime.config().rate_limit_burst() as usize;
        let flood = 3 * burst;
        for i in 1..=flood {
            send(
                &harness,
                &session,
                &format!(r#"{{"jsonrpc":"2.0","id":{i},"method":"getState"}}"#),
            )
            .await;
        }

        let frames = sink.wait_for_frames(flood + 1).await;
        let mut ok = 0;
        let mut limited = 0;
        for frame in &frames[1..] {
            let reply = parse_reply(frame);
            if let Some(error) = reply.error {
                assert_eq!(error.code, codes::RATE_LIMITED);
                assert_eq!(error.message, "Rate limit exceeded");
                limited += 1;
            } else {
                ok += 1;
            }
        }
        assert!(limited > 0, "flood must trip the rate limit");
        assert!(ok <= burst + 2, "successes bounded by burst: {ok}");
    }

    #[tokio::test]
    async fn epoch_rotation_expires_session() {
        let harness = harness().await;
        let (session, sink) = connect(&harness);
        send(
            &harness,
            &session,
            r#"{"jsonrpc":"2.0","id":1,"method":"handshake","params":{"token":"secret-token"}}"#,
        )
        .await;
        sink.wait_for_frames(1).await;

        let new_token = harness.runtime.rotate_token().unwrap();
        assert_ne!(new_token, "secret-token");
        assert_eq!(harness.runtime.epoch(), 2);
        assert_eq!(harness.store.epoch().unwrap(), 2);

        send(&harness, &session, r#"{"jsonrpc":"2.0","id":2,"method":"getState"}"#).await;
        let frames = sink.wait_for_frames(2).await;
        let error = parse_reply(&frames[1]).error.unwrap();
        assert_eq!(error.code, codes::SESSION_EXPIRED);

        tokio::time::timeout(Duration::from_secs(1), session.cancellation().cancelled())
            .await
            .expect("expired session must close after the -32004 reply");

        // Exactly one -32004; nothing further was sent.
        let final_frames = sink.frames();
        let expired: Vec<_> = final_frames
            .iter()
            .filter(|f| f.contains("-32004"))
            .collect();
        assert_eq!(expired.len(), 1);
    }

    #[tokio::test]
    async fn rehandshake_after_rotation_recovers() {
        let harness = harness().await;
        let (session, sink) = connect(&harness);
        let new_token = harness.runtime.rotate_token().unwrap();

        send(
            &harness,
            &session,
            &format!(
                r#"{{"jsonrpc":"2.0","id":1,"method":"handshake","params":{{"token":"{new_token}"}}}}"#
            ),
        )
        .await;
        let frames = sink.wait_for_frames(1).await;
        let result = parse_reply(&frames[0]).result.unwrap();
        assert_eq!(result["epoch"], 2);

        send(&harness, &session, r#"{"jsonrpc":"2.0","id":2,"method":"getState"}"#).await;
        let frames = sink.wait_for_frames(2).await;
        assert!(parse_reply(&frames[1]).result.is_some());
    }

    #[tokio::test]
    async fn dispatch_reaches_coordinator_after_all_gates() {
        let harness = harness().await;
        let (session, sink) = connect(&harness);
        send(
            &harness,
            &session,
            r#"{"jsonrpc":"2.0","id":1,"method":"handshake","params":{"token":"secret-token"}}"#,
        )
        .await;
        send(&harness, &session, r#"{"jsonrpc":"2.0","id":2,"method":"navigate","params":{"path":"/tmp"}}"#).await;
        let frames = sink.wait_for_frames(2).await;
        let reply = parse_reply(&frames[1]);
        assert_eq!(reply.result.unwrap()["echo"], "navigate");
    }

    #[tokio::test]
    async fn payload_cap_enforced() {
        let harness = harness().await;
        let (session, sink) = connect(&harness);
        send(
            &harness,
            &session,
            r#"{"jsonrpc":"2.0","id":1,"method":"handshake","params":{"token":"secret-token"}}"#,
        )
        .await;

        let big = "p".repeat(crate::methods::GET_METADATA_MAX_PAYLOAD_BYTES);
        let request = format!(
            r#"{{"jsonrpc":"2.0","id":2,"method":"getMetadata","params":{{"paths":["{big}"]}}}}"#
        );
        send(&harness, &session, &request).await;
        let frames = sink.wait_for_frames(2).await;
        let error = parse_reply(&frames[1]).error.unwrap();
        assert_eq!(error.code, codes::INVALID_PARAMS);
        assert_eq!(error.message, "Payload too large");
    }

    #[tokio::test]
    async fn broadcast_reaches_only_authenticated_sessions() {
        let harness = harness().await;
        let (authed, authed_sink) = connect(&harness);
        let (_unauthed, unauthed_sink) = connect(&harness);
        send(
            &harness,
            &authed,
            r#"{"jsonrpc":"2.0","id":1,"method":"handshake","params":{"token":"secret-token"}}"#,
        )
        .await;
        authed_sink.wait_for_frames(1).await;

        harness
            .runtime
            .broadcast("workingDirectoryChanged", json!({"path": "/tmp"}));

        let frames = authed_sink.wait_for_frames(2).await;
        let notification = parse_reply(&frames[1]);
        assert!(notification.is_notification());
        assert_eq!(notification.method.as_deref(), Some("workingDirectoryChanged"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(unauthed_sink.frames().is_empty());
    }

    #[tokio::test]
    async fn responses_precede_notifications_on_the_wire() {
        let harness = harness().await;
        let (session, sink) = connect(&harness);
        send(
            &harness,
            &session,
            r#"{"jsonrpc":"2.0","id":1,"method":"handshake","params":{"token":"secret-token"}}"#,
        )
        .await;
        sink.wait_for_frames(1).await;

        // Enqueue a notification, then a response, while the send loop is
        // racing; the response must still come out first whenever both are
        // queued together. Stack the queue directly to make the race
        // deterministic.
        let cap = harness.runtime.config().per_session_queue_cap_bytes();
        session
            .queue()
            .enqueue_notification("{\"n\":1}".to_string(), "ping", cap);
        session.queue().enqueue_response("{\"r\":1}".to_string(), cap);
        let frames = sink.wait_for_frames(3).await;
        let tail: Vec<&str> = frames[1..].iter().map(String::as_str).collect();
        let response_pos = tail.iter().position(|f| f.contains("\"r\"")).unwrap();
        let notification_pos = tail.iter().position(|f| f.contains("\"n\"")).unwrap();
        assert!(response_pos < notification_pos);
    }

    #[tokio::test]
    async fn write_failure_cancels_session() {
        let harness = harness().await;
        let (session, sink) = connect(&harness);
        sink.fail_writes();
        send(
            &harness,
            &session,
            r#"{"jsonrpc":"2.0","id":1,"method":"handshake","params":{"token":"secret-token"}}"#,
        )
        .await;
        tokio::time::timeout(Duration::from_secs(1), session.cancellation().cancelled())
            .await
            .expect("write failure must cancel the session");
    }

    #[tokio::test]
    async fn reaper_removes_cancelled_sessions() {
        let harness = harness().await;
        let (session, _sink) = connect(&harness);
        assert_eq!(harness.runtime.session_count(), 1);
        session.close();
        harness.runtime.reap_once();
        assert_eq!(harness.runtime.session_count(), 0);
    }

    #[tokio::test]
    async fn stop_closes_sessions_and_deletes_rendezvous() {
        let harness = harness().await;
        let (session, _sink) = connect(&harness);
        harness
            .runtime
            .rendezvous()
            .update(Some(1), None, 1)
            .unwrap();
        assert!(harness.runtime.rendezvous().current_path().exists());

        harness.runtime.stop().await;
        assert!(session.is_cancelled());
        assert_eq!(harness.runtime.session_count(), 0);
        assert!(!harness.runtime.rendezvous().current_path().exists());
        assert!(!harness.runtime.is_running());
    }

    #[test]
    fn constant_time_eq_semantics() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(constant_time_eq(b"", b""));
    }
}
