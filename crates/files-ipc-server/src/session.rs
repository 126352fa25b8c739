//! Per-connection session state.
//!
//! A [`ClientSession`] owns everything the runtime tracks for one live
//! connection: the transport write half, the authentication flag and the
//! epoch captured at handshake, the last-activity clock the reaper reads,
//! the rate-limit bucket, the cancellation token, and the dual-priority
//! send queue.
//!
//! # Send queue discipline
//!
//! Responses and notifications ride separate FIFOs. The dequeuer always
//! drains responses first, so on the wire every response precedes any
//! notification enqueued after it. Responses are never dropped; when the
//! byte cap is hit they evict queued notifications instead, and may exceed
//! the cap as a last resort. Notifications are lossy: a saturated queue
//! first coalesces (drops the oldest notification of the same method), then
//! evicts the oldest notification of any method, and finally drops the new
//! notification outright. Producers never block.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use files_ipc_core::IpcConfig;

use crate::rate_limit::TokenBucket;
use crate::transport::{SessionSink, TransportKind};

/// Opaque session identifier, unique per connection.
///
/// Format: `S-{uuid}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Generates a fresh random id.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("S-{}", Uuid::new_v4()))
    }

    /// The id string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One queued outbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    /// Serialized JSON-RPC envelope.
    pub payload: String,
    /// Method name for notifications (coalescing key); `None` for
    /// responses.
    pub method: Option<String>,
}

/// Dual-priority send queue with byte accounting and lossy coalescing.
pub struct SendQueue {
    inner: Mutex<QueueInner>,
    queued_bytes: AtomicU64,
    notify: Notify,
}

struct QueueInner {
    responses: VecDeque<OutboundFrame>,
    notifications: VecDeque<OutboundFrame>,
    per_method: HashMap<String, usize>,
}

impl SendQueue {
    fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                responses: VecDeque::new(),
                notifications: VecDeque::new(),
                per_method: HashMap::new(),
            }),
            queued_bytes: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    /// Total UTF-8 bytes currently queued across both FIFOs.
    pub fn queued_bytes(&self) -> usize {
        usize::try_from(self.queued_bytes.load(Ordering::Relaxed)).unwrap_or(usize::MAX)
    }

    /// Queued notifications carrying `method`.
    pub fn per_method_count(&self, method: &str) -> usize {
        let inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.per_method.get(method).copied().unwrap_or(0)
    }

    /// Signal released on every enqueue; the send loop waits on it.
    pub fn notified(&self) -> &Notify {
        &self.notify
    }

    fn drop_notification_at(&self, inner: &mut QueueInner, index: usize) {
        if let Some(dropped) = inner.notifications.remove(index) {
            self.queued_bytes
                .fetch_sub(dropped.payload.len() as u64, Ordering::Relaxed);
            if let Some(method) = &dropped.method {
                if let Some(count) = inner.per_method.get_mut(method) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        inner.per_method.remove(method);
                    }
                }
            }
        }
    }

    /// Enqueues a response. Never fails; evicts queued notifications when
    /// over the cap and exceeds the cap as a last resort.
    pub fn enqueue_response(&self, payload: String, cap: usize) {
        let size = payload.len();
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        while self.queued_bytes() + size > cap && !inner.notifications.is_empty() {
            self.drop_notification_at(&mut inner, 0);
        }
        self.queued_bytes.fetch_add(size as u64, Ordering::Relaxed);
        inner.responses.push_back(OutboundFrame {
            payload,
            method: None,
        });
        drop(inner);
        self.notify.notify_one();
    }

    /// Enqueues a notification under the lossy policy.
    ///
    /// Returns `false` when the new notification was dropped instead.
    pub fn enqueue_notification(&self, payload: String, method: &str, cap: usize) -> bool {
        let size = payload.len();
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if self.queued_bytes() + size > cap {
            // Coalesce: sacrifice the oldest notification of this method,
            // keeping only the latest state per method under pressure.
            if inner.per_method.get(method).copied().unwrap_or(0) > 0 {
                if let Some(index) = inner
                    .notifications
                    .iter()
                    .position(|frame| frame.method.as_deref() == Some(method))
                {
                    self.drop_notification_at(&mut inner, index);
                }
            }
        }
        if self.queued_bytes() + size > cap && !inner.notifications.is_empty() {
            self.drop_notification_at(&mut inner, 0);
        }
        if self.queued_bytes() + size > cap {
            return false;
        }

        self.queued_bytes.fetch_add(size as u64, Ordering::Relaxed);
        *inner.per_method.entry(method.to_string()).or_insert(0) += 1;
        inner.notifications.push_back(OutboundFrame {
            payload,
            method: Some(method.to_string()),
        });
        drop(inner);
        self.notify.notify_one();
        true
    }

    /// Removes and returns the next frame: responses strictly first.
    pub fn dequeue(&self) -> Option<OutboundFrame> {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let frame = if let Some(response) = inner.responses.pop_front() {
            response
        } else {
            let notification = inner.notifications.pop_front()?;
            if let Some(method) = &notification.method {
                if let Some(count) = inner.per_method.get_mut(method) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        inner.per_method.remove(method.as_str());
                    }
                }
            }
            notification
        };
        self.queued_bytes
            .fetch_sub(frame.payload.len() as u64, Ordering::Relaxed);
        Some(frame)
    }

    /// True when both FIFOs are empty.
    pub fn is_empty(&self) -> bool {
        let inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.responses.is_empty() && inner.notifications.is_empty()
    }

    /// Drops everything queued.
    fn clear(&self) {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.responses.clear();
        inner.notifications.clear();
        inner.per_method.clear();
        self.queued_bytes.store(0, Ordering::Relaxed);
    }
}

/// State for one live connection.
pub struct ClientSession {
    id: SessionId,
    kind: TransportKind,
    sink: Arc<dyn SessionSink>,
    authenticated: AtomicBool,
    auth_epoch: AtomicU64,
    client_info: Mutex<Option<String>>,
    created: Instant,
    last_seen_ms: AtomicU64,
    consecutive_parse_errors: AtomicU32,
    close_when_drained: AtomicBool,
    cancel: CancellationToken,
    bucket: TokenBucket,
    queue: SendQueue,
}

impl ClientSession {
    /// Creates a session over `sink`, with a cancellation token derived
    /// from the runtime's root token.
    #[must_use]
    pub fn new(
        kind: TransportKind,
        sink: Arc<dyn SessionSink>,
        config: &IpcConfig,
        parent_cancel: &CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: SessionId::generate(),
            kind,
            sink,
            authenticated: AtomicBool::new(false),
            auth_epoch: AtomicU64::new(0),
            client_info: Mutex::new(None),
            created: Instant::now(),
            last_seen_ms: AtomicU64::new(0),
            consecutive_parse_errors: AtomicU32::new(0),
            close_when_drained: AtomicBool::new(false),
            cancel: parent_cancel.child_token(),
            bucket: TokenBucket::new(config.rate_limit_per_second(), config.rate_limit_burst()),
            queue: SendQueue::new(),
        })
    }

    /// Session identifier.
    #[must_use]
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Transport the session arrived through.
    #[must_use]
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// The transport write half.
    #[must_use]
    pub fn sink(&self) -> &Arc<dyn SessionSink> {
        &self.sink
    }

    /// Whether the handshake has succeeded on this session.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    /// Marks the session authenticated under `epoch`.
    ///
    /// The flag only ever transitions false→true; repeating a successful
    /// handshake refreshes the captured epoch.
    pub fn mark_authenticated(&self, epoch: u64) {
        self.auth_epoch.store(epoch, Ordering::Release);
        self.authenticated.store(true, Ordering::Release);
    }

    /// Epoch captured at the moment of successful handshake.
    #[must_use]
    pub fn auth_epoch(&self) -> u64 {
        self.auth_epoch.load(Ordering::Acquire)
    }

    /// Client-supplied info string from the handshake, if any.
    #[must_use]
    pub fn client_info(&self) -> Option<String> {
        self.client_info
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Records the client info string.
    pub fn set_client_info(&self, info: String) {
        *self
            .client_info
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(info);
    }

    /// Stamps the last-activity clock.
    pub fn touch(&self) {
        let elapsed = u64::try_from(self.created.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_seen_ms.store(elapsed, Ordering::Relaxed);
    }

    /// Time since the last inbound activity.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        let last = self.last_seen_ms.load(Ordering::Relaxed);
        let now = u64::try_from(self.created.elapsed().as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(now.saturating_sub(last))
    }

    /// Consumes one rate-limit token if available.
    #[must_use]
    pub fn try_consume(&self) -> bool {
        self.bucket.try_consume()
    }

    /// The session's send queue.
    #[must_use]
    pub fn queue(&self) -> &SendQueue {
        &self.queue
    }

    /// The session's cancellation token.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// True once the session has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Counts a parse failure; returns the consecutive total.
    pub fn record_parse_error(&self) -> u32 {
        self.consecutive_parse_errors
            .fetch_add(1, Ordering::Relaxed)
            + 1
    }

    /// Resets the parse-failure streak after a well-formed message.
    pub fn reset_parse_errors(&self) {
        self.consecutive_parse_errors.store(0, Ordering::Relaxed);
    }

    /// Asks the send loop to cancel the session once the queue drains.
    ///
    /// Used for epoch expiry, where exactly one `-32004` reply must reach
    /// the wire before the connection dies.
    pub fn close_when_drained(&self) {
        self.close_when_drained.store(true, Ordering::Release);
    }

    /// Whether a drain-then-close has been requested.
    #[must_use]
    pub fn should_close_when_drained(&self) -> bool {
        self.close_when_drained.load(Ordering::Acquire)
    }

    /// Cancels the session and clears its queues.
    ///
    /// Safe to call more than once; the transport handle is closed by the
    /// runtime's session teardown, which also calls this.
    pub fn close(&self) {
        self.cancel.cancel();
        self.queue.clear();
        self.queue.notify.notify_one();
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("authenticated", &self.is_authenticated())
            .field("auth_epoch", &self.auth_epoch())
            .field("queued_bytes", &self.queue.queued_bytes())
            .finish_non_exhaustive()
    }
}
