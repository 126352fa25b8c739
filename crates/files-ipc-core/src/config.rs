//! Runtime caps for the IPC server.
//!
//! All limits the runtime consults on hot paths live here as atomics so any
//! thread can read them without locking. Writes are only expected between
//! sessions (tests, or a settings reload while no transport is running);
//! nothing re-checks a cap mid-connection, so changing one under live
//! traffic only affects messages that have not been framed yet.

use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicUsize, Ordering};

/// Default upper bound on a reassembled WebSocket text message (16 MiB).
pub const DEFAULT_WS_MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

/// Default upper bound on a framed pipe message (10 MiB).
pub const DEFAULT_PIPE_MAX_MESSAGE_BYTES: usize = 10 * 1024 * 1024;

/// Default soft cap on queued payload bytes per session (2 MiB).
pub const DEFAULT_PER_SESSION_QUEUE_CAP_BYTES: usize = 2 * 1024 * 1024;

/// Default steady token refill rate for the per-session bucket.
pub const DEFAULT_RATE_LIMIT_PER_SECOND: u32 = 20;

/// Default bucket capacity for the per-session rate limiter.
pub const DEFAULT_RATE_LIMIT_BURST: u32 = 60;

/// Default truncation limit for `selectionChanged` broadcasts.
pub const DEFAULT_SELECTION_NOTIFICATION_CAP: usize = 200;

/// Default cap on paths accepted by a single `getMetadata` call.
pub const DEFAULT_GET_METADATA_MAX_ITEMS: usize = 500;

/// Default wall-clock deadline for a single `getMetadata` call, in seconds.
pub const DEFAULT_GET_METADATA_TIMEOUT_SECS: u64 = 30;

/// Default idle poll interval for a session send loop, in milliseconds.
pub const DEFAULT_SEND_LOOP_IDLE_MS: u64 = 10;

/// Default preferred TCP port for the loopback WebSocket listener.
pub const DEFAULT_WS_PREFERRED_PORT: u16 = 52345;

/// Port range scanned when the preferred WebSocket port is taken.
pub const WS_FALLBACK_PORT_RANGE: std::ops::Range<u16> = 40000..40100;

/// Central mutable caps for the IPC server.
///
/// One instance is shared (via `Arc`) between the runtime, both transports,
/// and the coordinator. Every getter is a relaxed atomic load; the struct is
/// cheap enough to consult per message.
#[derive(Debug)]
pub struct IpcConfig {
    ws_max_message_bytes: AtomicUsize,
    pipe_max_message_bytes: AtomicUsize,
    per_session_queue_cap_bytes: AtomicUsize,
    rate_limit_per_second: AtomicU32,
    rate_limit_burst: AtomicU32,
    selection_notification_cap: AtomicUsize,
    get_metadata_max_items: AtomicUsize,
    get_metadata_timeout_secs: AtomicU64,
    send_loop_idle_ms: AtomicU64,
    ws_preferred_port: AtomicU16,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            ws_max_message_bytes: AtomicUsize::new(DEFAULT_WS_MAX_MESSAGE_BYTES),
            pipe_max_message_bytes: AtomicUsize::new(DEFAULT_PIPE_MAX_MESSAGE_BYTES),
            per_session_queue_cap_bytes: AtomicUsize::new(DEFAULT_PER_SESSION_QUEUE_CAP_BYTES),
            rate_limit_per_second: AtomicU32::new(DEFAULT_RATE_LIMIT_PER_SECOND),
            rate_limit_burst: AtomicU32::new(DEFAULT_RATE_LIMIT_BURST),
            selection_notification_cap: AtomicUsize::new(DEFAULT_SELECTION_NOTIFICATION_CAP),
            get_metadata_max_items: AtomicUsize::new(DEFAULT_GET_METADATA_MAX_ITEMS),
            get_metadata_timeout_secs: AtomicU64::new(DEFAULT_GET_METADATA_TIMEOUT_SECS),
            send_loop_idle_ms: AtomicU64::new(DEFAULT_SEND_LOOP_IDLE_MS),
            ws_preferred_port: AtomicU16::new(DEFAULT_WS_PREFERRED_PORT),
        }
    }
}

impl IpcConfig {
    /// Creates a config with the production defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a config with small limits suitable for unit tests.
    ///
    /// Queue cap and rate limits are shrunk so saturation paths can be
    /// exercised without generating megabytes of traffic.
    #[must_use]
    pub fn for_testing() -> Self {
        let config = Self::default();
        config.set_per_session_queue_cap_bytes(4 * 1024);
        config.set_rate_limit_per_second(5);
        config.set_rate_limit_burst(10);
        config.set_get_metadata_timeout_secs(2);
        config
    }

    #[must_use]
    pub fn ws_max_message_bytes(&self) -> usize {
        self.ws_max_message_bytes.load(Ordering::Relaxed)
    }

    pub fn set_ws_max_message_bytes(&self, value: usize) {
        self.ws_max_message_bytes.store(value, Ordering::Relaxed);
    }

    #[must_use]
    pub fn pipe_max_message_bytes(&self) -> usize {
        self.pipe_max_message_bytes.load(Ordering::Relaxed)
    }

    pub fn set_pipe_max_message_bytes(&self, value: usize) {
        self.pipe_max_message_bytes.store(value, Ordering::Relaxed);
    }

    #[must_use]
    pub fn per_session_queue_cap_bytes(&self) -> usize {
        self.per_session_queue_cap_bytes.load(Ordering::Relaxed)
    }

    pub fn set_per_session_queue_cap_bytes(&self, value: usize) {
        self.per_session_queue_cap_bytes
            .store(value, Ordering::Relaxed);
    }

    #[must_use]
    pub fn rate_limit_per_second(&self) -> u32 {
        self.rate_limit_per_second.load(Ordering::Relaxed)
    }

    pub fn set_rate_limit_per_second(&self, value: u32) {
        self.rate_limit_per_second.store(value, Ordering::Relaxed);
    }

    #[must_use]
    pub fn rate_limit_burst(&self) -> u32 {
        self.rate_limit_burst.load(Ordering::Relaxed)
    }

    pub fn set_rate_limit_burst(&self, value: u32) {
        self.rate_limit_burst.store(value, Ordering::Relaxed);
    }

    #[must_use]
    pub fn selection_notification_cap(&self) -> usize {
        self.selection_notification_cap.load(Ordering::Relaxed)
    }

    pub fn set_selection_notification_cap(&self, value: usize) {
        self.selection_notification_cap
            .store(value, Ordering::Relaxed);
    }

    #[must_use]
    pub fn get_metadata_max_items(&self) -> usize {
        self.get_metadata_max_items.load(Ordering::Relaxed)
    }

    pub fn set_get_metadata_max_items(&self, value: usize) {
        self.get_metadata_max_items.store(value, Ordering::Relaxed);
    }

    #[must_use]
    pub fn get_metadata_timeout_secs(&self) -> u64 {
        self.get_metadata_timeout_secs.load(Ordering::Relaxed)
    }

    pub fn set_get_metadata_timeout_secs(&self, value: u64) {
        self.get_metadata_timeout_secs
            .store(value, Ordering::Relaxed);
    }

    #[must_use]
    pub fn send_loop_idle_ms(&self) -> u64 {
        self.send_loop_idle_ms.load(Ordering::Relaxed)
    }

    pub fn set_send_loop_idle_ms(&self, value: u64) {
        self.send_loop_idle_ms.store(value, Ordering::Relaxed);
    }

    #[must_use]
    pub fn ws_preferred_port(&self) -> u16 {
        self.ws_preferred_port.load(Ordering::Relaxed)
    }

    pub fn set_ws_preferred_port(&self, value: u16) {
        self.ws_preferred_port.store(value, Ordering::Relaxed);
    }
}
