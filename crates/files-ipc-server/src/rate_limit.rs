//! Per-session token-bucket rate limiter.
//!
//! One bucket per connection. `try_consume` refills from elapsed time and
//! then takes a single token; refill and consume run under one lock so a
//! concurrent broadcast and request cannot double-spend.
//!
//! The refill is `floor(elapsed × per_second)` whole tokens, and
//! `last_refill` only advances when that floor is non-zero — otherwise a
//! caller polling faster than one token's worth of time would reset the
//! clock forever and starve the bucket.

use std::sync::Mutex;
use std::time::Instant;

/// Token bucket with capacity `burst`, refilled at `per_second` tokens/s.
#[derive(Debug)]
pub struct TokenBucket {
    per_second: u32,
    burst: u32,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: u32,
    last_refill: Instant,
}

impl TokenBucket {
    /// Creates a bucket starting at full burst capacity.
    #[must_use]
    pub fn new(per_second: u32, burst: u32) -> Self {
        Self {
            per_second,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Adds `floor(elapsed × per_second)` tokens, capped at `burst`.
    fn refill(&self, state: &mut BucketState) {
        let elapsed_ms = state.last_refill.elapsed().as_millis();
        let earned = (elapsed_ms * u128::from(self.per_second)) / 1000;
        if earned == 0 {
            return;
        }
        let earned = u32::try_from(earned).unwrap_or(u32::MAX);
        state.tokens = state.tokens.saturating_add(earned).min(self.burst);
        state.last_refill = Instant::now();
    }

    /// Refills, then consumes one token if available.
    ///
    /// Returns `false` when the bucket is empty; the caller answers with a
    /// rate-limit error (requests) or drops silently (notifications and
    /// broadcasts).
    #[must_use]
    pub fn try_consume(&self) -> bool {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        self.refill(&mut state);
        if state.tokens == 0 {
            return false;
        }
        state.tokens -= 1;
        true
    }

    /// Current token count after a refill; for monitoring and tests.
    #[must_use]
    pub fn available(&self) -> u32 {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        self.refill(&mut state);
        state.tokens
    }

    /// Bucket capacity.
    #[must_use]
    pub const fn burst(&self) -> u32 {
        self.burst
    }
}
