//! Rate limiting utilities

use governor::{
    clock::DefaultClock,
    state::keyed::DefaultKeyedStateStore,
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;

use crate::game::CharacterId;

/// Keyed rate limiter type alias
pub type KeyedLimiter =
    RateLimiter<CharacterId, DefaultKeyedStateStore<CharacterId>, DefaultClock>;

/// Create a per-character rate limiter with the specified requests per second
pub fn create_keyed_limiter(requests_per_second: u32) -> Arc<KeyedLimiter> {
    let quota =
        Quota::per_second(NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN));
    Arc::new(RateLimiter::keyed(quota))
}

/// Queue join attempts per second, per character
pub const QUEUE_JOIN_RATE_LIMIT: u32 = 5;

/// Per-character limiter for queue join attempts
#[derive(Clone)]
pub struct QueueRateLimiter {
    join_limiter: Arc<KeyedLimiter>,
}

impl QueueRateLimiter {
    pub fn new() -> Self {
        Self {
            join_limiter: create_keyed_limiter(QUEUE_JOIN_RATE_LIMIT),
        }
    }

    /// Check if a join attempt is allowed (returns true if allowed)
    pub fn check_join(&self, character_id: CharacterId) -> bool {
        self.join_limiter.check_key(&character_id).is_ok()
    }
}

impl Default for QueueRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
