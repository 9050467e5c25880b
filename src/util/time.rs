//! Server time - the monotonic microsecond clock shared by the whole process

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Get current Unix timestamp in milliseconds (wall clock, for display/records)
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// Process epoch for the monotonic server clock. Uses the runtime clock so
/// deferred callbacks and `server_now` observe the same time source.
static PROCESS_EPOCH: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

/// Initialize the server clock (call once at startup)
pub fn init_server_time() {
    PROCESS_EPOCH.get_or_init(Instant::now);
}

/// Current monotonic server time
pub fn server_now() -> ServerTime {
    let epoch = PROCESS_EPOCH.get_or_init(Instant::now);
    ServerTime(epoch.elapsed().as_micros() as u64)
}

/// Get server uptime in seconds
pub fn uptime_secs() -> u64 {
    server_now().as_micros() / 1_000_000
}

/// Monotonic server timestamp: microseconds since the process epoch.
///
/// All match deadlines, capture tokens and tick schedules are expressed in
/// this clock, never in wall time.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ServerTime(pub u64);

impl ServerTime {
    pub const ZERO: ServerTime = ServerTime(0);

    pub fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    pub fn as_micros(self) -> u64 {
        self.0
    }

    /// This time plus a floating-point number of seconds (non-positive clamps to self)
    pub fn add_secs(self, secs: f64) -> Self {
        if secs <= 0.0 {
            return self;
        }
        Self(self.0.saturating_add((secs * 1_000_000.0) as u64))
    }

    /// Duration from `earlier` to self, zero if self is not later
    pub fn since(self, earlier: ServerTime) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0))
    }

    /// Seconds from self until `later`, zero if already past
    pub fn secs_until(self, later: ServerTime) -> f64 {
        later.since(self).as_secs_f64()
    }
}

impl std::fmt::Display for ServerTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}us", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_secs_and_since_round_trip() {
        let t = ServerTime::from_micros(1_000_000);
        let later = t.add_secs(2.5);
        assert_eq!(later.as_micros(), 3_500_000);
        assert_eq!(later.since(t), Duration::from_micros(2_500_000));
        assert_eq!(t.since(later), Duration::ZERO);
        assert_eq!(t.secs_until(later), 2.5);
    }

    #[test]
    fn server_clock_is_monotonic() {
        init_server_time();
        let a = server_now();
        let b = server_now();
        assert!(b >= a);
    }
}
