use std::sync::Arc;

use time::OffsetDateTime;
use tokio::time::Instant;

/// Source of wall-clock time for phase derivation and redirects.
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> OffsetDateTime;
}

/// Shared clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// Operating-system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Wall clock anchored to the tokio timer.
///
/// Advances exactly as tokio's clock does, so a paused runtime moves wall time
/// and timers together.
#[derive(Debug, Clone, Copy)]
pub struct AnchoredClock {
    wall: OffsetDateTime,
    origin: Instant,
}

impl AnchoredClock {
    /// Anchor `wall` to the current tokio instant.
    pub fn new(wall: OffsetDateTime) -> Self {
        Self {
            wall,
            origin: Instant::now(),
        }
    }
}

impl Clock for AnchoredClock {
    fn now(&self) -> OffsetDateTime {
        self.wall + self.origin.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use time::macros::datetime;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn anchored_clock_follows_tokio_time() {
        let clock = AnchoredClock::new(datetime!(2026-03-01 12:00 UTC));
        tokio::time::sleep(Duration::from_secs(90)).await;
        assert_eq!(clock.now(), datetime!(2026-03-01 12:01:30 UTC));
    }
}
