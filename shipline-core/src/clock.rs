use chrono::{DateTime, Duration, Utc};
use tokio::time::Instant;

/// Wall-clock anchored to the tokio timer, so timestamps advance with the runtime's
/// notion of time (including a paused test clock).
#[derive(Debug, Clone, Copy)]
pub struct RunClock {
    wall: DateTime<Utc>,
    origin: Instant,
}

impl RunClock {
    pub fn start() -> Self {
        Self::anchored_at(Utc::now())
    }

    pub fn anchored_at(wall: DateTime<Utc>) -> Self {
        Self {
            wall,
            origin: Instant::now(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        let elapsed =
            Duration::from_std(self.origin.elapsed()).unwrap_or_else(|_| Duration::zero());
        self.wall + elapsed
    }
}
