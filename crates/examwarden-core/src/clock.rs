//! Wall-clock abstraction for the timer and the mock backend.

use chrono::{DateTime, TimeDelta, Utc};
use tokio::time::Instant;

/// Source of "now" for countdown derivation.
#[derive(Debug, Clone, Copy, Default)]
pub enum Clock {
    /// Real system time.
    #[default]
    System,
    /// Wall time that moves with tokio's clock, starting at `origin`.
    ///
    /// Under `tokio::time::pause` this clock only moves when tokio time is
    /// advanced, which keeps timer tests deterministic.
    Tokio {
        origin: DateTime<Utc>,
        started: Instant,
    },
}

impl Clock {
    #[must_use]
    pub fn system() -> Self {
        Self::System
    }

    /// A clock that reads `origin` now and follows tokio time from here on.
    #[must_use]
    pub fn tokio_at(origin: DateTime<Utc>) -> Self {
        Self::Tokio {
            origin,
            started: Instant::now(),
        }
    }

    /// Returns the current time according to the clock.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        match self {
            Clock::System => Utc::now(),
            Clock::Tokio { origin, started } => {
                *origin + TimeDelta::from_std(started.elapsed()).unwrap_or_else(|_| TimeDelta::zero())
            }
        }
    }
}

/// Deterministic timestamp for tests and examples (2023-11-14T22:13:20Z).
pub const FIXED_TEST_TIMESTAMP: i64 = 1_700_000_000;

/// Returns a deterministic `DateTime<Utc>` for tests and doc examples.
///
/// # Panics
///
/// Panics if the fixed timestamp cannot be represented.
#[must_use]
pub fn fixed_now() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(FIXED_TEST_TIMESTAMP, 0)
        .expect("fixed timestamp should be valid")
}
