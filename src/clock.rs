use std::sync::{Mutex, PoisonError};

use aide_de_camp::core::DateTime;

/// Time source of a job store. All lease and schedule comparisons use it
/// instead of the worker's own clock.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime {
        chrono::Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime>,
}

impl ManualClock {
    pub fn new(start: DateTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn starting_now() -> Self {
        Self::new(chrono::Utc::now())
    }

    pub fn set(&self, now: DateTime) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now = *now + by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
