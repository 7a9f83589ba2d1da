use std::fmt;

use chrono::Utc;

use crate::Timestamp;

/// Source of the timestamp captured at the start of every attempt.
pub trait Clock: fmt::Debug + Send + Sync + 'static {
    fn now(&self) -> Timestamp;
}

/// The local system clock.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now()
    }
}
