use std::time::{Duration, Instant};

/// Caller-supplied deadline threaded through store operations.
///
/// `Deadline::none()` means unbounded. Operations check expiry before
/// touching storage and before acquiring per-device locks, so a timed-out
/// call is abandoned without side effects.
#[derive(Clone, Copy, Debug, Default)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn at(instant: Instant) -> Self {
        Self(Some(instant))
    }

    pub fn after(timeout: Duration) -> Self {
        Self(Some(Instant::now() + timeout))
    }

    pub fn expired(&self) -> bool {
        self.0.is_some_and(|t| Instant::now() >= t)
    }

    pub fn instant(&self) -> Option<Instant> {
        self.0
    }
}
