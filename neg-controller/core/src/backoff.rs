use std::time::Duration;

/// An exponential retry schedule with a cap.
///
/// The k-th consecutive failure is retried after `min(cap, base * 2^(k-1))`.
/// Once `max_retries` delays have been handed out without a `reset`, further
/// requests fail with [`RetriesExceeded`] and the caller is expected to park
/// until its inputs change.
#[derive(Clone, Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    max_retries: u32,
    attempts: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("maximum number of retries exceeded")]
pub struct RetriesExceeded(());

// === impl Backoff ===

impl Backoff {
    pub fn new(base: Duration, cap: Duration, max_retries: u32) -> Self {
        Self {
            base,
            cap,
            max_retries,
            attempts: 0,
        }
    }

    /// Returns the delay to wait before the next retry, or
    /// [`RetriesExceeded`] once the budget is spent.
    pub fn next_delay(&mut self) -> Result<Duration, RetriesExceeded> {
        if self.attempts >= self.max_retries {
            return Err(RetriesExceeded(()));
        }
        let delay = self
            .base
            .checked_mul(1u32.checked_shl(self.attempts).unwrap_or(u32::MAX))
            .map_or(self.cap, |d| d.min(self.cap));
        self.attempts += 1;
        Ok(delay)
    }

    /// Resets the schedule after a success (or a fresh input).
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}
