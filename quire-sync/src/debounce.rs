//! Debounced change emitter.
//!
//! Every push restarts the quiet period and replaces the pending value; the
//! value is released once, after a full quiet period with no further pushes.
//! There is no comparison against what was last emitted, so a burst that
//! ends where it started still fires.
//!
//! Dropping or cancelling the debouncer discards the pending value.

use std::time::Duration;
use tokio::time::Instant;

/// Default quiet period between the last edit and the save.
pub const DEFAULT_QUIET_PERIOD: Duration = Duration::from_millis(1000);

#[derive(Debug)]
struct Pending<T> {
    value: T,
    deadline: Instant,
}

#[derive(Debug)]
pub struct Debouncer<T> {
    quiet: Duration,
    pending: Option<Pending<T>>,
}

impl<T> Debouncer<T> {
    pub fn new(quiet: Duration) -> Self {
        Self { quiet, pending: None }
    }

    pub fn quiet_period(&self) -> Duration {
        self.quiet
    }

    /// Record a new latest value at `now` and restart the quiet period.
    pub fn push_at(&mut self, value: T, now: Instant) {
        self.pending = Some(Pending {
            value,
            deadline: now + self.quiet,
        });
    }

    pub fn push(&mut self, value: T) {
        self.push_at(value, Instant::now());
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|p| p.deadline)
    }

    /// Release the pending value if its quiet period has elapsed by `now`.
    pub fn fire_at(&mut self, now: Instant) -> Option<T> {
        match &self.pending {
            Some(p) if p.deadline <= now => self.pending.take().map(|p| p.value),
            _ => None,
        }
    }

    /// Wait until the pending value is due.
    ///
    /// Never completes while nothing is pending. Cancel-safe: dropping the
    /// future leaves the pending value in place.
    pub async fn expired(&self) {
        match self.deadline() {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }

    /// Take the pending value regardless of its deadline (explicit save).
    pub fn take(&mut self) -> Option<T> {
        self.pending.take().map(|p| p.value)
    }

    /// Abandon the pending value.
    pub fn cancel(&mut self) -> bool {
        self.pending.take().is_some()
    }
}

impl<T> Default for Debouncer<T> {
    fn default() -> Self {
        Self::new(DEFAULT_QUIET_PERIOD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_burst_coalesces_to_last_value() {
        let t0 = Instant::now();
        let mut debouncer = Debouncer::new(ms(1000));

        let mut emitted = Vec::new();
        for (offset, value) in [(0, "a"), (100, "ab"), (200, "abc"), (300, "abcd")] {
            let now = t0 + ms(offset);
            emitted.extend(debouncer.fire_at(now).map(|v| (offset, v)));
            debouncer.push_at(value, now);
        }

        // Nothing is due until a full quiet period after the last push.
        assert_eq!(debouncer.fire_at(t0 + ms(1299)), None);
        assert_eq!(debouncer.deadline(), Some(t0 + ms(1300)));
        emitted.extend(debouncer.fire_at(t0 + ms(1300)).map(|v| (1300, v)));
        assert_eq!(debouncer.fire_at(t0 + ms(5000)), None);

        assert_eq!(emitted, vec![(1300, "abcd")]);
    }

    #[test]
    fn test_spaced_edits_fire_separately() {
        let t0 = Instant::now();
        let mut debouncer = Debouncer::new(ms(1000));

        debouncer.push_at(1, t0);
        assert_eq!(debouncer.fire_at(t0 + ms(1000)), Some(1));
        debouncer.push_at(2, t0 + ms(1500));
        assert_eq!(debouncer.fire_at(t0 + ms(2500)), Some(2));
    }

    #[test]
    fn test_cancel_discards_pending() {
        let t0 = Instant::now();
        let mut debouncer = Debouncer::new(ms(1000));

        debouncer.push_at("draft", t0);
        assert!(debouncer.cancel());
        assert!(!debouncer.is_pending());
        assert_eq!(debouncer.fire_at(t0 + ms(10_000)), None);
        assert!(!debouncer.cancel());
    }

    #[test]
    fn test_take_ignores_deadline() {
        let t0 = Instant::now();
        let mut debouncer = Debouncer::new(ms(1000));
        debouncer.push_at(String::new(), t0);
        assert_eq!(debouncer.take(), Some(String::new()));
        assert!(debouncer.take().is_none());
    }

    #[test]
    fn test_unchanged_value_still_fires() {
        let t0 = Instant::now();
        let mut debouncer = Debouncer::new(ms(1000));
        debouncer.push_at("same", t0);
        debouncer.push_at("changed", t0 + ms(10));
        debouncer.push_at("same", t0 + ms(20));
        assert_eq!(debouncer.fire_at(t0 + ms(1020)), Some("same"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_waits_for_quiet_period() {
        let mut debouncer = Debouncer::new(ms(1000));
        let start = Instant::now();

        debouncer.push("x");
        debouncer.expired().await;
        assert_eq!(start.elapsed(), ms(1000));
        assert_eq!(debouncer.fire_at(Instant::now()), Some("x"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_pends_when_idle() {
        let debouncer: Debouncer<u8> = Debouncer::default();
        assert_eq!(debouncer.quiet_period(), DEFAULT_QUIET_PERIOD);
        let waited = tokio::time::timeout(ms(60_000), debouncer.expired()).await;
        assert!(waited.is_err());
    }
}
