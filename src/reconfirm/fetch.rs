//! Rate limiting for reconfirm log fetches

use std::time::{Duration, Instant};

/// Decides when another fetch to the candidate-tail holder may go out.
///
/// At most one fetch per interval, unless the log buffer start marker moved
/// since the last look: entries are sliding out, so the timer restarts and
/// a new attempt is allowed right away.
#[derive(Debug, Clone, Default)]
pub struct FetchThrottle {
    last_fetch_at: Option<Instant>,
    last_start_marker: Option<u64>,
    last_sent: Option<bool>,
    attempts: u64,
}

impl FetchThrottle {
    pub fn should_fetch(&mut self, start_marker: u64, now: Instant, interval: Duration) -> bool {
        match (self.last_fetch_at, self.last_start_marker) {
            (Some(last), Some(marker)) if marker == start_marker => {
                now.saturating_duration_since(last) >= interval
            }
            (Some(_), Some(_)) => {
                self.last_start_marker = Some(start_marker);
                self.last_fetch_at = None;
                true
            }
            _ => true,
        }
    }

    /// Record the outcome of a fetch request. Only a sent request restarts
    /// the timer; an unsent one may be retried on the next poll.
    pub fn record(&mut self, sent: bool, start_marker: u64, now: Instant) {
        self.attempts += 1;
        self.last_sent = Some(sent);
        if sent {
            self.last_fetch_at = Some(now);
            self.last_start_marker = Some(start_marker);
        }
    }

    pub fn last_sent(&self) -> Option<bool> {
        self.last_sent
    }

    pub fn attempts(&self) -> u64 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_secs(2);

    #[test]
    fn test_first_fetch_allowed() {
        let mut throttle = FetchThrottle::default();
        assert!(throttle.should_fetch(7, Instant::now(), INTERVAL));
    }

    #[test]
    fn test_one_fetch_per_interval() {
        let start = Instant::now();
        let mut throttle = FetchThrottle::default();
        assert!(throttle.should_fetch(7, start, INTERVAL));
        throttle.record(true, 7, start);

        assert!(!throttle.should_fetch(7, start + Duration::from_millis(500), INTERVAL));
        assert!(throttle.should_fetch(7, start + INTERVAL, INTERVAL));
    }

    #[test]
    fn test_marker_progress_resets_timer() {
        let start = Instant::now();
        let mut throttle = FetchThrottle::default();
        throttle.record(true, 7, start);

        assert!(throttle.should_fetch(9, start + Duration::from_millis(10), INTERVAL));
        throttle.record(true, 9, start + Duration::from_millis(10));
        assert!(!throttle.should_fetch(9, start + Duration::from_millis(20), INTERVAL));
    }

    #[test]
    fn test_unsent_fetch_retried_next_poll() {
        let start = Instant::now();
        let mut throttle = FetchThrottle::default();
        throttle.record(false, 7, start);
        assert_eq!(throttle.last_sent(), Some(false));
        assert!(throttle.should_fetch(7, start + Duration::from_millis(1), INTERVAL));
        assert_eq!(throttle.attempts(), 1);
    }
}
