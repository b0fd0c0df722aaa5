//! Log length, log silence and wall clock tracking for a running job.

use std::time::{Duration, Instant};

use crate::outcome::{Condition, OutcomePolicy};

/// Watches a job's output stream against the policy limits.
///
/// Time is passed in by the caller so the monitor stays deterministic.
#[derive(Debug, Clone)]
pub struct LogMonitor {
    policy: OutcomePolicy,
    started_at: Instant,
    last_output_at: Instant,
    bytes_written: u64,
}

impl LogMonitor {
    pub fn new(policy: OutcomePolicy, started_at: Instant) -> Self {
        Self {
            policy,
            started_at,
            last_output_at: started_at,
            bytes_written: 0,
        }
    }

    /// Record a chunk of output.
    ///
    /// Returns [`Condition::LogLimitExceeded`] once the cumulative size is
    /// over the limit.
    pub fn record(&mut self, bytes: usize, now: Instant) -> Option<Condition> {
        self.bytes_written = self.bytes_written.saturating_add(bytes as u64);
        self.last_output_at = now;

        if self.bytes_written > self.policy.max_log_length {
            Some(Condition::LogLimitExceeded)
        } else {
            None
        }
    }

    /// Check the time based limits. The wall clock limit wins when both apply.
    pub fn check(&self, now: Instant) -> Option<Condition> {
        if now.saturating_duration_since(self.started_at) >= self.policy.hard_timeout {
            return Some(Condition::WallClockExceeded);
        }
        if now.saturating_duration_since(self.last_output_at) >= self.policy.log_timeout {
            return Some(Condition::LogSilence);
        }
        None
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Time until the next time based limit could trip.
    ///
    /// A limit too far out to be represented as an instant never trips and
    /// yields `Duration::MAX`.
    pub fn next_deadline(&self, now: Instant) -> Duration {
        let until = |from: Instant, limit: Duration| {
            from.checked_add(limit)
                .map_or(Duration::MAX, |at| at.saturating_duration_since(now))
        };
        let hard = until(self.started_at, self.policy.hard_timeout);
        let silence = until(self.last_output_at, self.policy.log_timeout);
        hard.min(silence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> OutcomePolicy {
        OutcomePolicy {
            hard_timeout: Duration::from_secs(600),
            log_timeout: Duration::from_secs(60),
            max_log_length: 100,
        }
    }

    #[test]
    fn log_limit_trips_after_cumulative_size() {
        let start = Instant::now();
        let mut monitor = LogMonitor::new(policy(), start);

        assert_eq!(monitor.record(60, start), None);
        assert_eq!(monitor.record(40, start), None);
        assert_eq!(monitor.record(1, start), Some(Condition::LogLimitExceeded));
        assert_eq!(monitor.bytes_written(), 101);
    }

    #[test]
    fn silence_resets_on_output() {
        let start = Instant::now();
        let mut monitor = LogMonitor::new(policy(), start);

        assert_eq!(monitor.check(start + Duration::from_secs(59)), None);
        monitor.record(1, start + Duration::from_secs(59));
        assert_eq!(monitor.check(start + Duration::from_secs(100)), None);
        assert_eq!(
            monitor.check(start + Duration::from_secs(119)),
            Some(Condition::LogSilence)
        );
    }

    #[test]
    fn wall_clock_wins_over_silence() {
        let start = Instant::now();
        let monitor = LogMonitor::new(policy(), start);

        assert_eq!(
            monitor.check(start + Duration::from_secs(600)),
            Some(Condition::WallClockExceeded)
        );
        assert_eq!(
            monitor.next_deadline(start + Duration::from_secs(10)),
            Duration::from_secs(50)
        );
    }

    #[test]
    fn unbounded_limits_never_trip() {
        let start = Instant::now();
        let monitor = LogMonitor::new(
            OutcomePolicy {
                hard_timeout: Duration::MAX,
                log_timeout: Duration::MAX,
                max_log_length: u64::MAX,
            },
            start,
        );

        assert_eq!(monitor.next_deadline(start), Duration::MAX);
        assert_eq!(monitor.check(start + Duration::from_secs(86_400)), None);
    }
}
