//! # Failure Policies
//!
//! Decide whether a transport failure takes a node out of service. Each node
//! owns one policy instance created by the configured factory; the node calls
//! `should_fail` after every failed exchange and `reset` once the node is
//! resurrected.

use std::fmt::Debug;
use std::time::{Duration, Instant};

pub trait FailurePolicy: Send + Debug {
    /// Records one failure. Returns true when the node must be marked dead.
    fn should_fail(&mut self) -> bool;

    /// Forgets accumulated failures.
    fn reset(&mut self) {}
}

pub trait FailurePolicyFactory: Send + Sync + Debug {
    fn create(&self, endpoint: &str) -> Box<dyn FailurePolicy>;
}

/// Every failure is fatal.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailImmediately;

impl FailurePolicy for FailImmediately {
    fn should_fail(&mut self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ImmediateFailureFactory;

impl FailurePolicyFactory for ImmediateFailureFactory {
    fn create(&self, _endpoint: &str) -> Box<dyn FailurePolicy> {
        Box::new(FailImmediately)
    }
}

/// Fails after `threshold` failures, each at most `window` after the previous.
///
/// A gap longer than `window` starts the count over.
#[derive(Debug, Clone)]
pub struct ThrottlingPolicy {
    threshold: usize,
    window: Duration,
    failures: usize,
    last_failure: Option<Instant>,
}

impl ThrottlingPolicy {
    pub fn new(threshold: usize, window: Duration) -> Self {
        ThrottlingPolicy {
            threshold: threshold.max(1),
            window,
            failures: 0,
            last_failure: None,
        }
    }

    fn record_at(&mut self, now: Instant) -> bool {
        match self.last_failure {
            Some(last) if now.saturating_duration_since(last) <= self.window => {
                self.failures += 1;
            }
            _ => self.failures = 1,
        }
        self.last_failure = Some(now);

        if self.failures >= self.threshold {
            self.failures = 0;
            self.last_failure = None;
            true
        } else {
            false
        }
    }
}

impl FailurePolicy for ThrottlingPolicy {
    fn should_fail(&mut self) -> bool {
        self.record_at(Instant::now())
    }

    fn reset(&mut self) {
        self.failures = 0;
        self.last_failure = None;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ThrottlingFailureFactory {
    threshold: usize,
    window: Duration,
}

impl ThrottlingFailureFactory {
    pub fn new(threshold: usize, window: Duration) -> Self {
        ThrottlingFailureFactory { threshold, window }
    }
}

impl FailurePolicyFactory for ThrottlingFailureFactory {
    fn create(&self, _endpoint: &str) -> Box<dyn FailurePolicy> {
        Box::new(ThrottlingPolicy::new(self.threshold, self.window))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediate_always_fails() {
        let mut policy = ImmediateFailureFactory.create("a:1");
        assert!(policy.should_fail());
        assert!(policy.should_fail());
    }

    #[test]
    fn throttling_needs_threshold_within_window() {
        let window = Duration::from_millis(100);
        let mut policy = ThrottlingPolicy::new(3, window);
        let start = Instant::now();

        assert!(!policy.record_at(start));
        assert!(!policy.record_at(start + Duration::from_millis(50)));
        assert!(policy.record_at(start + Duration::from_millis(90)));

        // Counter restarted after firing.
        assert!(!policy.record_at(start + Duration::from_millis(95)));
    }

    #[test]
    fn throttling_restarts_after_a_long_gap() {
        let mut policy = ThrottlingPolicy::new(2, Duration::from_millis(100));
        let start = Instant::now();

        assert!(!policy.record_at(start));
        assert!(!policy.record_at(start + Duration::from_millis(500)));
        assert!(policy.record_at(start + Duration::from_millis(550)));
    }

    #[test]
    fn throttling_reset_clears_count() {
        let mut policy = ThrottlingPolicy::new(2, Duration::from_secs(10));
        assert!(!policy.should_fail());
        policy.reset();
        assert!(!policy.should_fail());
        assert!(policy.should_fail());
    }

    #[test]
    fn threshold_of_zero_behaves_like_one() {
        let mut policy = ThrottlingPolicy::new(0, Duration::from_secs(1));
        assert!(policy.should_fail());
    }
}
