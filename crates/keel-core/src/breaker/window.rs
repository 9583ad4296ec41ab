//! Sliding window of recent call outcomes for failure-rate tripping.

use std::collections::VecDeque;

use crate::config::FailureRateRule;

#[derive(Debug, Clone)]
pub(crate) struct OutcomeWindow {
    rule: FailureRateRule,
    /// `true` = failure.
    outcomes: VecDeque<bool>,
    failures: usize,
}

impl OutcomeWindow {
    pub(crate) fn new(rule: FailureRateRule) -> Self {
        Self {
            outcomes: VecDeque::with_capacity(rule.window),
            failures: 0,
            rule,
        }
    }

    pub(crate) fn record(&mut self, failed: bool) {
        if self.outcomes.len() == self.rule.window
            && let Some(evicted) = self.outcomes.pop_front()
            && evicted
        {
            self.failures -= 1;
        }
        self.outcomes.push_back(failed);
        if failed {
            self.failures += 1;
        }
    }

    pub(crate) fn failure_rate(&self) -> Option<f64> {
        if self.outcomes.is_empty() {
            return None;
        }
        Some(self.failures as f64 / self.outcomes.len() as f64)
    }

    /// Enough calls seen and the failure ratio reached the rule's rate.
    pub(crate) fn tripped(&self) -> bool {
        self.outcomes.len() >= self.rule.minimum_calls as usize
            && self
                .failure_rate()
                .is_some_and(|rate| rate >= self.rule.rate)
    }

    pub(crate) fn clear(&mut self) {
        self.outcomes.clear();
        self.failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(rate: f64, minimum_calls: u32, size: usize) -> OutcomeWindow {
        OutcomeWindow::new(FailureRateRule {
            rate,
            minimum_calls,
            window: size,
        })
    }

    #[test]
    fn does_not_trip_below_minimum_calls() {
        let mut w = window(0.5, 4, 10);
        w.record(true);
        w.record(true);
        w.record(true);

        assert_eq!(w.failure_rate(), Some(1.0));
        assert!(!w.tripped());

        w.record(false);
        assert!(w.tripped());
    }

    #[test]
    fn old_outcomes_fall_out_of_window() {
        let mut w = window(0.5, 2, 3);
        w.record(true);
        w.record(true);
        w.record(false);
        w.record(false);
        w.record(false);

        assert_eq!(w.failure_rate(), Some(0.0));
        assert!(!w.tripped());
    }

    #[test]
    fn clear_forgets_everything() {
        let mut w = window(0.5, 1, 3);
        w.record(true);
        w.clear();

        assert_eq!(w.failure_rate(), None);
        assert!(!w.tripped());
    }
}
