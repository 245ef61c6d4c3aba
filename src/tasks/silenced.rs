// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Rate-limited logging of repeated failures.

use crate::manager::SilencePolicy;

/// Counts consecutive failures and decides which ones deserve a warning.
///
/// # Examples
///
/// ```
/// use octofleet_lib::manager::SilencePolicy;
/// use octofleet_lib::tasks::SilencedLogger;
///
/// let mut logger = SilencedLogger::new(SilencePolicy::new(2, 5));
///
/// assert!(!logger.record_failure()); // 1
/// assert!(!logger.record_failure()); // 2
/// assert!(logger.record_failure()); // 3, first warning
/// assert!(!logger.record_failure()); // 4
///
/// assert!(logger.record_success());
/// assert_eq!(logger.consecutive_failures(), 0);
/// ```
#[derive(Debug, Clone)]
pub struct SilencedLogger {
    policy: SilencePolicy,
    consecutive: u64,
}

impl SilencedLogger {
    /// Creates a logger with no recorded failures.
    #[must_use]
    pub fn new(policy: SilencePolicy) -> Self {
        Self {
            policy,
            consecutive: 0,
        }
    }

    /// Records a failure. Returns true if it should be logged as a warning.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive += 1;
        let threshold = u64::from(self.policy.threshold);
        let every = u64::from(self.policy.log_every.max(1));

        if self.consecutive <= threshold {
            return false;
        }
        (self.consecutive - threshold - 1) % every == 0
    }

    /// Records a success. Returns true if it ended a failure streak.
    pub fn record_success(&mut self) -> bool {
        std::mem::take(&mut self.consecutive) > 0
    }

    /// Returns the length of the current failure streak.
    #[must_use]
    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logged(policy: SilencePolicy, attempts: u64) -> Vec<u64> {
        let mut logger = SilencedLogger::new(policy);
        (1..=attempts)
            .filter(|_| logger.record_failure())
            .collect()
    }

    #[test]
    fn default_policy_logs_fourth_then_every_tenth() {
        assert_eq!(logged(SilencePolicy::default(), 30), vec![4, 14, 24]);
    }

    #[test]
    fn zero_threshold_logs_first_failure() {
        assert_eq!(logged(SilencePolicy::new(0, 3), 7), vec![1, 4, 7]);
    }

    #[test]
    fn success_restarts_the_quiet_period() {
        let mut logger = SilencedLogger::new(SilencePolicy::new(1, 10));
        assert!(!logger.record_failure());
        assert!(logger.record_failure());

        assert!(logger.record_success());
        assert!(!logger.record_success());

        assert!(!logger.record_failure());
        assert!(logger.record_failure());
    }
}
