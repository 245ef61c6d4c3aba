// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Task scheduling options.

use std::time::Duration;

use crate::error::TaskError;

/// How a task is scheduled.
///
/// Exactly one of `periodic`, `run_once` and `run_delayed` must be set.
/// `disabled` is only valid with `periodic`.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use octofleet_lib::scheduler::TaskOptions;
///
/// let sweep = TaskOptions::periodic(Duration::from_secs(10));
/// let warmup = TaskOptions::run_delayed(Duration::from_secs(2));
/// let standby = TaskOptions::periodic(Duration::from_secs(60)).disabled();
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskOptions {
    /// Run on this interval.
    pub periodic: Option<Duration>,
    /// Run once, right away.
    pub run_once: bool,
    /// Run once after this delay.
    pub run_delayed: Option<Duration>,
    /// Register without starting; enable later.
    pub disabled: bool,
}

impl TaskOptions {
    /// Runs on an interval, first after one interval has passed.
    #[must_use]
    pub fn periodic(interval: Duration) -> Self {
        Self {
            periodic: Some(interval),
            ..Self::default()
        }
    }

    /// Runs once, right away.
    #[must_use]
    pub fn run_once() -> Self {
        Self {
            run_once: true,
            ..Self::default()
        }
    }

    /// Runs once after `delay`.
    #[must_use]
    pub fn run_delayed(delay: Duration) -> Self {
        Self {
            run_delayed: Some(delay),
            ..Self::default()
        }
    }

    /// Registers the task without starting it.
    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    pub(crate) fn validate(&self, id: &str) -> Result<Schedule, TaskError> {
        let invalid = |message: &str| TaskError::InvalidSchedule {
            id: id.to_string(),
            message: message.to_string(),
        };

        let kinds = [
            self.periodic.is_some(),
            self.run_once,
            self.run_delayed.is_some(),
        ];
        if kinds.iter().filter(|set| **set).count() != 1 {
            return Err(invalid(
                "exactly one of periodic, run_once or run_delayed must be set",
            ));
        }
        if self.disabled && self.periodic.is_none() {
            return Err(invalid("disabled is only valid for periodic tasks"));
        }

        match (self.periodic, self.run_delayed) {
            (Some(interval), _) if interval.is_zero() => Err(invalid("interval must be positive")),
            (Some(interval), _) => Ok(Schedule::Periodic(interval)),
            (_, Some(delay)) if delay.is_zero() => Err(invalid("delay must be positive")),
            (_, Some(delay)) => Ok(Schedule::Delayed(delay)),
            (None, None) => Ok(Schedule::Once),
        }
    }
}

/// A validated schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Every interval.
    Periodic(Duration),
    /// Once, right away.
    Once,
    /// Once, after a delay.
    Delayed(Duration),
}

impl Schedule {
    /// Returns true for periodic schedules.
    #[must_use]
    pub fn is_periodic(self) -> bool {
        matches!(self, Self::Periodic(_))
    }
}
