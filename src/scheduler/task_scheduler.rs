// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Task registry and execution.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::TaskError;

use super::options::{Schedule, TaskOptions};
use super::runnable::{Runnable, RunnableRegistry, Workload};

/// Execution statistics of one task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskStats {
    /// Finished runs, successful or not.
    pub run_count: u64,
    /// Runs that returned an error or panicked.
    pub failure_count: u64,
    /// Duration of the last run.
    pub last_duration: Option<Duration>,
    /// When the task first completed successfully.
    pub first_completed: Option<DateTime<Utc>>,
}

struct TaskEntry {
    schedule: Schedule,
    runnable: Arc<dyn Runnable>,
    stats: Arc<Mutex<TaskStats>>,
    handle: Option<JoinHandle<()>>,
}

impl TaskEntry {
    fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn start(&mut self, id: &str) {
        let id = id.to_string();
        let runnable = Arc::clone(&self.runnable);
        let stats = Arc::clone(&self.stats);
        let schedule = self.schedule;

        self.handle = Some(tokio::spawn(async move {
            match schedule {
                Schedule::Periodic(period) => {
                    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        ticker.tick().await;
                        execute(&id, &runnable, &stats).await;
                    }
                }
                Schedule::Once => execute(&id, &runnable, &stats).await,
                Schedule::Delayed(delay) => {
                    tokio::time::sleep(delay).await;
                    execute(&id, &runnable, &stats).await;
                }
            }
        }));
    }

    fn stop(&mut self) -> bool {
        match self.handle.take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

/// Runs one workload, isolating its failures from the scheduler.
///
/// The workload runs in its own task so that a panic is reported through
/// the join handle instead of tearing down the schedule loop.
async fn execute(id: &str, runnable: &Arc<dyn Runnable>, stats: &Mutex<TaskStats>) {
    let started = Instant::now();
    let runnable = Arc::clone(runnable);
    let outcome = tokio::spawn(async move { runnable.run().await }).await;
    let elapsed = started.elapsed();

    let mut stats = stats.lock();
    stats.run_count += 1;
    stats.last_duration = Some(elapsed);

    match outcome {
        Ok(Ok(())) => {
            if stats.first_completed.is_none() {
                stats.first_completed = Some(Utc::now());
                tracing::info!(task_id = id, elapsed_ms = elapsed_ms(elapsed), "Task completed for the first time");
            } else {
                tracing::trace!(task_id = id, elapsed_ms = elapsed_ms(elapsed), "Task completed");
            }
        }
        Ok(Err(e)) => {
            stats.failure_count += 1;
            tracing::error!(task_id = id, error = %e, "Task failed");
        }
        Err(join_err) if join_err.is_panic() => {
            stats.failure_count += 1;
            tracing::error!(task_id = id, "Task panicked");
        }
        Err(_) => {
            tracing::debug!(task_id = id, "Task run cancelled");
        }
    }
}

fn elapsed_ms(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

/// Registry and runner of periodic, run-once and delayed tasks.
///
/// Every task runs in its own Tokio task, so a failing or slow workload
/// never holds up another task's schedule. A periodic run that overruns
/// its interval delays that task's next tick only.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use octofleet_lib::scheduler::{TaskOptions, TaskScheduler, Workload};
///
/// # #[tokio::main]
/// # async fn main() -> octofleet_lib::Result<()> {
/// let scheduler = TaskScheduler::new();
///
/// scheduler.register(
///     "cleanup",
///     Workload::callable(|| async { Ok(()) }),
///     TaskOptions::periodic(Duration::from_secs(60)).disabled(),
/// )?;
///
/// scheduler.enable("cleanup")?;
/// assert_eq!(scheduler.is_enabled("cleanup"), Some(true));
/// scheduler.shutdown();
/// # Ok(())
/// # }
/// ```
pub struct TaskScheduler {
    registry: RwLock<RunnableRegistry>,
    tasks: Mutex<HashMap<String, TaskEntry>>,
}

impl TaskScheduler {
    /// Creates a scheduler with an empty runnable registry.
    #[must_use]
    pub fn new() -> Self {
        Self::with_registry(RunnableRegistry::new())
    }

    /// Creates a scheduler resolving named workloads in `registry`.
    #[must_use]
    pub fn with_registry(registry: RunnableRegistry) -> Self {
        Self {
            registry: RwLock::new(registry),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Adds a named runnable for later [`Workload::Named`] registrations.
    pub fn provide(&self, name: impl Into<String>, runnable: Arc<dyn Runnable>) {
        self.registry.write().insert(name, runnable);
    }

    /// Registers a task and, unless it is disabled, starts it.
    ///
    /// Nothing is registered if validation fails.
    ///
    /// # Errors
    ///
    /// Fails if the id is empty or taken, a named workload is unknown, or
    /// the options are inconsistent.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime and the task starts.
    pub fn register(
        &self,
        id: impl Into<String>,
        workload: Workload,
        options: TaskOptions,
    ) -> Result<(), TaskError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(TaskError::EmptyId);
        }
        let schedule = options.validate(&id)?;
        let runnable = match workload.into_runnable() {
            Ok(runnable) => runnable,
            Err(name) => self
                .registry
                .read()
                .get(&name)
                .ok_or(TaskError::UnknownService(name))?,
        };

        let mut tasks = self.tasks.lock();
        if tasks.contains_key(&id) {
            return Err(TaskError::DuplicateId(id));
        }

        let mut entry = TaskEntry {
            schedule,
            runnable,
            stats: Arc::new(Mutex::new(TaskStats::default())),
            handle: None,
        };
        if !options.disabled {
            entry.start(&id);
        }
        tracing::debug!(task_id = %id, ?schedule, enabled = !options.disabled, "Registered task");
        tasks.insert(id, entry);
        Ok(())
    }

    /// Starts a periodic task that is stopped.
    ///
    /// # Errors
    ///
    /// Fails if the task is unknown, not periodic, or already enabled.
    pub fn enable(&self, id: &str) -> Result<(), TaskError> {
        if self.ensure_enabled(id)? {
            Ok(())
        } else {
            Err(TaskError::AlreadyEnabled(id.to_string()))
        }
    }

    /// Stops a running periodic task.
    ///
    /// A run in progress finishes; no further runs start.
    ///
    /// # Errors
    ///
    /// Fails if the task is unknown, not periodic, or already disabled.
    pub fn disable(&self, id: &str) -> Result<(), TaskError> {
        if self.ensure_disabled(id)? {
            Ok(())
        } else {
            Err(TaskError::AlreadyDisabled(id.to_string()))
        }
    }

    /// Like [`enable`](Self::enable), but an enabled task is fine.
    ///
    /// Returns true if the task was started by this call.
    ///
    /// # Errors
    ///
    /// Fails if the task is unknown or not periodic.
    pub fn ensure_enabled(&self, id: &str) -> Result<bool, TaskError> {
        let mut tasks = self.tasks.lock();
        let entry = periodic_entry(&mut tasks, id)?;
        if entry.is_running() {
            return Ok(false);
        }
        entry.start(id);
        tracing::info!(task_id = id, "Enabled task");
        Ok(true)
    }

    /// Like [`disable`](Self::disable), but a disabled task is fine.
    ///
    /// Returns true if the task was stopped by this call.
    ///
    /// # Errors
    ///
    /// Fails if the task is unknown or not periodic.
    pub fn ensure_disabled(&self, id: &str) -> Result<bool, TaskError> {
        let mut tasks = self.tasks.lock();
        let entry = periodic_entry(&mut tasks, id)?;
        if !entry.is_running() {
            entry.handle = None;
            return Ok(false);
        }
        entry.stop();
        tracing::info!(task_id = id, "Disabled task");
        Ok(true)
    }

    /// Returns whether a task is scheduled to run, or `None` if unknown.
    #[must_use]
    pub fn is_enabled(&self, id: &str) -> Option<bool> {
        self.tasks.lock().get(id).map(TaskEntry::is_running)
    }

    /// Returns true if a task with this id exists.
    #[must_use]
    pub fn is_registered(&self, id: &str) -> bool {
        self.tasks.lock().contains_key(id)
    }

    /// Returns all task ids, sorted.
    #[must_use]
    pub fn task_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.tasks.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Returns the statistics of a task.
    #[must_use]
    pub fn task_stats(&self, id: &str) -> Option<TaskStats> {
        self.tasks.lock().get(id).map(|entry| entry.stats.lock().clone())
    }

    /// Stops every task. Registrations are kept.
    pub fn shutdown(&self) {
        let mut tasks = self.tasks.lock();
        let stopped = tasks
            .values_mut()
            .map(TaskEntry::stop)
            .filter(|stopped| *stopped)
            .count();
        tracing::debug!(stopped, "Scheduler shut down");
    }
}

fn periodic_entry<'a>(
    tasks: &'a mut HashMap<String, TaskEntry>,
    id: &str,
) -> Result<&'a mut TaskEntry, TaskError> {
    let entry = tasks
        .get_mut(id)
        .ok_or_else(|| TaskError::NotFound(id.to_string()))?;
    if !entry.schedule.is_periodic() {
        return Err(TaskError::NotPeriodic(id.to_string()));
    }
    Ok(entry)
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        for entry in self.tasks.get_mut().values_mut() {
            entry.stop();
        }
    }
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("tasks", &self.task_ids())
            .field("registry", &*self.registry.read())
            .finish()
    }
}
