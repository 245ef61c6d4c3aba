// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Periodic fleet maintenance tasks.

use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;

use crate::error::{Error, TaskError};
use crate::manager::FleetManager;
use crate::scheduler::{Runnable, TaskOptions, TaskScheduler, Workload};

/// Task id of the reconnection sweep.
pub const RECONNECT_SWEEP_TASK: &str = "fleet-reconnect-sweep";
/// Task id of the socket heartbeat.
pub const HEARTBEAT_TASK: &str = "fleet-socket-heartbeat";
/// Task id of the stale connection reaper.
pub const STALE_REAPER_TASK: &str = "fleet-stale-reaper";

/// Runs [`FleetManager::reconnect_sweep`].
#[derive(Debug, Clone)]
pub struct ReconnectSweepTask {
    manager: Arc<FleetManager>,
}

impl ReconnectSweepTask {
    /// Creates the task.
    #[must_use]
    pub fn new(manager: Arc<FleetManager>) -> Self {
        Self { manager }
    }
}

impl Runnable for ReconnectSweepTask {
    fn run(&self) -> BoxFuture<'_, Result<(), Error>> {
        async move {
            let report = self.manager.reconnect_sweep().await;
            if !report.failed_device_ids.is_empty() {
                tracing::debug!(failed = ?report.failed_device_ids, "Sweep left devices disconnected");
            }
            Ok(())
        }
        .boxed()
    }
}

/// Runs [`FleetManager::heartbeat`].
#[derive(Debug, Clone)]
pub struct HeartbeatTask {
    manager: Arc<FleetManager>,
}

impl HeartbeatTask {
    /// Creates the task.
    #[must_use]
    pub fn new(manager: Arc<FleetManager>) -> Self {
        Self { manager }
    }
}

impl Runnable for HeartbeatTask {
    fn run(&self) -> BoxFuture<'_, Result<(), Error>> {
        async move {
            let report = self.manager.heartbeat().await;
            tracing::trace!(pinged = report.pinged, failed = report.failed_device_ids.len(), "Heartbeat sent");
            Ok(())
        }
        .boxed()
    }
}

/// Runs [`FleetManager::reap_stale_connections`] with a fixed threshold.
#[derive(Debug, Clone)]
pub struct StaleConnectionReaperTask {
    manager: Arc<FleetManager>,
    threshold: Duration,
}

impl StaleConnectionReaperTask {
    /// Creates the task.
    #[must_use]
    pub fn new(manager: Arc<FleetManager>, threshold: Duration) -> Self {
        Self { manager, threshold }
    }
}

impl Runnable for StaleConnectionReaperTask {
    fn run(&self) -> BoxFuture<'_, Result<(), Error>> {
        async move {
            let reaped = self.manager.reap_stale_connections(self.threshold).await;
            if !reaped.is_empty() {
                tracing::info!(count = reaped.len(), "Reset stale connections");
            }
            Ok(())
        }
        .boxed()
    }
}

/// Registers the sweep, heartbeat and reaper with the manager's intervals.
///
/// The runnables are provided to the scheduler under their task ids and
/// registered by name.
///
/// # Errors
///
/// Fails if one of the task ids is already taken, in which case nothing
/// is provided or registered, or if an interval is zero. Tasks registered
/// before an interval failure stay registered.
pub fn register_fleet_tasks(
    scheduler: &TaskScheduler,
    manager: &Arc<FleetManager>,
) -> Result<(), TaskError> {
    let config = manager.config().clone();

    let tasks: [(&str, Arc<dyn Runnable>, Duration); 3] = [
        (
            RECONNECT_SWEEP_TASK,
            Arc::new(ReconnectSweepTask::new(Arc::clone(manager))),
            config.sweep_interval,
        ),
        (
            HEARTBEAT_TASK,
            Arc::new(HeartbeatTask::new(Arc::clone(manager))),
            config.heartbeat_interval,
        ),
        (
            STALE_REAPER_TASK,
            Arc::new(StaleConnectionReaperTask::new(
                Arc::clone(manager),
                config.stale_threshold,
            )),
            config.reaper_interval,
        ),
    ];

    if let Some((id, _, _)) = tasks.iter().find(|(id, _, _)| scheduler.is_registered(id)) {
        return Err(TaskError::DuplicateId((*id).to_string()));
    }

    for (id, runnable, interval) in tasks {
        scheduler.provide(id, runnable);
        scheduler.register(id, Workload::named(id), TaskOptions::periodic(interval))?;
    }
    tracing::info!("Registered fleet maintenance tasks");
    Ok(())
}
