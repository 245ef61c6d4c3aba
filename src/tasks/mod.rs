// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fleet maintenance tasks for the [`scheduler`](crate::scheduler).
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use octofleet_lib::event::EventBus;
//! use octofleet_lib::manager::{FleetConfig, FleetManager};
//! use octofleet_lib::protocol::HttpConfig;
//! use octofleet_lib::scheduler::TaskScheduler;
//! use octofleet_lib::tasks::register_fleet_tasks;
//!
//! # async fn example() -> octofleet_lib::Result<()> {
//! let manager = Arc::new(FleetManager::with_http(
//!     HttpConfig::new(),
//!     EventBus::new(),
//!     FleetConfig::default(),
//! )?);
//! let scheduler = TaskScheduler::new();
//! register_fleet_tasks(&scheduler, &manager)?;
//! # Ok(())
//! # }
//! ```

mod fleet;
mod silenced;

pub use fleet::{
    HEARTBEAT_TASK, HeartbeatTask, RECONNECT_SWEEP_TASK, ReconnectSweepTask, STALE_REAPER_TASK,
    StaleConnectionReaperTask, register_fleet_tasks,
};
pub use silenced::SilencedLogger;
