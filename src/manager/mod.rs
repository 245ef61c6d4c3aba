// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fleet manager keeping a set of printers connected.
//!
//! # Overview
//!
//! The [`FleetManager`] owns one [`DeviceStateAggregator`] per device known
//! to the registry, and each enabled device's aggregator holds exactly one
//! [`OctoPrintAdapter`](crate::adapter::OctoPrintAdapter). The manager:
//!
//! - **Follows the registry**: [`RegistryEvent`]s create, replace and delete
//!   devices. An update always replaces the adapter, so no adapter keeps
//!   stale credentials.
//! - **Heals connections**: [`reconnect_sweep`](FleetManager::reconnect_sweep)
//!   reauthenticates and reconnects devices, one failure domain per device.
//! - **Detects dead sockets**: [`heartbeat`](FleetManager::heartbeat) pings
//!   and [`reap_stale_connections`](FleetManager::reap_stale_connections)
//!   resets silent sockets.
//! - **Publishes health**: [`flush_state_diffs`](FleetManager::flush_state_diffs)
//!   returns what changed since the last call.
//!
//! Periodic calls are usually wired through
//! [`register_fleet_tasks`](crate::tasks::register_fleet_tasks).
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use octofleet_lib::event::{DeviceId, EventBus};
//! use octofleet_lib::manager::{DeviceRecord, FleetConfig, FleetManager, RegistryEvent};
//! use octofleet_lib::protocol::{HttpConfig, LoginDescriptor};
//!
//! # async fn example() -> octofleet_lib::Result<()> {
//! let manager = FleetManager::with_http(HttpConfig::new(), EventBus::new(), FleetConfig::default())?;
//!
//! let record = DeviceRecord::new("p1", LoginDescriptor::new("http://10.0.0.5", "key"));
//! manager.handle_registry_event(RegistryEvent::Created(record)).await?;
//! manager.reconnect_sweep().await;
//!
//! if let Some(snapshot) = manager.snapshot(&DeviceId::from("p1")).await {
//!     println!("{:?}: {}", snapshot.host.state, snapshot.host.description);
//! }
//!
//! manager
//!     .handle_registry_event(RegistryEvent::Deleted(vec![DeviceId::from("p1")]))
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod aggregator;
mod config;
mod fleet_manager;
mod registry;

pub use aggregator::{
    ApiAccessibility, DeviceSnapshot, DeviceStateAggregator, HostState, HostStateDescriptor,
    ReachabilityCategory,
};
pub use config::{DeviceRecord, FleetConfig, SilencePolicy};
pub use fleet_manager::{FleetManager, HeartbeatReport, SweepReport, TestConnectionReport};
pub use registry::{DeviceRegistry, RegistryEvent};
