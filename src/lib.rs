// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `OctoFleet` Lib - A Rust library to keep a fleet of OctoPrint-compatible
//! printer controllers connected.
//!
//! Every printer exposes a REST login endpoint and a WebSocket push
//! channel. This library keeps one live, authenticated, self-healing
//! connection per printer, isolates failures per printer, and re-emits
//! every push frame on a single event bus.
//!
//! # Building Blocks
//!
//! - [`adapter`]: per-printer protocol client and its socket/API state machine
//! - [`manager`]: per-printer health and the fleet orchestrator
//! - [`scheduler`]: periodic, run-once and delayed tasks with isolated failures
//! - [`tasks`]: reconnection sweep, heartbeat and stale connection reaper
//! - [`cache`]: keyed store with change tracking
//! - [`event`]: pattern-matching event bus
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use octofleet_lib::event::EventBus;
//! use octofleet_lib::manager::{DeviceRecord, FleetConfig, FleetManager};
//! use octofleet_lib::protocol::{HttpConfig, LoginDescriptor};
//! use octofleet_lib::scheduler::TaskScheduler;
//! use octofleet_lib::tasks::register_fleet_tasks;
//!
//! #[tokio::main]
//! async fn main() -> octofleet_lib::Result<()> {
//!     let bus = EventBus::new();
//!     bus.on("octoprint.*", |name, event| {
//!         println!("{} from {}", name, event.device_id);
//!     });
//!
//!     let manager = Arc::new(FleetManager::with_http(
//!         HttpConfig::new(),
//!         bus,
//!         FleetConfig::default(),
//!     )?);
//!     manager
//!         .create_or_update(DeviceRecord::new(
//!             "mk3s",
//!             LoginDescriptor::new("http://192.168.1.20", "api-key"),
//!         ))
//!         .await?;
//!
//!     let scheduler = TaskScheduler::new();
//!     register_fleet_tasks(&scheduler, &manager)?;
//!
//!     tokio::time::sleep(Duration::from_secs(600)).await;
//!     scheduler.shutdown();
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Validating Credentials
//!
//! ```no_run
//! use std::time::Duration;
//! # use octofleet_lib::manager::FleetManager;
//! use octofleet_lib::protocol::LoginDescriptor;
//!
//! # async fn example(manager: &FleetManager) {
//! let login = LoginDescriptor::new("http://192.168.1.21", "candidate-key");
//! match manager.setup_test_connection(login, Duration::from_secs(5)).await {
//!     Ok(report) => println!("connected: {}", report.socket_state),
//!     Err(e) => println!("rejected: {e}"),
//! }
//! # }
//! ```

pub mod adapter;
pub mod cache;
pub mod error;
pub mod event;
pub mod manager;
pub mod protocol;
pub mod scheduler;
pub mod tasks;

pub use adapter::{ApiState, OctoPrintAdapter, SocketScheme, SocketState};
pub use error::{AdapterError, ApiError, Error, ManagerError, Result, TaskError};
pub use event::{DeviceId, EventBus, FleetEvent};
pub use manager::{DeviceRecord, FleetConfig, FleetManager, SweepReport};
pub use protocol::{LoginDescriptor, LoginTransport};
#[cfg(feature = "http")]
pub use protocol::{HttpConfig, OctoPrintHttpClient};
pub use scheduler::{TaskOptions, TaskScheduler, Workload};
