// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Event system for normalized device events.
//!
//! Every push frame a device sends is re-emitted on the shared [`EventBus`]
//! as a [`FleetEvent`], named `octoprint.<frame key>`. Adapters also emit
//! lifecycle notifications (`adapter.socket-opened`, ...).
//!
//! # Examples
//!
//! ```
//! use octofleet_lib::event::{DeviceId, EventBus, FleetEvent};
//!
//! let bus = EventBus::new();
//!
//! // Pattern subscription, called synchronously
//! bus.on("octoprint.*", |name, event| {
//!     println!("{name}: {:?}", event.payload);
//! });
//!
//! // Async subscription
//! let mut rx = bus.subscribe();
//!
//! bus.emit(
//!     "octoprint.current",
//!     FleetEvent::new("current", serde_json::json!({}), DeviceId::from("printer-1")),
//! );
//! ```

mod device_event;
mod device_id;
mod event_bus;

pub use device_event::{
    API_STATE_CHANGED, FRAME_EVENT_PREFIX, FleetEvent, REAUTH_REQUIRED, SOCKET_CLOSED,
    SOCKET_ERROR, SOCKET_OPENED, SOCKET_STATE_CHANGED, frame_event_name,
};
pub use device_id::DeviceId;
pub use event_bus::{BusMessage, EventBus, SubscriptionId};
