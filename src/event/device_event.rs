// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Normalized fleet event type and well-known event names.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::DeviceId;

/// Prefix of events re-emitted from device push frames.
pub const FRAME_EVENT_PREFIX: &str = "octoprint";

/// Emitted when an adapter's socket state changes.
pub const SOCKET_STATE_CHANGED: &str = "adapter.socket-state-changed";
/// Emitted when an adapter's API state changes.
pub const API_STATE_CHANGED: &str = "adapter.api-state-changed";
/// Emitted once the WebSocket transport is connected.
pub const SOCKET_OPENED: &str = "adapter.socket-opened";
/// Emitted when the transport is closed by either side.
pub const SOCKET_CLOSED: &str = "adapter.socket-closed";
/// Emitted when the transport fails.
pub const SOCKET_ERROR: &str = "adapter.socket-error";

/// Frame key the device sends when the session must be renewed.
pub const REAUTH_REQUIRED: &str = "reauthRequired";

/// Returns the bus name of a push frame event, e.g. `octoprint.current`.
#[must_use]
pub fn frame_event_name(event: &str) -> String {
    format!("{FRAME_EVENT_PREFIX}.{event}")
}

/// A normalized event on the shared bus.
///
/// Every push frame becomes one of these, keyed by the frame's first key.
/// Adapter lifecycle notifications use the same shape with the names
/// defined in this module.
///
/// # Examples
///
/// ```
/// use octofleet_lib::event::{DeviceId, FleetEvent};
///
/// let event = FleetEvent::new("current", serde_json::json!({"busy": false}), DeviceId::from("p1"));
/// assert_eq!(event.event, "current");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetEvent {
    /// Event name (the frame's first key, or a lifecycle name).
    pub event: String,
    /// Event payload.
    pub payload: Value,
    /// The device that produced the event.
    pub device_id: DeviceId,
}

impl FleetEvent {
    /// Creates a new event.
    #[must_use]
    pub fn new(event: impl Into<String>, payload: Value, device_id: DeviceId) -> Self {
        Self {
            event: event.into(),
            payload,
            device_id,
        }
    }

    /// Returns `true` if this event is an adapter lifecycle notification.
    #[must_use]
    pub fn is_lifecycle(&self) -> bool {
        self.event.starts_with("adapter.")
    }
}
