// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device records and fleet configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::adapter::{DEFAULT_THROTTLE, SocketScheme};
use crate::event::DeviceId;
use crate::protocol::LoginDescriptor;

/// A device as known to the registry.
///
/// Records are treated as frozen: an update replaces the whole record and
/// resets the device's connection, it never patches fields in place.
///
/// # Examples
///
/// ```
/// use octofleet_lib::manager::DeviceRecord;
/// use octofleet_lib::protocol::LoginDescriptor;
///
/// let record = DeviceRecord::new(
///     "printer-1",
///     LoginDescriptor::new("http://192.168.1.20", "api-key"),
/// )
/// .with_name("Prusa MK3S");
///
/// assert!(record.enabled);
/// assert_eq!(record.name, "Prusa MK3S");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    /// Registry id.
    pub id: DeviceId,
    /// Display name.
    pub name: String,
    /// Where and how to log in.
    pub login: LoginDescriptor,
    /// Disabled devices keep their record but get no adapter.
    pub enabled: bool,
}

impl DeviceRecord {
    /// Creates an enabled record named after its id.
    #[must_use]
    pub fn new(id: impl Into<DeviceId>, login: LoginDescriptor) -> Self {
        let id = id.into();
        Self {
            name: id.as_str().to_string(),
            id,
            login,
            enabled: true,
        }
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets whether the device is enabled.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Rate limit for repeated transient failure logs.
///
/// The first `threshold` consecutive failures of a device are only logged
/// at debug level. The next one is logged as a warning, and after that only
/// every `log_every`-th failure is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SilencePolicy {
    /// Consecutive failures kept quiet before the first warning.
    pub threshold: u32,
    /// Warn again on every n-th failure after the first warning.
    pub log_every: u32,
}

impl SilencePolicy {
    /// Creates a policy.
    #[must_use]
    pub fn new(threshold: u32, log_every: u32) -> Self {
        Self {
            threshold,
            log_every: log_every.max(1),
        }
    }
}

impl Default for SilencePolicy {
    fn default() -> Self {
        Self {
            threshold: 3,
            log_every: 10,
        }
    }
}

/// Timing and protocol settings for a [`FleetManager`](super::FleetManager).
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use octofleet_lib::manager::FleetConfig;
///
/// let config = FleetConfig::new()
///     .with_sweep_interval(Duration::from_secs(5))
///     .with_stale_threshold(Duration::from_secs(60));
///
/// assert_eq!(config.sweep_interval, Duration::from_secs(5));
/// assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
/// ```
#[derive(Debug, Clone)]
pub struct FleetConfig {
    /// Period of the reconnection sweep.
    pub sweep_interval: Duration,
    /// Period of the socket heartbeat.
    pub heartbeat_interval: Duration,
    /// A connected device silent for longer than this is reset.
    pub stale_threshold: Duration,
    /// Period of the stale connection reaper.
    pub reaper_interval: Duration,
    /// Throttle multiplier sent after the auth frame.
    pub throttle: u32,
    /// Scheme used for push channel URLs.
    pub socket_scheme: SocketScheme,
    /// Default deadline of ephemeral test connections.
    pub test_connection_deadline: Duration,
    /// Rate limit for transient failure logs.
    pub silence: SilencePolicy,
}

impl FleetConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the reconnection sweep period.
    #[must_use]
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Sets the heartbeat period.
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the staleness threshold.
    #[must_use]
    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    /// Sets the reaper period.
    #[must_use]
    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }

    /// Sets the throttle multiplier.
    #[must_use]
    pub fn with_throttle(mut self, throttle: u32) -> Self {
        self.throttle = throttle;
        self
    }

    /// Sets the push channel scheme.
    #[must_use]
    pub fn with_socket_scheme(mut self, scheme: SocketScheme) -> Self {
        self.socket_scheme = scheme;
        self
    }

    /// Sets the default test connection deadline.
    #[must_use]
    pub fn with_test_connection_deadline(mut self, deadline: Duration) -> Self {
        self.test_connection_deadline = deadline;
        self
    }

    /// Sets the failure log rate limit.
    #[must_use]
    pub fn with_silence(mut self, silence: SilencePolicy) -> Self {
        self.silence = silence;
        self
    }
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(90),
            reaper_interval: Duration::from_secs(15),
            throttle: DEFAULT_THROTTLE,
            socket_scheme: SocketScheme::Auto,
            test_connection_deadline: Duration::from_secs(10),
            silence: SilencePolicy::default(),
        }
    }
}
