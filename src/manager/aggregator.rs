// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-device health wrapper for the fleet manager.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::adapter::{ApiState, OctoPrintAdapter, SocketState};
use crate::error::ManagerError;
use crate::event::DeviceId;
use crate::protocol::LoginDescriptor;

use super::config::DeviceRecord;

/// Normalized reachability of a device's host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HostState {
    /// Waiting for the first successful connection.
    Searching,
    /// The device answers and its socket is up.
    Online,
    /// The device does not answer or the connection dropped.
    Offline,
    /// A permanent failure needs a record change or manual reconnect.
    Failed,
    /// The device is disabled in the registry.
    Disabled,
}

impl HostState {
    /// Returns the category a host state implies before the device reports
    /// its own status.
    #[must_use]
    pub const fn category(self) -> ReachabilityCategory {
        match self {
            Self::Searching => ReachabilityCategory::Searching,
            Self::Online => ReachabilityCategory::Idle,
            Self::Offline => ReachabilityCategory::Offline,
            Self::Failed => ReachabilityCategory::Error,
            Self::Disabled => ReachabilityCategory::Disabled,
        }
    }
}

/// Coarse grouping of device states, used by consumers for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReachabilityCategory {
    /// No connection yet.
    Searching,
    /// Ready and not working on anything.
    Idle,
    /// Working on a job, or in a state without a better match.
    Active,
    /// Connecting to its printer hardware.
    Connecting,
    /// Not reachable.
    Offline,
    /// Reports an error or failed permanently.
    Error,
    /// Disabled in the registry.
    Disabled,
}

impl ReachabilityCategory {
    /// Maps a device-reported state label onto a category.
    ///
    /// Returns `None` for labels without a known mapping.
    #[must_use]
    pub fn from_status_label(label: &str) -> Option<Self> {
        let category = match label.trim() {
            "Operational" => Self::Idle,
            "Printing" | "Printing from SD" | "Sending file to SD" | "Pausing" | "Paused"
            | "Resuming" | "Cancelling" | "Finishing" | "Starting" | "Transferring file to SD" => {
                Self::Active
            }
            "Opening serial connection" | "Detecting serial connection" | "Connecting"
            | "Detecting baudrate" => Self::Connecting,
            "Offline" | "Closed" => Self::Offline,
            "Error" | "Offline after error" | "Closed with error" => Self::Error,
            _ => return None,
        };
        Some(category)
    }
}

/// Host reachability with its category and a human-readable description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostStateDescriptor {
    /// Normalized state.
    pub state: HostState,
    /// Display category.
    pub category: ReachabilityCategory,
    /// What is going on, in words.
    pub description: String,
}

/// Whether the device's REST API may be used, and if not, whether to retry.
///
/// This is the retry gate consulted by every reconnection loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiAccessibility {
    /// The last attempt reached the API.
    pub accessible: bool,
    /// Retrying may succeed without operator action.
    pub retryable: bool,
    /// Why the API is not accessible.
    pub reason: Option<String>,
}

impl ApiAccessibility {
    fn retryable() -> Self {
        Self {
            accessible: true,
            retryable: true,
            reason: None,
        }
    }
}

/// Serializable view of one device, fed to the fleet's diff cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSnapshot {
    /// Device id.
    pub id: DeviceId,
    /// Display name.
    pub name: String,
    /// Registry enabled flag.
    pub enabled: bool,
    /// Host reachability.
    pub host: HostStateDescriptor,
    /// REST API accessibility.
    pub api_accessibility: ApiAccessibility,
    /// Socket state of the bound adapter.
    pub socket_state: Option<SocketState>,
    /// API state of the bound adapter.
    pub api_state: Option<ApiState>,
    /// Pending reauthentication request.
    pub reauth_requested_at: Option<DateTime<Utc>>,
    /// Wall-clock time of the last frame.
    pub last_message_received: Option<DateTime<Utc>>,
}

struct AggregatorInner {
    record: DeviceRecord,
    adapter: Option<Arc<OctoPrintAdapter>>,
    marked_for_removal: bool,
    host: HostStateDescriptor,
    api_accessibility: ApiAccessibility,
}

/// One device's overall health, independent of transport mechanics.
///
/// Holds the frozen [`DeviceRecord`], at most one bound adapter, a host
/// state descriptor and the API accessibility gate. Once
/// [`tear_down`](Self::tear_down) ran the device is never retried again.
pub struct DeviceStateAggregator {
    id: DeviceId,
    inner: Mutex<AggregatorInner>,
}

impl DeviceStateAggregator {
    /// Creates an aggregator for a record, in the state
    /// [`reset_connection_state`](Self::reset_connection_state) would set.
    #[must_use]
    pub fn new(record: DeviceRecord) -> Self {
        let aggregator = Self {
            id: record.id.clone(),
            inner: Mutex::new(AggregatorInner {
                record,
                adapter: None,
                marked_for_removal: false,
                host: HostStateDescriptor {
                    state: HostState::Searching,
                    category: ReachabilityCategory::Searching,
                    description: String::new(),
                },
                api_accessibility: ApiAccessibility::retryable(),
            }),
        };
        aggregator.reset_connection_state();
        aggregator
    }

    /// Returns the device id.
    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    /// Returns a copy of the device record.
    pub fn record(&self) -> DeviceRecord {
        self.inner.lock().record.clone()
    }

    /// Returns the login details of the record.
    pub fn login_details(&self) -> LoginDescriptor {
        self.inner.lock().record.login.clone()
    }

    /// Returns the display name of the record.
    pub fn name(&self) -> String {
        self.inner.lock().record.name.clone()
    }

    /// Returns true if the record is enabled.
    pub fn is_enabled(&self) -> bool {
        self.inner.lock().record.enabled
    }

    /// Returns true once [`tear_down`](Self::tear_down) ran.
    pub fn is_marked_for_removal(&self) -> bool {
        self.inner.lock().marked_for_removal
    }

    /// Returns the bound adapter.
    pub fn adapter(&self) -> Option<Arc<OctoPrintAdapter>> {
        self.inner.lock().adapter.clone()
    }

    /// Returns the host state descriptor.
    pub fn host_state(&self) -> HostStateDescriptor {
        self.inner.lock().host.clone()
    }

    /// Returns the API accessibility.
    pub fn api_accessibility(&self) -> ApiAccessibility {
        self.inner.lock().api_accessibility.clone()
    }

    /// Replaces the record. The caller resets the connection afterwards.
    pub fn replace_record(&self, record: DeviceRecord) {
        self.inner.lock().record = record;
    }

    /// Sets the host state, categorized by [`HostState::category`].
    pub fn set_host_state(&self, state: HostState, description: impl Into<String>) {
        let description = description.into();
        tracing::debug!(device_id = %self.id, ?state, description = %description, "Host state changed");
        self.inner.lock().host = HostStateDescriptor {
            state,
            category: state.category(),
            description,
        };
    }

    /// Sets the retry gate.
    ///
    /// `accessible = false, retryable = false` is a permanent failure;
    /// `retryable = true` is a transient one.
    pub fn set_api_accessibility(
        &self,
        accessible: bool,
        retryable: bool,
        reason: Option<String>,
    ) {
        self.inner.lock().api_accessibility = ApiAccessibility {
            accessible,
            retryable,
            reason,
        };
    }

    /// Applies a status label reported by the device itself.
    ///
    /// Unknown labels fall back to [`ReachabilityCategory::Active`] with a
    /// warning. Ignored for disabled or removed devices, and for devices
    /// in a permanent failure until the connection state is reset.
    pub fn apply_device_status(&self, label: &str) -> ReachabilityCategory {
        let category = ReachabilityCategory::from_status_label(label).unwrap_or_else(|| {
            tracing::warn!(device_id = %self.id, label, "Unknown device state label, treating as active");
            ReachabilityCategory::Active
        });

        let mut inner = self.inner.lock();
        if inner.marked_for_removal
            || !inner.record.enabled
            || !inner.api_accessibility.retryable
        {
            return inner.host.category;
        }
        inner.host = HostStateDescriptor {
            state: HostState::Online,
            category,
            description: label.to_string(),
        };
        category
    }

    /// True only if the device may be retried and its adapter's socket is
    /// `unopened` or `closed`.
    pub fn should_retry_connect(&self) -> bool {
        let inner = self.inner.lock();
        if inner.marked_for_removal || !inner.api_accessibility.retryable {
            return false;
        }
        inner.adapter.as_ref().is_some_and(|adapter| {
            matches!(
                adapter.socket_state(),
                SocketState::Unopened | SocketState::Closed
            )
        })
    }

    /// True if nothing forbids a retry, whatever the socket state.
    pub fn retry_permitted(&self) -> bool {
        let inner = self.inner.lock();
        !inner.marked_for_removal && inner.api_accessibility.retryable
    }

    /// Resets host state and accessibility after a record change or a
    /// manual reconnect.
    pub fn reset_connection_state(&self) {
        let mut inner = self.inner.lock();
        if inner.record.enabled {
            inner.host = HostStateDescriptor {
                state: HostState::Searching,
                category: ReachabilityCategory::Searching,
                description: "searching for device".to_string(),
            };
            inner.api_accessibility = ApiAccessibility::retryable();
        } else {
            inner.host = HostStateDescriptor {
                state: HostState::Disabled,
                category: ReachabilityCategory::Disabled,
                description: "device is disabled".to_string(),
            };
            inner.api_accessibility = ApiAccessibility {
                accessible: false,
                retryable: false,
                reason: Some("device is disabled".to_string()),
            };
        }
    }

    /// Closes the bound adapter and marks the device for removal.
    ///
    /// Irreversible.
    pub fn tear_down(&self) {
        let adapter = {
            let mut inner = self.inner.lock();
            inner.marked_for_removal = true;
            inner.adapter.take()
        };
        if let Some(adapter) = adapter {
            adapter.close();
        }
        tracing::debug!(device_id = %self.id, "Device torn down");
    }

    /// Binds an adapter.
    ///
    /// # Errors
    ///
    /// Fails if an adapter is already bound or the device was torn down.
    pub fn bind_adapter(&self, adapter: Arc<OctoPrintAdapter>) -> Result<(), ManagerError> {
        let mut inner = self.inner.lock();
        if inner.marked_for_removal {
            return Err(ManagerError::MarkedForRemoval(self.id.to_string()));
        }
        if inner.adapter.is_some() {
            return Err(ManagerError::AdapterAlreadyBound(self.id.to_string()));
        }
        inner.adapter = Some(adapter);
        Ok(())
    }

    /// Unbinds and closes the adapter, returning it.
    pub fn reset_adapter(&self) -> Option<Arc<OctoPrintAdapter>> {
        let adapter = self.inner.lock().adapter.take();
        if let Some(adapter) = &adapter {
            adapter.close();
        }
        adapter
    }

    /// Returns a serializable view of the device.
    pub fn snapshot(&self) -> DeviceSnapshot {
        let inner = self.inner.lock();
        let adapter = inner.adapter.as_ref();
        DeviceSnapshot {
            id: self.id.clone(),
            name: inner.record.name.clone(),
            enabled: inner.record.enabled,
            host: inner.host.clone(),
            api_accessibility: inner.api_accessibility.clone(),
            socket_state: adapter.map(|a| a.socket_state()),
            api_state: adapter.map(|a| a.api_state()),
            reauth_requested_at: adapter.and_then(|a| a.reauth_requested_at()),
            last_message_received: adapter.and_then(|a| a.last_message_received()),
        }
    }
}

impl std::fmt::Debug for DeviceStateAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("DeviceStateAggregator")
            .field("id", &self.id)
            .field("name", &inner.record.name)
            .field("marked_for_removal", &inner.marked_for_removal)
            .field("host", &inner.host.state)
            .field("has_adapter", &inner.adapter.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::SocketScheme;
    use crate::error::ApiError;
    use crate::event::EventBus;
    use crate::protocol::{LoginResponse, LoginTransport};
    use futures_util::FutureExt;
    use futures_util::future::BoxFuture;

    struct NoopTransport;

    impl LoginTransport for NoopTransport {
        fn login<'a>(
            &'a self,
            _login: &'a LoginDescriptor,
        ) -> BoxFuture<'a, Result<LoginResponse, ApiError>> {
            async { Err(ApiError::NoResponse("offline".into())) }.boxed()
        }

        fn admin_username<'a>(
            &'a self,
            _login: &'a LoginDescriptor,
        ) -> BoxFuture<'a, Result<String, ApiError>> {
            async { Err(ApiError::NoResponse("offline".into())) }.boxed()
        }
    }

    fn record(enabled: bool) -> DeviceRecord {
        DeviceRecord::new("p1", LoginDescriptor::new("http://127.0.0.1:1", "k"))
            .with_name("Printer")
            .with_enabled(enabled)
    }

    fn adapter() -> Arc<OctoPrintAdapter> {
        let adapter = OctoPrintAdapter::new(Arc::new(NoopTransport), EventBus::new());
        adapter
            .register_credentials(
                DeviceId::from("p1"),
                LoginDescriptor::new("http://127.0.0.1:1", "k"),
                SocketScheme::Auto,
            )
            .unwrap();
        Arc::new(adapter)
    }

    #[test]
    fn accessors_read_the_record() {
        let aggregator = DeviceStateAggregator::new(record(true));
        assert_eq!(aggregator.name(), "Printer");
        assert_eq!(aggregator.login_details().api_key, "k");
        assert_eq!(aggregator.host_state().state, HostState::Searching);
    }

    #[test]
    fn retry_requires_an_unopened_adapter() {
        let aggregator = DeviceStateAggregator::new(record(true));
        assert!(!aggregator.should_retry_connect());

        aggregator.bind_adapter(adapter()).unwrap();
        assert!(aggregator.should_retry_connect());
    }

    #[test]
    fn non_retryable_accessibility_blocks_retry() {
        let aggregator = DeviceStateAggregator::new(record(true));
        aggregator.bind_adapter(adapter()).unwrap();

        aggregator.set_api_accessibility(false, false, Some("credentials rejected".into()));

        assert!(!aggregator.should_retry_connect());
        assert!(!aggregator.retry_permitted());
    }

    #[test]
    fn marked_for_removal_never_retries() {
        let aggregator = DeviceStateAggregator::new(record(true));
        aggregator.bind_adapter(adapter()).unwrap();

        aggregator.tear_down();
        aggregator.set_api_accessibility(true, true, None);
        aggregator.reset_connection_state();

        assert!(aggregator.is_marked_for_removal());
        assert!(!aggregator.should_retry_connect());
        assert!(aggregator.adapter().is_none());
        assert_eq!(
            aggregator.bind_adapter(adapter()),
            Err(ManagerError::MarkedForRemoval("p1".into()))
        );
    }

    #[test]
    fn binding_twice_fails() {
        let aggregator = DeviceStateAggregator::new(record(true));
        aggregator.bind_adapter(adapter()).unwrap();

        let err = aggregator.bind_adapter(adapter()).unwrap_err();
        assert_eq!(err, ManagerError::AdapterAlreadyBound("p1".into()));

        assert!(aggregator.reset_adapter().is_some());
        assert!(aggregator.bind_adapter(adapter()).is_ok());
    }

    #[test]
    fn disabled_record_is_terminal() {
        let aggregator = DeviceStateAggregator::new(record(false));
        let access = aggregator.api_accessibility();

        assert_eq!(aggregator.host_state().state, HostState::Disabled);
        assert!(!access.accessible);
        assert!(!access.retryable);
    }

    #[test]
    fn reset_restores_retryable_after_failure() {
        let aggregator = DeviceStateAggregator::new(record(true));
        aggregator.set_api_accessibility(false, false, Some("credentials rejected".into()));
        aggregator.set_host_state(HostState::Failed, "credentials rejected");

        aggregator.reset_connection_state();

        assert!(aggregator.retry_permitted());
        assert_eq!(aggregator.host_state().category, ReachabilityCategory::Searching);
    }

    #[test]
    fn device_status_maps_labels() {
        let aggregator = DeviceStateAggregator::new(record(true));

        assert_eq!(
            aggregator.apply_device_status("Operational"),
            ReachabilityCategory::Idle
        );
        assert_eq!(
            aggregator.apply_device_status("Printing"),
            ReachabilityCategory::Active
        );
        assert_eq!(
            aggregator.apply_device_status("Offline after error"),
            ReachabilityCategory::Error
        );
        assert_eq!(aggregator.host_state().description, "Offline after error");
    }

    #[test]
    fn device_status_keeps_permanent_failure_visible() {
        let aggregator = DeviceStateAggregator::new(record(true));
        aggregator.set_api_accessibility(false, false, Some("credentials rejected".into()));
        aggregator.set_host_state(HostState::Failed, "credentials rejected");

        assert_eq!(
            aggregator.apply_device_status("Operational"),
            ReachabilityCategory::Error
        );

        let host = aggregator.host_state();
        assert_eq!(host.state, HostState::Failed);
        assert_eq!(host.description, "credentials rejected");

        aggregator.reset_connection_state();
        assert_eq!(
            aggregator.apply_device_status("Operational"),
            ReachabilityCategory::Idle
        );
    }

    #[test]
    fn unknown_status_falls_back_to_active() {
        let aggregator = DeviceStateAggregator::new(record(true));
        assert_eq!(
            aggregator.apply_device_status("Calibrating flux capacitor"),
            ReachabilityCategory::Active
        );
        assert_eq!(aggregator.host_state().state, HostState::Online);
    }

    #[test]
    fn snapshot_includes_adapter_state() {
        let aggregator = DeviceStateAggregator::new(record(true));
        assert_eq!(aggregator.snapshot().socket_state, None);

        aggregator.bind_adapter(adapter()).unwrap();
        let snapshot = aggregator.snapshot();
        assert_eq!(snapshot.socket_state, Some(SocketState::Unopened));
        assert_eq!(snapshot.api_state, Some(ApiState::Unset));

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["socketState"], "unopened");
        assert_eq!(json["host"]["category"], "searching");
    }
}
