// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fleet orchestrator keeping one adapter per enabled device.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::adapter::{ApiState, OctoPrintAdapter, SocketState};
use crate::cache::{DiffCache, Diffs};
use crate::error::{AdapterError, Error, ManagerError};
use crate::event::{BusMessage, DeviceId, EventBus, FleetEvent, SOCKET_CLOSED, SOCKET_ERROR};
use crate::protocol::{LoginDescriptor, LoginTransport};
use crate::tasks::SilencedLogger;

use super::aggregator::{DeviceSnapshot, DeviceStateAggregator, HostState};
use super::config::{DeviceRecord, FleetConfig};
use super::registry::{DeviceRegistry, RegistryEvent};

/// Push frame carrying the device's current status.
const CURRENT_FRAME: &str = "octoprint.current";
/// Push frame sent once after connecting, same shape as `current`.
const HISTORY_FRAME: &str = "octoprint.history";

type DeviceMap = HashMap<DeviceId, Arc<DeviceStateAggregator>>;

/// Outcome of one [`FleetManager::reconnect_sweep`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    /// Devices whose session was reauthenticated.
    pub reauth_attempted: usize,
    /// Devices whose session was set up and socket opened.
    pub setup_attempted: usize,
    /// Socket states of all bound adapters after the sweep.
    pub socket_state_histogram: BTreeMap<SocketState, usize>,
    /// API states of all bound adapters after the sweep.
    pub api_state_histogram: BTreeMap<ApiState, usize>,
    /// Devices with a failed attempt in this sweep.
    pub failed_device_ids: Vec<DeviceId>,
}

/// Outcome of one [`FleetManager::heartbeat`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatReport {
    /// Sockets pinged.
    pub pinged: usize,
    /// Devices whose ping failed.
    pub failed_device_ids: Vec<DeviceId>,
}

/// Result of a successful ephemeral test connection.
#[derive(Debug, Clone, PartialEq)]
pub struct TestConnectionReport {
    /// Generated id of the throwaway adapter.
    pub device_id: DeviceId,
    /// Socket state when the attempt finished.
    pub socket_state: SocketState,
    /// API state when the attempt finished.
    pub api_state: ApiState,
    /// Lifecycle events seen during the attempt.
    pub lifecycle_events: Vec<FleetEvent>,
}

/// Orchestrator keeping the adapter set consistent with the device
/// registry.
///
/// The manager exclusively owns the device map; every create, update and
/// delete goes through its methods. Sweeps, heartbeats and reaping operate
/// on a snapshot of the map and run per-device work concurrently, so one
/// slow device bounds the latency of a tick instead of the sum of all.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use octofleet_lib::event::EventBus;
/// use octofleet_lib::manager::{DeviceRecord, FleetConfig, FleetManager};
/// use octofleet_lib::protocol::{LoginDescriptor, OctoPrintHttpClient};
///
/// #[tokio::main]
/// async fn main() -> octofleet_lib::Result<()> {
///     let bus = EventBus::new();
///     bus.on("octoprint.current", |_, event| {
///         println!("{}: {}", event.device_id, event.payload["state"]["text"]);
///     });
///
///     let manager = FleetManager::new(
///         Arc::new(OctoPrintHttpClient::new()?),
///         bus,
///         FleetConfig::default(),
///     );
///     manager
///         .create_or_update(DeviceRecord::new(
///             "printer-1",
///             LoginDescriptor::new("http://192.168.1.20", "api-key"),
///         ))
///         .await?;
///
///     let report = manager.reconnect_sweep().await;
///     println!("{report:?}");
///     Ok(())
/// }
/// ```
pub struct FleetManager {
    devices: Arc<RwLock<DeviceMap>>,
    transport: Arc<dyn LoginTransport>,
    bus: EventBus,
    config: FleetConfig,
    diffs: Mutex<DiffCache<DeviceId, DeviceSnapshot>>,
    failure_logs: Mutex<HashMap<DeviceId, SilencedLogger>>,
    status_listener: Mutex<Option<JoinHandle<()>>>,
}

impl FleetManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new(transport: Arc<dyn LoginTransport>, bus: EventBus, config: FleetConfig) -> Self {
        Self {
            devices: Arc::new(RwLock::new(HashMap::new())),
            transport,
            bus,
            config,
            diffs: Mutex::new(DiffCache::new()),
            failure_logs: Mutex::new(HashMap::new()),
            status_listener: Mutex::new(None),
        }
    }

    /// Creates a manager using the `reqwest` login client.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be created.
    #[cfg(feature = "http")]
    pub fn with_http(
        http: crate::protocol::HttpConfig,
        bus: EventBus,
        config: FleetConfig,
    ) -> Result<Self, Error> {
        let transport = http.into_client()?;
        Ok(Self::new(Arc::new(transport), bus, config))
    }

    /// Returns the shared event bus.
    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Returns all device ids, sorted.
    pub async fn device_ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<_> = self.devices.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Returns the number of known devices.
    pub async fn device_count(&self) -> usize {
        self.devices.read().await.len()
    }

    /// Returns true if the device is known.
    pub async fn contains(&self, id: &DeviceId) -> bool {
        self.devices.read().await.contains_key(id)
    }

    /// Returns the aggregator of a device.
    pub async fn aggregator(&self, id: &DeviceId) -> Option<Arc<DeviceStateAggregator>> {
        self.devices.read().await.get(id).cloned()
    }

    /// Returns the bound adapter of a device.
    pub async fn adapter(&self, id: &DeviceId) -> Option<Arc<OctoPrintAdapter>> {
        self.aggregator(id).await.and_then(|a| a.adapter())
    }

    /// Returns a snapshot of a device.
    pub async fn snapshot(&self, id: &DeviceId) -> Option<DeviceSnapshot> {
        self.aggregator(id).await.map(|a| a.snapshot())
    }

    async fn aggregators(&self) -> Vec<Arc<DeviceStateAggregator>> {
        self.devices.read().await.values().cloned().collect()
    }

    // =========================================================================
    // Registry events
    // =========================================================================

    /// Creates or replaces a device.
    ///
    /// A disabled device loses its adapter. An enabled one always gets a
    /// fresh adapter with the new credentials; a previous adapter is closed
    /// first so no adapter ever keeps stale credentials. Either way the
    /// connection state is reset.
    ///
    /// # Errors
    ///
    /// Fails if the login URL cannot be turned into a socket URL. The
    /// record is still stored, marked as permanently failed.
    pub async fn create_or_update(&self, record: DeviceRecord) -> Result<(), Error> {
        self.ensure_status_listener();

        let id = record.id.clone();
        let enabled = record.enabled;
        let adapter = enabled.then(|| self.build_adapter(&record));

        let aggregator = {
            let mut devices = self.devices.write().await;
            let aggregator = match devices.get(&id) {
                Some(existing) => {
                    existing.replace_record(record);
                    existing.reset_adapter();
                    Arc::clone(existing)
                }
                None => {
                    let aggregator = Arc::new(DeviceStateAggregator::new(record));
                    devices.insert(id.clone(), Arc::clone(&aggregator));
                    aggregator
                }
            };
            aggregator.reset_connection_state();
            aggregator
        };
        self.failure_logs.lock().remove(&id);

        let result = match adapter {
            Some(Ok(adapter)) => aggregator.bind_adapter(adapter).map_err(Error::from),
            Some(Err(e)) => {
                tracing::warn!(device_id = %id, error = %e, "Cannot create adapter for device");
                aggregator.set_api_accessibility(false, false, Some(e.to_string()));
                aggregator.set_host_state(HostState::Failed, e.to_string());
                Err(e.into())
            }
            None => Ok(()),
        };

        self.diffs.lock().set_value(id.clone(), aggregator.snapshot());
        if result.is_ok() {
            tracing::info!(device_id = %id, enabled, "Device created or updated");
        }
        result
    }

    /// Closes and discards the adapters of the given devices.
    ///
    /// Returns how many of the ids were known.
    pub async fn handle_deleted(&self, ids: &[DeviceId]) -> usize {
        let removed: Vec<_> = {
            let mut devices = self.devices.write().await;
            ids.iter().filter_map(|id| devices.remove(id)).collect()
        };

        let mut diffs = self.diffs.lock();
        let mut logs = self.failure_logs.lock();
        for aggregator in &removed {
            aggregator.tear_down();
            diffs.delete_value(aggregator.id());
            logs.remove(aggregator.id());
            tracing::info!(device_id = %aggregator.id(), "Device removed");
        }
        removed.len()
    }

    /// Dispatches a registry change notification.
    ///
    /// Batch creations are applied per record; a bad record is logged and
    /// does not stop the others.
    ///
    /// # Errors
    ///
    /// Returns the failure of a single created or updated record.
    pub async fn handle_registry_event(&self, event: RegistryEvent) -> Result<(), Error> {
        match event {
            RegistryEvent::Created(record) | RegistryEvent::Updated(record) => {
                self.create_or_update(record).await
            }
            RegistryEvent::Deleted(ids) => {
                self.handle_deleted(&ids).await;
                Ok(())
            }
            RegistryEvent::BatchCreated(records) => {
                self.create_all(records).await;
                Ok(())
            }
        }
    }

    /// Loads every device from the registry.
    ///
    /// Returns the number of records applied without error.
    ///
    /// # Errors
    ///
    /// Returns error if the registry cannot be listed.
    pub async fn load_from_registry(&self, registry: &dyn DeviceRegistry) -> Result<usize, Error> {
        let records = registry.list().await?;
        let total = records.len();
        let loaded = self.create_all(records).await;
        tracing::info!(loaded, total, "Loaded devices from registry");
        Ok(loaded)
    }

    async fn create_all(&self, records: Vec<DeviceRecord>) -> usize {
        let mut applied = 0;
        for record in records {
            let id = record.id.clone();
            match self.create_or_update(record).await {
                Ok(()) => applied += 1,
                Err(e) => tracing::warn!(device_id = %id, error = %e, "Skipping device record"),
            }
        }
        applied
    }

    /// Resets a device's accessibility and adapter so the next sweep
    /// connects it from scratch.
    ///
    /// # Errors
    ///
    /// Fails if the device is unknown.
    pub async fn reconnect(&self, id: &DeviceId) -> Result<(), Error> {
        let aggregator = self
            .aggregator(id)
            .await
            .ok_or_else(|| ManagerError::DeviceNotFound(id.to_string()))?;

        aggregator.reset_connection_state();
        if let Some(adapter) = aggregator.adapter() {
            adapter.reset_socket_state();
        }
        self.failure_logs.lock().remove(id);
        tracing::info!(device_id = %id, "Manual reconnect requested");
        Ok(())
    }

    // =========================================================================
    // Periodic work
    // =========================================================================

    /// Runs one reconnection sweep.
    ///
    /// Phase one reauthenticates every device that asked for it. Once all
    /// reauths settled, phase two sets up and opens every device that needs
    /// a (re)connection. Both phases run all devices concurrently and wait
    /// for the whole batch; a failing device never aborts the sweep.
    pub async fn reconnect_sweep(&self) -> SweepReport {
        let aggregators = self.aggregators().await;
        let mut report = SweepReport::default();

        let reauth: Vec<_> = aggregators
            .iter()
            .filter(|aggregator| aggregator.retry_permitted())
            .filter_map(|aggregator| {
                let adapter = aggregator.adapter()?;
                (adapter.needs_reauth() && adapter.has_socket()).then_some((aggregator, adapter))
            })
            .collect();
        report.reauth_attempted = reauth.len();

        let results = join_all(reauth.iter().map(|(aggregator, adapter)| async move {
            (*aggregator, adapter.reauth_session().await)
        }))
        .await;
        for (aggregator, result) in results {
            if let Err(e) = result {
                report.failed_device_ids.push(aggregator.id().clone());
                self.record_failure(aggregator, "reauth", &e);
            } else {
                self.record_success(aggregator);
            }
        }

        let setup: Vec<_> = aggregators
            .iter()
            .filter_map(|aggregator| {
                let adapter = aggregator.adapter()?;
                wants_connect(aggregator, &adapter).then_some((aggregator, adapter))
            })
            .collect();
        report.setup_attempted = setup.len();

        let results = join_all(setup.iter().map(|(aggregator, adapter)| async move {
            (*aggregator, connect_device(aggregator, adapter).await)
        }))
        .await;
        for (aggregator, result) in results {
            if let Err(e) = result {
                if !report.failed_device_ids.contains(aggregator.id()) {
                    report.failed_device_ids.push(aggregator.id().clone());
                }
                self.record_failure(aggregator, "connect", &e);
            } else {
                self.record_success(aggregator);
            }
        }

        for adapter in aggregators.iter().filter_map(|a| a.adapter()) {
            *report
                .socket_state_histogram
                .entry(adapter.socket_state())
                .or_default() += 1;
            *report
                .api_state_histogram
                .entry(adapter.api_state())
                .or_default() += 1;
        }
        report.failed_device_ids.sort();

        tracing::debug!(
            reauth = report.reauth_attempted,
            setup = report.setup_attempted,
            failed = report.failed_device_ids.len(),
            "Reconnect sweep finished"
        );
        report
    }

    /// Pings every connected socket.
    ///
    /// A failed ping moves the socket to `error`; the next sweep reopens it.
    pub async fn heartbeat(&self) -> HeartbeatReport {
        let targets: Vec<_> = self
            .aggregators()
            .await
            .into_iter()
            .filter_map(|aggregator| {
                let adapter = aggregator.adapter()?;
                (adapter.has_socket() && adapter.socket_state().is_connected())
                    .then_some((aggregator, adapter))
            })
            .collect();

        let results = join_all(
            targets
                .iter()
                .map(|(aggregator, adapter)| async move { (aggregator, adapter.ping().await) }),
        )
        .await;

        let mut report = HeartbeatReport {
            pinged: targets.len(),
            failed_device_ids: Vec::new(),
        };
        for (aggregator, result) in results {
            if let Err(e) = result {
                report.failed_device_ids.push(aggregator.id().clone());
                aggregator.set_host_state(HostState::Offline, "heartbeat failed");
                self.log_transient(aggregator, "heartbeat", &e);
            }
        }
        report.failed_device_ids.sort();
        report
    }

    /// Closes and resets every socket silent for longer than `threshold`.
    ///
    /// Returns the ids of the reset devices. Their adapters need a fresh
    /// setup afterwards.
    pub async fn reap_stale_connections(&self, threshold: Duration) -> Vec<DeviceId> {
        let mut reaped = Vec::new();
        for aggregator in self.aggregators().await {
            let Some(adapter) = aggregator.adapter() else {
                continue;
            };
            if !adapter.has_socket() {
                continue;
            }
            let Some(age) = adapter.last_message_age() else {
                continue;
            };
            if age <= threshold {
                continue;
            }

            tracing::warn!(
                device_id = %aggregator.id(),
                silent_for_ms = u64::try_from(age.as_millis()).unwrap_or(u64::MAX),
                "Resetting stale connection"
            );
            adapter.reset_socket_state();
            aggregator.set_host_state(
                HostState::Offline,
                format!("no messages for {}s", age.as_secs()),
            );
            reaped.push(aggregator.id().clone());
        }
        reaped.sort();
        reaped
    }

    /// Returns the snapshot changes since the previous call.
    pub async fn flush_state_diffs(&self) -> Diffs<DeviceId, DeviceSnapshot> {
        let aggregators = self.aggregators().await;
        let mut cache = self.diffs.lock();
        for aggregator in aggregators {
            let snapshot = aggregator.snapshot();
            if cache.get_value(aggregator.id()) != Some(&snapshot) {
                cache.set_value(aggregator.id().clone(), snapshot);
            }
        }
        cache.flush_diffs()
    }

    // =========================================================================
    // Test connections
    // =========================================================================

    /// Validates not-yet-saved credentials with a throwaway adapter.
    ///
    /// The attempt races against `deadline`. Whatever finishes first, the
    /// temporary bus handler is removed and the adapter closed before
    /// returning.
    ///
    /// # Errors
    ///
    /// Returns the login or socket failure, or [`Error::Timeout`] if the
    /// deadline passed first.
    pub async fn setup_test_connection(
        &self,
        login: LoginDescriptor,
        deadline: Duration,
    ) -> Result<TestConnectionReport, Error> {
        let device_id = DeviceId::ephemeral();
        let adapter = Arc::new(
            OctoPrintAdapter::new(Arc::clone(&self.transport), self.bus.clone())
                .with_throttle(self.config.throttle),
        );
        adapter.register_credentials(device_id.clone(), login, self.config.socket_scheme)?;

        let events = Arc::new(Mutex::new(Vec::new()));
        let subscription = {
            let events = Arc::clone(&events);
            let device_id = device_id.clone();
            self.bus.on("adapter.*", move |_, event| {
                if event.device_id == device_id {
                    events.lock().push(event.clone());
                }
            })
        };

        let attempt = async {
            adapter.setup_socket_session().await?;
            adapter.open().await
        };
        let outcome = tokio::time::timeout(deadline, attempt).await;

        self.bus.off(subscription);
        let socket_state = adapter.socket_state();
        let api_state = adapter.api_state();
        adapter.close();
        let lifecycle_events = std::mem::take(&mut *events.lock());

        match outcome {
            Ok(Ok(())) => {
                tracing::debug!(%device_id, "Test connection succeeded");
                Ok(TestConnectionReport {
                    device_id,
                    socket_state,
                    api_state,
                    lifecycle_events,
                })
            }
            Ok(Err(e)) => {
                tracing::debug!(%device_id, error = %e, "Test connection failed");
                Err(e)
            }
            Err(_) => {
                tracing::debug!(%device_id, "Test connection timed out");
                Err(Error::Timeout(
                    u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
                ))
            }
        }
    }

    /// Like [`setup_test_connection`](Self::setup_test_connection) with the
    /// configured deadline.
    ///
    /// # Errors
    ///
    /// See [`setup_test_connection`](Self::setup_test_connection).
    pub async fn test_connection(&self, login: LoginDescriptor) -> Result<TestConnectionReport, Error> {
        self.setup_test_connection(login, self.config.test_connection_deadline)
            .await
    }

    /// Closes every adapter and stops the status listener.
    pub async fn shutdown(&self) {
        if let Some(listener) = self.status_listener.lock().take() {
            listener.abort();
        }
        for aggregator in self.aggregators().await {
            if let Some(adapter) = aggregator.adapter() {
                adapter.close();
            }
        }
        tracing::info!("Fleet manager shut down");
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn build_adapter(&self, record: &DeviceRecord) -> Result<Arc<OctoPrintAdapter>, AdapterError> {
        let adapter = OctoPrintAdapter::new(Arc::clone(&self.transport), self.bus.clone())
            .with_throttle(self.config.throttle);
        adapter.register_credentials(
            record.id.clone(),
            record.login.clone(),
            self.config.socket_scheme,
        )?;
        Ok(Arc::new(adapter))
    }

    fn record_success(&self, aggregator: &DeviceStateAggregator) {
        aggregator.set_api_accessibility(true, true, None);
        aggregator.set_host_state(HostState::Online, "connected");

        let recovered = self
            .failure_logs
            .lock()
            .get_mut(aggregator.id())
            .is_some_and(SilencedLogger::record_success);
        if recovered {
            tracing::info!(device_id = %aggregator.id(), "Device recovered");
        }
    }

    fn record_failure(&self, aggregator: &DeviceStateAggregator, phase: &str, error: &Error) {
        match error {
            Error::Api(api) if !api.is_retryable() => {
                aggregator.set_api_accessibility(false, false, Some(api.reason().to_string()));
                aggregator.set_host_state(HostState::Failed, api.reason());
                if let Some(adapter) = aggregator.adapter() {
                    adapter.close();
                }
                tracing::warn!(
                    device_id = %aggregator.id(),
                    phase,
                    error = %api,
                    "Device failed permanently, not retrying until reset"
                );
            }
            Error::Api(api) => {
                aggregator.set_api_accessibility(false, true, Some(api.reason().to_string()));
                aggregator.set_host_state(HostState::Offline, api.reason());
                self.log_transient(aggregator, phase, error);
            }
            other => {
                aggregator.set_host_state(HostState::Offline, other.to_string());
                self.log_transient(aggregator, phase, error);
            }
        }
    }

    fn log_transient(&self, aggregator: &DeviceStateAggregator, phase: &str, error: &Error) {
        let (warn, consecutive) = {
            let mut logs = self.failure_logs.lock();
            let logger = logs
                .entry(aggregator.id().clone())
                .or_insert_with(|| SilencedLogger::new(self.config.silence));
            (logger.record_failure(), logger.consecutive_failures())
        };

        if warn {
            tracing::warn!(device_id = %aggregator.id(), phase, consecutive, error = %error, "Device still failing");
        } else {
            tracing::debug!(device_id = %aggregator.id(), phase, consecutive, error = %error, "Device failure");
        }
    }

    /// Spawns the task that feeds device status frames into aggregators.
    fn ensure_status_listener(&self) {
        let mut slot = self.status_listener.lock();
        if slot.as_ref().is_some_and(|listener| !listener.is_finished()) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let mut rx = self.bus.subscribe();
        let devices = Arc::clone(&self.devices);
        *slot = Some(runtime.spawn(async move {
            tracing::debug!("Starting device status listener");
            loop {
                match rx.recv().await {
                    Ok(message) => apply_bus_message(&devices, &message).await,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Device status listener lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }));
    }
}

impl Drop for FleetManager {
    fn drop(&mut self) {
        if let Some(listener) = self.status_listener.get_mut().take() {
            listener.abort();
        }
    }
}

impl std::fmt::Debug for FleetManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FleetManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Sweep eligibility.
///
/// Beyond [`DeviceStateAggregator::should_retry_connect`], a responding
/// device whose socket failed is reopened, and so is a socket stuck in
/// `error` after a transient login failure.
fn wants_connect(aggregator: &DeviceStateAggregator, adapter: &OctoPrintAdapter) -> bool {
    if aggregator.should_retry_connect() {
        return true;
    }
    aggregator.retry_permitted()
        && (adapter.needs_reopen() || adapter.socket_state() == SocketState::Error)
}

async fn connect_device(
    aggregator: &DeviceStateAggregator,
    adapter: &Arc<OctoPrintAdapter>,
) -> Result<(), Error> {
    adapter.setup_socket_session().await?;
    adapter.open().await?;

    // The device may have been updated or deleted while we were connecting.
    let still_bound = aggregator
        .adapter()
        .is_some_and(|bound| Arc::ptr_eq(&bound, adapter));
    if !still_bound {
        adapter.close();
    }
    Ok(())
}

async fn apply_bus_message(devices: &RwLock<DeviceMap>, message: &BusMessage) {
    let Some(aggregator) = devices
        .read()
        .await
        .get(&message.event.device_id)
        .cloned()
    else {
        return;
    };

    match message.name.as_str() {
        CURRENT_FRAME | HISTORY_FRAME => {
            if let Some(label) = message
                .event
                .payload
                .pointer("/state/text")
                .and_then(Value::as_str)
            {
                aggregator.apply_device_status(label);
            }
        }
        SOCKET_ERROR if aggregator.retry_permitted() => {
            aggregator.set_host_state(HostState::Offline, "socket error");
        }
        SOCKET_CLOSED
            if aggregator.retry_permitted() && message.event.payload["initiator"] == "remote" =>
        {
            aggregator.set_host_state(HostState::Offline, "connection closed by device");
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiError;
    use crate::manager::ReachabilityCategory;
    use crate::protocol::LoginResponse;
    use futures_util::FutureExt;
    use futures_util::future::BoxFuture;

    #[derive(Clone, Copy)]
    enum Behavior {
        Offline,
        GlobalKey,
        Rejected,
        Hang,
    }

    /// Login transport answering per base URL.
    struct FakeTransport {
        behaviors: HashMap<String, Behavior>,
    }

    impl FakeTransport {
        fn new(behaviors: &[(&str, Behavior)]) -> Arc<Self> {
            Arc::new(Self {
                behaviors: behaviors
                    .iter()
                    .map(|(url, b)| ((*url).to_string(), *b))
                    .collect(),
            })
        }
    }

    impl LoginTransport for FakeTransport {
        fn login<'a>(
            &'a self,
            login: &'a LoginDescriptor,
        ) -> BoxFuture<'a, Result<LoginResponse, ApiError>> {
            let behavior = self
                .behaviors
                .get(&login.base_url)
                .copied()
                .unwrap_or(Behavior::Offline);
            async move {
                match behavior {
                    Behavior::Offline => Err(ApiError::NoResponse("refused".into())),
                    Behavior::GlobalKey => Ok(LoginResponse {
                        name: "_api".into(),
                        session: Some("s".into()),
                        groups: vec![],
                    }),
                    Behavior::Rejected => Err(ApiError::CredentialRejected),
                    Behavior::Hang => futures_util::future::pending().await,
                }
            }
            .boxed()
        }

        fn admin_username<'a>(
            &'a self,
            _login: &'a LoginDescriptor,
        ) -> BoxFuture<'a, Result<String, ApiError>> {
            async { Ok("admin".to_string()) }.boxed()
        }
    }

    fn manager(transport: Arc<FakeTransport>) -> FleetManager {
        FleetManager::new(transport, EventBus::new(), FleetConfig::default())
    }

    fn record(id: &str, url: &str) -> DeviceRecord {
        DeviceRecord::new(id, LoginDescriptor::new(url, "key"))
    }

    #[tokio::test]
    async fn new_manager_is_empty() {
        let manager = manager(FakeTransport::new(&[]));
        assert_eq!(manager.device_count().await, 0);
        assert_eq!(manager.reconnect_sweep().await, SweepReport::default());
    }

    #[tokio::test]
    async fn create_binds_unopened_adapter() {
        let manager = manager(FakeTransport::new(&[]));
        manager.create_or_update(record("a", "http://a")).await.unwrap();

        let adapter = manager.adapter(&DeviceId::from("a")).await.unwrap();
        assert_eq!(adapter.socket_state(), SocketState::Unopened);
        assert!(adapter.needs_setup());
    }

    #[tokio::test]
    async fn update_replaces_adapter_and_credentials() {
        let manager = manager(FakeTransport::new(&[]));
        manager.create_or_update(record("a", "http://a")).await.unwrap();
        let first = manager.adapter(&DeviceId::from("a")).await.unwrap();

        manager
            .create_or_update(record("a", "https://a.example"))
            .await
            .unwrap();
        let second = manager.adapter(&DeviceId::from("a")).await.unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.socket_url().unwrap().scheme(), "wss");
        assert_eq!(manager.device_count().await, 1);
    }

    #[tokio::test]
    async fn disabling_drops_the_adapter() {
        let manager = manager(FakeTransport::new(&[]));
        manager.create_or_update(record("a", "http://a")).await.unwrap();

        manager
            .create_or_update(record("a", "http://a").with_enabled(false))
            .await
            .unwrap();

        let aggregator = manager.aggregator(&DeviceId::from("a")).await.unwrap();
        assert!(aggregator.adapter().is_none());
        assert_eq!(aggregator.host_state().state, HostState::Disabled);
        assert_eq!(manager.reconnect_sweep().await.setup_attempted, 0);
    }

    #[tokio::test]
    async fn invalid_url_is_stored_as_failed() {
        let manager = manager(FakeTransport::new(&[]));
        let err = manager
            .create_or_update(record("a", "ftp://a"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Adapter(AdapterError::InvalidUrl(_))));
        let aggregator = manager.aggregator(&DeviceId::from("a")).await.unwrap();
        assert_eq!(aggregator.host_state().state, HostState::Failed);
        assert!(!aggregator.retry_permitted());
    }

    #[tokio::test]
    async fn offline_device_is_retried_every_sweep() {
        let manager = manager(FakeTransport::new(&[("http://a", Behavior::Offline)]));
        manager.create_or_update(record("a", "http://a")).await.unwrap();

        for _ in 0..3 {
            let report = manager.reconnect_sweep().await;
            assert_eq!(report.setup_attempted, 1);
            assert_eq!(report.failed_device_ids, vec![DeviceId::from("a")]);
            assert_eq!(report.api_state_histogram.get(&ApiState::NoResponse), Some(&1));
        }

        let aggregator = manager.aggregator(&DeviceId::from("a")).await.unwrap();
        assert_eq!(aggregator.host_state().state, HostState::Offline);
        assert!(aggregator.should_retry_connect());
    }

    #[tokio::test]
    async fn global_key_device_is_never_retried() {
        let manager = manager(FakeTransport::new(&[("http://b", Behavior::GlobalKey)]));
        manager.create_or_update(record("b", "http://b")).await.unwrap();

        let first = manager.reconnect_sweep().await;
        assert_eq!(first.setup_attempted, 1);

        let adapter = manager.adapter(&DeviceId::from("b")).await.unwrap();
        assert_eq!(adapter.api_state(), ApiState::GlobalKey);
        assert_eq!(adapter.socket_state(), SocketState::Aborted);

        let aggregator = manager.aggregator(&DeviceId::from("b")).await.unwrap();
        assert!(!aggregator.should_retry_connect());
        assert_eq!(
            aggregator.host_state().description,
            "shared/global credential detected"
        );

        let second = manager.reconnect_sweep().await;
        assert_eq!(second.setup_attempted, 0);
        assert!(second.failed_device_ids.is_empty());
    }

    #[tokio::test]
    async fn failures_are_isolated_per_device() {
        let manager = manager(FakeTransport::new(&[
            ("http://a", Behavior::Offline),
            ("http://b", Behavior::Rejected),
        ]));
        manager.create_or_update(record("a", "http://a")).await.unwrap();
        manager.create_or_update(record("b", "http://b")).await.unwrap();

        let report = manager.reconnect_sweep().await;

        assert_eq!(report.setup_attempted, 2);
        assert_eq!(
            report.failed_device_ids,
            vec![DeviceId::from("a"), DeviceId::from("b")]
        );
        assert_eq!(report.socket_state_histogram.get(&SocketState::Aborted), Some(&1));
        assert_eq!(report.socket_state_histogram.get(&SocketState::Unopened), Some(&1));
    }

    #[tokio::test]
    async fn manual_reconnect_clears_permanent_failure() {
        let manager = manager(FakeTransport::new(&[("http://b", Behavior::Rejected)]));
        manager.create_or_update(record("b", "http://b")).await.unwrap();
        manager.reconnect_sweep().await;
        let id = DeviceId::from("b");
        assert!(!manager.aggregator(&id).await.unwrap().should_retry_connect());

        manager.reconnect(&id).await.unwrap();

        assert!(manager.aggregator(&id).await.unwrap().should_retry_connect());
        assert!(manager.adapter(&id).await.unwrap().needs_setup());
    }

    #[tokio::test]
    async fn reconnect_unknown_device_fails() {
        let manager = manager(FakeTransport::new(&[]));
        let err = manager.reconnect(&DeviceId::from("nope")).await.unwrap_err();
        assert!(matches!(err, Error::Manager(ManagerError::DeviceNotFound(_))));
    }

    #[tokio::test]
    async fn deleted_device_is_forgotten() {
        let manager = manager(FakeTransport::new(&[]));
        manager.create_or_update(record("c", "http://c")).await.unwrap();
        let aggregator = manager.aggregator(&DeviceId::from("c")).await.unwrap();

        let removed = manager
            .handle_deleted(&[DeviceId::from("c"), DeviceId::from("unknown")])
            .await;

        assert_eq!(removed, 1);
        assert!(!manager.contains(&DeviceId::from("c")).await);
        assert!(aggregator.is_marked_for_removal());
        assert!(!aggregator.should_retry_connect());
        assert_eq!(manager.reconnect_sweep().await, SweepReport::default());
    }

    #[tokio::test]
    async fn registry_events_are_dispatched() {
        let manager = manager(FakeTransport::new(&[]));
        manager
            .handle_registry_event(RegistryEvent::BatchCreated(vec![
                record("a", "http://a"),
                record("bad", "ftp://bad"),
                record("b", "http://b"),
            ]))
            .await
            .unwrap();
        assert_eq!(manager.device_count().await, 3);

        manager
            .handle_registry_event(RegistryEvent::Deleted(vec![DeviceId::from("a")]))
            .await
            .unwrap();
        assert_eq!(
            manager.device_ids().await,
            vec![DeviceId::from("b"), DeviceId::from("bad")]
        );
    }

    #[tokio::test]
    async fn load_from_registry_counts_applied_records() {
        struct StaticRegistry(Vec<DeviceRecord>);

        impl DeviceRegistry for StaticRegistry {
            fn list(&self) -> BoxFuture<'_, Result<Vec<DeviceRecord>, Error>> {
                let records = self.0.clone();
                async move { Ok(records) }.boxed()
            }
        }

        let manager = manager(FakeTransport::new(&[]));
        let registry = StaticRegistry(vec![record("a", "http://a"), record("x", "nope")]);

        assert_eq!(manager.load_from_registry(&registry).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn state_diffs_track_changes() {
        let manager = manager(FakeTransport::new(&[("http://a", Behavior::Offline)]));
        manager.create_or_update(record("a", "http://a")).await.unwrap();

        let first = manager.flush_state_diffs().await;
        assert_eq!(first.updated.len(), 1);
        assert!(manager.flush_state_diffs().await.is_empty());

        manager.reconnect_sweep().await;
        let after_sweep = manager.flush_state_diffs().await;
        assert_eq!(after_sweep.updated.len(), 1);
        assert_eq!(after_sweep.updated[0].1.api_state, Some(ApiState::NoResponse));

        manager.handle_deleted(&[DeviceId::from("a")]).await;
        let after_delete = manager.flush_state_diffs().await;
        assert_eq!(after_delete.deleted, vec![DeviceId::from("a")]);
        assert!(after_delete.updated.is_empty());
    }

    #[tokio::test]
    async fn status_frames_update_host_category() {
        let manager = manager(FakeTransport::new(&[]));
        manager.create_or_update(record("a", "http://a")).await.unwrap();
        let adapter = manager.adapter(&DeviceId::from("a")).await.unwrap();

        adapter.on_message(r#"{"current": {"state": {"text": "Printing"}}}"#);

        let aggregator = manager.aggregator(&DeviceId::from("a")).await.unwrap();
        for _ in 0..50 {
            if aggregator.host_state().category == ReachabilityCategory::Active {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("status frame was not applied");
    }

    #[tokio::test]
    async fn late_status_frame_keeps_permanent_failure() {
        let manager = manager(FakeTransport::new(&[("http://b", Behavior::Rejected)]));
        manager.create_or_update(record("b", "http://b")).await.unwrap();
        manager.create_or_update(record("a", "http://a")).await.unwrap();
        manager.reconnect_sweep().await;
        let failed = manager.aggregator(&DeviceId::from("b")).await.unwrap();
        let healthy = manager.aggregator(&DeviceId::from("a")).await.unwrap();
        assert_eq!(failed.host_state().state, HostState::Failed);

        failed
            .adapter()
            .unwrap()
            .on_message(r#"{"current": {"state": {"text": "Operational"}}}"#);
        // The listener handles frames in order, so once the second device's
        // frame landed the first one was applied too.
        healthy
            .adapter()
            .unwrap()
            .on_message(r#"{"current": {"state": {"text": "Printing"}}}"#);
        for _ in 0..50 {
            if healthy.host_state().category == ReachabilityCategory::Active {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(healthy.host_state().category, ReachabilityCategory::Active);

        let host = failed.host_state();
        assert_eq!(host.state, HostState::Failed);
        assert_eq!(host.category, ReachabilityCategory::Error);
        assert_eq!(host.description, "credentials rejected");
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_times_out_and_cleans_up() {
        let manager = manager(FakeTransport::new(&[("http://slow", Behavior::Hang)]));
        let handlers_before = manager.bus().handler_count();

        let started = tokio::time::Instant::now();
        let err = manager
            .setup_test_connection(
                LoginDescriptor::new("http://slow", "k"),
                Duration::from_millis(500),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Timeout(500)));
        assert!(started.elapsed() < Duration::from_millis(600));
        assert_eq!(manager.bus().handler_count(), handlers_before);
        assert_eq!(manager.device_count().await, 0);
    }

    #[tokio::test]
    async fn test_connection_reports_login_failure() {
        let manager = manager(FakeTransport::new(&[("http://b", Behavior::GlobalKey)]));

        let err = manager
            .setup_test_connection(LoginDescriptor::new("http://b", "k"), Duration::from_secs(1))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Api(ApiError::SharedCredential(_))));
        assert_eq!(manager.bus().handler_count(), 0);
    }
}
