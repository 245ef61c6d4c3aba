// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-device OctoPrint protocol client.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::error::{AdapterError, ApiError, Error};
use crate::event::{
    API_STATE_CHANGED, DeviceId, EventBus, FleetEvent, REAUTH_REQUIRED, SOCKET_CLOSED,
    SOCKET_ERROR, SOCKET_OPENED, SOCKET_STATE_CHANGED, frame_event_name,
};
use crate::protocol::{LoginDescriptor, LoginTransport};

use super::state::{ApiState, SocketScheme, SocketState};

/// Path of the push channel below the device's base URL.
const SOCKET_PATH: &str = "sockjs/websocket";

/// Default throttle multiplier sent after authenticating.
pub const DEFAULT_THROTTLE: u32 = 2;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// A live transport. Dropping the sink and aborting the reader tears it down.
struct SocketHandle {
    sink: Arc<tokio::sync::Mutex<WsSink>>,
    reader: Option<JoinHandle<()>>,
    generation: u64,
}

#[derive(Default)]
struct AdapterInner {
    device_id: Option<DeviceId>,
    login: Option<LoginDescriptor>,
    socket_url: Option<Url>,
    socket_state: SocketState,
    api_state: ApiState,
    session_token: Option<String>,
    username: Option<String>,
    reauth_requested_at: Option<DateTime<Utc>>,
    last_message_at: Option<Instant>,
    last_message_wall: Option<DateTime<Utc>>,
}

/// Protocol client owning one device's login handshake and push channel.
///
/// The adapter is shared as `Arc<OctoPrintAdapter>`: the fleet sweep calls
/// into it while its socket reader task delivers frames. All state lives
/// behind a mutex that is never held across an `.await`, and every
/// transition is made by the adapter on itself.
///
/// # Lifecycle
///
/// 1. [`register_credentials`](Self::register_credentials) once.
/// 2. [`setup_socket_session`](Self::setup_socket_session) logs in.
/// 3. [`open`](Self::open) connects the WebSocket and sends the auth and
///    throttle frames.
/// 4. Incoming frames go through [`on_message`](Self::on_message) and are
///    re-emitted on the shared bus.
pub struct OctoPrintAdapter {
    transport: Arc<dyn LoginTransport>,
    bus: EventBus,
    throttle: u32,
    inner: Mutex<AdapterInner>,
    socket: Mutex<Option<SocketHandle>>,
    generation: AtomicU64,
}

impl OctoPrintAdapter {
    /// Creates an unregistered adapter.
    #[must_use]
    pub fn new(transport: Arc<dyn LoginTransport>, bus: EventBus) -> Self {
        Self {
            transport,
            bus,
            throttle: DEFAULT_THROTTLE,
            inner: Mutex::new(AdapterInner::default()),
            socket: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Sets the throttle multiplier sent after the auth frame.
    #[must_use]
    pub fn with_throttle(mut self, throttle: u32) -> Self {
        self.throttle = throttle;
        self
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Returns the registered device id.
    pub fn device_id(&self) -> Option<DeviceId> {
        self.inner.lock().device_id.clone()
    }

    /// Returns the computed push channel URL.
    pub fn socket_url(&self) -> Option<Url> {
        self.inner.lock().socket_url.clone()
    }

    /// Returns the current socket state.
    pub fn socket_state(&self) -> SocketState {
        self.inner.lock().socket_state
    }

    /// Returns the current API state.
    pub fn api_state(&self) -> ApiState {
        self.inner.lock().api_state
    }

    /// Returns the admin user name used in the auth frame.
    pub fn username(&self) -> Option<String> {
        self.inner.lock().username.clone()
    }

    /// Returns when the device asked for reauthentication, if pending.
    pub fn reauth_requested_at(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().reauth_requested_at
    }

    /// Returns true if the device asked for reauthentication.
    pub fn needs_reauth(&self) -> bool {
        self.inner.lock().reauth_requested_at.is_some()
    }

    /// Returns the wall-clock time of the last received frame.
    pub fn last_message_received(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().last_message_wall
    }

    /// Returns how long ago the last frame arrived.
    ///
    /// Opening the socket counts as a frame so a silent device still ages.
    pub fn last_message_age(&self) -> Option<Duration> {
        self.inner
            .lock()
            .last_message_at
            .map(|at| Instant::now().saturating_duration_since(at))
    }

    /// Returns true if a transport socket exists.
    pub fn has_socket(&self) -> bool {
        self.socket.lock().is_some()
    }

    /// True only before the first session setup.
    pub fn needs_setup(&self) -> bool {
        self.socket_state() == SocketState::Unopened
    }

    /// True when the API responds but our local connection lapsed.
    pub fn needs_reopen(&self) -> bool {
        let inner = self.inner.lock();
        inner.api_state == ApiState::Responding
            && matches!(inner.socket_state, SocketState::Closed | SocketState::Error)
    }

    /// True for `closed` or `aborted`.
    pub fn is_closed_or_aborted(&self) -> bool {
        matches!(
            self.socket_state(),
            SocketState::Closed | SocketState::Aborted
        )
    }

    // =========================================================================
    // Session
    // =========================================================================

    /// Stores the target identity and computes the push channel URL.
    ///
    /// # Errors
    ///
    /// Fails if credentials were already registered or the login URL is
    /// not an `http`/`https` URL.
    pub fn register_credentials(
        &self,
        device_id: DeviceId,
        login: LoginDescriptor,
        scheme: SocketScheme,
    ) -> Result<(), AdapterError> {
        let mut inner = self.inner.lock();
        if inner.login.is_some() {
            return Err(AdapterError::AlreadyRegistered);
        }

        let socket_url = socket_url_from_login(&login, scheme)?;
        tracing::debug!(%device_id, url = %socket_url, "Registered device credentials");

        inner.device_id = Some(device_id);
        inner.login = Some(login);
        inner.socket_url = Some(socket_url);
        Ok(())
    }

    /// Performs the REST login and classifies the outcome.
    ///
    /// On success the API state becomes `responding` and, unless a socket
    /// is already live, the socket state becomes `opening`.
    ///
    /// # Errors
    ///
    /// Returns the classified [`ApiError`]. Non-retryable classifications
    /// also move the socket to `aborted`.
    pub async fn setup_socket_session(&self) -> Result<(), Error> {
        let login = self
            .inner
            .lock()
            .login
            .clone()
            .ok_or(AdapterError::NotRegistered)?;

        let response = match self.transport.login(&login).await {
            Ok(response) => response,
            Err(e) => return Err(self.fail_session(e)),
        };

        if response.is_shared_credential() {
            return Err(self.fail_session(ApiError::SharedCredential(
                "global API key in use".to_string(),
            )));
        }
        if response.is_guest() {
            return Err(self.fail_session(ApiError::SharedCredential(
                "user belongs to the guest group".to_string(),
            )));
        }
        let Some(session) = response.session else {
            return Err(self.fail_session(ApiError::MissingSession));
        };

        self.inner.lock().session_token = Some(session);
        self.set_api_state(ApiState::Responding);
        if !self.has_socket() {
            self.set_socket_state(SocketState::Opening);
        }

        match self.transport.admin_username(&login).await {
            Ok(username) => {
                self.inner.lock().username = Some(username);
                Ok(())
            }
            Err(e) => Err(self.fail_session(ApiError::MissingAdminUser(e.to_string()))),
        }
    }

    /// Re-runs the login and re-sends the auth frame on the live socket.
    ///
    /// The transport is kept.
    ///
    /// # Errors
    ///
    /// Returns the login failure, or an adapter error if no socket is open.
    pub async fn reauth_session(&self) -> Result<(), Error> {
        self.setup_socket_session().await?;
        self.send_auth_frame().await?;
        self.inner.lock().reauth_requested_at = None;

        if let Some(device_id) = self.device_id() {
            tracing::info!(%device_id, "Reauthenticated socket session");
        }
        Ok(())
    }

    fn fail_session(&self, error: ApiError) -> Error {
        self.set_api_state(error.api_state());
        if !error.is_retryable() {
            self.set_socket_state(SocketState::Aborted);
        }
        Error::Api(error)
    }

    // =========================================================================
    // Transport
    // =========================================================================

    /// Connects the WebSocket, then runs [`after_opened`](Self::after_opened).
    ///
    /// # Errors
    ///
    /// Fails fast with [`AdapterError::AlreadyOpen`] if a socket exists.
    /// Connection failures move the socket to `error`.
    pub async fn open(self: &Arc<Self>) -> Result<(), Error> {
        if self.has_socket() {
            return Err(AdapterError::AlreadyOpen.into());
        }
        let url = self.socket_url().ok_or(AdapterError::NotRegistered)?;

        self.set_socket_state(SocketState::Authenticating);
        let (stream, _response) = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok(connected) => connected,
            Err(e) => {
                let message = e.to_string();
                self.set_socket_state(SocketState::Error);
                self.emit_lifecycle(SOCKET_ERROR, json!({ "error": message }));
                return Err(AdapterError::WebSocket(message).into());
            }
        };

        let (sink, source) = stream.split();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        {
            let mut socket = self.socket.lock();
            if socket.is_some() {
                return Err(AdapterError::AlreadyOpen.into());
            }
            *socket = Some(SocketHandle {
                sink: Arc::new(tokio::sync::Mutex::new(sink)),
                reader: None,
                generation,
            });
        }
        self.emit_lifecycle(SOCKET_OPENED, json!({ "url": url.as_str() }));

        if let Err(e) = self.after_opened().await {
            self.close();
            self.set_socket_state(SocketState::Error);
            return Err(e);
        }

        // Frames queue in the stream until the reader starts, so nothing
        // can promote the state before the auth frame is out.
        let reader = tokio::spawn(read_loop(Arc::downgrade(self), source, generation));
        match self.socket.lock().as_mut() {
            Some(handle) if handle.generation == generation => handle.reader = Some(reader),
            _ => reader.abort(),
        }
        Ok(())
    }

    /// Marks the socket opened and sends the auth and throttle frames.
    ///
    /// A pending reauth request is settled by the fresh auth frame.
    ///
    /// # Errors
    ///
    /// Fails if no session exists or a frame cannot be sent.
    pub async fn after_opened(&self) -> Result<(), Error> {
        self.set_socket_state(SocketState::Opened);
        self.inner.lock().last_message_at = Some(Instant::now());
        self.send_auth_frame().await?;
        self.send_frame(&json!({ "throttle": self.throttle })).await?;
        self.inner.lock().reauth_requested_at = None;
        Ok(())
    }

    async fn send_auth_frame(&self) -> Result<(), Error> {
        let auth = {
            let inner = self.inner.lock();
            match (&inner.username, &inner.session_token) {
                (Some(user), Some(session)) => format!("{user}:{session}"),
                _ => return Err(AdapterError::MissingSession.into()),
            }
        };
        self.send_frame(&json!({ "auth": auth })).await
    }

    async fn send_frame(&self, frame: &Value) -> Result<(), Error> {
        self.send_message(Message::text(frame.to_string())).await
    }

    async fn send_message(&self, message: Message) -> Result<(), Error> {
        let sink = self
            .socket
            .lock()
            .as_ref()
            .map(|handle| Arc::clone(&handle.sink))
            .ok_or(AdapterError::NotOpen)?;

        sink.lock()
            .await
            .send(message)
            .await
            .map_err(|e| AdapterError::WebSocket(e.to_string()).into())
    }

    /// Sends a WebSocket ping on the live transport.
    ///
    /// # Errors
    ///
    /// Fails if no socket is open or the ping cannot be written. A write
    /// failure moves the socket to `error`.
    pub async fn ping(&self) -> Result<(), Error> {
        let result = self.send_message(Message::Ping(Vec::new().into())).await;
        if let Err(Error::Adapter(AdapterError::WebSocket(message))) = &result {
            self.drop_transport();
            self.set_socket_state(SocketState::Error);
            self.emit_lifecycle(SOCKET_ERROR, json!({ "error": message }));
        }
        result
    }

    /// Handles one inbound text frame.
    ///
    /// The frame's first key is the event name. The frame is re-emitted on
    /// the bus as `octoprint.<event>`, whatever the event is.
    pub fn on_message(&self, raw: &str) {
        {
            let mut inner = self.inner.lock();
            inner.last_message_at = Some(Instant::now());
            inner.last_message_wall = Some(Utc::now());
        }

        let frame: Value = match serde_json::from_str(raw) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(error = %e, "Ignoring unparseable frame");
                return;
            }
        };

        if matches!(
            self.socket_state(),
            SocketState::Opened | SocketState::Authenticating
        ) {
            self.set_socket_state(SocketState::Authenticated);
        }

        let Value::Object(map) = frame else {
            tracing::debug!("Ignoring frame that is not an object");
            return;
        };
        let Some((event, payload)) = map.into_iter().next() else {
            return;
        };

        if event == REAUTH_REQUIRED {
            self.inner.lock().reauth_requested_at = Some(Utc::now());
            tracing::info!(device_id = ?self.device_id(), "Device requested reauthentication");
        }

        let Some(device_id) = self.device_id() else {
            return;
        };
        tracing::trace!(%device_id, event = %event, "Received frame");
        let name = frame_event_name(&event);
        self.bus
            .emit(&name, FleetEvent::new(event, payload, device_id));
    }

    /// Closes the transport socket, if any, and discards it.
    ///
    /// Idempotent. An `aborted` state is kept; anything else becomes
    /// `closed`.
    pub fn close(&self) {
        if !self.drop_transport() {
            return;
        }
        if self.socket_state() != SocketState::Aborted {
            self.set_socket_state(SocketState::Closed);
        }
        self.emit_lifecycle(SOCKET_CLOSED, json!({ "initiator": "local" }));
    }

    /// Closes the socket and returns to `unopened`/`unset` so the next
    /// sweep sets the session up again.
    pub fn reset_socket_state(&self) {
        self.close();
        {
            let mut inner = self.inner.lock();
            inner.session_token = None;
            inner.reauth_requested_at = None;
            inner.last_message_at = None;
        }
        self.set_api_state(ApiState::Unset);
        self.set_socket_state(SocketState::Unopened);
    }

    /// Takes the transport out and shuts it down. Returns false if there
    /// was none.
    fn drop_transport(&self) -> bool {
        let Some(handle) = self.socket.lock().take() else {
            return false;
        };
        if let Some(reader) = handle.reader {
            reader.abort();
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let sink = handle.sink;
            runtime.spawn(async move {
                let _ = sink.lock().await.close().await;
            });
        }
        true
    }

    fn handle_remote_close(&self, generation: u64, error: Option<String>) {
        {
            let mut socket = self.socket.lock();
            match socket.as_ref() {
                Some(handle) if handle.generation == generation => {
                    *socket = None;
                }
                _ => return,
            }
        }

        let keep_aborted = self.socket_state() == SocketState::Aborted;
        match error {
            Some(message) => {
                tracing::warn!(device_id = ?self.device_id(), error = %message, "Socket failed");
                if !keep_aborted {
                    self.set_socket_state(SocketState::Error);
                }
                self.emit_lifecycle(SOCKET_ERROR, json!({ "error": message }));
            }
            None => {
                tracing::info!(device_id = ?self.device_id(), "Socket closed by device");
                if !keep_aborted {
                    self.set_socket_state(SocketState::Closed);
                }
                self.emit_lifecycle(SOCKET_CLOSED, json!({ "initiator": "remote" }));
            }
        }
    }

    // =========================================================================
    // State transitions
    // =========================================================================

    fn set_socket_state(&self, state: SocketState) {
        let previous = {
            let mut inner = self.inner.lock();
            std::mem::replace(&mut inner.socket_state, state)
        };
        if previous != state {
            self.emit_lifecycle(
                SOCKET_STATE_CHANGED,
                json!({ "previous": previous, "current": state }),
            );
        }
    }

    fn set_api_state(&self, state: ApiState) {
        let previous = {
            let mut inner = self.inner.lock();
            std::mem::replace(&mut inner.api_state, state)
        };
        if previous != state {
            self.emit_lifecycle(
                API_STATE_CHANGED,
                json!({ "previous": previous, "current": state }),
            );
        }
    }

    fn emit_lifecycle(&self, name: &str, payload: Value) {
        if let Some(device_id) = self.device_id() {
            self.bus.emit(name, FleetEvent::new(name, payload, device_id));
        }
    }
}

impl std::fmt::Debug for OctoPrintAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("OctoPrintAdapter")
            .field("device_id", &inner.device_id)
            .field("socket_state", &inner.socket_state)
            .field("api_state", &inner.api_state)
            .field("reauth_requested_at", &inner.reauth_requested_at)
            .finish_non_exhaustive()
    }
}

/// Reads frames until the stream ends, feeding them to the adapter.
async fn read_loop(adapter: Weak<OctoPrintAdapter>, mut source: WsSource, generation: u64) {
    while let Some(frame) = source.next().await {
        let Some(adapter) = adapter.upgrade() else {
            return;
        };
        match frame {
            Ok(Message::Text(text)) => adapter.on_message(text.as_str()),
            Ok(Message::Close(_)) => {
                adapter.handle_remote_close(generation, None);
                return;
            }
            Ok(_) => {}
            Err(e) => {
                adapter.handle_remote_close(generation, Some(e.to_string()));
                return;
            }
        }
    }

    if let Some(adapter) = adapter.upgrade() {
        adapter.handle_remote_close(generation, None);
    }
}

/// Computes the push channel URL from the login URL.
fn socket_url_from_login(
    login: &LoginDescriptor,
    scheme: SocketScheme,
) -> Result<Url, AdapterError> {
    let mut url = Url::parse(login.trimmed_base_url())
        .map_err(|e| AdapterError::InvalidUrl(format!("{}: {e}", login.base_url)))?;

    let target = match (scheme, url.scheme()) {
        (SocketScheme::Ws, _) | (SocketScheme::Auto, "http") => "ws",
        (SocketScheme::Wss, _) | (SocketScheme::Auto, "https") => "wss",
        (SocketScheme::Auto, other) => {
            return Err(AdapterError::InvalidUrl(format!(
                "unsupported scheme '{other}'"
            )));
        }
    };
    if !matches!(url.scheme(), "http" | "https") {
        return Err(AdapterError::InvalidUrl(format!(
            "unsupported scheme '{}'",
            url.scheme()
        )));
    }
    url.set_scheme(target)
        .map_err(|()| AdapterError::InvalidUrl(login.base_url.clone()))?;

    let path = format!("{}/{SOCKET_PATH}", url.path().trim_end_matches('/'));
    url.set_path(&path);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::LoginResponse;
    use futures_util::FutureExt;
    use futures_util::future::BoxFuture;

    /// Login transport with canned answers.
    struct FakeTransport {
        login: Result<LoginResponse, ApiError>,
        admin: Result<String, ApiError>,
    }

    impl FakeTransport {
        fn ok() -> Self {
            Self {
                login: Ok(LoginResponse {
                    name: "octo".into(),
                    session: Some("session-1".into()),
                    groups: vec!["admins".into()],
                }),
                admin: Ok("octo".into()),
            }
        }
    }

    impl LoginTransport for FakeTransport {
        fn login<'a>(
            &'a self,
            _login: &'a LoginDescriptor,
        ) -> BoxFuture<'a, Result<LoginResponse, ApiError>> {
            let result = self.login.clone();
            async move { result }.boxed()
        }

        fn admin_username<'a>(
            &'a self,
            _login: &'a LoginDescriptor,
        ) -> BoxFuture<'a, Result<String, ApiError>> {
            let result = self.admin.clone();
            async move { result }.boxed()
        }
    }

    fn adapter_with(transport: FakeTransport) -> (Arc<OctoPrintAdapter>, EventBus) {
        let bus = EventBus::new();
        let adapter = Arc::new(OctoPrintAdapter::new(Arc::new(transport), bus.clone()));
        adapter
            .register_credentials(
                DeviceId::from("p1"),
                LoginDescriptor::new("http://127.0.0.1:1", "key"),
                SocketScheme::Auto,
            )
            .unwrap();
        (adapter, bus)
    }

    #[test]
    fn socket_url_translates_http_to_ws() {
        let login = LoginDescriptor::new("http://192.168.1.20:5000", "k");
        let url = socket_url_from_login(&login, SocketScheme::Auto).unwrap();
        assert_eq!(url.as_str(), "ws://192.168.1.20:5000/sockjs/websocket");
    }

    #[test]
    fn socket_url_translates_https_to_wss_and_keeps_prefix() {
        let login = LoginDescriptor::new("https://farm.local/octoprint/", "k");
        let url = socket_url_from_login(&login, SocketScheme::Auto).unwrap();
        assert_eq!(url.as_str(), "wss://farm.local/octoprint/sockjs/websocket");
    }

    #[test]
    fn socket_url_honors_forced_scheme() {
        let login = LoginDescriptor::new("https://farm.local", "k");
        let url = socket_url_from_login(&login, SocketScheme::Ws).unwrap();
        assert_eq!(url.scheme(), "ws");
    }

    #[test]
    fn socket_url_rejects_other_schemes() {
        let login = LoginDescriptor::new("ftp://farm.local", "k");
        assert!(matches!(
            socket_url_from_login(&login, SocketScheme::Auto),
            Err(AdapterError::InvalidUrl(_))
        ));
    }

    #[test]
    fn credentials_register_only_once() {
        let (adapter, _bus) = adapter_with(FakeTransport::ok());
        let second = adapter.register_credentials(
            DeviceId::from("p1"),
            LoginDescriptor::new("http://other", "k"),
            SocketScheme::Auto,
        );
        assert_eq!(second, Err(AdapterError::AlreadyRegistered));
    }

    #[test]
    fn new_adapter_needs_setup() {
        let (adapter, _bus) = adapter_with(FakeTransport::ok());
        assert!(adapter.needs_setup());
        assert!(!adapter.needs_reopen());
        assert_eq!(adapter.api_state(), ApiState::Unset);
    }

    #[tokio::test]
    async fn successful_setup_moves_to_opening() {
        let (adapter, _bus) = adapter_with(FakeTransport::ok());

        adapter.setup_socket_session().await.unwrap();

        assert_eq!(adapter.api_state(), ApiState::Responding);
        assert_eq!(adapter.socket_state(), SocketState::Opening);
        assert_eq!(adapter.username().as_deref(), Some("octo"));
    }

    #[tokio::test]
    async fn global_key_aborts() {
        let mut transport = FakeTransport::ok();
        transport.login = Ok(LoginResponse {
            name: "_api".into(),
            session: Some("s".into()),
            groups: vec![],
        });
        let (adapter, _bus) = adapter_with(transport);

        let err = adapter.setup_socket_session().await.unwrap_err();

        assert!(matches!(err, Error::Api(ApiError::SharedCredential(_))));
        assert_eq!(adapter.api_state(), ApiState::GlobalKey);
        assert_eq!(adapter.socket_state(), SocketState::Aborted);
        assert!(!adapter.needs_setup());
        assert!(!adapter.needs_reopen());
    }

    #[tokio::test]
    async fn guest_group_aborts_like_global_key() {
        let mut transport = FakeTransport::ok();
        transport.login = Ok(LoginResponse {
            name: "visitor".into(),
            session: Some("s".into()),
            groups: vec!["guests".into()],
        });
        let (adapter, _bus) = adapter_with(transport);

        assert!(adapter.setup_socket_session().await.is_err());
        assert_eq!(adapter.api_state(), ApiState::GlobalKey);
        assert_eq!(adapter.socket_state(), SocketState::Aborted);
    }

    #[tokio::test]
    async fn missing_session_aborts_with_auth_fail() {
        let mut transport = FakeTransport::ok();
        transport.login = Ok(LoginResponse {
            name: "octo".into(),
            session: None,
            groups: vec![],
        });
        let (adapter, _bus) = adapter_with(transport);

        let err = adapter.setup_socket_session().await.unwrap_err();
        assert!(matches!(err, Error::Api(ApiError::MissingSession)));
        assert_eq!(adapter.api_state(), ApiState::AuthFail);
        assert_eq!(adapter.socket_state(), SocketState::Aborted);
    }

    #[tokio::test]
    async fn admin_lookup_failure_aborts_with_auth_fail() {
        let mut transport = FakeTransport::ok();
        transport.admin = Err(ApiError::CredentialRejected);
        let (adapter, _bus) = adapter_with(transport);

        let err = adapter.setup_socket_session().await.unwrap_err();
        assert!(matches!(err, Error::Api(ApiError::MissingAdminUser(_))));
        assert_eq!(adapter.api_state(), ApiState::AuthFail);
        assert_eq!(adapter.socket_state(), SocketState::Aborted);
    }

    #[tokio::test]
    async fn no_response_is_retryable_and_keeps_socket_state() {
        let mut transport = FakeTransport::ok();
        transport.login = Err(ApiError::NoResponse("connection refused".into()));
        let (adapter, _bus) = adapter_with(transport);

        let err = adapter.setup_socket_session().await.unwrap_err();
        assert!(matches!(err, Error::Api(ApiError::NoResponse(_))));
        assert_eq!(adapter.api_state(), ApiState::NoResponse);
        assert!(adapter.needs_setup());
        assert!(!adapter.needs_reopen());
    }

    #[tokio::test]
    async fn setup_without_registration_fails() {
        let adapter = OctoPrintAdapter::new(Arc::new(FakeTransport::ok()), EventBus::new());
        let err = adapter.setup_socket_session().await.unwrap_err();
        assert!(matches!(err, Error::Adapter(AdapterError::NotRegistered)));
    }

    #[test]
    fn on_message_emits_frame_and_sets_reauth_flag() {
        let (adapter, bus) = adapter_with(FakeTransport::ok());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.on("octoprint.*", move |name, event| {
            sink.lock().push((name.to_string(), event.clone()));
        });

        adapter.on_message(r#"{"current": {"state": {"text": "Operational"}}}"#);
        adapter.on_message(r#"{"reauthRequired": {"reason": "logout"}}"#);

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, "octoprint.current");
        assert_eq!(seen[0].1.payload["state"]["text"], "Operational");
        assert_eq!(seen[0].1.device_id, DeviceId::from("p1"));
        assert_eq!(seen[1].1.event, "reauthRequired");
        assert!(adapter.needs_reauth());
        assert!(adapter.last_message_received().is_some());
    }

    #[test]
    fn on_message_ignores_garbage() {
        let (adapter, bus) = adapter_with(FakeTransport::ok());
        let mut rx = bus.subscribe();
        adapter.on_message("not json");
        assert!(rx.try_recv().is_err());
        assert!(adapter.last_message_age().is_some());
    }

    #[test]
    fn close_without_socket_is_idempotent() {
        let (adapter, _bus) = adapter_with(FakeTransport::ok());
        adapter.close();
        adapter.close();
        assert_eq!(adapter.socket_state(), SocketState::Unopened);
    }

    #[tokio::test]
    async fn state_changes_are_emitted() {
        let (adapter, bus) = adapter_with(FakeTransport::ok());
        let mut rx = bus.subscribe();

        adapter.setup_socket_session().await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.name, API_STATE_CHANGED);
        assert_eq!(first.event.payload["current"], "responding");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.name, SOCKET_STATE_CHANGED);
        assert_eq!(second.event.payload["current"], "opening");
    }

    #[tokio::test]
    async fn reset_returns_to_unopened() {
        let (adapter, _bus) = adapter_with(FakeTransport::ok());
        adapter.setup_socket_session().await.unwrap();

        adapter.reset_socket_state();

        assert!(adapter.needs_setup());
        assert_eq!(adapter.api_state(), ApiState::Unset);
    }

    #[tokio::test]
    async fn open_without_registration_fails() {
        let adapter = Arc::new(OctoPrintAdapter::new(
            Arc::new(FakeTransport::ok()),
            EventBus::new(),
        ));
        let err = adapter.open().await.unwrap_err();
        assert!(matches!(err, Error::Adapter(AdapterError::NotRegistered)));
    }

    /// Accepts WebSocket clients and drains their frames until they leave.
    async fn local_device() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                        return;
                    };
                    while let Some(Ok(_)) = ws.next().await {}
                });
            }
        });
        format!("http://{addr}")
    }

    async fn opened_adapter() -> (Arc<OctoPrintAdapter>, EventBus) {
        let bus = EventBus::new();
        let adapter = Arc::new(OctoPrintAdapter::new(
            Arc::new(FakeTransport::ok()),
            bus.clone(),
        ));
        adapter
            .register_credentials(
                DeviceId::from("p1"),
                LoginDescriptor::new(local_device().await, "key"),
                SocketScheme::Auto,
            )
            .unwrap();
        adapter.setup_socket_session().await.unwrap();
        adapter.open().await.unwrap();
        (adapter, bus)
    }

    #[tokio::test]
    async fn ping_on_live_socket_keeps_state() {
        let (adapter, _bus) = opened_adapter().await;

        adapter.ping().await.unwrap();

        assert!(adapter.has_socket());
        assert_eq!(adapter.socket_state(), SocketState::Opened);
    }

    #[tokio::test]
    async fn failed_ping_moves_socket_to_error() {
        let (adapter, bus) = opened_adapter().await;
        let errors = Arc::new(Mutex::new(0));
        {
            let errors = Arc::clone(&errors);
            bus.on(SOCKET_ERROR, move |_, _| *errors.lock() += 1);
        }

        let sink = {
            let mut socket = adapter.socket.lock();
            let handle = socket.as_mut().unwrap();
            if let Some(reader) = handle.reader.take() {
                reader.abort();
            }
            Arc::clone(&handle.sink)
        };
        let _ = sink.lock().await.close().await;

        let err = adapter.ping().await.unwrap_err();

        assert!(matches!(err, Error::Adapter(AdapterError::WebSocket(_))));
        assert_eq!(adapter.socket_state(), SocketState::Error);
        assert!(!adapter.has_socket());
        assert_eq!(*errors.lock(), 1);
    }

    #[tokio::test]
    async fn ping_without_socket_fails() {
        let (adapter, _bus) = adapter_with(FakeTransport::ok());
        let err = adapter.ping().await.unwrap_err();
        assert!(matches!(err, Error::Adapter(AdapterError::NotOpen)));
        assert_eq!(adapter.socket_state(), SocketState::Unopened);
    }

    #[tokio::test]
    async fn reopening_settles_pending_reauth() {
        let (adapter, _bus) = opened_adapter().await;
        adapter.on_message(r#"{"reauthRequired": {"reason": "logout"}}"#);
        assert!(adapter.needs_reauth());

        adapter.close();
        adapter.setup_socket_session().await.unwrap();
        assert!(adapter.needs_reauth());
        adapter.open().await.unwrap();

        assert!(!adapter.needs_reauth());
        assert_eq!(adapter.socket_state(), SocketState::Opened);
    }
}
