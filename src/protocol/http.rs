// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP login client for OctoPrint-compatible devices.

use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::error::{AdapterError, ApiError};
use crate::protocol::{LoginDescriptor, LoginResponse, LoginTransport};

/// Header carrying the API key.
const API_KEY_HEADER: &str = "X-Api-Key";

/// Configuration of the HTTP login client.
///
/// # Examples
///
/// ```
/// use octofleet_lib::protocol::HttpConfig;
/// use std::time::Duration;
///
/// let config = HttpConfig::new()
///     .with_timeout(Duration::from_secs(5))
///     .with_user_agent("my-fleet/1.0");
/// ```
#[derive(Debug, Clone)]
pub struct HttpConfig {
    timeout: Duration,
    user_agent: String,
}

impl HttpConfig {
    /// Default request timeout.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self {
            timeout: Self::DEFAULT_TIMEOUT,
            user_agent: concat!("octofleet/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }

    /// Sets the request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the user agent header.
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Returns the timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns the user agent.
    #[must_use]
    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// Creates an [`OctoPrintHttpClient`] from this configuration.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::HttpClient`] if the HTTP client cannot be
    /// created, e.g. for a user agent that is not a valid header value.
    pub fn into_client(self) -> Result<OctoPrintHttpClient, AdapterError> {
        let client = Client::builder()
            .timeout(self.timeout)
            .user_agent(self.user_agent)
            .build()
            .map_err(|e| AdapterError::HttpClient(e.to_string()))?;

        Ok(OctoPrintHttpClient { client })
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// `reqwest`-backed [`LoginTransport`].
///
/// Uses `POST /api/login` with `{"passive": true}` for the session and
/// `GET /api/access/users` to find an admin user name.
#[derive(Debug, Clone)]
pub struct OctoPrintHttpClient {
    client: Client,
}

#[derive(Debug, Deserialize)]
struct UserList {
    #[serde(default)]
    users: Vec<UserEntry>,
}

#[derive(Debug, Deserialize)]
struct UserEntry {
    name: String,
    #[serde(default)]
    admin: bool,
    #[serde(default)]
    groups: Vec<String>,
}

impl UserEntry {
    fn is_admin(&self) -> bool {
        self.admin || self.groups.iter().any(|g| g == "admins")
    }
}

impl OctoPrintHttpClient {
    /// Creates a client with the default configuration.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be created.
    pub fn new() -> Result<Self, AdapterError> {
        HttpConfig::new().into_client()
    }

    async fn do_login(&self, login: &LoginDescriptor) -> Result<LoginResponse, ApiError> {
        let url = format!("{}/api/login", login.trimmed_base_url());
        tracing::debug!(url = %url, "Sending login request");

        let response = self
            .client
            .post(&url)
            .header(API_KEY_HEADER, &login.api_key)
            .json(&serde_json::json!({ "passive": true }))
            .send()
            .await
            .map_err(classify_transport_error)?;

        let response = check_status(response)?;
        let body: LoginResponse = response
            .json()
            .await
            .map_err(|e| ApiError::IncompatibleHost(e.to_string()))?;

        Ok(body)
    }

    async fn do_admin_username(&self, login: &LoginDescriptor) -> Result<String, ApiError> {
        let url = format!("{}/api/access/users", login.trimmed_base_url());
        tracing::debug!(url = %url, "Fetching user list");

        let response = self
            .client
            .get(&url)
            .header(API_KEY_HEADER, &login.api_key)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let response = check_status(response)?;
        let list: UserList = response
            .json()
            .await
            .map_err(|e| ApiError::IncompatibleHost(e.to_string()))?;

        list.users
            .into_iter()
            .find(UserEntry::is_admin)
            .map(|user| user.name)
            .ok_or_else(|| ApiError::MissingAdminUser("user list has no admin".to_string()))
    }
}

impl LoginTransport for OctoPrintHttpClient {
    fn login<'a>(
        &'a self,
        login: &'a LoginDescriptor,
    ) -> BoxFuture<'a, Result<LoginResponse, ApiError>> {
        self.do_login(login).boxed()
    }

    fn admin_username<'a>(
        &'a self,
        login: &'a LoginDescriptor,
    ) -> BoxFuture<'a, Result<String, ApiError>> {
        self.do_admin_username(login).boxed()
    }
}

/// Maps errors where no HTTP response was received.
fn classify_transport_error(error: reqwest::Error) -> ApiError {
    if error.is_builder() {
        ApiError::BadRequest(error.to_string())
    } else {
        ApiError::NoResponse(error.to_string())
    }
}

/// Maps HTTP status codes onto the failure taxonomy.
fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    Err(match status {
        StatusCode::BAD_REQUEST => ApiError::BadRequest(status.to_string()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ApiError::CredentialRejected,
        StatusCode::NOT_FOUND => ApiError::IncompatibleHost(status.to_string()),
        s if s.is_server_error() => ApiError::NoResponse(s.to_string()),
        s => ApiError::IncompatibleHost(s.to_string()),
    })
}
