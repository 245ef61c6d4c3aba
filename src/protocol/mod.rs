// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! REST login transport for OctoPrint-compatible devices.
//!
//! The adapter only depends on the [`LoginTransport`] trait. The default
//! implementation, [`OctoPrintHttpClient`], talks to the device with
//! `reqwest` and classifies every failure into an
//! [`ApiError`](crate::error::ApiError).

#[cfg(feature = "http")]
mod http;

#[cfg(feature = "http")]
pub use http::{HttpConfig, OctoPrintHttpClient};

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

/// User name OctoPrint reports when the request used the global API key.
pub const GLOBAL_API_KEY_USER: &str = "_api";

/// Group name of restricted guest accounts.
pub const GUEST_GROUP: &str = "guests";

/// Where and how to log in to a device.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginDescriptor {
    /// Base URL of the device, e.g. `http://192.168.1.20`.
    pub base_url: String,
    /// Application or user API key.
    pub api_key: String,
}

impl LoginDescriptor {
    /// Creates a login descriptor.
    #[must_use]
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    /// Returns the base URL without a trailing slash.
    #[must_use]
    pub fn trimmed_base_url(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }
}

impl std::fmt::Debug for LoginDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginDescriptor")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

/// Body of a successful passive login.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct LoginResponse {
    /// Name of the user the key belongs to.
    #[serde(default)]
    pub name: String,
    /// Session token used in the socket auth frame.
    #[serde(default)]
    pub session: Option<String>,
    /// Groups of the user.
    #[serde(default)]
    pub groups: Vec<String>,
}

impl LoginResponse {
    /// Returns true if the key is the device's global API key.
    #[must_use]
    pub fn is_shared_credential(&self) -> bool {
        self.name == GLOBAL_API_KEY_USER
    }

    /// Returns true if the user belongs to the restricted guest group.
    #[must_use]
    pub fn is_guest(&self) -> bool {
        self.groups.iter().any(|g| g == GUEST_GROUP)
    }
}

/// REST calls the protocol adapter needs.
///
/// Implementations must map failures onto [`ApiError`] so that callers can
/// decide retry behavior from the classification alone.
pub trait LoginTransport: Send + Sync {
    /// Performs a passive login and returns the session details.
    fn login<'a>(
        &'a self,
        login: &'a LoginDescriptor,
    ) -> BoxFuture<'a, Result<LoginResponse, ApiError>>;

    /// Returns the name of an admin user on the device.
    fn admin_username<'a>(
        &'a self,
        login: &'a LoginDescriptor,
    ) -> BoxFuture<'a, Result<String, ApiError>>;
}
