// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Socket and API state of a protocol adapter.

use std::fmt;

use serde::{Deserialize, Serialize};

/// State of an adapter's push channel.
///
/// Listed in typical progression order. `Aborted` is terminal until the
/// device record changes; `Closed` and `Error` are transient.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum SocketState {
    /// No session or socket yet.
    #[default]
    Unopened,
    /// Login succeeded, socket not yet connected.
    Opening,
    /// WebSocket handshake in flight.
    Authenticating,
    /// Socket connected and auth frame sent.
    Opened,
    /// First frame parsed after the auth frame.
    Authenticated,
    /// Do not retry automatically.
    Aborted,
    /// Transport failed.
    Error,
    /// Transport closed.
    Closed,
}

impl SocketState {
    /// All states, in declaration order.
    pub const ALL: [Self; 8] = [
        Self::Unopened,
        Self::Opening,
        Self::Authenticating,
        Self::Opened,
        Self::Authenticated,
        Self::Aborted,
        Self::Error,
        Self::Closed,
    ];

    /// Returns the state name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unopened => "unopened",
            Self::Opening => "opening",
            Self::Authenticating => "authenticating",
            Self::Opened => "opened",
            Self::Authenticated => "authenticated",
            Self::Aborted => "aborted",
            Self::Error => "error",
            Self::Closed => "closed",
        }
    }

    /// Returns true for states with a live transport.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Opened | Self::Authenticated)
    }
}

impl fmt::Display for SocketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reachability of a device's REST API.
///
/// Independent of [`SocketState`]. Only `Responding` allows a socket to be
/// opened; `GlobalKey` and `AuthFail` are terminal until the record changes.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum ApiState {
    /// No login attempted yet.
    #[default]
    Unset,
    /// The last login got no response.
    NoResponse,
    /// The key is a shared/global key or a guest account.
    GlobalKey,
    /// The login was rejected or malformed.
    AuthFail,
    /// The last login succeeded.
    Responding,
}

impl ApiState {
    /// All states, in declaration order.
    pub const ALL: [Self; 5] = [
        Self::Unset,
        Self::NoResponse,
        Self::GlobalKey,
        Self::AuthFail,
        Self::Responding,
    ];

    /// Returns the state name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unset => "unset",
            Self::NoResponse => "noResponse",
            Self::GlobalKey => "globalKey",
            Self::AuthFail => "authFail",
            Self::Responding => "responding",
        }
    }
}

impl fmt::Display for ApiState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheme of the push channel URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SocketScheme {
    /// `ws` for `http` logins and `wss` for `https` logins.
    #[default]
    Auto,
    /// Always plain `ws`.
    Ws,
    /// Always `wss`.
    Wss,
}
