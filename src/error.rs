// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types for the `octofleet` library.
//!
//! Errors are grouped by the layer that raises them: REST login
//! classification ([`ApiError`]), protocol adapter misuse and transport
//! failures ([`AdapterError`]), scheduler registration and control
//! ([`TaskError`]), and fleet bookkeeping ([`ManagerError`]).

use thiserror::Error;

use crate::adapter::ApiState;

/// The main error type for this library.
#[derive(Debug, Error)]
pub enum Error {
    /// A REST call against a device failed and was classified.
    #[error("api error: {0}")]
    Api(#[from] ApiError),

    /// The protocol adapter rejected an operation or its transport failed.
    #[error("adapter error: {0}")]
    Adapter(#[from] AdapterError),

    /// A scheduler operation failed.
    #[error("task error: {0}")]
    Task(#[from] TaskError),

    /// Fleet bookkeeping failed.
    #[error("manager error: {0}")]
    Manager(#[from] ManagerError),

    /// An operation did not finish before its deadline.
    #[error("operation timed out after {0} ms")]
    Timeout(u64),
}

/// Classified failure of a REST call against a device.
///
/// Each variant maps to exactly one [`ApiState`], so retry logic only needs
/// to look at adapter state, never at the original error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// No response at all (connection refused, DNS, timeout).
    #[error("no response from device: {0}")]
    NoResponse(String),

    /// The host answered but does not speak the expected API.
    #[error("host is not an OctoPrint compatible device: {0}")]
    IncompatibleHost(String),

    /// The request was malformed. This is a bug on our side.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The API key was rejected.
    #[error("credentials rejected")]
    CredentialRejected,

    /// The key is the device's global key or belongs to a guest group.
    #[error("shared or global credential detected: {0}")]
    SharedCredential(String),

    /// The login succeeded but the response had no session.
    #[error("login response is missing the session field")]
    MissingSession,

    /// No admin user could be determined for the auth frame.
    #[error("no admin user available: {0}")]
    MissingAdminUser(String),
}

impl ApiError {
    /// Returns true if the failure is transient and may be retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NoResponse(_))
    }

    /// Returns the API state this classification maps to.
    #[must_use]
    pub fn api_state(&self) -> ApiState {
        match self {
            Self::NoResponse(_) => ApiState::NoResponse,
            Self::SharedCredential(_) => ApiState::GlobalKey,
            Self::IncompatibleHost(_)
            | Self::BadRequest(_)
            | Self::CredentialRejected
            | Self::MissingSession
            | Self::MissingAdminUser(_) => ApiState::AuthFail,
        }
    }

    /// Human-readable reason shown in a device's host state.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::NoResponse(_) => "device is not responding",
            Self::IncompatibleHost(_) => "host is not an OctoPrint compatible device",
            Self::BadRequest(_) => "request rejected as malformed",
            Self::CredentialRejected => "credentials rejected",
            Self::SharedCredential(_) => "shared/global credential detected",
            Self::MissingSession => "login response lacked a session",
            Self::MissingAdminUser(_) => "no admin user found",
        }
    }
}

/// Errors raised by a protocol adapter.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdapterError {
    /// Credentials were already registered on this adapter.
    #[error("credentials already registered for this adapter")]
    AlreadyRegistered,

    /// The adapter has no credentials yet.
    #[error("no credentials registered")]
    NotRegistered,

    /// A transport socket already exists.
    #[error("socket already open")]
    AlreadyOpen,

    /// No transport socket is open.
    #[error("socket is not open")]
    NotOpen,

    /// The login URL cannot be turned into a socket URL.
    #[error("invalid device url: {0}")]
    InvalidUrl(String),

    /// The WebSocket transport failed.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// An auth frame was requested before a session exists.
    #[error("no session available for the auth frame")]
    MissingSession,

    /// The local HTTP client could not be built.
    #[error("cannot build http client: {0}")]
    HttpClient(String),
}

/// Errors raised by the task scheduler.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The task id was empty.
    #[error("task id must not be empty")]
    EmptyId,

    /// A task with this id is already registered.
    #[error("task '{0}' is already registered")]
    DuplicateId(String),

    /// A named workload did not resolve to a registered runnable.
    #[error("no runnable registered under '{0}'")]
    UnknownService(String),

    /// The schedule options were inconsistent.
    #[error("invalid schedule for task '{id}': {message}")]
    InvalidSchedule {
        /// The task id.
        id: String,
        /// What is wrong with the options.
        message: String,
    },

    /// No task with this id exists.
    #[error("task '{0}' not found")]
    NotFound(String),

    /// The task is already running on its interval.
    #[error("task '{0}' is already enabled")]
    AlreadyEnabled(String),

    /// The task is already stopped.
    #[error("task '{0}' is already disabled")]
    AlreadyDisabled(String),

    /// Enable/disable only applies to periodic tasks.
    #[error("task '{0}' is not periodic")]
    NotPeriodic(String),

    /// The workload itself failed.
    #[error("task '{id}' failed: {message}")]
    Failed {
        /// The task id.
        id: String,
        /// Failure description.
        message: String,
    },
}

/// Errors related to fleet bookkeeping.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ManagerError {
    /// Device was not found in the manager.
    #[error("device '{0}' not found")]
    DeviceNotFound(String),

    /// An adapter is already bound to this device.
    #[error("an adapter is already bound to device '{0}'")]
    AdapterAlreadyBound(String),

    /// The device was torn down.
    #[error("device '{0}' is marked for removal")]
    MarkedForRemoval(String),
}

/// A specialized Result type for this library.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_no_response_is_retryable() {
        assert!(ApiError::NoResponse("refused".into()).is_retryable());
        assert!(!ApiError::CredentialRejected.is_retryable());
        assert!(!ApiError::SharedCredential("_api".into()).is_retryable());
        assert!(!ApiError::MissingSession.is_retryable());
        assert!(!ApiError::IncompatibleHost("404".into()).is_retryable());
    }

    #[test]
    fn classification_maps_to_api_state() {
        assert_eq!(
            ApiError::NoResponse(String::new()).api_state(),
            ApiState::NoResponse
        );
        assert_eq!(
            ApiError::SharedCredential(String::new()).api_state(),
            ApiState::GlobalKey
        );
        assert_eq!(ApiError::CredentialRejected.api_state(), ApiState::AuthFail);
        assert_eq!(
            ApiError::BadRequest(String::new()).api_state(),
            ApiState::AuthFail
        );
    }

    #[test]
    fn task_error_display() {
        let err = TaskError::InvalidSchedule {
            id: "sweep".to_string(),
            message: "interval must be positive".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "invalid schedule for task 'sweep': interval must be positive"
        );
    }

    #[test]
    fn error_from_api_error() {
        let err: Error = ApiError::CredentialRejected.into();
        assert!(matches!(err, Error::Api(ApiError::CredentialRejected)));
    }

    #[test]
    fn reason_is_human_readable() {
        assert_eq!(
            ApiError::SharedCredential("_api".into()).reason(),
            "shared/global credential detected"
        );
    }
}
