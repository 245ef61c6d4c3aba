// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interface to the external device registry.

use futures_util::future::BoxFuture;

use crate::error::Error;
use crate::event::DeviceId;

use super::config::DeviceRecord;

/// Source of device records, typically backed by a database.
///
/// The fleet manager reads it once at startup through
/// [`FleetManager::load_from_registry`](super::FleetManager::load_from_registry)
/// and is kept in sync afterwards with [`RegistryEvent`]s.
pub trait DeviceRegistry: Send + Sync {
    /// Lists every known device.
    fn list(&self) -> BoxFuture<'_, Result<Vec<DeviceRecord>, Error>>;
}

/// Change notification emitted by the device registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A device was created.
    Created(DeviceRecord),
    /// A device record was replaced.
    Updated(DeviceRecord),
    /// Devices were deleted.
    Deleted(Vec<DeviceId>),
    /// Several devices were created at once.
    BatchCreated(Vec<DeviceRecord>),
}
