// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-device protocol adapter.
//!
//! An [`OctoPrintAdapter`] owns one device's REST login and WebSocket push
//! channel. It tracks two independent axes:
//!
//! - [`SocketState`]: how far the push channel got
//!   (`unopened → opening → authenticating → opened → authenticated`, or
//!   `aborted` / `error` / `closed`)
//! - [`ApiState`]: what the last REST login said about the device
//!
//! Every login failure is classified so that retry logic only has to look
//! at these two states.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use octofleet_lib::adapter::{OctoPrintAdapter, SocketScheme};
//! use octofleet_lib::event::{DeviceId, EventBus};
//! use octofleet_lib::protocol::{LoginDescriptor, OctoPrintHttpClient};
//!
//! # async fn example() -> octofleet_lib::Result<()> {
//! let transport = Arc::new(OctoPrintHttpClient::new()?);
//! let adapter = Arc::new(OctoPrintAdapter::new(transport, EventBus::new()));
//!
//! adapter.register_credentials(
//!     DeviceId::from("printer-1"),
//!     LoginDescriptor::new("http://192.168.1.20", "API_KEY"),
//!     SocketScheme::Auto,
//! )?;
//! adapter.setup_socket_session().await?;
//! adapter.open().await?;
//! # Ok(())
//! # }
//! ```

mod octoprint;
mod state;

pub use octoprint::{DEFAULT_THROTTLE, OctoPrintAdapter};
pub use state::{ApiState, SocketScheme, SocketState};
