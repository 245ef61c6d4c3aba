// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Generic task scheduling.
//!
//! Tasks are registered with a [`Workload`] and [`TaskOptions`]:
//!
//! - a workload is a [`Runnable`] object, a closure, or the name of a
//!   runnable previously provided to the scheduler's [`RunnableRegistry`];
//! - options select one of periodic, run-once or delayed execution.
//!
//! Registration validates everything up front and fails without side
//! effects. At run time every execution is wrapped: errors and panics are
//! logged with the task id and counted in [`TaskStats`], and the first
//! success is logged once.

mod options;
mod runnable;
mod task_scheduler;

pub use options::{Schedule, TaskOptions};
pub use runnable::{Runnable, RunnableRegistry, TaskFn, Workload};
pub use task_scheduler::{TaskScheduler, TaskStats};
