// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Workloads the scheduler can run.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;

use crate::error::Error;

/// A unit of work with a zero-argument `run` operation.
///
/// Implementations are shared between ticks, so `run` takes `&self`.
///
/// # Examples
///
/// ```
/// use futures_util::FutureExt;
/// use futures_util::future::BoxFuture;
/// use octofleet_lib::scheduler::Runnable;
///
/// struct Hello;
///
/// impl Runnable for Hello {
///     fn run(&self) -> BoxFuture<'_, octofleet_lib::Result<()>> {
///         async {
///             println!("hello");
///             Ok(())
///         }
///         .boxed()
///     }
/// }
/// ```
pub trait Runnable: Send + Sync {
    /// Runs the work once.
    fn run(&self) -> BoxFuture<'_, Result<(), Error>>;
}

/// Boxed closure producing one run's future.
pub type TaskFn = Arc<dyn Fn() -> BoxFuture<'static, Result<(), Error>> + Send + Sync>;

struct CallableRunnable(TaskFn);

impl Runnable for CallableRunnable {
    fn run(&self) -> BoxFuture<'_, Result<(), Error>> {
        (self.0)()
    }
}

/// What a scheduled task runs.
///
/// Either directly callable, or the name of a service looked up in the
/// scheduler's [`RunnableRegistry`] when the task is registered.
#[derive(Clone)]
pub enum Workload {
    /// A shared runnable object.
    Runnable(Arc<dyn Runnable>),
    /// A closure.
    Callable(TaskFn),
    /// A runnable registered under this name.
    Named(String),
}

impl Workload {
    /// Wraps an async closure.
    pub fn callable<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        Self::Callable(Arc::new(move || f().boxed()))
    }

    /// Wraps a runnable object.
    pub fn runnable(runnable: impl Runnable + 'static) -> Self {
        Self::Runnable(Arc::new(runnable))
    }

    /// Refers to a runnable by name.
    pub fn named(name: impl Into<String>) -> Self {
        Self::Named(name.into())
    }

    pub(crate) fn into_runnable(self) -> Result<Arc<dyn Runnable>, String> {
        match self {
            Self::Runnable(runnable) => Ok(runnable),
            Self::Callable(f) => Ok(Arc::new(CallableRunnable(f))),
            Self::Named(name) => Err(name),
        }
    }
}

impl std::fmt::Debug for Workload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Runnable(_) => f.write_str("Workload::Runnable"),
            Self::Callable(_) => f.write_str("Workload::Callable"),
            Self::Named(name) => write!(f, "Workload::Named({name})"),
        }
    }
}

/// Typed lookup of runnables by service name.
#[derive(Default, Clone)]
pub struct RunnableRegistry {
    services: HashMap<String, Arc<dyn Runnable>>,
}

impl RunnableRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a runnable, returning the one it replaced.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        runnable: Arc<dyn Runnable>,
    ) -> Option<Arc<dyn Runnable>> {
        self.services.insert(name.into(), runnable)
    }

    /// Looks up a runnable.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Runnable>> {
        self.services.get(name).cloned()
    }

    /// Returns true if a runnable is registered under `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    /// Returns all service names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.services.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for RunnableRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnableRegistry")
            .field("services", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    impl Runnable for Noop {
        fn run(&self) -> BoxFuture<'_, Result<(), Error>> {
            async { Ok(()) }.boxed()
        }
    }

    #[test]
    fn registry_lookup() {
        let mut registry = RunnableRegistry::new();
        assert!(registry.insert("noop", Arc::new(Noop)).is_none());
        assert!(registry.insert("noop", Arc::new(Noop)).is_some());

        assert!(registry.contains("noop"));
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.names(), vec!["noop".to_string()]);
    }

    #[test]
    fn named_workload_needs_resolution() {
        assert_eq!(
            Workload::named("sweep").into_runnable().err().as_deref(),
            Some("sweep")
        );
        assert!(Workload::runnable(Noop).into_runnable().is_ok());
    }

    #[tokio::test]
    async fn callable_runs_each_time() {
        let runnable = Workload::callable(|| async { Ok(()) })
            .into_runnable()
            .ok()
            .unwrap();
        assert!(runnable.run().await.is_ok());
        assert!(runnable.run().await.is_ok());
    }
}
