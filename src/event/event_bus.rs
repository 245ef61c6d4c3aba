// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Event bus for distributing normalized fleet events.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::broadcast;

use super::FleetEvent;

/// Default channel capacity for the broadcast side of the bus.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Unique identifier of a pattern subscription.
///
/// Returned by [`EventBus::on`] and used with [`EventBus::off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    /// Returns the raw ID value.
    #[must_use]
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Sub({})", self.0)
    }
}

/// A message as seen by broadcast subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    /// The name the event was emitted under.
    pub name: String,
    /// The event itself.
    pub event: FleetEvent,
}

type Handler = Arc<dyn Fn(&str, &FleetEvent) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    pattern: String,
    handler: Handler,
}

struct Inner {
    next_id: AtomicU64,
    subscriptions: RwLock<Vec<Subscription>>,
    sender: broadcast::Sender<BusMessage>,
}

/// Shared event bus with pattern subscriptions.
///
/// Handlers registered with [`on`](Self::on) are called synchronously, in
/// registration order, on the emitting task. A slow handler delays every
/// handler after it for the same event, so handlers must not block.
///
/// Patterns are `.`-separated. A `*` segment matches exactly one segment
/// and a trailing `**` matches any remaining segments, so `octoprint.*`
/// matches `octoprint.current` and `**` matches everything.
///
/// Async consumers can use [`subscribe`](Self::subscribe) instead, which
/// hands out a broadcast receiver of every emitted event. If that channel
/// fills up, a lagging receiver loses older events.
///
/// # Examples
///
/// ```
/// use octofleet_lib::event::{EventBus, FleetEvent};
///
/// let bus = EventBus::new();
/// let id = bus.on("octoprint.*", |name, event| {
///     println!("{name} from {}", event.device_id);
/// });
///
/// bus.emit("octoprint.current", FleetEvent::new("current", serde_json::Value::Null, "p1".into()));
/// bus.off(id);
/// ```
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    /// Creates a new event bus with default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Creates a new event bus whose broadcast channel buffers `capacity`
    /// events.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(1),
                subscriptions: RwLock::new(Vec::new()),
                sender,
            }),
        }
    }

    /// Registers a handler for every event whose name matches `pattern`.
    pub fn on<F>(&self, pattern: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(&str, &FleetEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.subscriptions.write().push(Subscription {
            id,
            pattern: pattern.into(),
            handler: Arc::new(handler),
        });
        id
    }

    /// Removes a handler. Returns `true` if it was registered.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.inner.subscriptions.write();
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        subscriptions.len() != before
    }

    /// Returns the number of registered pattern handlers.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.inner.subscriptions.read().len()
    }

    /// Subscribes to every event as an async stream.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.inner.sender.subscribe()
    }

    /// Returns the number of active broadcast subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.sender.receiver_count()
    }

    /// Emits an event under `name`.
    ///
    /// Matching handlers run before this returns. The lock is released
    /// before handlers are called, so a handler may call `on` or `off`.
    pub fn emit(&self, name: &str, event: FleetEvent) {
        let handlers: Vec<Handler> = self
            .inner
            .subscriptions
            .read()
            .iter()
            .filter(|s| pattern_matches(&s.pattern, name))
            .map(|s| Arc::clone(&s.handler))
            .collect();

        for handler in handlers {
            handler(name, &event);
        }

        // No broadcast subscribers is fine
        let _ = self.inner.sender.send(BusMessage {
            name: name.to_string(),
            event,
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("handlers", &self.handler_count())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Matches an event name against a subscription pattern.
fn pattern_matches(pattern: &str, name: &str) -> bool {
    let mut pattern_parts = pattern.split('.');
    let mut name_parts = name.split('.');

    loop {
        match (pattern_parts.next(), name_parts.next()) {
            (Some("**"), _) => return true,
            (Some(p), Some(n)) if p == "*" || p == n => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
