//! Multicast events with scoped subscriptions.
//!
//! Every `subscribe` returns a [`Subscription`]. Dropping or disposing the
//! handle removes the handler, so a module that hands its handles to the
//! [`ResourceTracker`](crate::ResourceTracker) can never leak a subscriber
//! past `unload`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use crate::error::DisposeError;
use crate::resources::Disposable;

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct EventInner<T> {
    name: String,
    next_id: AtomicU64,
    handlers: RwLock<BTreeMap<u64, Handler<T>>>,
}

/// Thread-safe multicast event.
pub struct Event<T> {
    inner: Arc<EventInner<T>>,
}

impl<T: 'static> Event<T> {
    /// Create a new event with no subscribers.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventInner {
                name: name.into(),
                next_id: AtomicU64::new(0),
                handlers: RwLock::new(BTreeMap::new()),
            }),
        }
    }

    /// Subscribe a handler. The handler stays registered until the returned
    /// handle is dropped or disposed.
    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn subscribe(&self, handler: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(handler));

        let weak: Weak<EventInner<T>> = Arc::downgrade(&self.inner);
        Subscription {
            event: self.inner.name.clone(),
            release: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner
                        .handlers
                        .write()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(&id);
                }
            })),
        }
    }

    /// Invoke every handler synchronously, in subscription order.
    ///
    /// Handlers run outside the lock, so they may subscribe or unsubscribe.
    pub fn emit(&self, args: &T) {
        let handlers: Vec<Handler<T>> = self
            .inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for handler in handlers {
            handler(args);
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl<T> Clone for Event<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for Event<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event").field("name", &self.inner.name).finish()
    }
}

/// Scoped handle returned by every `subscribe` call.
pub struct Subscription {
    event: String,
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Name of the event this handle is subscribed to.
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Remove the handler now.
    pub fn unsubscribe(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("event", &self.event)
            .field("active", &self.release.is_some())
            .finish()
    }
}

impl Disposable for Subscription {
    fn label(&self) -> String {
        format!("subscription to {}", self.event)
    }

    fn dispose(mut self: Box<Self>) -> Result<(), DisposeError> {
        self.release_now();
        Ok(())
    }
}
