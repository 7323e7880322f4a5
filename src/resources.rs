//! Ownership tracking for resources created during an activation.

use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::error::DisposeError;

/// A resource that must be released when the module unloads.
pub trait Disposable {
    /// Human readable name used in logs.
    fn label(&self) -> String {
        "resource".to_string()
    }

    /// Release the resource. Called at most once.
    fn dispose(self: Box<Self>) -> Result<(), DisposeError>;
}

/// Disposal handle backed by a closure.
pub struct DisposeFn<F> {
    label: String,
    release: F,
}

impl<F> DisposeFn<F>
where
    F: FnOnce() -> Result<(), DisposeError>,
{
    pub fn new(label: impl Into<String>, release: F) -> Self {
        Self {
            label: label.into(),
            release,
        }
    }
}

impl<F> Disposable for DisposeFn<F>
where
    F: FnOnce() -> Result<(), DisposeError>,
{
    fn label(&self) -> String {
        self.label.clone()
    }

    fn dispose(self: Box<Self>) -> Result<(), DisposeError> {
        (self.release)()
    }
}

/// Summary of a [`ResourceTracker::dispose_all`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisposeReport {
    /// Handles released successfully
    pub disposed: usize,
    /// Handles whose release returned an error or panicked
    pub failed: usize,
}

impl DisposeReport {
    /// Total handles attempted.
    pub fn attempted(&self) -> usize {
        self.disposed + self.failed
    }
}

/// Records every disposal handle created during an activation and releases
/// each exactly once.
#[derive(Default)]
pub struct ResourceTracker {
    resources: Vec<Box<dyn Disposable>>,
}

impl ResourceTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of a disposal handle.
    pub fn register<R: Disposable + 'static>(&mut self, resource: R) {
        self.register_boxed(Box::new(resource));
    }

    /// Take ownership of an already boxed disposal handle.
    pub fn register_boxed(&mut self, resource: Box<dyn Disposable>) {
        tracing::trace!("Tracking {}", resource.label());
        self.resources.push(resource);
    }

    /// Register a resource that may have failed to construct.
    ///
    /// Returns whether anything was registered.
    pub fn register_optional<R: Disposable + 'static>(&mut self, resource: Option<R>) -> bool {
        match resource {
            Some(resource) => {
                self.register(resource);
                true
            }
            None => false,
        }
    }

    /// Register a release closure.
    pub fn register_fn<F>(&mut self, label: impl Into<String>, release: F)
    where
        F: FnOnce() -> Result<(), DisposeError> + 'static,
    {
        self.register(DisposeFn::new(label, release));
    }

    /// Number of handles waiting for disposal.
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Check if nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Release every tracked handle in reverse registration order.
    ///
    /// A failing or panicking release is logged and the remaining handles
    /// are still released. The tracker is empty afterwards, so a second call
    /// releases nothing.
    pub fn dispose_all(&mut self) -> DisposeReport {
        let mut report = DisposeReport::default();

        while let Some(resource) = self.resources.pop() {
            let label = resource.label();
            match catch_unwind(AssertUnwindSafe(move || resource.dispose())) {
                Ok(Ok(())) => {
                    tracing::trace!("Disposed {}", label);
                    report.disposed += 1;
                }
                Ok(Err(e)) => {
                    tracing::warn!("{}", e);
                    report.failed += 1;
                }
                Err(_) => {
                    tracing::warn!("Disposing {} panicked", label);
                    report.failed += 1;
                }
            }
        }

        report
    }
}

impl Drop for ResourceTracker {
    fn drop(&mut self) {
        if !self.resources.is_empty() {
            self.dispose_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn recorder(log: &Rc<RefCell<Vec<String>>>, name: &str) -> DisposeFn<impl FnOnce() -> Result<(), DisposeError>> {
        let log = log.clone();
        let owned = name.to_string();
        DisposeFn::new(name, move || {
            log.borrow_mut().push(owned);
            Ok(())
        })
    }

    #[test]
    fn test_dispose_reverse_order_once() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut tracker = ResourceTracker::new();
        tracker.register(recorder(&log, "window"));
        tracker.register(recorder(&log, "label"));
        tracker.register(recorder(&log, "icon"));

        let report = tracker.dispose_all();
        assert_eq!(report, DisposeReport { disposed: 3, failed: 0 });
        assert_eq!(*log.borrow(), vec!["icon", "label", "window"]);

        let again = tracker.dispose_all();
        assert_eq!(again.attempted(), 0);
        assert_eq!(log.borrow().len(), 3);
    }

    #[test]
    fn test_failures_do_not_stop_disposal() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut tracker = ResourceTracker::new();
        tracker.register(recorder(&log, "first"));
        tracker.register_fn("broken", || Err(DisposeError::new("broken", "device lost")));
        tracker.register_fn("panicky", || panic!("boom"));
        tracker.register(recorder(&log, "last"));

        let report = tracker.dispose_all();
        assert_eq!(report, DisposeReport { disposed: 2, failed: 2 });
        assert_eq!(*log.borrow(), vec!["last", "first"]);
    }

    #[test]
    fn test_register_optional_skips_absent() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut tracker = ResourceTracker::new();

        assert!(!tracker.register_optional::<DisposeFn<fn() -> Result<(), DisposeError>>>(None));
        assert!(tracker.register_optional(Some(recorder(&log, "texture"))));
        assert_eq!(tracker.len(), 1);

        assert_eq!(tracker.dispose_all().disposed, 1);
    }

    #[test]
    fn test_drop_disposes_leftovers() {
        let log = Rc::new(RefCell::new(Vec::new()));
        {
            let mut tracker = ResourceTracker::new();
            tracker.register(recorder(&log, "menu"));
        }
        assert_eq!(*log.borrow(), vec!["menu"]);
    }
}
