//! Hand-off of work to the host's main thread.
//!
//! Background continuations never touch host UI directly. They enqueue a
//! task through a [`MainThreadHandle`]; the controller drains the queue once
//! per `update` tick and runs each task with the module and a
//! [`MainThreadContext`], the only place UI operations are exposed.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::gateway::ApiGateway;
use crate::resources::{Disposable, ResourceTracker};
use crate::settings::SettingsRegistry;
use crate::ui::{NodeId, NodeSpec, NotificationLevel, UiFactory, UiNodeHandle};

/// Deferred main-thread work.
pub type MainThreadTask<M> = Box<dyn FnOnce(&mut M, &mut MainThreadContext<'_, M>) + Send>;

struct QueueShared<M> {
    tasks: Mutex<VecDeque<MainThreadTask<M>>>,
    live: AtomicBool,
}

/// Cloneable, thread-safe sender side of a [`MainThreadQueue`].
pub struct MainThreadHandle<M> {
    shared: Arc<QueueShared<M>>,
}

impl<M> Clone for MainThreadHandle<M> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<M: 'static> MainThreadHandle<M> {
    /// Queue a task for the next drain.
    ///
    /// Returns `false`, dropping the task, once the activation that owns the
    /// queue has started unloading.
    pub fn enqueue<F>(&self, task: F) -> bool
    where
        F: FnOnce(&mut M, &mut MainThreadContext<'_, M>) + Send + 'static,
    {
        if !self.is_live() {
            tracing::trace!("Dropping main-thread task, module is unloading");
            return false;
        }
        self.shared
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Box::new(task));
        true
    }

    /// Check if the owning activation is still live.
    pub fn is_live(&self) -> bool {
        self.shared.live.load(Ordering::Acquire)
    }
}

impl<M> fmt::Debug for MainThreadHandle<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MainThreadHandle")
            .field("live", &self.shared.live.load(Ordering::Acquire))
            .finish()
    }
}

/// FIFO queue of main-thread tasks, owned by one activation.
pub struct MainThreadQueue<M> {
    handle: MainThreadHandle<M>,
}

impl<M: 'static> MainThreadQueue<M> {
    pub fn new() -> Self {
        Self {
            handle: MainThreadHandle {
                shared: Arc::new(QueueShared {
                    tasks: Mutex::new(VecDeque::new()),
                    live: AtomicBool::new(true),
                }),
            },
        }
    }

    /// A sender that can be moved to other threads.
    pub fn handle(&self) -> MainThreadHandle<M> {
        self.handle.clone()
    }

    /// Tasks waiting for the next drain.
    pub fn len(&self) -> usize {
        self.handle
            .shared
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every task queued before this call, in submission order.
    ///
    /// Tasks enqueued while draining wait for the next call. Returns the
    /// number of tasks run.
    pub fn drain_once(&self, module: &mut M, ctx: &mut MainThreadContext<'_, M>) -> usize {
        let batch = std::mem::take(
            &mut *self
                .handle
                .shared
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );

        let mut ran = 0;
        for task in batch {
            if !self.handle.is_live() {
                break;
            }
            task(module, ctx);
            ran += 1;
        }
        ran
    }

    /// Mark the activation dead and drop pending tasks without running them.
    ///
    /// Returns the number of tasks dropped.
    pub fn close(&self) -> usize {
        self.handle.shared.live.store(false, Ordering::Release);
        let dropped = std::mem::take(
            &mut *self
                .handle
                .shared
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        dropped.len()
    }
}

impl<M: 'static> Default for MainThreadQueue<M> {
    fn default() -> Self {
        Self::new()
    }
}

/// Main-thread collaborators of one activation.
pub(crate) struct MainThreadServices {
    pub ui: Rc<dyn UiFactory>,
    pub settings: SettingsRegistry,
    pub gateway: Arc<ApiGateway>,
    pub runtime: Option<Handle>,
}

/// Access to host UI and activation state, available only on the main
/// thread: inside queued tasks and the `initialize`, `on_loaded` and
/// `update` hooks.
pub struct MainThreadContext<'a, M> {
    services: &'a MainThreadServices,
    resources: &'a mut ResourceTracker,
    main_thread: &'a MainThreadHandle<M>,
}

impl<'a, M: 'static> MainThreadContext<'a, M> {
    pub(crate) fn new(
        services: &'a MainThreadServices,
        resources: &'a mut ResourceTracker,
        main_thread: &'a MainThreadHandle<M>,
    ) -> Self {
        Self {
            services,
            resources,
            main_thread,
        }
    }

    /// Create a UI node. It is disposed automatically on unload.
    pub fn create_node(&mut self, spec: NodeSpec) -> Result<NodeId> {
        let id = self.services.ui.create(&spec)?;
        self.resources
            .register(UiNodeHandle::new(id, spec.kind, self.services.ui.clone()));
        Ok(id)
    }

    /// Merge properties into an existing node.
    pub fn update_node(&self, node: NodeId, props: Value) -> Result<()> {
        self.services.ui.update(node, &props)
    }

    /// Show a screen notification.
    pub fn notify(&self, message: &str, level: NotificationLevel) {
        self.services.ui.notify(message, level);
    }

    /// Hand a resource to the activation; it is disposed on unload.
    pub fn track(&mut self, resource: impl Disposable + 'static) {
        self.resources.register(resource);
    }

    /// Track a resource that may have failed to construct.
    pub fn track_optional<R: Disposable + 'static>(&mut self, resource: Option<R>) -> bool {
        self.resources.register_optional(resource)
    }

    /// Number of resources awaiting disposal.
    pub fn tracked_resources(&self) -> usize {
        self.resources.len()
    }

    pub fn settings(&self) -> &SettingsRegistry {
        &self.services.settings
    }

    pub fn gateway(&self) -> &Arc<ApiGateway> {
        &self.services.gateway
    }

    /// Sender for work that must come back to the main thread.
    pub fn main_thread(&self) -> MainThreadHandle<M> {
        self.main_thread.clone()
    }

    /// Run background work on the host runtime.
    ///
    /// The future must be `Send`, so it cannot capture UI handles; results
    /// come back through [`main_thread`](Self::main_thread). Returns `None`
    /// if the host did not provide a runtime.
    pub fn spawn<F>(&self, future: F) -> Option<JoinHandle<()>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match &self.services.runtime {
            Some(runtime) => Some(runtime.spawn(future)),
            None => {
                tracing::warn!("No runtime available, background task dropped");
                None
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use async_trait::async_trait;

    use crate::error::ApiError;
    use crate::gateway::ApiClient;
    use crate::ui::testing::RecordingUi;

    pub struct OfflineClient;

    #[async_trait]
    impl ApiClient for OfflineClient {
        async fn request(&self, _endpoint: &str, _params: &Value) -> std::result::Result<Value, ApiError> {
            Err(ApiError::Transport("offline".into()))
        }
    }

    pub fn services(ui: Rc<RecordingUi>) -> MainThreadServices {
        MainThreadServices {
            ui,
            settings: SettingsRegistry::in_memory("test"),
            gateway: Arc::new(ApiGateway::new(Arc::new(OfflineClient))),
            runtime: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::services;
    use super::*;
    use crate::ui::testing::RecordingUi;
    use serde_json::json;

    fn drain(queue: &MainThreadQueue<Vec<u32>>, module: &mut Vec<u32>) -> usize {
        let services = services(Rc::new(RecordingUi::default()));
        let mut resources = ResourceTracker::new();
        let handle = queue.handle();
        let mut ctx = MainThreadContext::new(&services, &mut resources, &handle);
        queue.drain_once(module, &mut ctx)
    }

    #[test]
    fn test_drain_fifo() {
        let queue: MainThreadQueue<Vec<u32>> = MainThreadQueue::new();
        let handle = queue.handle();
        for n in 1..=3 {
            handle.enqueue(move |m: &mut Vec<u32>, _ctx| m.push(n));
        }

        let mut module = Vec::new();
        assert_eq!(drain(&queue, &mut module), 3);
        assert_eq!(module, vec![1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_reenqueue_runs_next_tick() {
        let queue: MainThreadQueue<Vec<u32>> = MainThreadQueue::new();
        queue.handle().enqueue(|m: &mut Vec<u32>, ctx| {
            m.push(1);
            ctx.main_thread().enqueue(|m: &mut Vec<u32>, _ctx| m.push(2));
        });

        let mut module = Vec::new();
        assert_eq!(drain(&queue, &mut module), 1);
        assert_eq!(module, vec![1]);
        assert_eq!(queue.len(), 1);

        assert_eq!(drain(&queue, &mut module), 1);
        assert_eq!(module, vec![1, 2]);
    }

    #[test]
    fn test_enqueue_from_other_threads() {
        let queue: MainThreadQueue<Vec<u32>> = MainThreadQueue::new();
        let workers: Vec<_> = (0..4u32)
            .map(|n| {
                let handle = queue.handle();
                std::thread::spawn(move || {
                    handle.enqueue(move |m: &mut Vec<u32>, _ctx| m.push(n));
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let mut module = Vec::new();
        assert_eq!(drain(&queue, &mut module), 4);
        module.sort_unstable();
        assert_eq!(module, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_close_drops_pending_and_rejects_new() {
        let queue: MainThreadQueue<Vec<u32>> = MainThreadQueue::new();
        let handle = queue.handle();
        handle.enqueue(|m: &mut Vec<u32>, _ctx| m.push(1));

        assert_eq!(queue.close(), 1);
        assert!(!handle.is_live());
        assert!(!handle.enqueue(|m: &mut Vec<u32>, _ctx| m.push(2)));

        let mut module = Vec::new();
        assert_eq!(drain(&queue, &mut module), 0);
        assert!(module.is_empty());
    }

    #[test]
    fn test_context_tracks_created_nodes() {
        let ui = Rc::new(RecordingUi::default());
        let services = services(ui.clone());
        let mut resources = ResourceTracker::new();
        let queue: MainThreadQueue<()> = MainThreadQueue::new();
        let handle = queue.handle();

        {
            let mut ctx = MainThreadContext::new(&services, &mut resources, &handle);
            let panel = ctx.create_node(NodeSpec::new("panel")).unwrap();
            let label = ctx
                .create_node(NodeSpec::new("label").with_parent(panel).with_props(json!({ "text": "..." })))
                .unwrap();
            ctx.update_node(label, json!({ "text": "done" })).unwrap();
            ctx.notify("hello", NotificationLevel::Warning);
            assert_eq!(ctx.tracked_resources(), 2);
            assert_eq!(ui.props(label), Some(json!({ "text": "done" })));
        }

        assert_eq!(resources.dispose_all().disposed, 2);
        assert_eq!(ui.live_nodes(), 0);
        assert_eq!(*ui.notifications.borrow(), vec!["hello"]);
    }
}
