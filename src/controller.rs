//! Module lifecycle controller.
//!
//! Drives one module through
//! `Unloaded → Initializing → Loading → Loaded → Unloading → Unloaded`.
//! Each pass through that cycle is an activation; its settings, task queue
//! and tracked resources live exactly as long as the activation does.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::runtime::Handle;

use crate::config::ModuleConfig;
use crate::directories::{DirectoryService, FsDirectories};
use crate::error::{ModuleError, Result};
use crate::gateway::ApiGateway;
use crate::module::{LoadContext, LoadFuture, Module};
use crate::resources::ResourceTracker;
use crate::settings::SettingsRegistry;
use crate::store::{JsonSettingsStore, SettingsStore};
use crate::task_queue::{MainThreadContext, MainThreadQueue, MainThreadServices};
use crate::ui::UiFactory;

/// Lifecycle state of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Unloaded,
    Initializing,
    Loading,
    Loaded,
    Unloading,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Unloaded => write!(f, "unloaded"),
            LifecycleState::Initializing => write!(f, "initializing"),
            LifecycleState::Loading => write!(f, "loading"),
            LifecycleState::Loaded => write!(f, "loaded"),
            LifecycleState::Unloading => write!(f, "unloading"),
        }
    }
}

/// Host-provided collaborators shared by every activation.
pub struct ModuleServices {
    config: ModuleConfig,
    ui: Rc<dyn UiFactory>,
    gateway: Arc<ApiGateway>,
    store: Arc<dyn SettingsStore>,
    directories: Arc<dyn DirectoryService>,
    runtime: Option<Handle>,
}

impl ModuleServices {
    /// Services with a JSON settings store under `config.settings_dir`,
    /// directories from `config`, and the current tokio runtime if any.
    pub fn new(config: ModuleConfig, ui: Rc<dyn UiFactory>, gateway: Arc<ApiGateway>) -> Self {
        let store = Arc::new(JsonSettingsStore::new(config.settings_dir.clone()));
        let directories = Arc::new(FsDirectories::from_config(&config));
        Self {
            config,
            ui,
            gateway,
            store,
            directories,
            runtime: Handle::try_current().ok(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn SettingsStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_directories(mut self, directories: Arc<dyn DirectoryService>) -> Self {
        self.directories = directories;
        self
    }

    /// Runtime used by [`MainThreadContext::spawn`] and for blocking
    /// directory scans during load. With `None` the load future does not
    /// depend on tokio and can be polled by any executor.
    pub fn with_runtime(mut self, runtime: Option<Handle>) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn config(&self) -> &ModuleConfig {
        &self.config
    }

    pub fn gateway(&self) -> &Arc<ApiGateway> {
        &self.gateway
    }
}

/// Result of a [`PendingLoad`], handed back to
/// [`ModuleController::complete_load`].
#[derive(Debug)]
pub struct LoadCompletion {
    epoch: u64,
    result: Result<()>,
}

impl LoadCompletion {
    /// Activation that started the load.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// A running `load_async`, tagged with its activation.
///
/// `Send + 'static`, so the host may poll it anywhere while it keeps
/// calling [`ModuleController::update`] and [`ModuleController::unload`].
pub struct PendingLoad {
    epoch: u64,
    future: LoadFuture,
}

impl PendingLoad {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl Future for PendingLoad {
    type Output = LoadCompletion;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let epoch = this.epoch;
        this.future
            .as_mut()
            .poll(cx)
            .map(|result| LoadCompletion { epoch, result })
    }
}

impl fmt::Debug for PendingLoad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingLoad")
            .field("epoch", &self.epoch)
            .finish()
    }
}

struct Activation<M> {
    epoch: u64,
    queue: MainThreadQueue<M>,
    resources: ResourceTracker,
    main: MainThreadServices,
}

/// Owns a module and enforces its lifecycle.
///
/// Lives on the host's main thread (it holds the `Rc` UI factory, so it is
/// neither `Send` nor `Sync`).
pub struct ModuleController<M: Module> {
    module: M,
    services: ModuleServices,
    state: LifecycleState,
    epoch: u64,
    activation: Option<Activation<M>>,
}

impl<M: Module> ModuleController<M> {
    pub fn new(module: M, services: ModuleServices) -> Self {
        Self {
            module,
            services,
            state: LifecycleState::Unloaded,
            epoch: 0,
            activation: None,
        }
    }

    /// Module namespace, used for logs and the settings collection.
    pub fn name(&self) -> &str {
        &self.services.config.namespace
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Number of activations started so far.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn module(&self) -> &M {
        &self.module
    }

    pub fn module_mut(&mut self) -> &mut M {
        &mut self.module
    }

    pub fn services(&self) -> &ModuleServices {
        &self.services
    }

    /// Settings of the current activation.
    pub fn settings(&self) -> Option<&SettingsRegistry> {
        self.activation.as_ref().map(|a| &a.main.settings)
    }

    /// Resources the current activation will dispose on unload.
    pub fn tracked_resources(&self) -> usize {
        self.activation.as_ref().map_or(0, |a| a.resources.len())
    }

    /// Main-thread tasks waiting for the next tick.
    pub fn pending_tasks(&self) -> usize {
        self.activation.as_ref().map_or(0, |a| a.queue.len())
    }

    /// Start an activation: load persisted settings, then run
    /// `define_settings` and `initialize`.
    ///
    /// On error the activation is torn down and the module is left
    /// `Unloaded`.
    ///
    /// # Panics
    ///
    /// Panics unless the module is `Unloaded`.
    pub fn activate(&mut self) -> Result<()> {
        if self.state != LifecycleState::Unloaded {
            panic!(
                "activate called on module '{}' in state {}",
                self.name(),
                self.state
            );
        }

        self.epoch += 1;
        self.state = LifecycleState::Initializing;
        tracing::info!("Activating module '{}' (activation {})", self.name(), self.epoch);

        if let Err(e) = self.start_activation() {
            tracing::warn!("Module '{}' failed to initialize: {}", self.name(), e);
            self.unload();
            return Err(e);
        }
        Ok(())
    }

    fn start_activation(&mut self) -> Result<()> {
        let settings = SettingsRegistry::load(self.name(), self.services.store.clone())?;
        self.activation = Some(Activation {
            epoch: self.epoch,
            queue: MainThreadQueue::new(),
            resources: ResourceTracker::new(),
            main: MainThreadServices {
                ui: self.services.ui.clone(),
                settings: settings.clone(),
                gateway: self.services.gateway.clone(),
                runtime: self.services.runtime.clone(),
            },
        });

        self.module.define_settings(&settings)?;
        self.with_context(|module, ctx| module.initialize(ctx))
    }

    /// Run `f` with the module and a main-thread context of the current
    /// activation.
    fn with_context<R>(&mut self, f: impl FnOnce(&mut M, &mut MainThreadContext<'_, M>) -> R) -> R {
        let Some(activation) = self.activation.as_mut() else {
            panic!("module '{}' has no live activation", self.services.config.namespace);
        };
        let handle = activation.queue.handle();
        let mut ctx = MainThreadContext::new(&activation.main, &mut activation.resources, &handle);
        f(&mut self.module, &mut ctx)
    }

    /// Call `load_async` and return its future without awaiting it.
    ///
    /// # Panics
    ///
    /// Panics if the module was already loaded or is loading in this
    /// activation, or if it was not activated.
    pub fn begin_load(&mut self) -> PendingLoad {
        match self.state {
            LifecycleState::Initializing => {}
            LifecycleState::Loading | LifecycleState::Loaded => panic!(
                "load_async called twice for module '{}' (state {})",
                self.services.config.namespace, self.state
            ),
            state => panic!(
                "load_async called on module '{}' in state {}",
                self.services.config.namespace, state
            ),
        }
        let Some(activation) = self.activation.as_ref() else {
            panic!("module '{}' has no live activation", self.services.config.namespace);
        };

        self.state = LifecycleState::Loading;
        tracing::debug!("Loading module '{}'", self.services.config.namespace);

        let ctx = LoadContext::new(
            self.services.config.namespace.clone(),
            activation.main.settings.clone(),
            activation.main.gateway.clone(),
            self.services.directories.clone(),
            activation.queue.handle(),
            activation.main.runtime.clone(),
        );
        PendingLoad {
            epoch: activation.epoch,
            future: self.module.load_async(ctx),
        }
    }

    /// Finish a load started by [`begin_load`](Self::begin_load).
    ///
    /// A completion from an earlier activation, or one arriving after
    /// `unload`, is discarded. A failed load tears the activation down and
    /// returns [`ModuleError::LoadFailed`].
    pub fn complete_load(&mut self, completion: LoadCompletion) -> Result<()> {
        if self.state != LifecycleState::Loading || completion.epoch != self.epoch {
            tracing::debug!(
                "Discarding stale load completion for module '{}' (activation {}, current {} in state {})",
                self.name(),
                completion.epoch,
                self.epoch,
                self.state
            );
            return Ok(());
        }

        if let Err(e) = completion.result {
            tracing::warn!("Module '{}' failed to load: {}", self.name(), e);
            self.unload();
            return Err(ModuleError::LoadFailed(e.to_string()));
        }

        self.state = LifecycleState::Loaded;
        tracing::info!("Module '{}' loaded", self.name());

        if let Err(e) = self.with_context(|module, ctx| module.on_loaded(ctx)) {
            tracing::warn!("Module '{}' failed in on_loaded: {}", self.name(), e);
            self.unload();
            return Err(e);
        }
        Ok(())
    }

    /// Run the whole load on the caller's task.
    ///
    /// Hosts that need to keep ticking during the load should use
    /// [`begin_load`](Self::begin_load) and
    /// [`complete_load`](Self::complete_load) instead.
    ///
    /// # Panics
    ///
    /// Same as [`begin_load`](Self::begin_load).
    pub async fn load(&mut self) -> Result<()> {
        let completion = self.begin_load().await;
        self.complete_load(completion)
    }

    /// One host tick: drain the main-thread queue, then call
    /// [`Module::update`].
    ///
    /// # Panics
    ///
    /// Panics unless the module is `Loaded`.
    pub fn update(&mut self, elapsed: Duration) {
        if self.state != LifecycleState::Loaded {
            panic!(
                "update called on module '{}' in state {}",
                self.name(),
                self.state
            );
        }
        let Some(activation) = self.activation.as_mut() else {
            panic!("module '{}' has no live activation", self.services.config.namespace);
        };

        let handle = activation.queue.handle();
        let mut ctx = MainThreadContext::new(&activation.main, &mut activation.resources, &handle);
        let ran = activation.queue.drain_once(&mut self.module, &mut ctx);
        if ran > 0 {
            tracing::trace!("Ran {} main-thread tasks", ran);
        }
        self.module.update(&mut ctx, elapsed);
    }

    /// Tear down the current activation from any state.
    ///
    /// Pending main-thread tasks are dropped, [`Module::unload`] runs, every
    /// tracked resource is disposed in reverse registration order and the
    /// settings are saved. Calling it while `Unloaded` does nothing.
    pub fn unload(&mut self) {
        if self.state == LifecycleState::Unloaded {
            tracing::trace!("Module '{}' already unloaded", self.name());
            return;
        }

        let from = self.state;
        self.state = LifecycleState::Unloading;
        tracing::info!("Unloading module '{}' (was {})", self.name(), from);

        if let Some(activation) = &self.activation {
            let dropped = activation.queue.close();
            if dropped > 0 {
                tracing::debug!("Dropped {} pending main-thread tasks", dropped);
            }
        }

        self.module.unload();

        if let Some(mut activation) = self.activation.take() {
            let report = activation.resources.dispose_all();
            tracing::debug!(
                "Released {} resources for module '{}' ({} failed)",
                report.disposed,
                self.services.config.namespace,
                report.failed
            );

            if let Err(e) = activation.main.settings.save() {
                tracing::warn!(
                    "Failed to save settings for module '{}': {}",
                    self.services.config.namespace,
                    e
                );
            }
        }

        self.state = LifecycleState::Unloaded;
    }
}

impl<M: Module> Drop for ModuleController<M> {
    fn drop(&mut self) {
        self.unload();
    }
}

impl<M: Module> fmt::Debug for ModuleController<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleController")
            .field("name", &self.services.config.namespace)
            .field("state", &self.state)
            .field("epoch", &self.epoch)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use futures::FutureExt;

    use crate::settings::{SettingEntry, SettingMetadata};
    use crate::store::MemorySettingsStore;
    use crate::task_queue::fixtures::OfflineClient;
    use crate::ui::testing::RecordingUi;
    use crate::ui::{NodeId, NodeSpec};

    #[derive(Default)]
    struct Probe {
        hooks: Vec<&'static str>,
        fail_load: bool,
        fail_initialize: bool,
        loads: Option<SettingEntry<i64>>,
        label: Option<NodeId>,
        ticks: Vec<Duration>,
    }

    impl Module for Probe {
        fn define_settings(&mut self, settings: &SettingsRegistry) -> Result<()> {
            self.hooks.push("define_settings");
            self.loads = Some(settings.define_setting(
                "loads",
                0i64,
                SettingMetadata::new("Loads", "Completed loads"),
            )?);
            Ok(())
        }

        fn initialize(&mut self, ctx: &mut MainThreadContext<'_, Self>) -> Result<()> {
            self.hooks.push("initialize");
            ctx.create_node(NodeSpec::new("corner icon"))?;
            if self.fail_initialize {
                return Err(ModuleError::InitFailed("no icon texture".into()));
            }
            Ok(())
        }

        fn load_async(&mut self, ctx: LoadContext<Self>) -> LoadFuture {
            self.hooks.push("load_async");
            let fail = self.fail_load;
            async move {
                tokio::task::yield_now().await;
                if fail {
                    return Err(ModuleError::Io(std::io::Error::other("disk gone")));
                }
                ctx.main_thread().enqueue(|module: &mut Probe, ctx| {
                    module.hooks.push("queued");
                    module.label = ctx.create_node(NodeSpec::new("label")).ok();
                });
                Ok(())
            }
            .boxed()
        }

        fn on_loaded(&mut self, _ctx: &mut MainThreadContext<'_, Self>) -> Result<()> {
            self.hooks.push("on_loaded");
            if let Some(loads) = &self.loads {
                loads.set(loads.value() + 1);
            }
            Ok(())
        }

        fn update(&mut self, _ctx: &mut MainThreadContext<'_, Self>, elapsed: Duration) {
            self.ticks.push(elapsed);
        }

        fn unload(&mut self) {
            self.hooks.push("unload");
            self.label = None;
        }
    }

    fn controller(module: Probe, ui: Rc<RecordingUi>, store: Arc<MemorySettingsStore>) -> ModuleController<Probe> {
        let config = ModuleConfig::new("probe", PathBuf::from("/unused/settings"), PathBuf::from("/unused/data"));
        let services = ModuleServices::new(config, ui, Arc::new(ApiGateway::new(Arc::new(OfflineClient))))
            .with_store(store)
            .with_runtime(None);
        ModuleController::new(module, services)
    }

    /// Counts the files in its registered directories while loading.
    #[derive(Default)]
    struct Scanner {
        files: Option<usize>,
    }

    impl Module for Scanner {
        fn define_settings(&mut self, _settings: &SettingsRegistry) -> Result<()> {
            Ok(())
        }

        fn load_async(&mut self, ctx: LoadContext<Self>) -> LoadFuture {
            async move {
                let scans = ctx.scan_directories().await?;
                let files: usize = scans.iter().map(|s| s.file_count).sum();
                ctx.main_thread().enqueue(move |module: &mut Scanner, _ctx| {
                    module.files = Some(files);
                });
                Ok(())
            }
            .boxed()
        }
    }

    #[test]
    fn test_load_polled_outside_tokio() {
        let temp = tempfile::TempDir::new().unwrap();
        let config = ModuleConfig::new("scanner", temp.path().join("settings"), temp.path().join("data"))
            .with_directories(["cache"]);
        config.ensure_dirs().unwrap();
        std::fs::write(config.directory_path("cache").join("items.json"), "[]").unwrap();

        let services = ModuleServices::new(
            config,
            Rc::new(RecordingUi::default()),
            Arc::new(ApiGateway::new(Arc::new(OfflineClient))),
        )
        .with_store(Arc::new(MemorySettingsStore::new()))
        .with_runtime(None);
        let mut controller = ModuleController::new(Scanner::default(), services);

        controller.activate().unwrap();
        let completion = futures::executor::block_on(controller.begin_load());
        assert!(completion.is_ok());
        controller.complete_load(completion).unwrap();
        controller.update(Duration::from_millis(16));

        assert_eq!(controller.module().files, Some(1));
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let ui = Rc::new(RecordingUi::default());
        let mut controller = controller(Probe::default(), ui.clone(), Arc::new(MemorySettingsStore::new()));

        controller.activate().unwrap();
        assert_eq!(controller.state(), LifecycleState::Initializing);
        assert_eq!(ui.live_nodes(), 1);

        controller.load().await.unwrap();
        assert_eq!(controller.state(), LifecycleState::Loaded);
        assert_eq!(controller.pending_tasks(), 1);

        controller.update(Duration::from_millis(16));
        assert!(controller.module().label.is_some());
        assert_eq!(controller.module().ticks, vec![Duration::from_millis(16)]);
        assert_eq!(ui.live_nodes(), 2);

        controller.unload();
        assert_eq!(controller.state(), LifecycleState::Unloaded);
        assert_eq!(ui.live_nodes(), 0);
        assert_eq!(
            controller.module().hooks,
            vec!["define_settings", "initialize", "load_async", "on_loaded", "queued", "unload"]
        );
    }

    #[test]
    fn test_unload_from_initializing() {
        let ui = Rc::new(RecordingUi::default());
        let mut controller = controller(Probe::default(), ui.clone(), Arc::new(MemorySettingsStore::new()));

        controller.activate().unwrap();
        controller.unload();

        assert_eq!(controller.state(), LifecycleState::Unloaded);
        assert_eq!(ui.live_nodes(), 0);
        assert_eq!(controller.tracked_resources(), 0);
    }

    #[tokio::test]
    async fn test_unload_while_loading_discards_completion() {
        let ui = Rc::new(RecordingUi::default());
        let mut controller = controller(Probe::default(), ui.clone(), Arc::new(MemorySettingsStore::new()));

        controller.activate().unwrap();
        let pending = controller.begin_load();
        assert_eq!(controller.state(), LifecycleState::Loading);

        controller.unload();
        assert_eq!(ui.live_nodes(), 0);

        // The load finishes after unload; its UI task is rejected
        let completion = pending.await;
        assert!(completion.is_ok());
        controller.complete_load(completion).unwrap();

        assert_eq!(controller.state(), LifecycleState::Unloaded);
        assert!(!controller.module().hooks.contains(&"on_loaded"));
        assert_eq!(ui.live_nodes(), 0);
    }

    #[test]
    fn test_unload_is_idempotent() {
        let ui = Rc::new(RecordingUi::default());
        let mut controller = controller(Probe::default(), ui, Arc::new(MemorySettingsStore::new()));

        controller.unload();
        controller.activate().unwrap();
        controller.unload();
        controller.unload();

        let unloads = controller.module().hooks.iter().filter(|h| **h == "unload").count();
        assert_eq!(unloads, 1);
    }

    #[tokio::test]
    async fn test_stale_completion_from_previous_activation() {
        let ui = Rc::new(RecordingUi::default());
        let mut controller = controller(Probe::default(), ui, Arc::new(MemorySettingsStore::new()));

        controller.activate().unwrap();
        let first = controller.begin_load();
        controller.unload();

        controller.activate().unwrap();
        let second = controller.begin_load();
        assert_eq!(second.epoch(), 2);

        controller.complete_load(first.await).unwrap();
        assert_eq!(controller.state(), LifecycleState::Loading);

        controller.complete_load(second.await).unwrap();
        assert_eq!(controller.state(), LifecycleState::Loaded);
    }

    #[tokio::test]
    async fn test_load_failure_tears_down() {
        let ui = Rc::new(RecordingUi::default());
        let probe = Probe {
            fail_load: true,
            ..Default::default()
        };
        let mut controller = controller(probe, ui.clone(), Arc::new(MemorySettingsStore::new()));

        controller.activate().unwrap();
        let err = controller.load().await.unwrap_err();

        assert!(matches!(err, ModuleError::LoadFailed(_)));
        assert_eq!(controller.state(), LifecycleState::Unloaded);
        assert_eq!(ui.live_nodes(), 0);
    }

    #[test]
    fn test_initialize_failure_tears_down() {
        let ui = Rc::new(RecordingUi::default());
        let probe = Probe {
            fail_initialize: true,
            ..Default::default()
        };
        let mut controller = controller(probe, ui.clone(), Arc::new(MemorySettingsStore::new()));

        assert!(matches!(controller.activate(), Err(ModuleError::InitFailed(_))));
        assert_eq!(controller.state(), LifecycleState::Unloaded);
        assert_eq!(ui.live_nodes(), 0);
    }

    #[tokio::test]
    async fn test_settings_survive_reactivation() {
        let store = Arc::new(MemorySettingsStore::new());
        let ui = Rc::new(RecordingUi::default());
        let mut controller = controller(Probe::default(), ui, store.clone());

        for _ in 0..2 {
            controller.activate().unwrap();
            controller.load().await.unwrap();
            controller.unload();
        }

        assert_eq!(controller.module().loads.as_ref().unwrap().value(), 2);
        assert!(store.load("probe").unwrap().is_some());
    }

    #[test]
    #[should_panic(expected = "load_async called twice")]
    fn test_double_load_panics() {
        let ui = Rc::new(RecordingUi::default());
        let mut controller = controller(Probe::default(), ui, Arc::new(MemorySettingsStore::new()));

        controller.activate().unwrap();
        let _pending = controller.begin_load();
        let _again = controller.begin_load();
    }

    #[test]
    #[should_panic(expected = "update called on module 'probe' in state initializing")]
    fn test_update_before_loaded_panics() {
        let ui = Rc::new(RecordingUi::default());
        let mut controller = controller(Probe::default(), ui, Arc::new(MemorySettingsStore::new()));

        controller.activate().unwrap();
        controller.update(Duration::from_millis(16));
    }

    #[test]
    #[should_panic(expected = "load_async called on module 'probe' in state unloaded")]
    fn test_load_without_activation_panics() {
        let ui = Rc::new(RecordingUi::default());
        let mut controller = controller(Probe::default(), ui, Arc::new(MemorySettingsStore::new()));
        let _pending = controller.begin_load();
    }
}
