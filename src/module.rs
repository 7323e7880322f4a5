//! The module contract implemented by plugin authors.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::runtime::Handle;

use crate::directories::{self, DirectoryScan, DirectoryService};
use crate::error::Result;
use crate::gateway::ApiGateway;
use crate::settings::SettingsRegistry;
use crate::task_queue::{MainThreadContext, MainThreadHandle};

/// Future returned by [`Module::load_async`].
///
/// It must be `Send + 'static`: the host may poll it on a background thread
/// while it keeps ticking, so it can only reach the UI by enqueueing
/// main-thread tasks.
pub type LoadFuture = BoxFuture<'static, Result<()>>;

/// A module driven by a [`ModuleController`](crate::ModuleController).
///
/// Hooks are called in lifecycle order: `define_settings` and `initialize`
/// on activation, `load_async` once, `on_loaded` when the load future
/// resolves, `update` every tick while loaded, and `unload` from any state.
pub trait Module: Sized + 'static {
    /// Declare settings. Called before any other hook with persisted values
    /// already loaded, so returned entries reflect the user's last session.
    fn define_settings(&mut self, settings: &SettingsRegistry) -> Result<()>;

    /// Synchronous setup on the main thread. Must not block.
    fn initialize(&mut self, ctx: &mut MainThreadContext<'_, Self>) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Start asynchronous loading. Called at most once per activation.
    fn load_async(&mut self, ctx: LoadContext<Self>) -> LoadFuture;

    /// Called on the main thread after the load future resolved successfully.
    fn on_loaded(&mut self, ctx: &mut MainThreadContext<'_, Self>) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Per-tick work, after queued tasks have run.
    fn update(&mut self, ctx: &mut MainThreadContext<'_, Self>, elapsed: Duration) {
        let _ = (ctx, elapsed);
    }

    /// Release module-held state. Tracked resources are disposed by the
    /// controller right after this returns.
    fn unload(&mut self) {}
}

/// Thread-safe services available to the load future.
pub struct LoadContext<M> {
    namespace: String,
    settings: SettingsRegistry,
    gateway: Arc<ApiGateway>,
    directories: Arc<dyn DirectoryService>,
    main_thread: MainThreadHandle<M>,
    runtime: Option<Handle>,
}

impl<M: 'static> LoadContext<M> {
    pub(crate) fn new(
        namespace: impl Into<String>,
        settings: SettingsRegistry,
        gateway: Arc<ApiGateway>,
        directories: Arc<dyn DirectoryService>,
        main_thread: MainThreadHandle<M>,
        runtime: Option<Handle>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            settings,
            gateway,
            directories,
            main_thread,
            runtime,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn settings(&self) -> &SettingsRegistry {
        &self.settings
    }

    pub fn gateway(&self) -> &Arc<ApiGateway> {
        &self.gateway
    }

    pub fn directories(&self) -> &Arc<dyn DirectoryService> {
        &self.directories
    }

    /// Sender for continuations that need the UI.
    pub fn main_thread(&self) -> MainThreadHandle<M> {
        self.main_thread.clone()
    }

    /// `false` once the activation that started this load is unloading.
    pub fn is_live(&self) -> bool {
        self.main_thread.is_live()
    }

    /// Runtime provided by the host, if any.
    pub fn runtime(&self) -> Option<&Handle> {
        self.runtime.as_ref()
    }

    /// Count the files in every registered directory.
    ///
    /// Uses the host runtime's blocking pool when there is one and walks
    /// inline otherwise.
    pub async fn scan_directories(&self) -> Result<Vec<DirectoryScan>> {
        directories::scan_directories(self.directories.clone(), self.runtime.as_ref()).await
    }
}
