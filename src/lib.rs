//! Module host for plugins that live inside a UI application.
//!
//! A [`ModuleController`] drives one [`Module`] through its lifecycle and owns
//! everything an activation creates: persistent settings, a permission-gated
//! API gateway, a main-thread task queue and a tracker that disposes every
//! UI node and subscription on unload.
//!
//! # Example
//!
//! ```rust,ignore
//! use lib_module_host::*;
//! use futures::FutureExt;
//! use std::time::Duration;
//!
//! struct Greeter {
//!     label: Option<NodeId>,
//! }
//!
//! impl Module for Greeter {
//!     fn define_settings(&mut self, settings: &SettingsRegistry) -> Result<()> {
//!         settings.define_setting("greeting", "hello".to_string(), SettingMetadata::default())?;
//!         Ok(())
//!     }
//!
//!     fn load_async(&mut self, ctx: LoadContext<Self>) -> LoadFuture {
//!         async move {
//!             ctx.scan_directories().await?;
//!             ctx.main_thread().enqueue(|module: &mut Greeter, ui| {
//!                 module.label = ui.create_node(NodeSpec::new("label")).ok();
//!             });
//!             Ok(())
//!         }
//!         .boxed()
//!     }
//! }
//!
//! let services = ModuleServices::new(ModuleConfig::default(), ui, gateway);
//! let mut controller = ModuleController::new(Greeter { label: None }, services);
//!
//! controller.activate()?;
//! controller.load().await?;
//! controller.update(Duration::from_millis(16));
//! controller.unload();
//! ```

mod config;
mod controller;
mod directories;
mod error;
mod events;
mod gateway;
mod module;
mod resources;
mod scheduler;
mod settings;
mod store;
mod task_queue;
mod ui;

pub use config::*;
pub use controller::*;
pub use directories::*;
pub use error::*;
pub use events::*;
pub use gateway::*;
pub use module::*;
pub use resources::*;
pub use scheduler::*;
pub use settings::*;
pub use store::*;
pub use task_queue::*;
pub use ui::*;
