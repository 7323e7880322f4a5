//! Host UI collaborator.
//!
//! The host owns the UI tree and only allows it to be touched from the main
//! thread. Modules never hold a [`UiFactory`] directly: it is reachable only
//! through [`MainThreadContext`](crate::MainThreadContext), and it is shared
//! via `Rc`, so nothing holding it can be moved into a background task.

use std::fmt;
use std::rc::Rc;

use serde_json::Value;

use crate::error::{DisposeError, Result};
use crate::resources::Disposable;

/// Opaque handle to a host UI node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Description of a node to create, e.g. a corner icon, window or label.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSpec {
    /// Host widget kind
    pub kind: String,
    /// Parent node, `None` for the host's root screen
    pub parent: Option<NodeId>,
    /// Widget properties, interpreted by the host
    pub props: Value,
}

impl NodeSpec {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            parent: None,
            props: Value::Null,
        }
    }

    pub fn with_parent(mut self, parent: NodeId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_props(mut self, props: Value) -> Self {
        self.props = props;
        self
    }
}

/// Severity of a screen notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NotificationLevel {
    #[default]
    Info,
    Warning,
    Error,
}

/// UI operations provided by the host. Main thread only.
pub trait UiFactory {
    /// Create a node and attach it to its parent.
    fn create(&self, spec: &NodeSpec) -> Result<NodeId>;

    /// Merge `props` into an existing node.
    fn update(&self, node: NodeId, props: &Value) -> Result<()>;

    /// Detach and release a node.
    fn dispose(&self, node: NodeId) -> Result<()>;

    /// Show a transient notification.
    fn notify(&self, message: &str, level: NotificationLevel);
}

/// Disposal handle for a node created through [`UiFactory::create`].
pub struct UiNodeHandle {
    id: NodeId,
    kind: String,
    ui: Rc<dyn UiFactory>,
}

impl UiNodeHandle {
    pub(crate) fn new(id: NodeId, kind: impl Into<String>, ui: Rc<dyn UiFactory>) -> Self {
        Self {
            id,
            kind: kind.into(),
            ui,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }
}

impl Disposable for UiNodeHandle {
    fn label(&self) -> String {
        format!("{} {}", self.kind, self.id)
    }

    fn dispose(self: Box<Self>) -> std::result::Result<(), DisposeError> {
        self.ui
            .dispose(self.id)
            .map_err(|e| DisposeError::new(format!("{} {}", self.kind, self.id), e.to_string()))
    }
}
