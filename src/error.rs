//! Error types for module host operations.

use thiserror::Error;

use crate::gateway::PermissionSet;

/// Errors that can occur while hosting a module.
#[derive(Debug, Error)]
pub enum ModuleError {
    /// Setting key already defined in the same collection
    #[error("Setting already defined in '{collection}': {key}")]
    SettingAlreadyDefined { collection: String, key: String },

    /// Subcollection name already defined in the same collection
    #[error("Subcollection already defined in '{collection}': {name}")]
    SubcollectionAlreadyDefined { collection: String, name: String },

    /// Setting not found
    #[error("Setting not found: {0}")]
    SettingNotFound(String),

    /// Setting exists but holds a different value type
    #[error("Setting '{key}' holds {actual}, not {expected}")]
    SettingTypeMismatch {
        key: String,
        expected: &'static str,
        actual: &'static str,
    },

    /// Unknown variant name for an enum setting
    #[error("Unknown variant '{variant}' for setting '{key}'")]
    UnknownVariant { key: String, variant: String },

    /// Directory not registered with the directory service
    #[error("Directory not registered: {0}")]
    DirectoryNotFound(String),

    /// Module initialization failed
    #[error("Module initialization failed: {0}")]
    InitFailed(String),

    /// Module load failed
    #[error("Module load failed: {0}")]
    LoadFailed(String),

    /// UI collaborator rejected an operation
    #[error("UI operation failed: {0}")]
    Ui(String),

    /// Settings store failure
    #[error("Settings store error: {0}")]
    Store(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for module host operations
pub type Result<T> = std::result::Result<T, ModuleError>;

/// Outcome of a gated API call that did not produce a value.
///
/// Neither variant is fatal. Callers degrade the UI on `NotAuthorized` and
/// retry when permissions change; `TransientFailure` is retried on the next
/// scheduled poll.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// Required permissions are not currently granted
    #[error("Not authorized, missing permissions: {missing}")]
    NotAuthorized { missing: PermissionSet },

    /// Transport, remote or decoding failure
    #[error("Transient API failure: {message}")]
    TransientFailure { message: String },
}

impl GatewayError {
    /// Check if the call was rejected before reaching the client.
    pub fn is_not_authorized(&self) -> bool {
        matches!(self, GatewayError::NotAuthorized { .. })
    }
}

/// Error reported by an [`ApiClient`](crate::ApiClient) implementation.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Request never got a response
    #[error("Transport error: {0}")]
    Transport(String),

    /// Remote answered with an error status
    #[error("Remote error {status}: {message}")]
    Remote { status: u16, message: String },

    /// Request timed out
    #[error("Request timed out")]
    Timeout,
}

/// Error returned by a resource's release routine.
#[derive(Debug, Error)]
#[error("Failed to dispose '{resource}': {message}")]
pub struct DisposeError {
    pub resource: String,
    pub message: String,
}

impl DisposeError {
    pub fn new(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            message: message.into(),
        }
    }
}
