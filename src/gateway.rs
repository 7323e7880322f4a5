//! Permission-gated access to the external data API.
//!
//! The host hands the module a permission set derived from the user's API
//! token. Every [`ApiGateway::fetch`] re-checks that set at call time, so a
//! request denied earlier succeeds as soon as a refreshed token grants the
//! missing permissions. The gateway never retries on its own; subscribers
//! of [`ApiGateway::on_permissions_changed`] decide when to fetch again.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ApiError, GatewayError};
use crate::events::{Event, Subscription};

/// Opaque permission token, e.g. `"account"` or `"characters"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permission(String);

impl Permission {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Permission {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Permission {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Set of permission tokens.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionSet(BTreeSet<Permission>);

impl PermissionSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, permission: impl Into<Permission>) -> bool {
        self.0.insert(permission.into())
    }

    pub fn contains(&self, permission: &Permission) -> bool {
        self.0.contains(permission)
    }

    /// Check if every permission in `self` is in `granted`.
    pub fn is_subset_of(&self, granted: &PermissionSet) -> bool {
        self.0.is_subset(&granted.0)
    }

    /// Permissions in `self` that `granted` lacks.
    pub fn missing_from(&self, granted: &PermissionSet) -> PermissionSet {
        PermissionSet(self.0.difference(&granted.0).cloned().collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Permission> {
        self.0.iter()
    }
}

impl<P: Into<Permission>> FromIterator<P> for PermissionSet {
    fn from_iter<I: IntoIterator<Item = P>>(iter: I) -> Self {
        PermissionSet(iter.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for PermissionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.0.iter().map(Permission::as_str).collect();
        f.write_str(&names.join(", "))
    }
}

/// A request to the external API and the permissions it needs.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    /// Permissions that must be granted at call time
    pub required: PermissionSet,
    /// Endpoint path, e.g. `"v2/characters"`
    pub endpoint: String,
    /// Endpoint parameters
    pub params: Value,
}

impl ApiRequest {
    /// Create a request that needs no permissions.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            required: PermissionSet::new(),
            endpoint: endpoint.into(),
            params: Value::Null,
        }
    }

    /// Require permissions.
    pub fn with_permissions(mut self, permissions: impl IntoIterator<Item = impl Into<Permission>>) -> Self {
        self.required.0.extend(permissions.into_iter().map(Into::into));
        self
    }

    /// Set the parameters.
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }
}

/// Client for the external API, implemented by the host.
#[async_trait]
pub trait ApiClient: Send + Sync {
    /// Perform a request and return the decoded JSON body.
    async fn request(&self, endpoint: &str, params: &Value) -> Result<Value, ApiError>;
}

/// Gates API calls on the currently granted permission set.
pub struct ApiGateway {
    client: Arc<dyn ApiClient>,
    granted: RwLock<PermissionSet>,
    permissions_changed: Event<PermissionSet>,
}

impl ApiGateway {
    /// Create a gateway with no permissions granted yet.
    pub fn new(client: Arc<dyn ApiClient>) -> Self {
        Self::with_permissions(client, PermissionSet::new())
    }

    /// Create a gateway with an initial permission set.
    pub fn with_permissions(client: Arc<dyn ApiClient>, granted: PermissionSet) -> Self {
        Self {
            client,
            granted: RwLock::new(granted),
            permissions_changed: Event::new("permissions_changed"),
        }
    }

    /// Currently granted permissions.
    pub fn permissions(&self) -> PermissionSet {
        self.granted
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Check if every permission in `required` is currently granted.
    pub fn has_permissions(&self, required: &PermissionSet) -> bool {
        required.is_subset_of(&self.granted.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Replace the granted set after the host refreshed the API token, then
    /// notify subscribers.
    pub fn handle_token_refreshed(&self, granted: PermissionSet) {
        tracing::debug!("API token refreshed, granted permissions: [{}]", granted);
        *self.granted.write().unwrap_or_else(PoisonError::into_inner) = granted.clone();
        self.permissions_changed.emit(&granted);
    }

    /// Subscribe to permission refreshes.
    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn on_permissions_changed(
        &self,
        handler: impl Fn(&PermissionSet) + Send + Sync + 'static,
    ) -> Subscription {
        self.permissions_changed.subscribe(handler)
    }

    /// Perform a gated request and decode the response.
    ///
    /// Returns `NotAuthorized` without contacting the client if any required
    /// permission is missing. Client and decoding failures become
    /// `TransientFailure` and are logged at info level only: upstream
    /// outages are expected and must not be reported as errors.
    pub async fn fetch<T: DeserializeOwned>(&self, request: &ApiRequest) -> Result<T, GatewayError> {
        let value = self.fetch_value(request).await?;
        serde_json::from_value(value).map_err(|e| {
            tracing::info!("Failed to decode response from {}: {}", request.endpoint, e);
            GatewayError::TransientFailure {
                message: format!("invalid response from {}: {}", request.endpoint, e),
            }
        })
    }

    /// Perform a gated request and return the raw JSON body.
    pub async fn fetch_value(&self, request: &ApiRequest) -> Result<Value, GatewayError> {
        let missing = request.required.missing_from(&self.permissions());
        if !missing.is_empty() {
            tracing::debug!(
                "Skipping request to {}, missing permissions: [{}]",
                request.endpoint,
                missing
            );
            return Err(GatewayError::NotAuthorized { missing });
        }

        self.client
            .request(&request.endpoint, &request.params)
            .await
            .map_err(|e| {
                tracing::info!("Request to {} failed: {}", request.endpoint, e);
                GatewayError::TransientFailure {
                    message: e.to_string(),
                }
            })
    }
}

impl fmt::Debug for ApiGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiGateway")
            .field("granted", &self.permissions())
            .finish()
    }
}
