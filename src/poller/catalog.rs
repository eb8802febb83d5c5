//! Upstream catalog session seam.
//!
//! The poller drives a [`CatalogSession`] with fire-and-forget requests.
//! Everything the upstream says back (connection changes, logon results,
//! change deltas, product info) arrives later as a [`CatalogEvent`] on an
//! mpsc channel owned by the session implementation.

use crate::broker::BoxFuture;
use serde::{Deserialize, Serialize};

/// Credentials sent on logon.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct LogOnDetails {
    pub username: String,
    pub password: String,
    /// Remembered machine-auth token from a previous session.
    pub auth_token: Option<String>,
}

impl std::fmt::Debug for LogOnDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogOnDetails")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// One changed entity in a delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityChange {
    pub id: u32,
    pub change_number: u32,
}

/// Response to `request_changes_since`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesResponse {
    /// The change number the request was made with.
    pub since_change_number: u32,
    /// Upstream head at the time of the response.
    pub current_change_number: u32,
    #[serde(default)]
    pub app_changes: Vec<EntityChange>,
    #[serde(default)]
    pub package_changes: Vec<EntityChange>,
}

/// Ids to fetch details for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductInfoRequest {
    pub apps: Vec<u32>,
    pub packages: Vec<u32>,
}

impl ProductInfoRequest {
    pub fn len(&self) -> usize {
        self.apps.len() + self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty() && self.packages.is_empty()
    }
}

/// Details for one entity. The payload is opaque to the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductInfo {
    pub id: u32,
    pub change_number: u32,
    pub payload: serde_json::Value,
}

/// Response to `request_product_info`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductInfoResponse {
    #[serde(default)]
    pub apps: Vec<ProductInfo>,
    #[serde(default)]
    pub packages: Vec<ProductInfo>,
    #[serde(default)]
    pub unknown_apps: Vec<u32>,
    #[serde(default)]
    pub unknown_packages: Vec<u32>,
}

/// Something the upstream session reported.
#[derive(Debug, Clone, PartialEq)]
pub enum CatalogEvent {
    Connected,
    Disconnected,
    LoggedOn,
    LoggedOff { reason: String },
    LogOnFailed { reason: String },
    /// A new machine-auth token to remember for the next logon.
    AuthTokenIssued(String),
    Changes(ChangesResponse),
    ProductInfo(ProductInfoResponse),
    /// Unrecoverable session error; the poller reconnects.
    Error(String),
}

/// Client for the upstream catalog service.
///
/// Requests only report whether they could be sent; results come back as
/// [`CatalogEvent`]s.
pub trait CatalogSession: Send + Sync + 'static {
    /// Start connecting. Completion is reported as [`CatalogEvent::Connected`].
    fn connect(&self) -> BoxFuture<'_, ()>;

    /// Send a logon. The outcome is reported as `LoggedOn` or `LogOnFailed`.
    fn log_on(&self, details: LogOnDetails) -> BoxFuture<'_, ()>;

    /// Ask for everything changed after `change_number`.
    fn request_changes_since(&self, change_number: u32) -> BoxFuture<'_, ()>;

    /// Ask for details on the given ids.
    fn request_product_info(&self, request: ProductInfoRequest) -> BoxFuture<'_, ()>;

    /// Drop the session. Default: nothing to do.
    fn disconnect(&self) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}
