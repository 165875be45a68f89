// Ports to the hosted backend: auth provider, data API, object storage and change feed.
// Everything here is consumed as an opaque service; adapters live in submodules.

pub mod http;
pub mod memory;
pub mod query;
pub mod realtime;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::types::{ChangeEvent, ChangeScope, Session, Table};

pub use http::HttpBackend;
pub use memory::InMemoryBackend;
pub use query::{FilterOp, Query};
pub use realtime::RealtimeClient;

/// Errors reported by backend adapters
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request failed with status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Subscription error: {0}")]
    Subscription(String),

    #[error("Timed out: {0}")]
    Timeout(String),
}

impl BackendError {
    /// The provider's own message, without our variant prefix
    pub fn provider_message(&self) -> String {
        match self {
            BackendError::Network(m)
            | BackendError::NotFound(m)
            | BackendError::UniqueViolation(m)
            | BackendError::Unauthorized(m)
            | BackendError::Decode(m)
            | BackendError::Subscription(m)
            | BackendError::Timeout(m) => m.clone(),
            BackendError::Status { message, .. } => message.clone(),
        }
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(err: serde_json::Error) -> Self {
        BackendError::Decode(err.to_string())
    }
}

/// Bound a backend call by `limit`; a hung call becomes `BackendError::Timeout`
pub async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, BackendError>
where
    F: Future<Output = Result<T, BackendError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(BackendError::Timeout(format!("request timed out after {:?}", limit))),
    }
}

/// Provider-level session change kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEventKind {
    SignedIn,
    SignedOut,
    TokenRefreshed,
    UserUpdated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthEvent {
    pub kind: AuthEventKind,
    pub session: Option<Session>,
}

impl AuthEvent {
    pub fn new(kind: AuthEventKind, session: Option<Session>) -> Self {
        Self { kind, session }
    }
}

/// Credential-based authentication provider
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session, BackendError>;

    /// `None` when the provider requires verification before a session exists
    async fn sign_up(&self, email: &str, password: &str) -> Result<Option<Session>, BackendError>;

    async fn sign_out(&self, session: &Session) -> Result<(), BackendError>;

    async fn reset_password_for_email(&self, email: &str) -> Result<(), BackendError>;

    /// Session persisted by the provider's client, refreshed if needed
    async fn current_session(&self) -> Result<Option<Session>, BackendError>;

    /// Exchange the session's refresh token for a new access token. A rejected
    /// refresh token ends the session and is reported as `Unauthorized`.
    async fn refresh_session(&self, session: &Session) -> Result<Session, BackendError>;

    /// Session-change stream (refresh, expiry, sign-out from another tab)
    fn subscribe(&self) -> broadcast::Receiver<AuthEvent>;
}

/// CRUD against the hosted relational store
#[async_trait]
pub trait DataApi: Send + Sync {
    async fn select(&self, query: &Query) -> Result<Vec<Value>, BackendError>;

    async fn insert(&self, table: Table, row: Value) -> Result<Value, BackendError>;

    async fn update(&self, query: &Query, patch: Value) -> Result<Vec<Value>, BackendError>;

    async fn delete(&self, query: &Query) -> Result<u64, BackendError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOptions {
    pub cache_control: String,
    pub upsert: bool,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self { cache_control: "3600".to_string(), upsert: false }
    }
}

/// Write-once object storage with public URLs
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
        options: &UploadOptions,
    ) -> Result<(), BackendError>;

    fn public_url(&self, bucket: &str, path: &str) -> String;

    async fn remove(&self, bucket: &str, paths: &[String]) -> Result<(), BackendError>;
}

/// Realtime change notifications scoped to tables / records
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, scopes: &[ChangeScope]) -> Result<ChangeSubscription, BackendError>;
}

type ReleaseFn = Box<dyn FnOnce() + Send>;

/// One open realtime channel. Released exactly once: explicitly or on drop.
pub struct ChangeSubscription {
    label: String,
    events: mpsc::Receiver<Result<ChangeEvent, BackendError>>,
    on_release: Option<ReleaseFn>,
}

impl ChangeSubscription {
    pub fn new(
        label: impl Into<String>,
        events: mpsc::Receiver<Result<ChangeEvent, BackendError>>,
        on_release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self { label: label.into(), events, on_release: Some(Box::new(on_release)) }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Next notification; `None` once the transport closed the channel
    pub async fn next(&mut self) -> Option<Result<ChangeEvent, BackendError>> {
        self.events.recv().await
    }

    /// Non-blocking poll used to coalesce queued notifications
    pub fn try_next(&mut self) -> Option<Result<ChangeEvent, BackendError>> {
        self.events.try_recv().ok()
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(release) = self.on_release.take() {
            tracing::debug!("Releasing change subscription '{}'", self.label);
            self.events.close();
            release();
        }
    }
}

impl Drop for ChangeSubscription {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl std::fmt::Debug for ChangeSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeSubscription")
            .field("label", &self.label)
            .field("released", &self.on_release.is_none())
            .finish()
    }
}

/// The four hosted services, injected into the hub root
#[derive(Clone)]
pub struct Backend {
    pub auth: Arc<dyn AuthProvider>,
    pub data: Arc<dyn DataApi>,
    pub storage: Arc<dyn ObjectStorage>,
    pub changes: Arc<dyn ChangeFeed>,
}

impl Backend {
    pub fn new(
        auth: Arc<dyn AuthProvider>,
        data: Arc<dyn DataApi>,
        storage: Arc<dyn ObjectStorage>,
        changes: Arc<dyn ChangeFeed>,
    ) -> Self {
        Self { auth, data, storage, changes }
    }

    pub fn in_memory(backend: InMemoryBackend) -> Self {
        let shared = Arc::new(backend);
        Self {
            auth: shared.clone(),
            data: shared.clone(),
            storage: shared.clone(),
            changes: shared,
        }
    }

    pub fn http(backend: HttpBackend) -> Self {
        let shared = Arc::new(backend);
        Self {
            auth: shared.clone(),
            data: shared.clone(),
            storage: shared.clone(),
            changes: shared,
        }
    }
}
