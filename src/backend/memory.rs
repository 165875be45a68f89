// In-process implementation of every backend port.
// Used by tests and offline runs; behaves like the hosted service on the paths the hub relies on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use super::{
    AuthEvent, AuthEventKind, AuthProvider, BackendError, ChangeFeed, ChangeSubscription, DataApi,
    ObjectStorage, Query, UploadOptions,
};
use crate::auth::{generate_jwt, verify_jwt, AccessClaims};
use crate::types::{ChangeEvent, ChangeKind, ChangeScope, PrincipalId, Session, Table};

const MIN_PASSWORD_LEN: usize = 6;

#[derive(Debug, Clone)]
struct Account {
    principal: PrincipalId,
    email: String,
    password_digest: String,
    confirmed: bool,
}

#[derive(Debug, Clone)]
struct StoredObject {
    bytes: Vec<u8>,
    content_type: String,
    cache_control: String,
}

struct Inner {
    base_url: String,
    signing_secret: String,
    token_ttl_secs: AtomicI64,
    require_confirmation: AtomicBool,
    refresh_revoked: AtomicBool,

    tables: RwLock<HashMap<Table, Vec<Value>>>,
    accounts: RwLock<HashMap<String, Account>>,
    persisted: RwLock<Option<Session>>,
    objects: RwLock<HashMap<String, StoredObject>>,
    reset_requests: RwLock<Vec<String>>,

    auth_events: broadcast::Sender<AuthEvent>,
    changes: broadcast::Sender<ChangeEvent>,
    disconnects: broadcast::Sender<()>,

    open_channels: Arc<AtomicUsize>,
    select_count: AtomicUsize,
    failing_selects: AtomicUsize,
    failing_subscribes: AtomicUsize,
    fail_sign_out: AtomicBool,
    fail_uploads: AtomicBool,
    upload_allowance: AtomicUsize,
}

/// Shared in-process backend; clones see the same state (one "browser context")
#[derive(Clone)]
pub struct InMemoryBackend {
    inner: Arc<Inner>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        let (auth_events, _) = broadcast::channel(64);
        let (changes, _) = broadcast::channel(256);
        let (disconnects, _) = broadcast::channel(8);
        Self {
            inner: Arc::new(Inner {
                base_url: "http://localhost:54321".to_string(),
                signing_secret: format!("memory-{}", Uuid::new_v4().simple()),
                token_ttl_secs: AtomicI64::new(Duration::hours(1).num_seconds()),
                require_confirmation: AtomicBool::new(true),
                refresh_revoked: AtomicBool::new(false),
                tables: RwLock::new(HashMap::new()),
                accounts: RwLock::new(HashMap::new()),
                persisted: RwLock::new(None),
                objects: RwLock::new(HashMap::new()),
                reset_requests: RwLock::new(Vec::new()),
                auth_events,
                changes,
                disconnects,
                open_channels: Arc::new(AtomicUsize::new(0)),
                select_count: AtomicUsize::new(0),
                failing_selects: AtomicUsize::new(0),
                failing_subscribes: AtomicUsize::new(0),
                fail_sign_out: AtomicBool::new(false),
                fail_uploads: AtomicBool::new(false),
                upload_allowance: AtomicUsize::new(usize::MAX),
            }),
        }
    }

    /// Whether sign-up must be confirmed by email before a session exists
    pub fn with_email_confirmation(self, required: bool) -> Self {
        self.inner.require_confirmation.store(required, Ordering::SeqCst);
        self
    }

    /// Lifetime of issued access tokens
    pub fn with_session_ttl(self, ttl: Duration) -> Self {
        self.inner.token_ttl_secs.store(ttl.num_seconds(), Ordering::SeqCst);
        self
    }

    // ---------------------------------------------------------------
    // Fixture helpers
    // ---------------------------------------------------------------

    /// Create a confirmed account directly
    pub async fn create_user(&self, email: &str, password: &str) -> PrincipalId {
        let principal = PrincipalId::new(Uuid::new_v4().to_string());
        let account = Account {
            principal: principal.clone(),
            email: email.to_lowercase(),
            password_digest: digest(email, password),
            confirmed: true,
        };
        self.inner.accounts.write().await.insert(email.to_lowercase(), account);
        principal
    }

    pub async fn confirm_email(&self, email: &str) {
        if let Some(account) = self.inner.accounts.write().await.get_mut(&email.to_lowercase()) {
            account.confirmed = true;
        }
    }

    /// Insert or replace the profile row for `principal`
    pub async fn set_profile(&self, principal: &PrincipalId, username: &str, is_admin: bool) {
        let query = Query::table(Table::Profiles).eq("id", principal.as_str());
        let patch = json!({ "username": username, "is_admin": is_admin });
        let updated = self.update(&query, patch.clone()).await.unwrap_or_default();
        if updated.is_empty() {
            let mut row = patch;
            row["id"] = json!(principal.as_str());
            let _ = self.insert(Table::Profiles, row).await;
        }
    }

    pub async fn seed(&self, table: Table, row: Value) -> Value {
        self.insert(table, row).await.unwrap_or(Value::Null)
    }

    pub async fn rows(&self, table: Table) -> Vec<Value> {
        self.inner.tables.read().await.get(&table).cloned().unwrap_or_default()
    }

    /// Issue a fresh access token for the persisted session, as the provider's
    /// client does on its own schedule
    pub async fn rotate_session(&self) -> Option<Session> {
        let current = self.inner.persisted.read().await.clone()?;
        let refreshed = self.issue_session(&current.principal, current.email.clone()).ok()?;
        *self.inner.persisted.write().await = Some(refreshed.clone());
        let _ = self
            .inner
            .auth_events
            .send(AuthEvent::new(AuthEventKind::TokenRefreshed, Some(refreshed.clone())));
        Some(refreshed)
    }

    /// Every outstanding refresh token stops working (password change elsewhere, admin revoke)
    pub fn revoke_refresh_tokens(&self) {
        self.inner.refresh_revoked.store(true, Ordering::SeqCst);
    }

    /// Sign-out performed by another tab sharing this browser context
    pub async fn sign_out_everywhere(&self) {
        *self.inner.persisted.write().await = None;
        let _ = self.inner.auth_events.send(AuthEvent::new(AuthEventKind::SignedOut, None));
    }

    pub async fn reset_requests(&self) -> Vec<String> {
        self.inner.reset_requests.read().await.clone()
    }

    pub async fn object(&self, bucket: &str, path: &str) -> Option<Vec<u8>> {
        self.inner
            .objects
            .read()
            .await
            .get(&object_key(bucket, path))
            .map(|o| o.bytes.clone())
    }

    pub async fn object_count(&self) -> usize {
        self.inner.objects.read().await.len()
    }

    // ---------------------------------------------------------------
    // Failure injection and counters
    // ---------------------------------------------------------------

    pub fn fail_next_selects(&self, count: usize) {
        self.inner.failing_selects.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_subscribes(&self, count: usize) {
        self.inner.failing_subscribes.store(count, Ordering::SeqCst);
    }

    pub fn set_sign_out_failure(&self, failing: bool) {
        self.inner.fail_sign_out.store(failing, Ordering::SeqCst);
    }

    pub fn set_upload_failure(&self, failing: bool) {
        self.inner.fail_uploads.store(failing, Ordering::SeqCst);
    }

    /// Let `count` more uploads through, then fail the rest
    pub fn fail_uploads_after(&self, count: usize) {
        self.inner.upload_allowance.store(count, Ordering::SeqCst);
    }

    /// Drop every open realtime channel from the server side
    pub fn disconnect_subscriptions(&self) {
        let _ = self.inner.disconnects.send(());
    }

    pub fn open_channels(&self) -> usize {
        self.inner.open_channels.load(Ordering::SeqCst)
    }

    pub fn select_count(&self) -> usize {
        self.inner.select_count.load(Ordering::SeqCst)
    }

    // ---------------------------------------------------------------

    fn issue_session(&self, principal: &PrincipalId, email: Option<String>) -> Result<Session, BackendError> {
        let ttl = Duration::seconds(self.inner.token_ttl_secs.load(Ordering::SeqCst));
        let claims = AccessClaims::new(principal.as_str(), email.clone(), ttl);
        let access_token = generate_jwt(&self.inner.signing_secret, &claims)
            .map_err(|e| BackendError::Status { status: 500, message: e.to_string() })?;
        Ok(Session {
            principal: principal.clone(),
            email,
            access_token,
            refresh_token: Some(Uuid::new_v4().simple().to_string()),
            expires_at: claims.expires_at(),
        })
    }

    async fn establish(&self, account: &Account) -> Result<Session, BackendError> {
        let session = self.issue_session(&account.principal, Some(account.email.clone()))?;
        *self.inner.persisted.write().await = Some(session.clone());
        let _ = self
            .inner
            .auth_events
            .send(AuthEvent::new(AuthEventKind::SignedIn, Some(session.clone())));
        Ok(session)
    }

    /// Data calls carry the persisted session's token; a token this backend
    /// did not sign, or one past its expiry, is rejected and ends the session
    async fn check_bearer(&self) -> Result<(), BackendError> {
        let token = match self.inner.persisted.read().await.as_ref() {
            Some(session) => session.access_token.clone(),
            None => return Ok(()),
        };
        match verify_jwt(&self.inner.signing_secret, &token) {
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::debug!("Rejected bearer: {}", e);
                self.end_session(&token).await;
                Err(BackendError::Unauthorized("JWT expired".to_string()))
            }
        }
    }

    async fn end_session(&self, token: &str) {
        {
            let mut persisted = self.inner.persisted.write().await;
            if persisted.as_ref().is_some_and(|s| s.access_token != token) {
                return;
            }
            *persisted = None;
        }
        let _ = self.inner.auth_events.send(AuthEvent::new(AuthEventKind::SignedOut, None));
    }

    fn publish(&self, table: Table, kind: ChangeKind, new: Option<Value>, old: Option<Value>) {
        let _ = self.inner.changes.send(ChangeEvent { table, kind, new, old });
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn digest(email: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(email.to_lowercase().as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn object_key(bucket: &str, path: &str) -> String {
    format!("{}/{}", bucket, path)
}

fn validate_email(email: &str) -> Result<(), BackendError> {
    let valid = email
        .split_once('@')
        .map(|(local, domain)| !local.is_empty() && domain.contains('.'))
        .unwrap_or(false);
    if valid {
        Ok(())
    } else {
        Err(BackendError::Status {
            status: 422,
            message: "Unable to validate email address: invalid format".to_string(),
        })
    }
}

fn violates_review_uniqueness(rows: &[Value], candidate: &Value) -> bool {
    let user = match candidate.get("user_id") {
        Some(Value::String(user)) => user,
        _ => return false,
    };
    rows.iter().any(|row| {
        row.get("user_id").and_then(Value::as_str) == Some(user.as_str())
            && row.get("app_id") == candidate.get("app_id")
            && row.get("id") != candidate.get("id")
    })
}

#[async_trait]
impl AuthProvider for InMemoryBackend {
    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session, BackendError> {
        let account = self.inner.accounts.read().await.get(&email.to_lowercase()).cloned();
        let account = match account {
            Some(account) if account.password_digest == digest(email, password) => account,
            _ => return Err(BackendError::Unauthorized("Invalid login credentials".to_string())),
        };
        if !account.confirmed {
            return Err(BackendError::Unauthorized("Email not confirmed".to_string()));
        }
        self.establish(&account).await
    }

    async fn sign_up(&self, email: &str, password: &str) -> Result<Option<Session>, BackendError> {
        validate_email(email)?;
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(BackendError::Status {
                status: 422,
                message: format!("Password should be at least {} characters", MIN_PASSWORD_LEN),
            });
        }

        let confirmed = !self.inner.require_confirmation.load(Ordering::SeqCst);
        let account = {
            let mut accounts = self.inner.accounts.write().await;
            if accounts.contains_key(&email.to_lowercase()) {
                return Err(BackendError::Status {
                    status: 422,
                    message: "User already registered".to_string(),
                });
            }
            let account = Account {
                principal: PrincipalId::new(Uuid::new_v4().to_string()),
                email: email.to_lowercase(),
                password_digest: digest(email, password),
                confirmed,
            };
            accounts.insert(email.to_lowercase(), account.clone());
            account
        };

        if confirmed {
            self.establish(&account).await.map(Some)
        } else {
            Ok(None)
        }
    }

    async fn sign_out(&self, session: &Session) -> Result<(), BackendError> {
        if self.inner.fail_sign_out.load(Ordering::SeqCst) {
            return Err(BackendError::Network("sign-out request failed".to_string()));
        }
        {
            let mut persisted = self.inner.persisted.write().await;
            if persisted.as_ref().map(|s| &s.principal) == Some(&session.principal) {
                *persisted = None;
            }
        }
        let _ = self.inner.auth_events.send(AuthEvent::new(AuthEventKind::SignedOut, None));
        Ok(())
    }

    async fn reset_password_for_email(&self, email: &str) -> Result<(), BackendError> {
        validate_email(email)?;
        // Unknown addresses are accepted silently so accounts cannot be enumerated
        self.inner.reset_requests.write().await.push(email.to_lowercase());
        Ok(())
    }

    async fn current_session(&self) -> Result<Option<Session>, BackendError> {
        let mut persisted = self.inner.persisted.write().await;
        if persisted.as_ref().map(Session::is_expired).unwrap_or(false) {
            *persisted = None;
        }
        Ok(persisted.clone())
    }

    async fn refresh_session(&self, session: &Session) -> Result<Session, BackendError> {
        let persisted_token = self
            .inner
            .persisted
            .read()
            .await
            .as_ref()
            .and_then(|s| s.refresh_token.clone());
        let valid = !self.inner.refresh_revoked.load(Ordering::SeqCst)
            && session.refresh_token.is_some()
            && persisted_token == session.refresh_token;
        if !valid {
            self.end_session(&session.access_token).await;
            return Err(BackendError::Unauthorized(
                "Invalid Refresh Token: Refresh Token Not Found".to_string(),
            ));
        }
        let refreshed = self.issue_session(&session.principal, session.email.clone())?;
        *self.inner.persisted.write().await = Some(refreshed.clone());
        let _ = self
            .inner
            .auth_events
            .send(AuthEvent::new(AuthEventKind::TokenRefreshed, Some(refreshed.clone())));
        Ok(refreshed)
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.inner.auth_events.subscribe()
    }
}

#[async_trait]
impl DataApi for InMemoryBackend {
    async fn select(&self, query: &Query) -> Result<Vec<Value>, BackendError> {
        if Self::take_failure(&self.inner.failing_selects) {
            return Err(BackendError::Network("simulated network failure".to_string()));
        }
        self.check_bearer().await?;
        self.inner.select_count.fetch_add(1, Ordering::SeqCst);
        let tables = self.inner.tables.read().await;
        let rows = tables.get(&query.table).map(Vec::as_slice).unwrap_or(&[]);
        Ok(query.apply(rows))
    }

    async fn insert(&self, table: Table, row: Value) -> Result<Value, BackendError> {
        let mut object: Map<String, Value> = match row {
            Value::Object(map) => map,
            other => return Err(BackendError::Decode(format!("expected object row, got {}", other))),
        };
        self.check_bearer().await?;
        object
            .entry("id")
            .or_insert_with(|| Value::String(Uuid::new_v4().to_string()));
        object
            .entry("created_at")
            .or_insert_with(|| Value::String(Utc::now().to_rfc3339()));
        let row = Value::Object(object);

        {
            let mut tables = self.inner.tables.write().await;
            let rows = tables.entry(table).or_default();
            if rows.iter().any(|existing| existing.get("id") == row.get("id")) {
                return Err(BackendError::UniqueViolation(format!(
                    "duplicate key value violates unique constraint \"{}_pkey\"",
                    table
                )));
            }
            if table == Table::AppReviews && violates_review_uniqueness(rows, &row) {
                return Err(BackendError::UniqueViolation(
                    "duplicate key value violates unique constraint \"app_reviews_app_id_user_id_key\"".to_string(),
                ));
            }
            rows.push(row.clone());
        }

        self.publish(table, ChangeKind::Insert, Some(row.clone()), None);
        Ok(row)
    }

    async fn update(&self, query: &Query, patch: Value) -> Result<Vec<Value>, BackendError> {
        let patch = match patch {
            Value::Object(map) => map,
            other => return Err(BackendError::Decode(format!("expected object patch, got {}", other))),
        };
        self.check_bearer().await?;

        let mut changed = Vec::new();
        {
            let mut tables = self.inner.tables.write().await;
            let rows = tables.entry(query.table).or_default();
            for row in rows.iter_mut().filter(|row| query.matches(row)) {
                let old = row.clone();
                if let Value::Object(fields) = row {
                    for (key, value) in &patch {
                        fields.insert(key.clone(), value.clone());
                    }
                    if query.table == Table::Apps {
                        fields.insert("updated_at".to_string(), Value::String(Utc::now().to_rfc3339()));
                    }
                }
                changed.push((old, row.clone()));
            }
        }

        for (old, new) in &changed {
            self.publish(query.table, ChangeKind::Update, Some(new.clone()), Some(old.clone()));
        }
        Ok(changed.into_iter().map(|(_, new)| new).collect())
    }

    async fn delete(&self, query: &Query) -> Result<u64, BackendError> {
        self.check_bearer().await?;
        let removed: Vec<Value> = {
            let mut tables = self.inner.tables.write().await;
            let rows = tables.entry(query.table).or_default();
            let (removed, kept): (Vec<Value>, Vec<Value>) =
                rows.drain(..).partition(|row| query.matches(row));
            *rows = kept;
            removed
        };

        for old in &removed {
            self.publish(query.table, ChangeKind::Delete, None, Some(old.clone()));
        }
        Ok(removed.len() as u64)
    }
}

#[async_trait]
impl ObjectStorage for InMemoryBackend {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
        options: &UploadOptions,
    ) -> Result<(), BackendError> {
        let exhausted = self
            .inner
            .upload_allowance
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                usize::MAX => Some(n),
                n => n.checked_sub(1),
            })
            .is_err();
        if exhausted || self.inner.fail_uploads.load(Ordering::SeqCst) {
            return Err(BackendError::Network("storage service unavailable".to_string()));
        }
        let key = object_key(bucket, path);
        let mut objects = self.inner.objects.write().await;
        if objects.contains_key(&key) && !options.upsert {
            return Err(BackendError::Status { status: 409, message: "The resource already exists".to_string() });
        }
        objects.insert(
            key,
            StoredObject {
                bytes,
                content_type: content_type.to_string(),
                cache_control: options.cache_control.clone(),
            },
        );
        Ok(())
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("{}/storage/v1/object/public/{}/{}", self.inner.base_url, bucket, path)
    }

    async fn remove(&self, bucket: &str, paths: &[String]) -> Result<(), BackendError> {
        let mut objects = self.inner.objects.write().await;
        for path in paths {
            if let Some(removed) = objects.remove(&object_key(bucket, path)) {
                tracing::debug!(
                    "Removed {} ({} bytes, {}, cache {})",
                    path,
                    removed.bytes.len(),
                    removed.content_type,
                    removed.cache_control
                );
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ChangeFeed for InMemoryBackend {
    async fn subscribe(&self, scopes: &[ChangeScope]) -> Result<ChangeSubscription, BackendError> {
        if Self::take_failure(&self.inner.failing_subscribes) {
            return Err(BackendError::Subscription("channel join rejected".to_string()));
        }

        let mut changes = self.inner.changes.subscribe();
        let mut disconnects = self.inner.disconnects.subscribe();
        let scopes = scopes.to_vec();
        let label = scopes
            .iter()
            .map(|s| match s.filter_expression() {
                Some(filter) => format!("{}:{}", s.table, filter),
                None => s.table.to_string(),
            })
            .collect::<Vec<_>>()
            .join(",");
        let (tx, rx) = mpsc::channel(64);

        let forwarder = tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = changes.recv() => match received {
                        Ok(event) => {
                            if scopes.iter().any(|scope| scope.matches(&event))
                                && tx.send(Ok(event)).await.is_err()
                            {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(missed)) => {
                            let _ = tx
                                .send(Err(BackendError::Subscription(format!("missed {} notifications", missed))))
                                .await;
                            break;
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = disconnects.recv() => {
                        let _ = tx.send(Err(BackendError::Subscription("channel disconnected".to_string()))).await;
                        break;
                    }
                }
            }
        });

        let open_channels = self.inner.open_channels.clone();
        open_channels.fetch_add(1, Ordering::SeqCst);
        Ok(ChangeSubscription::new(label, rx, move || {
            forwarder.abort();
            open_channels.fetch_sub(1, Ordering::SeqCst);
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn review_uniqueness_is_enforced_per_principal_and_app() {
        let backend = InMemoryBackend::new();
        let review = json!({ "app_id": "abc-123", "user_id": "u1", "rating": 5, "comment": "ok" });
        backend.insert(Table::AppReviews, review.clone()).await.unwrap();
        let duplicate = backend.insert(Table::AppReviews, review).await;
        assert!(matches!(duplicate, Err(BackendError::UniqueViolation(_))));

        let other_app = json!({ "app_id": "other", "user_id": "u1", "rating": 4, "comment": "ok" });
        assert!(backend.insert(Table::AppReviews, other_app).await.is_ok());
    }

    #[tokio::test]
    async fn sign_up_rejects_weak_secret_and_duplicates() {
        let backend = InMemoryBackend::new().with_email_confirmation(false);
        let weak = backend.sign_up("new@example.com", "123").await;
        assert!(matches!(weak, Err(BackendError::Status { status: 422, .. })));

        let session = backend.sign_up("new@example.com", "secret123").await.unwrap();
        assert!(session.is_some());
        let duplicate = backend.sign_up("NEW@example.com", "secret123").await;
        assert!(matches!(duplicate, Err(BackendError::Status { status: 422, .. })));
    }

    #[tokio::test]
    async fn unconfirmed_sign_up_has_no_session() {
        let backend = InMemoryBackend::new();
        assert_eq!(backend.sign_up("wait@example.com", "secret123").await.unwrap(), None);
        let attempt = backend.sign_in_with_password("wait@example.com", "secret123").await;
        assert!(matches!(attempt, Err(BackendError::Unauthorized(_))));

        backend.confirm_email("wait@example.com").await;
        assert!(backend.sign_in_with_password("wait@example.com", "secret123").await.is_ok());
    }

    #[tokio::test]
    async fn subscription_only_forwards_matching_scope() {
        let backend = InMemoryBackend::new();
        let mut subscription = ChangeFeed::subscribe(&backend, &[ChangeScope::record(Table::Apps, "wanted")])
            .await
            .unwrap();
        assert_eq!(backend.open_channels(), 1);

        backend.seed(Table::Apps, json!({ "id": "other", "name": "x" })).await;
        backend.seed(Table::Apps, json!({ "id": "wanted", "name": "y" })).await;

        let event = subscription.next().await.unwrap().unwrap();
        assert_eq!(event.new.unwrap()["id"], "wanted");

        subscription.release();
        assert_eq!(backend.open_channels(), 0);
    }

    #[tokio::test]
    async fn expired_bearer_is_rejected_and_ends_the_session() {
        let backend = InMemoryBackend::new().with_session_ttl(Duration::seconds(1));
        backend.create_user("user@example.com", "secret123").await;
        backend.sign_in_with_password("user@example.com", "secret123").await.unwrap();
        let mut events = AuthProvider::subscribe(&backend);
        assert!(backend.select(&Query::table(Table::Apps)).await.is_ok());

        tokio::time::sleep(std::time::Duration::from_millis(2100)).await;
        let rejected = backend.select(&Query::table(Table::Apps)).await;
        assert_eq!(rejected, Err(BackendError::Unauthorized("JWT expired".to_string())));
        assert_eq!(events.recv().await.unwrap().kind, AuthEventKind::SignedOut);
        assert_eq!(backend.current_session().await.unwrap(), None);
        // Anonymous reads work again once the session is gone
        assert!(backend.select(&Query::table(Table::Apps)).await.is_ok());
    }

    #[tokio::test]
    async fn refresh_rotates_tokens_until_revoked() {
        let backend = InMemoryBackend::new();
        backend.create_user("user@example.com", "secret123").await;
        let session = backend.sign_in_with_password("user@example.com", "secret123").await.unwrap();

        let refreshed = backend.refresh_session(&session).await.unwrap();
        assert_eq!(refreshed.principal, session.principal);
        assert_ne!(refreshed.refresh_token, session.refresh_token);
        // The old refresh token was consumed by the rotation
        assert!(matches!(backend.refresh_session(&session).await, Err(BackendError::Unauthorized(_))));
        assert_eq!(backend.current_session().await.unwrap(), Some(refreshed.clone()));

        backend.revoke_refresh_tokens();
        assert!(matches!(backend.refresh_session(&refreshed).await, Err(BackendError::Unauthorized(_))));
        assert_eq!(backend.current_session().await.unwrap(), None);
    }

    #[tokio::test]
    async fn duplicate_object_paths_are_rejected() {
        let backend = InMemoryBackend::new();
        let options = UploadOptions::default();
        backend.upload("app_assets", "icons/a.png", vec![1], "image/png", &options).await.unwrap();
        let second = backend.upload("app_assets", "icons/a.png", vec![2], "image/png", &options).await;
        assert!(matches!(second, Err(BackendError::Status { status: 409, .. })));
        assert_eq!(backend.object("app_assets", "icons/a.png").await, Some(vec![1]));
    }
}
