// reqwest adapter for a hosted Supabase-style backend (GoTrue auth, PostgREST, storage, realtime)

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, RwLock};
use url::Url;

use super::{
    AuthEvent, AuthEventKind, AuthProvider, BackendError, ChangeFeed, ChangeSubscription, DataApi,
    ObjectStorage, Query, RealtimeClient, UploadOptions,
};
use crate::auth::peek_claims;
use crate::config::HubConfig;
use crate::types::{ChangeScope, PrincipalId, Session, Table};

const UNIQUE_VIOLATION: &str = "23505";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    #[serde(default)]
    user: Option<TokenUser>,
}

#[derive(Debug, Deserialize)]
struct TokenUser {
    id: String,
    #[serde(default)]
    email: Option<String>,
}

impl TokenResponse {
    fn into_session(self) -> Result<Session, BackendError> {
        let (principal, email) = match self.user {
            Some(user) => (user.id, user.email),
            None => {
                let claims = peek_claims(&self.access_token)
                    .map_err(|e| BackendError::Decode(e.to_string()))?;
                (claims.sub, claims.email)
            }
        };
        let expires_at = match (self.expires_at, self.expires_in) {
            (Some(at), _) => Utc.timestamp_opt(at, 0).single(),
            (None, Some(secs)) => Some(Utc::now() + chrono::Duration::seconds(secs)),
            (None, None) => peek_claims(&self.access_token).ok().map(|c| c.expires_at()),
        }
        .unwrap_or_else(Utc::now);

        Ok(Session {
            principal: PrincipalId::new(principal),
            email,
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
        })
    }
}

pub struct HttpBackend {
    client: Client,
    base_url: Url,
    anon_key: String,
    session_file: Option<PathBuf>,
    session: RwLock<Option<Session>>,
    events: broadcast::Sender<AuthEvent>,
    realtime: RealtimeClient,
}

impl HttpBackend {
    pub fn new(
        base_url: &str,
        anon_key: &str,
        request_timeout: Duration,
        heartbeat: Duration,
        session_file: Option<PathBuf>,
    ) -> Result<Self, BackendError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| BackendError::Network(format!("invalid backend url '{}': {}", base_url, e)))?;
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| BackendError::Network(e.to_string()))?;
        let realtime = RealtimeClient::new(&base_url, anon_key, heartbeat)?;
        let (events, _) = broadcast::channel(32);

        Ok(Self {
            client,
            base_url,
            anon_key: anon_key.to_string(),
            session_file,
            session: RwLock::new(None),
            events,
            realtime,
        })
    }

    pub fn from_config(config: &HubConfig) -> Result<Self, BackendError> {
        Self::new(
            &config.backend.url,
            &config.backend.anon_key,
            config.request_timeout(),
            config.realtime.heartbeat(),
            Some(config.client_dir.join("session.json")),
        )
    }

    fn endpoint(&self, path: &str) -> Result<Url, BackendError> {
        self.base_url
            .join(path)
            .map_err(|e| BackendError::Network(format!("invalid endpoint '{}': {}", path, e)))
    }

    /// Send a request carrying the session's bearer (or the anon key). A 401
    /// for a session bearer means the backend no longer accepts the token.
    async fn call(
        &self,
        method: Method,
        path: &str,
        build: impl FnOnce(RequestBuilder) -> RequestBuilder + Send,
    ) -> Result<Response, BackendError> {
        let url = self.endpoint(path)?;
        let session_token = self.session.read().await.as_ref().map(|s| s.access_token.clone());
        let bearer = session_token.clone().unwrap_or_else(|| self.anon_key.clone());
        let builder = self
            .client
            .request(method, url)
            .header("apikey", &self.anon_key)
            .bearer_auth(bearer);
        let response = build(builder).send().await.map_err(transport_error)?;
        if response.status() == StatusCode::UNAUTHORIZED {
            if let Some(token) = &session_token {
                let err = Self::check(response).await.err();
                let message = err.as_ref().map(BackendError::provider_message).unwrap_or_default();
                self.end_session(token, &message).await;
                return Err(BackendError::Unauthorized(message));
            }
        }
        Self::check(response).await
    }

    async fn send(builder: RequestBuilder) -> Result<Response, BackendError> {
        let response = builder.send().await.map_err(transport_error)?;
        Self::check(response).await
    }

    async fn check(response: Response) -> Result<Response, BackendError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body: Value = response.json().await.unwrap_or(Value::Null);
            Err(error_from_body(status, &body))
        }
    }

    /// Drop the stored session if it still carries `token`, and tell subscribers
    async fn end_session(&self, token: &str, reason: &str) {
        let current = self.session.read().await.as_ref().map(|s| s.access_token.clone());
        if current.as_deref().is_some_and(|current| current != token) {
            return;
        }
        tracing::info!("Session ended by the backend: {}", reason);
        self.store_session(None).await;
        self.emit(AuthEventKind::SignedOut, None);
    }

    async fn token_grant(&self, grant_type: &str, body: Value) -> Result<Session, BackendError> {
        let builder = self
            .client
            .post(self.endpoint("auth/v1/token")?)
            .query(&[("grant_type", grant_type)])
            .header("apikey", &self.anon_key)
            .json(&body);
        let response = Self::send(builder).await?;
        let token: TokenResponse = response.json().await.map_err(|e| BackendError::Decode(e.to_string()))?;
        token.into_session()
    }

    async fn store_session(&self, session: Option<Session>) {
        *self.session.write().await = session.clone();
        let Some(path) = &self.session_file else { return };
        let result = match &session {
            Some(session) => match serde_json::to_vec_pretty(session) {
                Ok(bytes) => {
                    if let Some(dir) = path.parent() {
                        let _ = tokio::fs::create_dir_all(dir).await;
                    }
                    tokio::fs::write(path, bytes).await
                }
                Err(e) => Err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            },
            None => match tokio::fs::remove_file(path).await {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                other => other,
            },
        };
        if let Err(e) = result {
            tracing::warn!("Failed to persist session to {}: {}", path.display(), e);
        }
    }

    async fn load_persisted(&self) -> Option<Session> {
        let path = self.session_file.as_ref()?;
        let bytes = tokio::fs::read(path).await.ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(session) => Some(session),
            Err(e) => {
                tracing::warn!("Ignoring unreadable session file {}: {}", path.display(), e);
                None
            }
        }
    }

    fn emit(&self, kind: AuthEventKind, session: Option<Session>) {
        let _ = self.events.send(AuthEvent::new(kind, session));
    }

    fn rest_path(table: Table) -> String {
        format!("rest/v1/{}", table.as_str())
    }
}

fn transport_error(err: reqwest::Error) -> BackendError {
    if err.is_timeout() {
        BackendError::Timeout(err.to_string())
    } else {
        BackendError::Network(err.to_string())
    }
}

/// Map a GoTrue / PostgREST / storage error body to a `BackendError`
fn error_from_body(status: StatusCode, body: &Value) -> BackendError {
    let message = ["msg", "error_description", "message", "error"]
        .iter()
        .find_map(|key| body.get(*key).and_then(Value::as_str))
        .map(str::to_string)
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string());

    if body.get("code").and_then(Value::as_str) == Some(UNIQUE_VIOLATION) {
        return BackendError::UniqueViolation(message);
    }
    match status {
        StatusCode::NOT_FOUND => BackendError::NotFound(message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => BackendError::Unauthorized(message),
        StatusCode::CONFLICT if message.contains("duplicate key") => BackendError::UniqueViolation(message),
        _ => BackendError::Status { status: status.as_u16(), message },
    }
}

#[async_trait]
impl AuthProvider for HttpBackend {
    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session, BackendError> {
        let session = self
            .token_grant("password", json!({ "email": email, "password": password }))
            .await?;
        self.store_session(Some(session.clone())).await;
        self.emit(AuthEventKind::SignedIn, Some(session.clone()));
        Ok(session)
    }

    async fn sign_up(&self, email: &str, password: &str) -> Result<Option<Session>, BackendError> {
        let builder = self
            .client
            .post(self.endpoint("auth/v1/signup")?)
            .header("apikey", &self.anon_key)
            .json(&json!({ "email": email, "password": password }));
        let body: Value = Self::send(builder)
            .await?
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))?;

        // Without an access token the account awaits email confirmation
        if body.get("access_token").is_none() {
            return Ok(None);
        }
        let session = serde_json::from_value::<TokenResponse>(body)?.into_session()?;
        self.store_session(Some(session.clone())).await;
        self.emit(AuthEventKind::SignedIn, Some(session.clone()));
        Ok(Some(session))
    }

    async fn sign_out(&self, session: &Session) -> Result<(), BackendError> {
        let builder = self
            .client
            .post(self.endpoint("auth/v1/logout")?)
            .header("apikey", &self.anon_key)
            .bearer_auth(&session.access_token);
        let remote = Self::send(builder).await.map(|_| ());
        self.store_session(None).await;
        self.emit(AuthEventKind::SignedOut, None);
        remote
    }

    async fn reset_password_for_email(&self, email: &str) -> Result<(), BackendError> {
        let builder = self
            .client
            .post(self.endpoint("auth/v1/recover")?)
            .header("apikey", &self.anon_key)
            .json(&json!({ "email": email }));
        Self::send(builder).await.map(|_| ())
    }

    async fn current_session(&self) -> Result<Option<Session>, BackendError> {
        let cached = self.session.read().await.clone();
        let session = match cached {
            Some(session) => session,
            None => match self.load_persisted().await {
                Some(session) => session,
                None => return Ok(None),
            },
        };
        if !session.is_expired() {
            *self.session.write().await = Some(session.clone());
            return Ok(Some(session));
        }

        match self.refresh_session(&session).await {
            Ok(refreshed) => Ok(Some(refreshed)),
            // Transient failures keep the persisted session for the next attempt
            Err(e @ (BackendError::Network(_) | BackendError::Timeout(_))) => Err(e),
            Err(e) => {
                tracing::info!("Persisted session could not be refreshed: {}", e);
                Ok(None)
            }
        }
    }

    async fn refresh_session(&self, session: &Session) -> Result<Session, BackendError> {
        let Some(refresh_token) = session.refresh_token.clone() else {
            self.end_session(&session.access_token, "no refresh token").await;
            return Err(BackendError::Unauthorized("Session has no refresh token".to_string()));
        };
        match self
            .token_grant("refresh_token", json!({ "refresh_token": refresh_token }))
            .await
        {
            Ok(refreshed) => {
                tracing::debug!("Refreshed session for {}", refreshed.principal);
                self.store_session(Some(refreshed.clone())).await;
                self.emit(AuthEventKind::TokenRefreshed, Some(refreshed.clone()));
                Ok(refreshed)
            }
            Err(e @ (BackendError::Network(_) | BackendError::Timeout(_))) => Err(e),
            Err(e) => {
                self.end_session(&session.access_token, &e.provider_message()).await;
                Err(BackendError::Unauthorized(e.provider_message()))
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }
}

#[async_trait]
impl DataApi for HttpBackend {
    async fn select(&self, query: &Query) -> Result<Vec<Value>, BackendError> {
        let mut params = vec![("select".to_string(), "*".to_string())];
        params.extend(query.to_query_pairs());
        self.call(Method::GET, &Self::rest_path(query.table), |b| b.query(&params))
            .await?
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))
    }

    async fn insert(&self, table: Table, row: Value) -> Result<Value, BackendError> {
        let rows: Vec<Value> = self
            .call(Method::POST, &Self::rest_path(table), |b| {
                b.header("Prefer", "return=representation").json(&row)
            })
            .await?
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))?;
        rows.into_iter()
            .next()
            .ok_or_else(|| BackendError::Decode(format!("insert into {} returned no row", table)))
    }

    async fn update(&self, query: &Query, patch: Value) -> Result<Vec<Value>, BackendError> {
        self.call(Method::PATCH, &Self::rest_path(query.table), |b| {
            b.query(&query.to_query_pairs())
                .header("Prefer", "return=representation")
                .json(&patch)
        })
        .await?
        .json()
        .await
        .map_err(|e| BackendError::Decode(e.to_string()))
    }

    async fn delete(&self, query: &Query) -> Result<u64, BackendError> {
        let rows: Vec<Value> = self
            .call(Method::DELETE, &Self::rest_path(query.table), |b| {
                b.query(&query.to_query_pairs()).header("Prefer", "return=representation")
            })
            .await?
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))?;
        Ok(rows.len() as u64)
    }
}

#[async_trait]
impl ObjectStorage for HttpBackend {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
        options: &UploadOptions,
    ) -> Result<(), BackendError> {
        self.call(Method::POST, &format!("storage/v1/object/{}/{}", bucket, path), |b| {
            b.header("Content-Type", content_type)
                .header("cache-control", format!("max-age={}", options.cache_control))
                .header("x-upsert", options.upsert.to_string())
                .body(bytes)
        })
        .await
        .map(|_| ())
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{}",
            self.base_url.as_str().trim_end_matches('/'),
            bucket,
            path
        )
    }

    async fn remove(&self, bucket: &str, paths: &[String]) -> Result<(), BackendError> {
        self.call(Method::DELETE, &format!("storage/v1/object/{}", bucket), |b| {
            b.json(&json!({ "prefixes": paths }))
        })
        .await
        .map(|_| ())
    }
}

#[async_trait]
impl ChangeFeed for HttpBackend {
    async fn subscribe(&self, scopes: &[ChangeScope]) -> Result<ChangeSubscription, BackendError> {
        let token = self.session.read().await.as_ref().map(|s| s.access_token.clone());
        self.realtime.subscribe(scopes, token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn postgrest_unique_violation_is_recognised() {
        let body = json!({
            "code": "23505",
            "message": "duplicate key value violates unique constraint \"app_reviews_app_id_user_id_key\""
        });
        assert!(matches!(
            error_from_body(StatusCode::CONFLICT, &body),
            BackendError::UniqueViolation(_)
        ));
    }

    #[test]
    fn gotrue_error_message_is_extracted() {
        let body = json!({ "error": "invalid_grant", "error_description": "Invalid login credentials" });
        assert_eq!(
            error_from_body(StatusCode::BAD_REQUEST, &body),
            BackendError::Status { status: 400, message: "Invalid login credentials".to_string() }
        );
    }

    #[test]
    fn public_url_has_no_double_slash() {
        let backend = HttpBackend::new(
            "https://demo.supabase.co/",
            "anon",
            Duration::from_secs(5),
            Duration::from_secs(30),
            None,
        )
        .unwrap();
        assert_eq!(
            backend.public_url("app_assets", "icons/a.png"),
            "https://demo.supabase.co/storage/v1/object/public/app_assets/icons/a.png"
        );
    }
}
