mod common;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value};

use apphaven_hub::backend::{
    AuthEventKind, AuthProvider, Backend, BackendError, DataApi, HttpBackend, ObjectStorage, Query,
    UploadOptions,
};
use apphaven_hub::guard::{GuardDecision, Route};
use apphaven_hub::hub::Hub;
use apphaven_hub::types::{PrincipalId, Session, Table};
use common::{scratch_dir, test_config, within, PASSWORD, USER_EMAIL};

/// Signs in with a one-second access token that refreshes normally
const SHORT_EMAIL: &str = "short@example.com";
/// Signs in with a one-second access token whose refresh token the service rejects
const REVOKED_EMAIL: &str = "revoked@example.com";

/// One request as seen by the mock service
#[derive(Debug, Clone)]
struct Recorded {
    method: Method,
    path: String,
    query: HashMap<String, String>,
    headers: HeaderMap,
    body: Bytes,
}

impl Recorded {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap_or(Value::Null)
    }
}

#[derive(Default)]
struct MockService {
    requests: Mutex<Vec<Recorded>>,
}

impl MockService {
    fn find(&self, method: Method, path: &str) -> Option<Recorded> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|r| r.method == method && r.path == path)
            .cloned()
    }
}

fn token_body(access: &str, refresh: &str, email: &str) -> Value {
    token_body_expiring(access, refresh, email, 3600)
}

fn token_body_expiring(access: &str, refresh: &str, email: &str, expires_in: i64) -> Value {
    json!({
        "access_token": access,
        "refresh_token": refresh,
        "token_type": "bearer",
        "expires_in": expires_in,
        "user": { "id": "u-1", "email": email }
    })
}

async fn hosted_api(
    State(service): State<Arc<MockService>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let query: HashMap<String, String> = url::form_urlencoded::parse(uri.query().unwrap_or("").as_bytes())
        .into_owned()
        .collect();
    let recorded = Recorded { method: method.clone(), path: uri.path().to_string(), query, headers, body };
    service.requests.lock().unwrap().push(recorded.clone());

    match (method, recorded.path.as_str()) {
        (Method::POST, "/auth/v1/token") => match recorded.query.get("grant_type").map(String::as_str) {
            Some("password") => {
                let credentials = recorded.json();
                if credentials["password"] == PASSWORD {
                    let email = credentials["email"].as_str().unwrap_or_default();
                    let body = match email {
                        SHORT_EMAIL => token_body_expiring("access-1", "refresh-1", email, 1),
                        REVOKED_EMAIL => token_body_expiring("access-1", "revoked-1", email, 1),
                        _ => token_body("access-1", "refresh-1", email),
                    };
                    Json(body).into_response()
                } else {
                    (
                        StatusCode::BAD_REQUEST,
                        Json(json!({ "error": "invalid_grant", "error_description": "Invalid login credentials" })),
                    )
                        .into_response()
                }
            }
            Some("refresh_token") if recorded.json()["refresh_token"] == "revoked-1" => (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": "invalid_grant",
                    "error_description": "Invalid Refresh Token: Refresh Token Not Found"
                })),
            )
                .into_response(),
            Some("refresh_token") => Json(token_body("access-2", "refresh-2", USER_EMAIL)).into_response(),
            _ => (StatusCode::BAD_REQUEST, Json(json!({ "msg": "unsupported grant_type" }))).into_response(),
        },
        (Method::POST, "/auth/v1/signup") => {
            Json(json!({ "id": "u-2", "email": recorded.json()["email"], "confirmation_sent_at": Utc::now() }))
                .into_response()
        }
        (Method::POST, "/auth/v1/logout") => StatusCode::NO_CONTENT.into_response(),
        (Method::GET, "/rest/v1/apps") => {
            Json(json!([{ "id": "a1", "name": "Beat Box", "category": "music" }])).into_response()
        }
        (Method::GET, "/rest/v1/profiles") => Json(json!([])).into_response(),
        (Method::GET, "/rest/v1/app_reviews") => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "code": "PGRST301", "message": "JWT expired" })),
        )
            .into_response(),
        (Method::POST, "/rest/v1/app_reviews") => (
            StatusCode::CONFLICT,
            Json(json!({
                "code": "23505",
                "message": "duplicate key value violates unique constraint \"app_reviews_app_id_user_id_key\""
            })),
        )
            .into_response(),
        (Method::POST, path) if path.starts_with("/storage/v1/object/") => {
            Json(json!({ "Key": path.trim_start_matches("/storage/v1/object/") })).into_response()
        }
        _ => (StatusCode::NOT_FOUND, Json(json!({ "message": "not found" }))).into_response(),
    }
}

/// Serve the mock on a free local port, returning its base url
async fn serve(service: Arc<MockService>) -> Result<String> {
    common::init_tracing();
    let port = portpicker::pick_unused_port().context("no free port")?;
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
    let app = Router::new().fallback(hosted_api).with_state(service);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(format!("http://127.0.0.1:{}/", port))
}

fn client(base_url: &str, session_file: Option<std::path::PathBuf>) -> Result<HttpBackend> {
    Ok(HttpBackend::new(base_url, "anon", Duration::from_secs(5), Duration::from_secs(30), session_file)?)
}

#[tokio::test]
async fn sign_in_persists_session_and_authorizes_data_requests() -> Result<()> {
    let service = Arc::new(MockService::default());
    let base_url = serve(service.clone()).await?;
    let session_file = scratch_dir("http-sign-in").join("session.json");
    let backend = client(&base_url, Some(session_file.clone()))?;

    let session = backend.sign_in_with_password(USER_EMAIL, PASSWORD).await?;
    assert_eq!(session.principal, PrincipalId::new("u-1"));
    assert_eq!(session.refresh_token.as_deref(), Some("refresh-1"));
    assert!(session_file.exists());

    let token = service.find(Method::POST, "/auth/v1/token").context("token request")?;
    assert_eq!(token.query.get("grant_type").map(String::as_str), Some("password"));
    assert_eq!(token.header("apikey"), Some("anon"));

    let query = Query::table(Table::Apps).eq("category", "music").order("created_at", false).limit(5);
    let rows = backend.select(&query).await?;
    assert_eq!(rows.len(), 1);

    let select = service.find(Method::GET, "/rest/v1/apps").context("select request")?;
    assert_eq!(select.header("authorization"), Some("Bearer access-1"));
    assert_eq!(select.query.get("select").map(String::as_str), Some("*"));
    assert_eq!(select.query.get("category").map(String::as_str), Some("eq.music"));
    assert_eq!(select.query.get("order").map(String::as_str), Some("created_at.desc"));
    assert_eq!(select.query.get("limit").map(String::as_str), Some("5"));

    // A fresh client (another tab) restores the persisted session
    let restored = client(&base_url, Some(session_file.clone()))?.current_session().await?;
    assert_eq!(restored, Some(session));
    Ok(())
}

#[tokio::test]
async fn expired_persisted_session_is_refreshed() -> Result<()> {
    let service = Arc::new(MockService::default());
    let base_url = serve(service.clone()).await?;
    let dir = scratch_dir("http-refresh");
    std::fs::create_dir_all(&dir)?;
    let session_file = dir.join("session.json");
    let stale = Session {
        principal: PrincipalId::new("u-1"),
        email: Some(USER_EMAIL.to_string()),
        access_token: "access-0".to_string(),
        refresh_token: Some("refresh-0".to_string()),
        expires_at: Utc::now() - chrono::Duration::minutes(5),
    };
    std::fs::write(&session_file, serde_json::to_vec(&stale)?)?;

    let backend = client(&base_url, Some(session_file.clone()))?;
    let mut events = backend.subscribe();
    let refreshed = backend.current_session().await?.context("refreshed session")?;
    assert_eq!(refreshed.access_token, "access-2");
    assert_eq!(refreshed.principal, stale.principal);

    let grant = service.find(Method::POST, "/auth/v1/token").context("refresh request")?;
    assert_eq!(grant.query.get("grant_type").map(String::as_str), Some("refresh_token"));
    assert_eq!(grant.json()["refresh_token"], "refresh-0");

    let event = events.try_recv()?;
    assert_eq!(event.kind, AuthEventKind::TokenRefreshed);
    let persisted: Session = serde_json::from_slice(&std::fs::read(&session_file)?)?;
    assert_eq!(persisted.access_token, "access-2");
    Ok(())
}

#[tokio::test]
async fn rejected_credentials_carry_the_provider_message() -> Result<()> {
    let service = Arc::new(MockService::default());
    let base_url = serve(service).await?;
    let session_file = scratch_dir("http-bad-credentials").join("session.json");
    let backend = client(&base_url, Some(session_file.clone()))?;

    let err = backend.sign_in_with_password(USER_EMAIL, "wrong").await.unwrap_err();
    assert_eq!(err, BackendError::Status { status: 400, message: "Invalid login credentials".into() });
    assert_eq!(err.provider_message(), "Invalid login credentials");
    assert!(!session_file.exists());
    assert_eq!(backend.current_session().await?, None);
    Ok(())
}

#[tokio::test]
async fn sign_up_awaiting_confirmation_has_no_session() -> Result<()> {
    let service = Arc::new(MockService::default());
    let base_url = serve(service.clone()).await?;
    let backend = client(&base_url, None)?;

    assert_eq!(backend.sign_up("new@example.com", PASSWORD).await?, None);
    let signup = service.find(Method::POST, "/auth/v1/signup").context("signup request")?;
    assert_eq!(signup.json()["email"], "new@example.com");
    Ok(())
}

#[tokio::test]
async fn duplicate_review_insert_is_a_unique_violation() -> Result<()> {
    let service = Arc::new(MockService::default());
    let base_url = serve(service.clone()).await?;
    let backend = client(&base_url, None)?;

    let row = json!({ "app_id": "a1", "user_id": "u-1", "rating": 5, "comment": "Great app" });
    let err = backend.insert(Table::AppReviews, row).await.unwrap_err();
    assert!(matches!(err, BackendError::UniqueViolation(_)), "got {:?}", err);

    let insert = service.find(Method::POST, "/rest/v1/app_reviews").context("insert request")?;
    assert_eq!(insert.header("prefer"), Some("return=representation"));
    assert_eq!(insert.header("authorization"), Some("Bearer anon"));
    Ok(())
}

#[tokio::test]
async fn upload_sends_content_type_and_cache_headers() -> Result<()> {
    let service = Arc::new(MockService::default());
    let base_url = serve(service.clone()).await?;
    let backend = client(&base_url, None)?;

    backend
        .upload("app_assets", "icons/a.png", vec![0x89, 0x50], "image/png", &UploadOptions::default())
        .await?;

    let upload = service
        .find(Method::POST, "/storage/v1/object/app_assets/icons/a.png")
        .context("upload request")?;
    assert_eq!(upload.header("content-type"), Some("image/png"));
    assert_eq!(upload.header("cache-control"), Some("max-age=3600"));
    assert_eq!(upload.header("x-upsert"), Some("false"));
    assert_eq!(upload.body.to_vec(), vec![0x89u8, 0x50]);
    assert_eq!(
        backend.public_url("app_assets", "icons/a.png"),
        format!("{}storage/v1/object/public/app_assets/icons/a.png", base_url)
    );
    Ok(())
}

#[tokio::test]
async fn sign_out_revokes_remotely_and_forgets_the_session() -> Result<()> {
    let service = Arc::new(MockService::default());
    let base_url = serve(service.clone()).await?;
    let session_file = scratch_dir("http-sign-out").join("session.json");
    let backend = client(&base_url, Some(session_file.clone()))?;

    let session = backend.sign_in_with_password(USER_EMAIL, PASSWORD).await?;
    let mut events = backend.subscribe();
    backend.sign_out(&session).await?;

    let logout = service.find(Method::POST, "/auth/v1/logout").context("logout request")?;
    assert_eq!(logout.header("authorization"), Some("Bearer access-1"));
    assert!(!session_file.exists());
    assert_eq!(events.try_recv()?.kind, AuthEventKind::SignedOut);
    assert_eq!(backend.current_session().await?, None);
    Ok(())
}

#[tokio::test]
async fn unauthorized_response_ends_the_session() -> Result<()> {
    let service = Arc::new(MockService::default());
    let base_url = serve(service.clone()).await?;
    let session_file = scratch_dir("http-unauthorized").join("session.json");
    let backend = client(&base_url, Some(session_file.clone()))?;

    backend.sign_in_with_password(USER_EMAIL, PASSWORD).await?;
    let mut events = backend.subscribe();
    let err = backend.select(&Query::table(Table::AppReviews)).await.unwrap_err();
    assert_eq!(err, BackendError::Unauthorized("JWT expired".into()));
    assert_eq!(events.try_recv()?.kind, AuthEventKind::SignedOut);
    assert!(!session_file.exists());
    assert_eq!(backend.current_session().await?, None);

    backend.select(&Query::table(Table::Apps)).await?;
    let select = service.find(Method::GET, "/rest/v1/apps").context("anonymous select")?;
    assert_eq!(select.header("authorization"), Some("Bearer anon"));
    Ok(())
}

#[tokio::test]
async fn hub_refreshes_a_short_lived_session_before_it_expires() -> Result<()> {
    let service = Arc::new(MockService::default());
    let base_url = serve(service.clone()).await?;
    let hub = Hub::new(test_config("http-short"), Backend::http(client(&base_url, None)?));
    hub.start().await;

    let session = hub.session.sign_in(SHORT_EMAIL, PASSWORD).await?;
    assert_eq!(session.access_token, "access-1");
    let snapshot = within(
        "refreshed access token",
        hub.session
            .wait_for(|s| s.session.as_ref().is_some_and(|x| x.access_token == "access-2")),
    )
    .await?;
    assert_eq!(snapshot.principal(), Some(&PrincipalId::new("u-1")));

    let grant = service.find(Method::POST, "/auth/v1/token").context("refresh request")?;
    assert_eq!(grant.query.get("grant_type").map(String::as_str), Some("refresh_token"));
    assert_eq!(grant.json()["refresh_token"], "refresh-1");

    hub.backend.data.select(&Query::table(Table::Apps)).await?;
    let select = service.find(Method::GET, "/rest/v1/apps").context("select request")?;
    assert_eq!(select.header("authorization"), Some("Bearer access-2"));
    hub.shutdown();
    let _ = std::fs::remove_dir_all(&hub.config.client_dir);
    Ok(())
}

#[tokio::test]
async fn hub_signs_out_when_the_refresh_token_is_rejected() -> Result<()> {
    let service = Arc::new(MockService::default());
    let base_url = serve(service.clone()).await?;
    let hub = Hub::new(test_config("http-revoked"), Backend::http(client(&base_url, None)?));
    hub.start().await;
    let mut notices = hub.notifier.subscribe();

    hub.session.sign_in(REVOKED_EMAIL, PASSWORD).await?;
    let mut upload = hub.guard_route(Route::protected("/upload"));

    let snapshot = within("expired session", hub.session.wait_for(|s| !s.has_session())).await?;
    assert!(!snapshot.is_privileged());
    let decision = within(
        "sign-in redirect",
        upload.wait_until(|d| matches!(d, GuardDecision::Unauthenticated { .. })),
    )
    .await?;
    assert_eq!(
        decision,
        Some(GuardDecision::Unauthenticated { redirect: "/auth".into(), return_to: "/upload".into() })
    );

    let mut titles = Vec::new();
    while let Ok(Ok(notice)) = tokio::time::timeout(Duration::from_millis(200), notices.recv()).await {
        titles.push(notice.title);
    }
    assert!(titles.iter().any(|t| t == "Session expired"), "got {:?}", titles);

    hub.backend.data.select(&Query::table(Table::Apps)).await?;
    let select = service.find(Method::GET, "/rest/v1/apps").context("select request")?;
    assert_eq!(select.header("authorization"), Some("Bearer anon"));
    hub.shutdown();
    let _ = std::fs::remove_dir_all(&hub.config.client_dir);
    Ok(())
}
