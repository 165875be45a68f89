#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Once;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{json, Value};

use apphaven_hub::backend::{Backend, InMemoryBackend};
use apphaven_hub::config::{Environment, HubConfig};
use apphaven_hub::hub::Hub;
use apphaven_hub::types::{AuthSnapshot, PrincipalId, Table};

pub const USER_EMAIL: &str = "user@example.com";
pub const ADMIN_EMAIL: &str = "admin@example.com";
pub const PASSWORD: &str = "secret123";

/// Upper bound for any single wait in these suites
pub const WAIT: Duration = Duration::from_secs(5);

static TRACING: Once = Once::new();

/// Route hub logs through the test harness (`RUST_LOG` overrides the default filter)
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn,apphaven_hub=debug"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub fn scratch_dir(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("haven-test-{}-{}", label, uuid::Uuid::new_v4()))
}

pub fn test_config(label: &str) -> HubConfig {
    let mut config = HubConfig::preset(Environment::Development);
    config.request_timeout_secs = 5;
    config.realtime.reconnect_delay_ms = 20;
    config.client_dir = scratch_dir(label);
    config
}

/// One in-memory backend plus the hub ("browser tab") built on it
pub struct Fixture {
    pub memory: InMemoryBackend,
    pub hub: Hub,
    pub user: PrincipalId,
    pub admin: PrincipalId,
}

impl Fixture {
    /// Started hub, nobody signed in. `user` is a plain account, `admin` is privileged.
    pub async fn new(label: &str) -> Result<Self> {
        Self::with_memory(label, InMemoryBackend::new()).await
    }

    pub async fn with_memory(label: &str, memory: InMemoryBackend) -> Result<Self> {
        init_tracing();
        let user = memory.create_user(USER_EMAIL, PASSWORD).await;
        memory.set_profile(&user, "user", false).await;
        let admin = memory.create_user(ADMIN_EMAIL, PASSWORD).await;
        memory.set_profile(&admin, "admin", true).await;

        let hub = Hub::new(test_config(label), Backend::in_memory(memory.clone()));
        hub.start().await;
        Ok(Self { memory, hub, user, admin })
    }

    /// A second tab sharing this fixture's browser context
    pub async fn open_tab(&self, label: &str) -> Hub {
        let hub = Hub::new(test_config(label), Backend::in_memory(self.memory.clone()));
        hub.start().await;
        hub
    }

    pub async fn sign_in_as(&self, email: &str) -> Result<AuthSnapshot> {
        self.hub.session.sign_in(email, PASSWORD).await?;
        self.settled().await
    }

    /// Wait until the session is restored and privilege is known for it
    pub async fn settled(&self) -> Result<AuthSnapshot> {
        tokio::time::timeout(WAIT, self.hub.settled())
            .await
            .context("auth state did not settle")
    }

    pub async fn seed_app(&self, id: &str, name: &str, category: &str) -> Value {
        self.memory
            .seed(
                Table::Apps,
                json!({
                    "id": id,
                    "name": name,
                    "developer": "Lens Labs",
                    "category": category,
                    "version": "1.0.0",
                    "description": format!("{} description", name),
                    "features": ["Fast"],
                    "is_free": true,
                    "downloads": 0,
                }),
            )
            .await
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        self.hub.shutdown();
        let _ = std::fs::remove_dir_all(&self.hub.config.client_dir);
    }
}

/// Wait for `fut` or fail the test with `what`
pub async fn within<T>(what: &str, fut: impl std::future::Future<Output = T>) -> Result<T> {
    tokio::time::timeout(WAIT, fut)
        .await
        .with_context(|| format!("timed out waiting for {}", what))
}
