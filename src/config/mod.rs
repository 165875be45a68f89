use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub environment: Environment,
    pub backend: BackendConfig,
    pub realtime: RealtimeConfig,
    pub request_timeout_secs: u64,
    pub storage: StorageConfig,
    pub routes: RouteConfig,
    /// Where the persisted session and theme preference live
    pub client_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Staging,
    Production,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub url: String,
    pub anon_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    pub heartbeat_secs: u64,
    pub reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub bucket: String,
    pub cache_control: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
    pub sign_in: String,
    pub home: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },

    #[error("Failed to parse config file {path}: {source}")]
    Parse { path: PathBuf, source: serde_yaml::Error },
}

impl HubConfig {
    pub fn from_env() -> Self {
        Self::preset(Environment::from_env()).with_env_overrides()
    }

    /// YAML overlay on top of the environment preset, then env overrides
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        let config = Self::from_yaml_str(&text)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
        Ok(config.with_env_overrides())
    }

    /// Keys present in `text` replace the preset's; the preset is the file's
    /// `environment`, or `APP_ENV` when the file names none
    pub fn from_yaml_str(text: &str) -> Result<Self, serde_yaml::Error> {
        let overlay: serde_yaml::Value = serde_yaml::from_str(text)?;
        let environment = match overlay.get("environment") {
            Some(named) => serde_yaml::from_value(named.clone())?,
            None => Environment::from_env(),
        };
        let mut merged = serde_yaml::to_value(Self::preset(environment))?;
        merge_yaml(&mut merged, overlay);
        serde_yaml::from_value(merged)
    }

    pub fn preset(environment: Environment) -> Self {
        match environment {
            Environment::Production => Self::production(),
            Environment::Staging => Self::staging(),
            Environment::Development => Self::development(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    fn with_env_overrides(mut self) -> Self {
        // Backend overrides
        if let Ok(v) = env::var("HAVEN_BACKEND_URL") {
            self.backend.url = v;
        }
        if let Ok(v) = env::var("HAVEN_ANON_KEY") {
            self.backend.anon_key = v;
        }
        if let Ok(v) = env::var("HAVEN_REQUEST_TIMEOUT_SECS") {
            self.request_timeout_secs = v.parse().unwrap_or(self.request_timeout_secs);
        }

        // Realtime overrides
        if let Ok(v) = env::var("HAVEN_REALTIME_HEARTBEAT_SECS") {
            self.realtime.heartbeat_secs = v.parse().unwrap_or(self.realtime.heartbeat_secs);
        }
        if let Ok(v) = env::var("HAVEN_REALTIME_RECONNECT_ATTEMPTS") {
            self.realtime.reconnect_attempts = v.parse().unwrap_or(self.realtime.reconnect_attempts);
        }
        if let Ok(v) = env::var("HAVEN_REALTIME_RECONNECT_DELAY_MS") {
            self.realtime.reconnect_delay_ms = v.parse().unwrap_or(self.realtime.reconnect_delay_ms);
        }

        // Storage overrides
        if let Ok(v) = env::var("HAVEN_STORAGE_BUCKET") {
            self.storage.bucket = v;
        }
        if let Ok(v) = env::var("HAVEN_STORAGE_CACHE_CONTROL") {
            self.storage.cache_control = v;
        }

        // Route overrides
        if let Ok(v) = env::var("HAVEN_SIGN_IN_ROUTE") {
            self.routes.sign_in = v;
        }
        if let Ok(v) = env::var("HAVEN_HOME_ROUTE") {
            self.routes.home = v;
        }

        if let Ok(v) = env::var("HAVEN_CONFIG_DIR") {
            self.client_dir = PathBuf::from(v);
        }

        self
    }

    fn development() -> Self {
        Self {
            environment: Environment::Development,
            backend: BackendConfig::default(),
            realtime: RealtimeConfig::default(),
            request_timeout_secs: 30,
            storage: StorageConfig::default(),
            routes: RouteConfig::default(),
            client_dir: default_client_dir(),
        }
    }

    fn staging() -> Self {
        Self {
            environment: Environment::Staging,
            request_timeout_secs: 15,
            ..Self::development()
        }
    }

    fn production() -> Self {
        Self {
            environment: Environment::Production,
            realtime: RealtimeConfig {
                heartbeat_secs: 25,
                reconnect_attempts: 1,
                reconnect_delay_ms: 1000,
            },
            request_timeout_secs: 10,
            ..Self::development()
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self::preset(Environment::from_env())
    }
}

impl Environment {
    pub fn from_env() -> Self {
        match env::var("APP_ENV").as_deref() {
            Ok("production") | Ok("prod") => Environment::Production,
            Ok("staging") | Ok("stage") => Environment::Staging,
            _ => Environment::Development,
        }
    }
}

impl Default for Environment {
    fn default() -> Self {
        Environment::Development
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:54321".to_string(),
            anon_key: String::new(),
        }
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self { heartbeat_secs: 30, reconnect_attempts: 1, reconnect_delay_ms: 500 }
    }
}

impl RealtimeConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { bucket: "app_assets".to_string(), cache_control: "3600".to_string() }
    }
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self { sign_in: "/auth".to_string(), home: "/".to_string() }
    }
}

fn merge_yaml(base: &mut serde_yaml::Value, overlay: serde_yaml::Value) {
    match (base, overlay) {
        (serde_yaml::Value::Mapping(base), serde_yaml::Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => merge_yaml(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (_, serde_yaml::Value::Null) => {}
        (slot, value) => *slot = value,
    }
}

fn default_client_dir() -> PathBuf {
    match env::var("HOME") {
        Ok(home) => PathBuf::from(home).join(".config").join("apphaven"),
        Err(_) => PathBuf::from(".apphaven"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_development_config() {
        let config = HubConfig::development();
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.storage.bucket, "app_assets");
        assert_eq!(config.routes.sign_in, "/auth");
        assert_eq!(config.realtime.reconnect_attempts, 1);
    }

    #[test]
    fn test_default_production_config() {
        let config = HubConfig::production();
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.routes.home, "/");
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config: HubConfig = serde_yaml::from_str(
            "backend:\n  url: https://demo.supabase.co\n  anon_key: abc\nroutes:\n  home: /apps\n",
        )
        .unwrap();
        assert_eq!(config.backend.url, "https://demo.supabase.co");
        assert_eq!(config.routes.home, "/apps");
        assert_eq!(config.routes.sign_in, "/auth");
        assert_eq!(config.storage.cache_control, "3600");
    }

    #[test]
    fn test_yaml_overlays_the_named_preset() {
        let config = HubConfig::from_yaml_str(
            "environment: production\nbackend:\n  url: https://demo.supabase.co\nrealtime:\n  heartbeat_secs: 40\n",
        )
        .unwrap();
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.backend.url, "https://demo.supabase.co");
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.realtime.heartbeat_secs, 40);
        assert_eq!(config.realtime.reconnect_delay_ms, 1000);

        let staging = HubConfig::from_yaml_str("environment: staging\nroutes:\n  home: /apps\n").unwrap();
        assert_eq!(staging.request_timeout(), Duration::from_secs(15));
        assert_eq!(staging.routes.home, "/apps");
        assert_eq!(staging.routes.sign_in, "/auth");
    }
}
