// Display theme preference, persisted next to the session file

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

const THEME_FILE: &str = "theme.json";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    Dark,
    Light,
    #[default]
    System,
}

impl Theme {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "dark" => Some(Theme::Dark),
            "light" => Some(Theme::Light),
            "system" => Some(Theme::System),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Theme::Dark => "dark",
            Theme::Light => "light",
            Theme::System => "system",
        }
    }

    /// Concrete theme; never returns `System`
    pub fn resolved(&self, system_prefers_dark: bool) -> Theme {
        match self {
            Theme::System if system_prefers_dark => Theme::Dark,
            Theme::System => Theme::Light,
            concrete => *concrete,
        }
    }
}

impl std::fmt::Display for Theme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredTheme {
    theme: Theme,
}

#[derive(Clone)]
pub struct ThemeStore {
    path: PathBuf,
    state: Arc<watch::Sender<Theme>>,
}

impl ThemeStore {
    /// Load from `dir/theme.json`. A missing or unreadable file means `System`.
    pub fn load(dir: impl AsRef<Path>) -> Self {
        let path = dir.as_ref().join(THEME_FILE);
        let theme = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<StoredTheme>(&raw) {
                Ok(stored) => stored.theme,
                Err(e) => {
                    tracing::warn!("Ignoring malformed {}: {}", path.display(), e);
                    Theme::default()
                }
            },
            Err(_) => Theme::default(),
        };
        let (state, _) = watch::channel(theme);
        Self { path, state: Arc::new(state) }
    }

    pub fn theme(&self) -> Theme {
        *self.state.borrow()
    }

    pub fn resolved(&self, system_prefers_dark: bool) -> Theme {
        self.theme().resolved(system_prefers_dark)
    }

    pub fn subscribe(&self) -> watch::Receiver<Theme> {
        self.state.subscribe()
    }

    /// Persist then publish. Subscribers are only woken on an actual change.
    pub async fn set(&self, theme: Theme) -> std::io::Result<()> {
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let body = serde_json::to_vec_pretty(&StoredTheme { theme }).map_err(std::io::Error::other)?;
        tokio::fs::write(&self.path, body).await?;
        self.state.send_if_modified(|current| {
            if *current == theme {
                return false;
            }
            tracing::info!("Theme changed: {} -> {}", current, theme);
            *current = theme;
            true
        });
        Ok(())
    }
}
