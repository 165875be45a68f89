use clap::Subcommand;
use serde_json::json;

use crate::cli::utils::{output_error, output_success};
use crate::cli::OutputFormat;
use crate::config::HubConfig;
use crate::theme::{Theme, ThemeStore};

#[derive(Subcommand)]
pub enum ThemeCommands {
    #[command(about = "Show the stored theme preference")]
    Show {
        #[arg(long, help = "Resolve `system` as if the platform prefers dark")]
        prefers_dark: bool,
    },

    #[command(about = "Store a theme preference")]
    Set {
        #[arg(help = "dark, light or system")]
        theme: String,
    },
}

pub async fn handle(cmd: ThemeCommands, config: &HubConfig, output_format: OutputFormat) -> anyhow::Result<()> {
    let store = ThemeStore::load(&config.client_dir);
    match cmd {
        ThemeCommands::Show { prefers_dark } => {
            let theme = store.theme();
            let resolved = store.resolved(prefers_dark);
            output_success(
                &output_format,
                &format!("Theme: {} (renders {})", theme, resolved),
                Some(json!({ "theme": theme, "resolved": resolved })),
            )
        }
        ThemeCommands::Set { theme } => {
            let Some(parsed) = Theme::parse(&theme) else {
                output_error(&output_format, &format!("Unknown theme '{}'", theme), Some("VALIDATION_ERROR"))?;
                anyhow::bail!("Unknown theme '{}'", theme);
            };
            store.set(parsed).await?;
            output_success(&output_format, &format!("Theme set to {}", parsed), Some(json!({ "theme": parsed })))
        }
    }
}
