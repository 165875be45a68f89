pub mod commands;
pub mod utils;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use crate::backend::{Backend, HttpBackend};
use crate::config::HubConfig;
use crate::hub::Hub;

#[derive(Parser)]
#[command(name = "haven")]
#[command(about = "Haven CLI - browse, publish and review apps on an AppHaven hub")]
#[command(version)]
pub struct Cli {
    #[arg(long, global = true, help = "Output in human-readable text format")]
    pub text: bool,

    #[arg(long, global = true, help = "Output in JSON format")]
    pub json: bool,

    #[arg(long, global = true, help = "YAML config file applied before HAVEN_* overrides")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Sign in, sign up and session status")]
    Auth {
        #[command(subcommand)]
        cmd: commands::auth::AuthCommands,
    },

    #[command(about = "Browse, watch and administer the app catalog")]
    Apps {
        #[command(subcommand)]
        cmd: commands::apps::AppsCommands,
    },

    #[command(about = "Read and write app reviews")]
    Reviews {
        #[command(subcommand)]
        cmd: commands::reviews::ReviewsCommands,
    },

    #[command(about = "Publish an app from a YAML submission manifest")]
    Upload {
        #[arg(help = "Path to the submission manifest")]
        manifest: PathBuf,
    },

    #[command(about = "Show the guard decision for a route")]
    Guard {
        #[arg(help = "Route path, e.g. /upload")]
        path: String,
        #[arg(long, help = "Route requires administrator privilege")]
        admin: bool,
    },

    #[command(about = "Display theme preference")]
    Theme {
        #[command(subcommand)]
        cmd: commands::theme::ThemeCommands,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    pub fn from_cli(cli: &Cli) -> Self {
        if cli.json {
            OutputFormat::Json
        } else {
            OutputFormat::Text
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<HubConfig> {
    match path {
        Some(path) => Ok(HubConfig::from_yaml_file(path)?),
        None => Ok(HubConfig::from_env()),
    }
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let output_format = OutputFormat::from_cli(&cli);
    let config = load_config(cli.config.as_ref())?;

    // Theme is local-only; no backend connection needed
    if let Commands::Theme { cmd } = cli.command {
        return commands::theme::handle(cmd, &config, output_format).await;
    }

    let http = HttpBackend::from_config(&config).context("failed to configure backend")?;
    let hub = Hub::new(config, Backend::http(http));
    hub.start().await;
    if tokio::time::timeout(utils::SETTLE_TIMEOUT, hub.settled()).await.is_err() {
        tracing::warn!("Session state did not settle within {:?}", utils::SETTLE_TIMEOUT);
    }

    let result = match cli.command {
        Commands::Auth { cmd } => commands::auth::handle(cmd, &hub, output_format).await,
        Commands::Apps { cmd } => commands::apps::handle(cmd, &hub, output_format).await,
        Commands::Reviews { cmd } => commands::reviews::handle(cmd, &hub, output_format).await,
        Commands::Upload { manifest } => commands::upload::handle(&manifest, &hub, output_format).await,
        Commands::Guard { path, admin } => commands::guard::handle(path, admin, &hub, output_format).await,
        Commands::Theme { .. } => Ok(()),
    };

    hub.shutdown();
    result
}
