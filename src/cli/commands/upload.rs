use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::watch;

use crate::catalog::{AppSubmission, AssetFile};
use crate::cli::utils::{fail, output_success};
use crate::cli::OutputFormat;
use crate::hub::Hub;

/// Submission manifest; asset paths are relative to the manifest
#[derive(Debug, Deserialize)]
struct Manifest {
    name: String,
    developer: String,
    version: String,
    category: String,
    description: String,
    #[serde(default)]
    features: Vec<String>,
    #[serde(default = "default_free")]
    is_free: bool,
    #[serde(default)]
    price: Option<String>,
    icon: PathBuf,
    package: PathBuf,
    #[serde(default)]
    screenshots: Vec<PathBuf>,
}

fn default_free() -> bool {
    true
}

async fn read_asset(base: &Path, path: &Path) -> anyhow::Result<AssetFile> {
    let full = base.join(path);
    AssetFile::read(&full)
        .await
        .with_context(|| format!("failed to read {}", full.display()))
}

async fn load_submission(manifest_path: &Path) -> anyhow::Result<AppSubmission> {
    let raw = tokio::fs::read_to_string(manifest_path)
        .await
        .with_context(|| format!("failed to read manifest {}", manifest_path.display()))?;
    let manifest: Manifest = serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse manifest {}", manifest_path.display()))?;
    let base = manifest_path.parent().unwrap_or_else(|| Path::new("."));

    let mut screenshots = Vec::with_capacity(manifest.screenshots.len());
    for shot in &manifest.screenshots {
        screenshots.push(read_asset(base, shot).await?);
    }

    Ok(AppSubmission {
        name: manifest.name,
        developer: manifest.developer,
        version: manifest.version,
        category: manifest.category,
        description: manifest.description,
        features: manifest.features,
        is_free: manifest.is_free,
        price: manifest.price.unwrap_or_default(),
        icon: Some(read_asset(base, &manifest.icon).await?),
        package: Some(read_asset(base, &manifest.package).await?),
        screenshots,
    })
}

pub async fn handle(manifest: &Path, hub: &Hub, output_format: OutputFormat) -> anyhow::Result<()> {
    let submission = load_submission(manifest).await?;

    let (progress_tx, mut progress_rx) = watch::channel(0u8);
    let show_progress = matches!(output_format, OutputFormat::Text);
    let reporter = tokio::spawn(async move {
        while progress_rx.changed().await.is_ok() {
            let pct = *progress_rx.borrow_and_update();
            if show_progress {
                eprintln!("  {:>3}%", pct);
            }
        }
    });

    let result = hub.uploads.submit(submission, Some(&progress_tx)).await;
    drop(progress_tx);
    let _ = reporter.await;

    let app = result.map_err(|e| fail(&output_format, e))?;
    output_success(
        &output_format,
        &format!("Published {} ({})", app.name, app.id),
        Some(json!({ "app": app })),
    )
}
