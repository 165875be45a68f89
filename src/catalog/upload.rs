// App submission: validate the form, push assets to storage, then create the catalog row.

use std::path::Path;

use serde_json::{json, Value};
use tokio::sync::watch;
use uuid::Uuid;

use super::ServiceContext;
use crate::backend::{bounded, Query, UploadOptions};
use crate::error::HubError;
use crate::types::{AppRecord, NewApp, Table};

/// Stages reported through the progress channel, in percent
pub mod progress {
    pub const STARTED: u8 = 10;
    pub const ICON: u8 = 20;
    pub const PACKAGE: u8 = 40;
    pub const SCREENSHOTS: u8 = 60;
    pub const RECORD: u8 = 80;
    pub const DONE: u8 = 100;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetFile {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl AssetFile {
    pub fn new(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        let file_name = file_name.into();
        let content_type = content_type_for(&file_name).to_string();
        Self { file_name, content_type, bytes }
    }

    pub async fn read(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload.bin".to_string());
        Ok(Self::new(file_name, bytes))
    }

    /// Text after the last dot, or `bin`
    pub fn extension(&self) -> &str {
        match self.file_name.rsplit_once('.') {
            Some((_, ext)) if !ext.is_empty() => ext,
            _ => "bin",
        }
    }
}

fn content_type_for(file_name: &str) -> &'static str {
    let ext = file_name.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase()).unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "apk" => "application/vnd.android.package-archive",
        _ => "application/octet-stream",
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppSubmission {
    pub name: String,
    pub developer: String,
    pub version: String,
    pub category: String,
    pub description: String,
    pub features: Vec<String>,
    pub is_free: bool,
    pub price: String,
    pub icon: Option<AssetFile>,
    pub package: Option<AssetFile>,
    pub screenshots: Vec<AssetFile>,
}

impl AppSubmission {
    /// First failing field, in form order
    pub fn validate(&self) -> Result<(), HubError> {
        let blank = |s: &str| s.trim().is_empty();
        let message = if blank(&self.name) {
            "App name is required"
        } else if blank(&self.developer) {
            "Developer name is required"
        } else if blank(&self.version) {
            "Version is required"
        } else if blank(&self.category) {
            "Category is required"
        } else if blank(&self.description) {
            "Description is required"
        } else if self.features.iter().all(|f| blank(f)) {
            "At least one feature is required"
        } else if !self.is_free && blank(&self.price) {
            "Price is required for paid apps"
        } else if self.icon.is_none() {
            "App icon is required"
        } else if self.package.is_none() {
            "App APK file is required"
        } else {
            return Ok(());
        };
        Err(HubError::Validation(message.to_string()))
    }

    fn into_row(self, uploaded_by: String, icon_url: String, app_url: String, screenshots: Vec<String>) -> NewApp {
        NewApp {
            name: self.name,
            developer: self.developer,
            version: self.version,
            category: self.category,
            description: self.description,
            features: self
                .features
                .into_iter()
                .filter(|f| !f.trim().is_empty())
                .collect(),
            price: if self.is_free { None } else { Some(self.price) },
            is_free: self.is_free,
            uploaded_by,
            icon_url,
            app_url,
            screenshots,
            downloads: 0,
            platform: "android".to_string(),
        }
    }
}

/// Object path inside `bucket` for a public URL (`.../<bucket>/<path>?query`)
pub fn storage_path_from_url(url: &str, bucket: &str) -> Option<String> {
    let marker = format!("/{}/", bucket);
    let start = url.find(&marker)? + marker.len();
    let path = url[start..].split(['?', '#']).next().unwrap_or("");
    if path.is_empty() {
        None
    } else {
        Some(path.to_string())
    }
}

#[derive(Clone)]
pub struct UploadService {
    ctx: ServiceContext,
}

impl UploadService {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }

    /// Upload one asset under `<folder>/<uuid>.<ext>` and record its path in
    /// `stored`; returns its public URL
    async fn upload_asset(&self, folder: &str, file: &AssetFile, stored: &mut Vec<String>) -> Result<String, HubError> {
        let path = format!("{}/{}.{}", folder, Uuid::new_v4(), file.extension());
        let url = self.put(folder, &path, file).await?;
        stored.push(path);
        Ok(url)
    }

    /// Remove assets left behind by an operation that failed after uploading them
    async fn discard(&self, paths: &[String]) {
        if paths.is_empty() {
            return;
        }
        let bucket = &self.ctx.storage.bucket;
        match bounded(self.ctx.timeout, self.ctx.backend.storage.remove(bucket, paths)).await {
            Ok(()) => tracing::info!("Removed {} orphaned assets", paths.len()),
            Err(e) => tracing::warn!("Could not remove orphaned assets {:?}: {}", paths, e),
        }
    }

    async fn put(&self, folder: &str, path: &str, file: &AssetFile) -> Result<String, HubError> {
        let storage = &self.ctx.backend.storage;
        let options = UploadOptions { cache_control: self.ctx.storage.cache_control.clone(), upsert: false };
        bounded(
            self.ctx.timeout,
            storage.upload(&self.ctx.storage.bucket, path, file.bytes.clone(), &file.content_type, &options),
        )
        .await
        .map_err(|e| HubError::upload(folder, e))?;
        tracing::debug!("Uploaded {} ({} bytes)", path, file.bytes.len());
        Ok(storage.public_url(&self.ctx.storage.bucket, path))
    }

    /// Publish a new app. Any failure aborts before the row is written and
    /// removes the assets already uploaded.
    pub async fn submit(
        &self,
        submission: AppSubmission,
        progress: Option<&watch::Sender<u8>>,
    ) -> Result<AppRecord, HubError> {
        let report = |pct: u8| {
            if let Some(tx) = progress {
                tx.send_replace(pct);
            }
        };

        if let Err(e) = self.ctx.require_privilege("upload apps") {
            self.ctx.notifier.failure("Upload Failed", &e);
            return Err(e);
        }
        if let Err(e) = submission.validate() {
            self.ctx.notifier.failure("Validation Error", &e);
            return Err(e);
        }

        report(progress::STARTED);
        match self.publish(submission, &report).await {
            Ok(app) => {
                report(progress::DONE);
                tracing::info!("Published app {} ({})", app.name, app.id);
                self.ctx.notifier.notify(
                    crate::notify::Notice::success("Success!").with_description("App uploaded successfully."),
                );
                Ok(app)
            }
            Err(e) => {
                tracing::warn!("App upload failed: {}", e);
                self.ctx.notifier.failure("Upload Failed", &e);
                Err(e)
            }
        }
    }

    async fn publish(&self, mut submission: AppSubmission, report: &impl Fn(u8)) -> Result<AppRecord, HubError> {
        let principal = self
            .ctx
            .session
            .snapshot()
            .principal()
            .cloned()
            .ok_or_else(|| HubError::Authentication("You must be signed in to upload apps".to_string()))?;
        let (Some(icon), Some(package)) = (submission.icon.take(), submission.package.take()) else {
            return Err(HubError::Validation("App icon is required".to_string()));
        };

        let mut stored = Vec::new();
        let result = self
            .store_and_record(submission, principal.to_string(), icon, package, report, &mut stored)
            .await;
        if result.is_err() {
            self.discard(&stored).await;
        }
        result
    }

    async fn store_and_record(
        &self,
        mut submission: AppSubmission,
        uploaded_by: String,
        icon: AssetFile,
        package: AssetFile,
        report: &impl Fn(u8),
        stored: &mut Vec<String>,
    ) -> Result<AppRecord, HubError> {
        report(progress::ICON);
        let icon_url = self.upload_asset("icons", &icon, stored).await?;

        report(progress::PACKAGE);
        let app_url = self.upload_asset("apks", &package, stored).await?;

        report(progress::SCREENSHOTS);
        let mut screenshot_urls = Vec::with_capacity(submission.screenshots.len());
        for shot in std::mem::take(&mut submission.screenshots) {
            screenshot_urls.push(self.upload_asset("screenshots", &shot, stored).await?);
        }

        report(progress::RECORD);
        let row = submission.into_row(uploaded_by, icon_url, app_url, screenshot_urls);
        let row = serde_json::to_value(&row).map_err(|e| HubError::Backend(e.to_string()))?;
        let inserted = bounded(self.ctx.timeout, self.ctx.backend.data.insert(Table::Apps, row)).await?;
        serde_json::from_value(inserted).map_err(|e| HubError::DataFetch(format!("malformed app row: {}", e)))
    }

    /// Add a screenshot to an existing app; returns the new screenshot list
    pub async fn add_screenshot(&self, app_id: &str, file: AssetFile) -> Result<Vec<String>, HubError> {
        let result = self.try_add_screenshot(app_id, &file).await;
        match &result {
            Ok(_) => self.ctx.notifier.success("Screenshot(s) uploaded successfully"),
            Err(e) => self.ctx.notifier.failure("Error uploading screenshot", e),
        }
        result
    }

    async fn try_add_screenshot(&self, app_id: &str, file: &AssetFile) -> Result<Vec<String>, HubError> {
        self.ctx.require_privilege("edit screenshots")?;
        let mut screenshots = self.current_screenshots(app_id).await?;
        let random = Uuid::new_v4().simple().to_string();
        let path = format!("screenshots/{}/{}.{}", app_id, &random[..10], file.extension());
        screenshots.push(self.put("screenshots", &path, file).await?);
        if let Err(e) = self.save_screenshots(app_id, &screenshots).await {
            self.discard(&[path]).await;
            return Err(e);
        }
        Ok(screenshots)
    }

    /// Remove a screenshot by its public URL; returns the new screenshot list
    pub async fn remove_screenshot(&self, app_id: &str, url: &str) -> Result<Vec<String>, HubError> {
        let result = self.try_remove_screenshot(app_id, url).await;
        match &result {
            Ok(_) => self.ctx.notifier.success("Screenshot removed successfully"),
            Err(e) => self.ctx.notifier.failure("Error removing screenshot", e),
        }
        result
    }

    async fn try_remove_screenshot(&self, app_id: &str, url: &str) -> Result<Vec<String>, HubError> {
        self.ctx.require_privilege("edit screenshots")?;
        let bucket = &self.ctx.storage.bucket;
        // URLs outside our bucket are only dropped from the list
        if let Some(path) = storage_path_from_url(url, bucket) {
            bounded(self.ctx.timeout, self.ctx.backend.storage.remove(bucket, &[path])).await?;
        }
        let mut screenshots = self.current_screenshots(app_id).await?;
        screenshots.retain(|s| s != url);
        self.save_screenshots(app_id, &screenshots).await?;
        Ok(screenshots)
    }

    async fn current_screenshots(&self, app_id: &str) -> Result<Vec<String>, HubError> {
        let rows = self
            .ctx
            .select(&Query::table(Table::Apps).eq("id", app_id).limit(1))
            .await?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| HubError::NotFound(format!("App '{}' not found", app_id)))?;
        Ok(match row.get("screenshots") {
            Some(Value::Array(items)) => items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect(),
            _ => Vec::new(),
        })
    }

    async fn save_screenshots(&self, app_id: &str, screenshots: &[String]) -> Result<(), HubError> {
        let query = Query::table(Table::Apps).eq("id", app_id);
        bounded(
            self.ctx.timeout,
            self.ctx.backend.data.update(&query, json!({ "screenshots": screenshots })),
        )
        .await?;
        Ok(())
    }
}
