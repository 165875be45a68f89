// Catalog browsing and administration over the `apps` collection

pub mod reviews;
pub mod upload;

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use crate::backend::{bounded, Backend, ChangeSubscription, DataApi, Query};
use crate::config::{HubConfig, StorageConfig};
use crate::error::HubError;
use crate::live::{LiveOptions, LiveQuery, LiveTarget};
use crate::notify::{Notice, Notifier};
use crate::session::SessionStore;
use crate::types::{AppRecord, ChangeEvent, ChangeKind, ChangeScope, Table};

pub use reviews::{RatingSummary, ReviewService};
pub use upload::{AppSubmission, AssetFile, UploadService};

const DOWNLOAD_ATTEMPTS: usize = 8;

/// What every catalog service needs from the hub root
#[derive(Clone)]
pub struct ServiceContext {
    pub backend: Backend,
    pub session: SessionStore,
    pub notifier: Notifier,
    pub live: LiveOptions,
    pub storage: StorageConfig,
    pub timeout: Duration,
}

impl ServiceContext {
    pub fn new(config: &HubConfig, backend: Backend, session: SessionStore, notifier: Notifier) -> Self {
        Self {
            backend,
            session,
            notifier,
            live: LiveOptions::from_config(config),
            storage: config.storage.clone(),
            timeout: config.request_timeout(),
        }
    }

    pub(crate) fn live_query<T>(&self, target: LiveTarget<T>, error_title: &str) -> LiveQuery<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        LiveQuery::new(self.backend.changes.clone(), self.notifier.clone(), self.live.clone(), target)
            .with_error_title(error_title)
    }

    pub(crate) async fn select(&self, query: &Query) -> Result<Vec<Value>, HubError> {
        bounded(self.timeout, self.backend.data.select(query))
            .await
            .map_err(HubError::data_fetch)
    }

    pub(crate) fn require_privilege(&self, action: &str) -> Result<(), HubError> {
        let snapshot = self.session.snapshot();
        if snapshot.is_privileged() {
            Ok(())
        } else if !snapshot.has_session() {
            Err(HubError::Authentication(format!("You must be signed in to {}", action)))
        } else {
            Err(HubError::Forbidden(format!("Only administrators can {}", action)))
        }
    }
}

pub(crate) fn decode_rows<T: DeserializeOwned>(rows: Vec<Value>) -> Result<Vec<T>, HubError> {
    rows.into_iter()
        .map(|row| serde_json::from_value(row).map_err(|e| HubError::DataFetch(format!("malformed row: {}", e))))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Category {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
}

static CATEGORIES: Lazy<Vec<Category>> = Lazy::new(|| {
    vec![
        Category { id: "games", name: "Games", description: "Action, puzzle and casual games" },
        Category { id: "business", name: "Business", description: "Tools for work and teams" },
        Category { id: "photography", name: "Photography", description: "Cameras, editors and filters" },
        Category { id: "music", name: "Music & Audio", description: "Players, streaming and creation" },
        Category { id: "utilities", name: "Utilities", description: "Everyday device helpers" },
        Category { id: "productivity", name: "Productivity", description: "Notes, tasks and documents" },
        Category { id: "shopping", name: "Shopping", description: "Stores and deal finders" },
        Category { id: "education", name: "Education", description: "Learning and reference" },
        Category { id: "health", name: "Health & Fitness", description: "Workouts, tracking and wellbeing" },
        Category { id: "social", name: "Social", description: "Messaging and communities" },
    ]
});

pub fn categories() -> &'static [Category] {
    &CATEGORIES
}

pub fn category(id: &str) -> Option<&'static Category> {
    CATEGORIES.iter().find(|c| c.id == id)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Pricing {
    #[default]
    Any,
    Free,
    Paid,
}

/// Admin dashboard filter, applied to an already-fetched snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppFilter {
    pub search: Option<String>,
    pub category: Option<String>,
    pub pricing: Pricing,
}

impl AppFilter {
    pub fn matches(&self, app: &AppRecord) -> bool {
        if let Some(term) = self.search.as_deref().map(str::to_lowercase).filter(|t| !t.is_empty()) {
            if !app.name.to_lowercase().contains(&term) && !app.developer.to_lowercase().contains(&term) {
                return false;
            }
        }
        if let Some(category) = self.category.as_deref().filter(|c| !c.is_empty()) {
            if app.category != category {
                return false;
            }
        }
        match self.pricing {
            Pricing::Any => true,
            Pricing::Free => app.is_free(),
            Pricing::Paid => !app.is_free(),
        }
    }

    pub fn apply<'a>(&self, apps: &'a [AppRecord]) -> Vec<&'a AppRecord> {
        apps.iter().filter(|app| self.matches(app)).collect()
    }
}

/// Toast text for an admin-visible change on `apps`
pub fn describe_change(event: &ChangeEvent) -> Notice {
    let name = event
        .new
        .as_ref()
        .and_then(|row| row.get("name"))
        .and_then(Value::as_str)
        .unwrap_or("An app");
    match event.kind {
        ChangeKind::Insert => {
            Notice::success("New app added").with_description(format!("{} has been added to the store.", name))
        }
        ChangeKind::Update => Notice::info("App updated").with_description(format!("{} has been updated.", name)),
        ChangeKind::Delete => {
            Notice::info("App removed").with_description("An app has been removed from the store.")
        }
    }
}

#[derive(Clone)]
pub struct CatalogService {
    ctx: ServiceContext,
}

impl CatalogService {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }

    fn newest_first(query: Query) -> Query {
        query.order("created_at", false)
    }

    /// Every app, newest first
    pub async fn list_apps(&self) -> Result<Vec<AppRecord>, HubError> {
        let result = self.fetch_list(Self::newest_first(Query::table(Table::Apps))).await;
        self.report(result, "Error fetching apps")
    }

    pub async fn app_detail(&self, id: &str) -> Result<AppRecord, HubError> {
        let result = fetch_app(self.ctx.backend.data.clone(), self.ctx.timeout, id.to_string())
            .await
            .and_then(|app| app.ok_or_else(|| HubError::NotFound(format!("App '{}' not found", id))));
        self.report(result, "Error fetching app details")
    }

    /// Server-side name search, newest first. `%` and `_` in `term` are literal.
    pub async fn search_apps(&self, term: &str) -> Result<Vec<AppRecord>, HubError> {
        let pattern = format!("%{}%", escape_like(term.trim()));
        let result = self
            .fetch_list(Self::newest_first(Query::table(Table::Apps).ilike("name", pattern)))
            .await;
        self.report(result, "Error searching apps")
    }

    pub async fn apps_in_category(&self, category: &str) -> Result<Vec<AppRecord>, HubError> {
        let result = self
            .fetch_list(Self::newest_first(Query::table(Table::Apps).eq("category", category)))
            .await;
        self.report(result, "Error fetching apps")
    }

    /// Storefront / admin list
    pub fn live_apps(&self) -> LiveQuery<Vec<AppRecord>> {
        let target = LiveTarget::query(
            self.ctx.backend.data.clone(),
            Self::newest_first(Query::table(Table::Apps)),
            vec![ChangeScope::table(Table::Apps)],
            decode_rows::<AppRecord>,
        );
        self.ctx.live_query(target, "Error fetching apps")
    }

    /// Detail view; `None` once the app is deleted
    pub fn live_app(&self, id: &str) -> LiveQuery<Option<AppRecord>> {
        self.ctx.live_query(self.app_target(id), "Error fetching app details")
    }

    /// Target for `LiveView::retarget` when the detail view switches apps
    pub fn app_target(&self, id: &str) -> LiveTarget<Option<AppRecord>> {
        let data = self.ctx.backend.data.clone();
        let timeout = self.ctx.timeout;
        let id = id.to_string();
        LiveTarget::new(
            format!("app {}", id),
            vec![ChangeScope::record(Table::Apps, id.clone())],
            move || fetch_app(data.clone(), timeout, id.clone()),
        )
    }

    pub fn live_category(&self, category: &str) -> LiveQuery<Vec<AppRecord>> {
        let target = LiveTarget::query(
            self.ctx.backend.data.clone(),
            Self::newest_first(Query::table(Table::Apps).eq("category", category)),
            // Unfiltered: an app moving out of the category only matches on its old row
            vec![ChangeScope::table(Table::Apps)],
            decode_rows::<AppRecord>,
        );
        self.ctx.live_query(target, "Error fetching apps")
    }

    /// Raw change stream on `apps`, for admin toasts
    pub async fn watch_changes(&self) -> Result<ChangeSubscription, HubError> {
        bounded(self.ctx.timeout, self.ctx.backend.changes.subscribe(&[ChangeScope::table(Table::Apps)]))
            .await
            .map_err(HubError::from)
    }

    pub async fn delete_app(&self, id: &str) -> Result<(), HubError> {
        let result = self.report(self.try_delete(id).await, "Error deleting app");
        if result.is_ok() {
            self.ctx.notifier.success("App deleted successfully");
        }
        result
    }

    async fn try_delete(&self, id: &str) -> Result<(), HubError> {
        self.ctx.require_privilege("delete apps")?;
        let query = Query::table(Table::Apps).eq("id", id);
        let deleted = bounded(self.ctx.timeout, self.ctx.backend.data.delete(&query)).await?;
        if deleted == 0 {
            return Err(HubError::NotFound(format!("App '{}' not found", id)));
        }
        tracing::info!("Deleted app {}", id);
        Ok(())
    }

    /// Increment the download counter; returns the new count
    pub async fn record_download(&self, id: &str) -> Result<i64, HubError> {
        let result = self.try_record_download(id).await;
        self.report(result, "Download failed")
    }

    /// Compare-and-set on the count read: the update only lands if nobody
    /// counted in between, otherwise re-read and try again
    async fn try_record_download(&self, id: &str) -> Result<i64, HubError> {
        for attempt in 1..=DOWNLOAD_ATTEMPTS {
            let app = fetch_app(self.ctx.backend.data.clone(), self.ctx.timeout, id.to_string())
                .await?
                .ok_or_else(|| HubError::NotFound(format!("App '{}' not found", id)))?;
            let query = Query::table(Table::Apps).eq("id", id);
            let query = match app.downloads {
                Some(seen) => query.eq("downloads", seen),
                None => query.is_null("downloads"),
            };
            let downloads = app.downloads.unwrap_or(0) + 1;
            let updated = bounded(
                self.ctx.timeout,
                self.ctx.backend.data.update(&query, json!({ "downloads": downloads })),
            )
            .await?;
            if !updated.is_empty() {
                return Ok(downloads);
            }
            tracing::debug!("Download count for {} moved underneath attempt {}", id, attempt);
        }
        Err(HubError::Conflict("Download counter is busy, please try again".to_string()))
    }

    async fn fetch_list(&self, query: Query) -> Result<Vec<AppRecord>, HubError> {
        decode_rows(self.ctx.select(&query).await?)
    }

    fn report<T>(&self, result: Result<T, HubError>, title: &str) -> Result<T, HubError> {
        if let Err(e) = &result {
            self.ctx.notifier.failure(title, e);
        }
        result
    }
}

/// Escape `ilike` wildcards so user input matches literally
fn escape_like(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

async fn fetch_app(data: Arc<dyn DataApi>, timeout: Duration, id: String) -> Result<Option<AppRecord>, HubError> {
    let query = Query::table(Table::Apps).eq("id", id).limit(1);
    let rows = bounded(timeout, data.select(&query)).await.map_err(HubError::data_fetch)?;
    Ok(decode_rows::<AppRecord>(rows)?.into_iter().next())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app(name: &str, developer: &str, category: &str, is_free: Option<bool>) -> AppRecord {
        serde_json::from_value(json!({
            "id": name.to_lowercase(),
            "name": name,
            "developer": developer,
            "category": category,
            "version": "1.0",
            "is_free": is_free,
        }))
        .unwrap()
    }

    #[test]
    fn filter_searches_name_and_developer() {
        let apps = vec![
            app("PhotoMagic", "Lens Labs", "photography", Some(true)),
            app("Beat Box", "Magic Audio", "music", Some(false)),
            app("Ledger", "Count Co", "business", Some(false)),
        ];
        let filter = AppFilter { search: Some("MAGIC".into()), ..Default::default() };
        assert_eq!(filter.apply(&apps).len(), 2);

        let paid_music = AppFilter {
            search: Some("magic".into()),
            category: Some("music".into()),
            pricing: Pricing::Paid,
        };
        let matched = paid_music.apply(&apps);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].name, "Beat Box");
    }

    #[test]
    fn pricing_filter_agrees_with_the_price_label() {
        let unknown = app("Mystery", "Dev", "games", None);
        let free = AppFilter { pricing: Pricing::Free, ..Default::default() };
        let paid = AppFilter { pricing: Pricing::Paid, ..Default::default() };
        assert_eq!(unknown.price_label(), "Paid");
        assert!(!free.matches(&unknown));
        assert!(paid.matches(&unknown));
        assert!(AppFilter::default().matches(&unknown));

        let labelled_free = app("Gift", "Dev", "games", Some(true));
        assert_eq!(labelled_free.price_label(), "Free");
        assert!(free.matches(&labelled_free) && !paid.matches(&labelled_free));
    }

    #[test]
    fn search_terms_are_escaped_for_ilike() {
        assert_eq!(escape_like("100%_pure"), "100\\%\\_pure");
        assert_eq!(escape_like("plain"), "plain");
    }

    #[test]
    fn change_descriptions_name_the_app() {
        let inserted = ChangeEvent {
            table: Table::Apps,
            kind: ChangeKind::Insert,
            new: Some(json!({ "name": "PhotoMagic" })),
            old: None,
        };
        let notice = describe_change(&inserted);
        assert_eq!(notice.title, "New app added");
        assert_eq!(notice.description.as_deref(), Some("PhotoMagic has been added to the store."));

        let removed = ChangeEvent { kind: ChangeKind::Delete, new: None, old: Some(json!({ "id": "x" })), ..inserted };
        assert_eq!(describe_change(&removed).title, "App removed");
    }

    #[test]
    fn category_catalogue_lookup() {
        assert_eq!(categories().len(), 10);
        assert_eq!(category("music").map(|c| c.name), Some("Music & Audio"));
        assert!(category("warez").is_none());
    }
}
