/// Shared types used across the codebase

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifier of an authenticated actor, as issued by the auth provider
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrincipalId(pub String);

impl PrincipalId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Live proof of authentication for a principal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub principal: PrincipalId,
    pub email: Option<String>,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    /// Display name used for reviews: the local part of the email, if any
    pub fn display_name(&self) -> String {
        self.email
            .as_deref()
            .and_then(|email| email.split('@').next())
            .filter(|name| !name.is_empty())
            .unwrap_or("Anonymous")
            .to_string()
    }
}

/// Privilege flag derived from the principal's profile record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorizationState {
    pub principal: Option<PrincipalId>,
    pub privileged: bool,
    pub resolved: bool,
}

impl AuthorizationState {
    /// State for "nobody is signed in": resolved, never privileged
    pub fn signed_out() -> Self {
        Self { principal: None, privileged: false, resolved: true }
    }

    /// A principal whose privilege lookup has not completed yet
    pub fn pending(principal: PrincipalId) -> Self {
        Self { principal: Some(principal), privileged: false, resolved: false }
    }

    pub fn resolved(principal: PrincipalId, privileged: bool) -> Self {
        Self { principal: Some(principal), privileged, resolved: true }
    }
}

/// Everything a view needs to know about "who is signed in"
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSnapshot {
    pub session: Option<Session>,
    pub authorization: AuthorizationState,
    /// True until the persisted session has been restored at startup
    pub loading: bool,
}

impl AuthSnapshot {
    pub fn initial() -> Self {
        Self { session: None, authorization: AuthorizationState::signed_out(), loading: true }
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    pub fn principal(&self) -> Option<&PrincipalId> {
        self.session.as_ref().map(|s| &s.principal)
    }

    /// Privilege resolved for the *current* principal
    pub fn privilege_resolved(&self) -> bool {
        match self.principal() {
            Some(principal) => {
                self.authorization.resolved
                    && self.authorization.principal.as_ref() == Some(principal)
            }
            None => true,
        }
    }

    pub fn is_privileged(&self) -> bool {
        self.privilege_resolved() && self.has_session() && self.authorization.privileged
    }
}

/// Backend collections the storefront reads and writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Apps,
    AppReviews,
    Profiles,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Apps => "apps",
            Table::AppReviews => "app_reviews",
            Table::Profiles => "profiles",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "apps" => Some(Table::Apps),
            "app_reviews" => Some(Table::AppReviews),
            "profiles" => Some(Table::Profiles),
            _ => None,
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Catalog entry as stored in the `apps` collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppRecord {
    pub id: String,
    pub name: String,
    pub developer: String,
    pub category: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub features: Option<Vec<String>>,
    #[serde(default)]
    pub is_free: Option<bool>,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub icon_url: Option<String>,
    #[serde(default)]
    pub app_url: Option<String>,
    #[serde(default)]
    pub screenshots: Option<Vec<String>>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub downloads: Option<i64>,
    #[serde(default)]
    pub uploaded_by: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl AppRecord {
    /// Only an explicit flag makes an app free; a missing flag is shown as paid
    pub fn is_free(&self) -> bool {
        self.is_free == Some(true)
    }

    pub fn price_amount(&self) -> Option<Decimal> {
        if self.is_free() {
            return None;
        }
        self.price.as_deref().and_then(parse_price)
    }

    /// "Free", a normalised "$4.99", the raw price text, or "Paid"
    pub fn price_label(&self) -> String {
        if self.is_free() {
            return "Free".to_string();
        }
        match (self.price_amount(), self.price.as_deref().map(str::trim)) {
            (Some(amount), _) => format!("${:.2}", amount),
            (None, Some(raw)) if !raw.is_empty() => raw.to_string(),
            _ => "Paid".to_string(),
        }
    }

    pub fn features(&self) -> &[String] {
        self.features.as_deref().unwrap_or(&[])
    }

    pub fn screenshots(&self) -> &[String] {
        self.screenshots.as_deref().unwrap_or(&[])
    }
}

/// Accepts "4.99" and "$4.99"
pub fn parse_price(raw: &str) -> Option<Decimal> {
    let trimmed = raw.trim().trim_start_matches('$').trim();
    trimmed.parse::<Decimal>().ok()
}

/// Insert payload for the `apps` collection
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewApp {
    pub name: String,
    pub developer: String,
    pub version: String,
    pub category: String,
    pub description: String,
    pub features: Vec<String>,
    pub is_free: bool,
    pub price: Option<String>,
    pub uploaded_by: String,
    pub icon_url: String,
    pub app_url: String,
    pub screenshots: Vec<String>,
    pub downloads: i64,
    pub platform: String,
}

/// Row of the `app_reviews` collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub id: String,
    pub app_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub username: String,
    pub rating: i32,
    pub comment: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewReview {
    pub app_id: String,
    pub user_id: String,
    pub username: String,
    pub rating: i32,
    pub comment: String,
}

/// Row of the `profiles` collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub is_admin: Option<bool>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Kind of mutation carried by a change notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "INSERT" => Some(ChangeKind::Insert),
            "UPDATE" => Some(ChangeKind::Update),
            "DELETE" => Some(ChangeKind::Delete),
            _ => None,
        }
    }
}

/// Push message describing an insert/update/delete on a watched collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: Table,
    pub kind: ChangeKind,
    #[serde(default)]
    pub new: Option<Value>,
    #[serde(default)]
    pub old: Option<Value>,
}

impl ChangeEvent {
    /// The row the event is about: `new` for inserts/updates, `old` for deletes
    pub fn row(&self) -> Option<&Value> {
        match self.kind {
            ChangeKind::Delete => self.old.as_ref().or(self.new.as_ref()),
            _ => self.new.as_ref().or(self.old.as_ref()),
        }
    }
}

/// Column equality narrowing a change subscription
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeFilter {
    pub column: String,
    pub value: String,
}

/// One (table, optional filter) pair a subscription listens to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeScope {
    pub table: Table,
    pub filter: Option<ScopeFilter>,
}

impl ChangeScope {
    pub fn table(table: Table) -> Self {
        Self { table, filter: None }
    }

    /// Narrow to one record by primary key
    pub fn record(table: Table, id: impl Into<String>) -> Self {
        Self::where_eq(table, "id", id)
    }

    pub fn where_eq(table: Table, column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            table,
            filter: Some(ScopeFilter { column: column.into(), value: value.into() }),
        }
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if self.table != event.table {
            return false;
        }
        let Some(filter) = &self.filter else {
            return true;
        };
        [event.new.as_ref(), event.old.as_ref()]
            .into_iter()
            .flatten()
            .any(|row| row_column_equals(row, &filter.column, &filter.value))
    }

    /// Filter string in the realtime wire syntax (`id=eq.abc`)
    pub fn filter_expression(&self) -> Option<String> {
        self.filter
            .as_ref()
            .map(|f| format!("{}=eq.{}", f.column, f.value))
    }
}

fn row_column_equals(row: &Value, column: &str, expected: &str) -> bool {
    match row.get(column) {
        Some(Value::String(s)) => s == expected,
        Some(Value::Number(n)) => n.to_string() == expected,
        Some(Value::Bool(b)) => b.to_string() == expected,
        _ => false,
    }
}
