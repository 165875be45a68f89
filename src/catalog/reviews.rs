use serde::Serialize;
use serde_json::json;

use super::{decode_rows, ServiceContext};
use crate::backend::{bounded, BackendError, Query};
use crate::error::HubError;
use crate::live::{LiveQuery, LiveTarget};
use crate::types::{ChangeScope, NewReview, Review, Table};

pub const MIN_RATING: i32 = 1;
pub const MAX_RATING: i32 = 5;

const ALREADY_REVIEWED: &str = "You have already reviewed this app";

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RatingSummary {
    pub average: Option<f64>,
    pub count: usize,
}

/// Average rating rounded to one decimal place
pub fn rating_summary(reviews: &[Review]) -> RatingSummary {
    if reviews.is_empty() {
        return RatingSummary { average: None, count: 0 };
    }
    let total: i64 = reviews.iter().map(|r| i64::from(r.rating)).sum();
    let average = total as f64 / reviews.len() as f64;
    RatingSummary { average: Some((average * 10.0).round() / 10.0), count: reviews.len() }
}

pub fn validate_review(rating: i32, comment: &str) -> Result<(), HubError> {
    if !(MIN_RATING..=MAX_RATING).contains(&rating) {
        return Err(HubError::Validation(format!(
            "Rating must be between {} and {}",
            MIN_RATING, MAX_RATING
        )));
    }
    if comment.trim().is_empty() {
        return Err(HubError::Validation("Please write a comment".to_string()));
    }
    Ok(())
}

#[derive(Clone)]
pub struct ReviewService {
    ctx: ServiceContext,
}

impl ReviewService {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }

    fn for_app(app_id: &str) -> Query {
        Query::table(Table::AppReviews)
            .eq("app_id", app_id)
            .order("created_at", false)
    }

    pub async fn reviews_for(&self, app_id: &str) -> Result<Vec<Review>, HubError> {
        let result = match self.ctx.select(&Self::for_app(app_id)).await {
            Ok(rows) => decode_rows(rows),
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            self.ctx.notifier.failure("Error fetching reviews", e);
        }
        result
    }

    pub fn live_reviews(&self, app_id: &str) -> LiveQuery<Vec<Review>> {
        let target = LiveTarget::query(
            self.ctx.backend.data.clone(),
            Self::for_app(app_id),
            vec![ChangeScope::where_eq(Table::AppReviews, "app_id", app_id)],
            decode_rows::<Review>,
        );
        self.ctx.live_query(target, "Error fetching reviews")
    }

    /// One review per (principal, app): updates the existing review if there is one
    pub async fn submit_review(&self, app_id: &str, rating: i32, comment: &str) -> Result<Review, HubError> {
        match self.upsert(app_id, rating, comment).await {
            Ok(review) => {
                self.ctx.notifier.success("Review submitted");
                Ok(review)
            }
            Err(e) => {
                self.ctx.notifier.failure("Error submitting review", &e);
                Err(e)
            }
        }
    }

    async fn upsert(&self, app_id: &str, rating: i32, comment: &str) -> Result<Review, HubError> {
        let session = self
            .ctx
            .session
            .snapshot()
            .session
            .ok_or_else(|| HubError::Authentication("You must be signed in to leave a review".to_string()))?;
        validate_review(rating, comment)?;
        let comment = comment.trim();
        let data = &self.ctx.backend.data;

        let mine = Query::table(Table::AppReviews)
            .eq("app_id", app_id)
            .eq("user_id", session.principal.as_str())
            .limit(1);
        let existing = self.ctx.select(&mine).await?;

        let row = if let Some(existing) = existing.first() {
            let id = existing
                .get("id")
                .and_then(|v| v.as_str())
                .ok_or_else(|| HubError::DataFetch("review row without id".to_string()))?;
            let patch = json!({ "rating": rating, "comment": comment, "username": session.display_name() });
            let updated = bounded(
                self.ctx.timeout,
                data.update(&Query::table(Table::AppReviews).eq("id", id), patch),
            )
            .await?;
            tracing::info!("Updated review {} for app {}", id, app_id);
            updated
                .into_iter()
                .next()
                .ok_or_else(|| HubError::NotFound("Review disappeared while updating".to_string()))?
        } else {
            let review = NewReview {
                app_id: app_id.to_string(),
                user_id: session.principal.to_string(),
                username: session.display_name(),
                rating,
                comment: comment.to_string(),
            };
            let row = serde_json::to_value(&review).map_err(|e| HubError::Backend(e.to_string()))?;
            match bounded(self.ctx.timeout, data.insert(Table::AppReviews, row)).await {
                Ok(inserted) => {
                    tracing::info!("Added review for app {}", app_id);
                    inserted
                }
                // A concurrent submit from another tab won the insert
                Err(BackendError::UniqueViolation(_)) => {
                    return Err(HubError::Conflict(ALREADY_REVIEWED.to_string()));
                }
                Err(e) => return Err(e.into()),
            }
        };

        serde_json::from_value(row).map_err(|e| HubError::DataFetch(format!("malformed review: {}", e)))
    }
}
