// Client-facing error taxonomy
use serde_json::{json, Value};
use thiserror::Error;

use crate::backend::BackendError;

/// Failure of a user-initiated operation, converted into a notification at the call site
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HubError {
    // Bad credentials, weak secret, duplicate account
    #[error("{0}")]
    Authentication(String),

    // Profile lookup failed; never surfaced, the resolver fails closed
    #[error("authorization lookup failed: {0}")]
    AuthorizationLookup(String),

    // Privileged operation attempted without privilege
    #[error("{0}")]
    Forbidden(String),

    // Network/query failure while reading a collection
    #[error("{0}")]
    DataFetch(String),

    // Asset upload failure, aborts the enclosing submit
    #[error("{0}")]
    Upload(String),

    // Uniqueness constraint hit
    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Timeout(String),

    // Any other failed mutation
    #[error("{0}")]
    Backend(String),
}

impl HubError {
    pub fn error_code(&self) -> &'static str {
        match self {
            HubError::Authentication(_) => "AUTHENTICATION_ERROR",
            HubError::AuthorizationLookup(_) => "AUTHORIZATION_LOOKUP_ERROR",
            HubError::Forbidden(_) => "FORBIDDEN",
            HubError::DataFetch(_) => "DATA_FETCH_ERROR",
            HubError::Upload(_) => "UPLOAD_ERROR",
            HubError::Conflict(_) => "CONFLICT",
            HubError::Validation(_) => "VALIDATION_ERROR",
            HubError::NotFound(_) => "NOT_FOUND",
            HubError::Timeout(_) => "TIMEOUT",
            HubError::Backend(_) => "BACKEND_ERROR",
        }
    }

    /// Text suitable for a toast description
    pub fn user_message(&self) -> String {
        match self {
            HubError::AuthorizationLookup(_) => "Could not verify your permissions".to_string(),
            other => other.to_string(),
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "error": true,
            "message": self.user_message(),
            "code": self.error_code()
        })
    }

    /// Mapping for auth-provider calls
    pub fn authentication(err: BackendError) -> Self {
        match err {
            BackendError::Timeout(msg) => HubError::Timeout(msg),
            other => HubError::Authentication(other.provider_message()),
        }
    }

    /// Mapping for collection reads
    pub fn data_fetch(err: BackendError) -> Self {
        HubError::DataFetch(err.provider_message())
    }

    /// Mapping for storage writes; the message names the asset folder
    pub fn upload(folder: &str, err: BackendError) -> Self {
        HubError::Upload(format!("Failed to upload {}: {}", folder, err.provider_message()))
    }
}

impl From<BackendError> for HubError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::UniqueViolation(msg) => HubError::Conflict(msg),
            BackendError::NotFound(msg) => HubError::NotFound(msg),
            BackendError::Timeout(msg) => HubError::Timeout(msg),
            BackendError::Unauthorized(msg) => HubError::Authentication(msg),
            other => {
                tracing::error!("Backend error: {}", other);
                HubError::Backend(other.provider_message())
            }
        }
    }
}
