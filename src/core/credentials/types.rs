use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::core::service::ServiceTag;

/// Launch-time authorization material. This is also the shape of the secret
/// file handed to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthPayload {
    pub refresh_secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl AuthPayload {
    pub fn new(refresh_secret: impl Into<String>) -> Self {
        Self {
            refresh_secret: refresh_secret.into(),
            access_token: None,
            expires_at: None,
        }
    }

    pub fn with_access_token(mut self, token: impl Into<String>, expires_at: Option<DateTime<Utc>>) -> Self {
        self.access_token = Some(token.into());
        self.expires_at = expires_at;
        self
    }
}

/// Fields to merge into an existing credential. `None` leaves a field as is.
#[derive(Debug, Clone, Default)]
pub struct PayloadUpdate {
    pub refresh_secret: Option<String>,
    pub access_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl PayloadUpdate {
    pub(crate) fn apply(&self, payload: &mut AuthPayload) {
        if let Some(secret) = &self.refresh_secret {
            payload.refresh_secret = secret.clone();
        }
        if let Some(token) = &self.access_token {
            payload.access_token = Some(token.clone());
        }
        if let Some(expiry) = self.expires_at {
            payload.expires_at = Some(expiry);
        }
    }
}

#[derive(Debug, Clone)]
pub struct Credential {
    pub user_id: String,
    pub service: ServiceTag,
    pub payload: AuthPayload,
    pub secret_path: PathBuf,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Secret-free view of a credential row.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialSummary {
    pub service: String,
    pub active: bool,
    pub has_access_token: bool,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}
