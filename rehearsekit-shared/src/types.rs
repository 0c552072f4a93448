//! Shared types for the RehearseKit client

use crate::{RehearseError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Authenticated user as returned by the identity endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    pub is_admin: bool,
    pub is_active: bool,
    #[serde(default)]
    pub oauth_provider: Option<String>,
    pub created_at: String,
    #[serde(default)]
    pub last_login_at: Option<String>,
}

impl Identity {
    /// Best human-readable name: full name, then email, then the raw id
    pub fn display_name(&self) -> &str {
        self.full_name
            .as_deref()
            .or(self.email.as_deref())
            .unwrap_or(&self.id)
    }

    /// Accounts start inactive until an administrator approves them
    pub fn is_pending_approval(&self) -> bool {
        !self.is_active
    }
}

/// Access/refresh token pair minted by the backend
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPair {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

impl CredentialPair {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            token_type: default_token_type(),
        }
    }
}

// Tokens never end up in logs.
impl fmt::Debug for CredentialPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialPair")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("token_type", &self.token_type)
            .finish()
    }
}

/// Authenticated-identity state observed by the UI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub identity: Option<Identity>,
    pub is_loading: bool,
}

impl SessionState {
    /// Initial state at application start, before the first fetch resolves
    pub fn starting() -> Self {
        Self {
            identity: None,
            is_loading: true,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.identity.is_some()
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::starting()
    }
}

/// Job processing status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Pending,
    Converting,
    Analyzing,
    Separating,
    Finalizing,
    Packaging,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// No further updates follow a terminal status
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Converting => "CONVERTING",
            JobStatus::Analyzing => "ANALYZING",
            JobStatus::Separating => "SEPARATING",
            JobStatus::Finalizing => "FINALIZING",
            JobStatus::Packaging => "PACKAGING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One progress event for a job, as pushed over the progress channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub job_id: String,
    pub status: JobStatus,
    pub progress_percent: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ProgressUpdate {
    /// Decode a channel frame. Anything that is not a complete, in-range update is rejected.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let update: ProgressUpdate = serde_json::from_slice(payload)?;

        if update.progress_percent > 100 {
            return Err(RehearseError::MalformedPayload(format!(
                "progress_percent out of range: {}",
                update.progress_percent
            )));
        }

        if update.job_id.is_empty() {
            return Err(RehearseError::MalformedPayload(
                "job_id is empty".to_string(),
            ));
        }

        Ok(update)
    }
}
