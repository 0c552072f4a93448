//! Error types for the RehearseKit client

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RehearseError>;

#[derive(Error, Debug)]
pub enum RehearseError {
    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Credential rejected by server")]
    Unauthorized,

    #[error("Unexpected HTTP status: {0}")]
    HttpStatus(u16),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Credential storage error: {0}")]
    Storage(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Channel error: {0}")]
    Channel(String),
}

impl RehearseError {
    /// Whether the server rejected the credential itself (as opposed to a transport failure)
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, RehearseError::Unauthorized)
    }
}
