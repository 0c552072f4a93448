//! Session lifecycle, credential storage and shared types for the RehearseKit client

pub mod config;
pub mod credentials;
pub mod error;
pub mod session;
pub mod session_api;
pub mod token_claims;
pub mod types;

pub use config::{
    ApiConfig, ClientConfig, CredentialStoreKind, LoggingConfig, ProgressConfig, SessionConfig,
};
pub use credentials::{
    CredentialKind, CredentialLifetimes, CredentialStore, KeyringCredentialStore,
    MemoryCredentialStore, StoredCredential,
};
pub use error::{RehearseError, Result};
pub use session::{SessionEvent, SessionManager};
pub use session_api::{HttpSessionApi, SessionApi};
pub use token_claims::TokenClaims;
pub use types::*;
