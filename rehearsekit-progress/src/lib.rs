//! RehearseKit progress streams - live job progress over a reconnecting push channel

pub mod backoff;
pub mod channel;
pub mod client;
pub mod endpoint;

pub use backoff::{ReconnectBudget, ReconnectPolicy};
pub use channel::{Channel, Connector, Frame, WebSocketConnector};
pub use client::{ConnectionState, ErrorCallback, ProgressStreamClient, UpdateCallback};
pub use endpoint::{HostContext, ProgressEndpoint};

use rehearsekit_shared::config::ProgressConfig;
use rehearsekit_shared::{ProgressUpdate, Result};
use std::sync::Arc;

/// Builds progress stream clients that share one resolved endpoint and transport
pub struct ProgressMonitor {
    endpoint: ProgressEndpoint,
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
}

impl ProgressMonitor {
    pub fn new(host: Option<&HostContext>, config: &ProgressConfig) -> Result<Self> {
        let endpoint = ProgressEndpoint::resolve(host, config)?;
        tracing::debug!("Progress channels resolved to {}", endpoint.base());

        Ok(Self {
            endpoint,
            connector: Arc::new(WebSocketConnector),
            policy: ReconnectPolicy::from(config),
        })
    }

    /// Swap the transport, e.g. for an in-process fake
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn endpoint(&self) -> &ProgressEndpoint {
        &self.endpoint
    }

    /// Idle client for one job; call `connect` on it to start streaming
    pub fn watch<F>(&self, job_id: impl Into<String>, on_update: F) -> ProgressStreamClient
    where
        F: Fn(ProgressUpdate) + Send + Sync + 'static,
    {
        ProgressStreamClient::new(
            job_id,
            self.endpoint.clone(),
            Arc::clone(&self.connector),
            on_update,
        )
        .with_policy(self.policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitor_uses_configured_channel() {
        let config = ProgressConfig {
            ws_url: Some("ws://nas.local:30072".to_string()),
            ..ProgressConfig::default()
        };
        let monitor = ProgressMonitor::new(None, &config).unwrap();

        assert_eq!(
            monitor.endpoint().channel_url("job-9").unwrap().as_str(),
            "ws://nas.local:30072/ws/jobs/job-9/progress"
        );

        let client = monitor.watch("job-9", |_| {});
        assert_eq!(client.job_id(), "job-9");
        assert_eq!(client.state(), ConnectionState::Idle);
        assert!(!client.has_handle());
    }

    #[test]
    fn test_monitor_follows_secure_host() {
        let host = HostContext::parse("https://rehearsekit.uk").unwrap();
        let monitor = ProgressMonitor::new(Some(&host), &ProgressConfig::default()).unwrap();

        assert_eq!(monitor.endpoint().base().as_str(), "wss://rehearsekit.uk/");
    }
}
