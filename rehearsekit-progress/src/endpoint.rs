//! Progress channel address resolution
//!
//! Behind the public reverse proxy everything is reached over TLS on a single origin, so the
//! channel lives on that same origin. Plain-HTTP setups (local development, LAN installs) run the
//! progress service on its own host/port, which comes from configuration.

use rehearsekit_shared::config::{ApiConfig, ProgressConfig};
use rehearsekit_shared::{RehearseError, Result};
use url::Url;

/// Where the application itself is being served from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostContext {
    origin: Url,
}

impl HostContext {
    pub fn parse(origin: &str) -> Result<Self> {
        let origin = Url::parse(origin)?;
        if origin.host_str().is_none() {
            return Err(RehearseError::Config(format!(
                "host origin has no host: {origin}"
            )));
        }
        Ok(Self { origin })
    }

    pub fn is_secure(&self) -> bool {
        self.origin.scheme() == "https"
    }

    /// host[:port] exactly as the origin carries it
    pub fn authority(&self) -> String {
        match (self.origin.host_str(), self.origin.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => String::new(),
        }
    }

    /// API origin matching this host: same origin over https, configured origin otherwise
    pub fn api_base(&self, config: &ApiConfig) -> String {
        if self.is_secure() {
            format!("https://{}", self.authority())
        } else {
            config.resolved_api_url()
        }
    }
}

/// Resolved channel base plus the proxy path prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEndpoint {
    base: Url,
    path_prefix: String,
}

impl ProgressEndpoint {
    /// Resolve the channel base for an optional hosting context
    pub fn resolve(host: Option<&HostContext>, config: &ProgressConfig) -> Result<Self> {
        let base = match host {
            Some(host) if host.is_secure() => format!("wss://{}", host.authority()),
            _ => config.resolved_ws_url(),
        };

        Self::new(&base, &config.path_prefix)
    }

    pub fn new(base: &str, path_prefix: &str) -> Result<Self> {
        let base = Url::parse(base.trim_end_matches('/'))?;

        if !matches!(base.scheme(), "ws" | "wss") {
            return Err(RehearseError::Config(format!(
                "progress channel URL must use ws:// or wss://, got {base}"
            )));
        }
        if base.cannot_be_a_base() || base.host_str().is_none() {
            return Err(RehearseError::Config(format!(
                "progress channel URL has no host: {base}"
            )));
        }

        Ok(Self {
            base,
            path_prefix: path_prefix.trim_matches('/').to_string(),
        })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// `<base>/<prefix>/jobs/{job_id}/progress`, the job id encoded as a single segment
    pub fn channel_url(&self, job_id: &str) -> Result<Url> {
        if job_id.is_empty() {
            return Err(RehearseError::Config("job id is empty".to_string()));
        }

        let mut url = self.base.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                RehearseError::Config(format!("cannot append path to {}", self.base))
            })?;
            segments.pop_if_empty();
            segments.extend(self.path_prefix.split('/').filter(|s| !s.is_empty()));
            segments.extend(["jobs", job_id, "progress"]);
        }

        Ok(url)
    }
}
