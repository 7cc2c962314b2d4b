//! State layer configuration

use std::time::Duration;

use crate::backend::{Backend, DEFAULT_API_URL, StateResult};
use crate::lock::DEFAULT_POLL_INTERVAL;

/// Default backend descriptor when nothing is configured
pub const DEFAULT_BACKEND: &str = "file://.flow";

/// Settings for opening a state store
#[derive(Debug, Clone, PartialEq)]
pub struct StateConfig {
    /// Backend descriptor (`file://...`, `s3://...`, `flow://...`, `https://...`)
    pub backend: String,
    /// Control-plane endpoint used for `flow://<account>` descriptors
    pub api_url: String,
    /// Bearer token for the remote backend
    pub api_token: Option<String>,
    /// Interval between lock attempts while waiting
    pub lock_poll_interval: Duration,
    /// AWS region for the S3 backend (falls back to the AWS default chain)
    pub s3_region: Option<String>,
    /// Whether to encrypt S3 records at rest
    pub s3_encrypt: bool,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: DEFAULT_BACKEND.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            api_token: None,
            lock_poll_interval: DEFAULT_POLL_INTERVAL,
            s3_region: None,
            s3_encrypt: true,
        }
    }
}

impl StateConfig {
    /// Create config from environment variables
    ///
    /// Reads `FLOW_BACKEND`, `FLOW_API_URL`, `FLOW_API_TOKEN`, `FLOW_LOCK_POLL_MS`,
    /// `AWS_REGION` and `FLOW_S3_ENCRYPT`; anything unset keeps its default.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`StateConfig::from_env`] with an explicit variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(backend) = get("FLOW_BACKEND") {
            config.backend = backend;
        }
        if let Some(url) = get("FLOW_API_URL") {
            config.api_url = url;
        }
        config.api_token = get("FLOW_API_TOKEN");
        if let Some(ms) = get("FLOW_LOCK_POLL_MS").and_then(|v| v.parse::<u64>().ok()) {
            config.lock_poll_interval = Duration::from_millis(ms);
        }
        config.s3_region = get("AWS_REGION");
        if let Some(encrypt) = get("FLOW_S3_ENCRYPT") {
            config.s3_encrypt = !matches!(encrypt.to_lowercase().as_str(), "0" | "false" | "no");
        }

        config
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = backend.into();
        self
    }

    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    pub fn with_api_token(mut self, api_token: impl Into<String>) -> Self {
        self.api_token = Some(api_token.into());
        self
    }

    pub fn with_lock_poll_interval(mut self, interval: Duration) -> Self {
        self.lock_poll_interval = interval;
        self
    }

    /// Parse the configured descriptor, pointing `flow://` accounts at `api_url`
    pub fn resolve_backend(&self) -> StateResult<Backend> {
        match Backend::parse(&self.backend)? {
            Backend::Remote { account_id, .. } if self.backend.starts_with("flow://") => {
                Ok(Backend::Remote {
                    url: self.api_url.trim_end_matches('/').to_string(),
                    account_id,
                })
            }
            backend => Ok(backend),
        }
    }
}
