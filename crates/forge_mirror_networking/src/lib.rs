//! Networking utilities for forge-mirror
//!
//! Every collaborator that talks HTTP (the anaconda.org registry, PyPI, GitHub)
//! goes through one [`BaseClient`] so that the timeout and the retry policy are
//! configured in a single place.

use std::time::Duration;

use reqwest_middleware::ClientWithMiddleware;
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};
use url::Url;

/// Default user agent if none is provided
const DEFAULT_USER_AGENT: &str = concat!("forge-mirror-networking", "/", env!("CARGO_PKG_VERSION"));

/// Default timeout for a single request, in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Transient failures are retried exactly once by default.
pub const DEFAULT_MAX_RETRIES: u32 = 1;

/// A client that can handle both secure and insecure connections
#[derive(Clone, Debug)]
pub struct BaseClient {
    /// The standard client with SSL verification enabled
    client: ClientWithMiddleware,
    /// The dangerous client with SSL verification disabled
    dangerous_client: ClientWithMiddleware,
    /// List of hosts for which SSL verification should be skipped
    allow_insecure_host: Option<Vec<String>>,
    timeout: Duration,
    max_retries: u32,
}

impl BaseClient {
    /// Create a builder for configuring the BaseClient
    pub fn builder() -> BaseClientBuilder {
        BaseClientBuilder::default()
    }

    /// Get the default client (with SSL verification enabled)
    pub fn get_client(&self) -> &ClientWithMiddleware {
        &self.client
    }

    /// Selects the appropriate client based on the host's trustworthiness
    pub fn for_host(&self, url: &Url) -> &ClientWithMiddleware {
        if self.disable_ssl(url) {
            &self.dangerous_client
        } else {
            &self.client
        }
    }

    /// The per-request timeout this client was built with.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// How many times a transient failure is retried before giving up.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Returns true if SSL verification should be disabled for the given URL
    fn disable_ssl(&self, url: &Url) -> bool {
        match (&self.allow_insecure_host, url.host_str()) {
            (Some(hosts), Some(host)) => hosts.iter().any(|h| h == host),
            _ => false,
        }
    }
}

/// Builder for configuring a BaseClient
#[derive(Debug, Clone)]
pub struct BaseClientBuilder {
    user_agent: Option<String>,
    timeout_secs: u64,
    max_retries: u32,
    insecure_hosts: Option<Vec<String>>,
}

impl Default for BaseClientBuilder {
    fn default() -> Self {
        Self {
            user_agent: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            insecure_hosts: None,
        }
    }
}

impl BaseClientBuilder {
    /// Set a custom user agent string
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Set the timeout in seconds
    pub fn timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// Set the number of retries for transient failures
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set hosts for which SSL verification should be disabled
    pub fn insecure_hosts(mut self, hosts: Vec<String>) -> Self {
        self.insecure_hosts = (!hosts.is_empty()).then_some(hosts);
        self
    }

    /// Build the BaseClient with the configured settings
    pub fn build(self) -> Result<BaseClient, reqwest::Error> {
        let user_agent = self
            .user_agent
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());
        let timeout = Duration::from_secs(self.timeout_secs);

        let common_settings = |builder: reqwest::ClientBuilder| -> reqwest::ClientBuilder {
            builder
                .pool_max_idle_per_host(20)
                .user_agent(&user_agent)
                .timeout(timeout)
        };

        let max_retries = self.max_retries;
        let retry_middleware = || {
            RetryTransientMiddleware::new_with_policy(
                ExponentialBackoff::builder()
                    .retry_bounds(Duration::from_millis(500), Duration::from_secs(10))
                    .build_with_max_retries(max_retries),
            )
        };

        let client = reqwest_middleware::ClientBuilder::new(
            common_settings(reqwest::Client::builder()).build()?,
        )
        .with(retry_middleware())
        .build();

        let dangerous_client = reqwest_middleware::ClientBuilder::new(
            common_settings(reqwest::Client::builder())
                .danger_accept_invalid_certs(true)
                .build()?,
        )
        .with(retry_middleware())
        .build();

        Ok(BaseClient {
            client,
            dangerous_client,
            allow_insecure_host: self.insecure_hosts,
            timeout,
            max_retries: self.max_retries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_a_single_retry() {
        let client = BaseClient::builder().build().unwrap();
        assert_eq!(client.max_retries(), 1);
        assert_eq!(client.timeout(), Duration::from_secs(DEFAULT_TIMEOUT_SECS));
    }

    #[test]
    fn builder_overrides_timeout_and_retries() {
        let client = BaseClient::builder()
            .timeout(5)
            .max_retries(0)
            .user_agent("test-agent")
            .build()
            .unwrap();
        assert_eq!(client.timeout(), Duration::from_secs(5));
        assert_eq!(client.max_retries(), 0);
    }

    #[test]
    fn insecure_hosts_only_match_exact_host() {
        let client = BaseClient::builder()
            .insecure_hosts(vec!["mirror.internal".to_string()])
            .build()
            .unwrap();

        assert!(client.disable_ssl(&Url::parse("https://mirror.internal/pkg").unwrap()));
        assert!(!client.disable_ssl(&Url::parse("https://api.anaconda.org/pkg").unwrap()));
    }

    #[test]
    fn empty_insecure_host_list_disables_nothing() {
        let client = BaseClient::builder()
            .insecure_hosts(Vec::new())
            .build()
            .unwrap();
        assert!(!client.disable_ssl(&Url::parse("https://pypi.org/pypi").unwrap()));
    }
}
