//! Consul agent connection settings.

use crate::{ConsulError, ConsulResult};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const HTTP_ADDR_ENV: &str = "CONSUL_HTTP_ADDR";
pub const HTTP_TOKEN_ENV: &str = "CONSUL_HTTP_TOKEN";
pub const HTTP_SSL_ENV: &str = "CONSUL_HTTP_SSL";

/// Configuration for talking to a Consul agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsulConfig {
    /// Agent address, `host:port`
    pub address: String,
    /// `http` or `https`
    pub scheme: String,
    /// ACL token sent as `X-Consul-Token`
    #[serde(default)]
    pub token: Option<String>,
    /// Datacenter to target, the agent's own when unset
    #[serde(default)]
    pub datacenter: Option<String>,
    /// Timeout for non-blocking requests
    pub request_timeout: Duration,
    /// Consecutive monitor failures tolerated before the lock counts as lost
    pub monitor_retries: u32,
    /// Pause between monitor retries, also used between failed renewals
    pub monitor_retry_time: Duration,
    /// Pause after an acquire the agent refused (lock delay or lost race)
    pub lock_retry_time: Duration,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8500".to_string(),
            scheme: "http".to_string(),
            token: None,
            datacenter: None,
            request_timeout: Duration::from_secs(10),
            monitor_retries: 5,
            monitor_retry_time: Duration::from_secs(2),
            lock_retry_time: Duration::from_secs(5),
        }
    }
}

impl ConsulConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by the standard `CONSUL_HTTP_*` variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`ConsulConfig::from_env`] with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(address) = lookup(HTTP_ADDR_ENV).filter(|a| !a.trim().is_empty()) {
            let address = address.trim();
            if let Some(rest) = address.strip_prefix("https://") {
                config.scheme = "https".to_string();
                config.address = rest.trim_end_matches('/').to_string();
            } else if let Some(rest) = address.strip_prefix("http://") {
                config.address = rest.trim_end_matches('/').to_string();
            } else {
                config.address = address.to_string();
            }
        }

        if let Some(token) = lookup(HTTP_TOKEN_ENV).filter(|t| !t.is_empty()) {
            config.token = Some(token);
        }

        if let Some(ssl) = lookup(HTTP_SSL_ENV) {
            if matches!(ssl.to_ascii_lowercase().as_str(), "1" | "true") {
                config.scheme = "https".to_string();
            }
        }

        config
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_datacenter(mut self, datacenter: impl Into<String>) -> Self {
        self.datacenter = Some(datacenter.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_monitor_retries(mut self, retries: u32, retry_time: Duration) -> Self {
        self.monitor_retries = retries;
        self.monitor_retry_time = retry_time;
        self
    }

    pub fn with_lock_retry_time(mut self, retry_time: Duration) -> Self {
        self.lock_retry_time = retry_time;
        self
    }

    /// Parses `scheme://address/`, the root every endpoint is joined to.
    pub fn base_url(&self) -> ConsulResult<Url> {
        if self.address.trim().is_empty() {
            return Err(ConsulError::invalid_address(&self.address, "address is empty"));
        }
        if self.scheme != "http" && self.scheme != "https" {
            return Err(ConsulError::invalid_address(
                &self.address,
                format!("unsupported scheme {:?}", self.scheme),
            ));
        }

        let url = Url::parse(&format!("{}://{}/", self.scheme, self.address))
            .map_err(|e| ConsulError::invalid_address(&self.address, e.to_string()))?;

        if url.cannot_be_a_base() {
            return Err(ConsulError::invalid_address(&self.address, "not a base URL"));
        }

        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ConsulConfig::default();
        assert_eq!(config.address, "127.0.0.1:8500");
        assert_eq!(config.monitor_retries, 5);
        assert_eq!(
            config.base_url().unwrap().as_str(),
            "http://127.0.0.1:8500/"
        );
    }

    #[test]
    fn test_env_overrides() {
        let config = ConsulConfig::from_lookup(lookup(&[
            (HTTP_ADDR_ENV, "https://consul.service:8501"),
            (HTTP_TOKEN_ENV, "secret"),
        ]));

        assert_eq!(config.scheme, "https");
        assert_eq!(config.address, "consul.service:8501");
        assert_eq!(config.token.as_deref(), Some("secret"));
    }

    #[test]
    fn test_env_ssl_flag() {
        let config = ConsulConfig::from_lookup(lookup(&[
            (HTTP_ADDR_ENV, "10.0.0.1:8501"),
            (HTTP_SSL_ENV, "true"),
        ]));

        assert_eq!(config.scheme, "https");
        assert_eq!(config.address, "10.0.0.1:8501");
    }

    #[test]
    fn test_invalid_addresses() {
        assert!(ConsulConfig::new().with_address("").base_url().is_err());
        assert!(ConsulConfig::new().with_scheme("ftp").base_url().is_err());
    }

    #[test]
    fn test_json_config() {
        let json = r#"{
            "address": "consul:8500",
            "scheme": "http",
            "request_timeout": {"secs": 5, "nanos": 0},
            "monitor_retries": 3,
            "monitor_retry_time": {"secs": 1, "nanos": 0},
            "lock_retry_time": {"secs": 5, "nanos": 0}
        }"#;

        let config: ConsulConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.address, "consul:8500");
        assert_eq!(config.monitor_retries, 3);
        assert!(config.token.is_none());
    }
}
