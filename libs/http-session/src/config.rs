use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SessionError;

const LIFETIME_ENV: &str = "HTTP_SESSION_CLIENT_LIFETIME";
const SWEEP_INTERVAL_ENV: &str = "HTTP_SESSION_SWEEP_INTERVAL";
const DEFAULT_CLIENT_LIFETIME: Duration = Duration::from_secs(10 * 60);

/// Fully resolved session configuration.
///
/// Two configurations that compare equal share one pooled client; any
/// differing field produces a separate client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfiguration {
    pub tls: TlsSettings,
    pub proxy: Option<ProxySettings>,
    pub timeouts: Timeouts,
    pub decompression: Decompression,
    pub redirect: RedirectPolicy,
    /// Host name to fixed socket addresses, bypassing DNS.
    pub dns_overrides: BTreeMap<String, Vec<SocketAddr>>,
    pub http_version: HttpVersionPolicy,
    pub pool: ConnectionPoolSettings,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    pub accept_invalid_certificates: bool,
    pub min_version: Option<TlsVersion>,
    /// Additional trusted roots, PEM encoded.
    pub root_certificates: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProxySettings {
    pub url: String,
    pub basic_auth: Option<(String, String)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub connect: Option<Duration>,
    pub request: Option<Duration>,
    pub read: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
#[allow(clippy::struct_excessive_bools)]
pub struct Decompression {
    pub gzip: bool,
    pub brotli: bool,
    pub deflate: bool,
    pub zstd: bool,
}

impl Default for Decompression {
    fn default() -> Self {
        Self {
            gzip: true,
            brotli: true,
            deflate: true,
            zstd: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RedirectPolicy {
    None,
    Limited(usize),
}

impl Default for RedirectPolicy {
    fn default() -> Self {
        RedirectPolicy::Limited(10)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HttpVersionPolicy {
    #[default]
    Automatic,
    Http1Only,
    Http2PriorKnowledge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionPoolSettings {
    pub idle_timeout: Option<Duration>,
    pub max_idle_per_host: usize,
}

impl Default for ConnectionPoolSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Some(Duration::from_secs(90)),
            max_idle_per_host: usize::MAX,
        }
    }
}

impl SessionConfiguration {
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.connect = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.request = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_proxy(mut self, url: impl Into<String>) -> Self {
        self.proxy = Some(ProxySettings {
            url: url.into(),
            basic_auth: None,
        });
        self
    }

    #[must_use]
    pub fn with_redirect(mut self, redirect: RedirectPolicy) -> Self {
        self.redirect = redirect;
        self
    }

    #[must_use]
    pub fn with_http_version(mut self, http_version: HttpVersionPolicy) -> Self {
        self.http_version = http_version;
        self
    }

    #[must_use]
    pub fn with_dns_override(mut self, host: impl Into<String>, addrs: Vec<SocketAddr>) -> Self {
        self.dns_overrides.insert(host.into(), addrs);
        self
    }

    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }
}

/// Client Manager tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientManagerConfig {
    /// Idle age after which a pooled client becomes eligible for shutdown.
    pub lifetime: Duration,
    /// Period of the background sweep.
    pub sweep_interval: Duration,
}

impl Default for ClientManagerConfig {
    fn default() -> Self {
        Self {
            lifetime: DEFAULT_CLIENT_LIFETIME,
            sweep_interval: DEFAULT_CLIENT_LIFETIME,
        }
    }
}

impl ClientManagerConfig {
    #[must_use]
    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    #[must_use]
    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }

    /// Create configuration from environment variables
    ///
    /// Reads (both optional, `humantime` syntax such as `90s` or `5m`):
    /// - `HTTP_SESSION_CLIENT_LIFETIME`: idle lifetime of pooled clients
    /// - `HTTP_SESSION_SWEEP_INTERVAL`: period of the expiry sweep
    ///
    /// # Errors
    /// Returns [`SessionError::Configuration`] when a variable is set but
    /// cannot be parsed.
    pub fn from_env() -> Result<Self, SessionError> {
        let mut config = Self::default();
        if let Some(lifetime) = duration_from_env(LIFETIME_ENV)? {
            config.lifetime = lifetime;
        }
        if let Some(interval) = duration_from_env(SWEEP_INTERVAL_ENV)? {
            config.sweep_interval = interval;
        }
        Ok(config)
    }
}

fn duration_from_env(name: &str) -> Result<Option<Duration>, SessionError> {
    let Ok(raw) = std::env::var(name) else {
        return Ok(None);
    };
    humantime::parse_duration(raw.trim())
        .map(Some)
        .map_err(|e| SessionError::Configuration(format!("{name}={raw}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_configurations_compare_equal() {
        let a = SessionConfiguration::default().with_connect_timeout(Duration::from_secs(5));
        let b = SessionConfiguration::default().with_connect_timeout(Duration::from_secs(5));
        assert_eq!(a, b);
    }

    #[test]
    fn single_field_difference_breaks_equality() {
        let a = SessionConfiguration::default().with_connect_timeout(Duration::from_secs(5));
        let b = SessionConfiguration::default().with_connect_timeout(Duration::from_secs(6));
        assert_ne!(a, b);
    }

    #[test]
    fn deserializes_partial_json() {
        let config: SessionConfiguration =
            serde_json::from_str(r#"{"redirect":"None","http_version":"Http1Only"}"#).unwrap();
        assert_eq!(config.redirect, RedirectPolicy::None);
        assert_eq!(config.http_version, HttpVersionPolicy::Http1Only);
        assert_eq!(config.pool, ConnectionPoolSettings::default());
    }

    #[test]
    fn manager_config_from_env() {
        temp_env::with_vars(
            [(LIFETIME_ENV, Some("90s")), (SWEEP_INTERVAL_ENV, Some("1m"))],
            || {
                let config = ClientManagerConfig::from_env().unwrap();
                assert_eq!(config.lifetime, Duration::from_secs(90));
                assert_eq!(config.sweep_interval, Duration::from_secs(60));
            },
        );
    }

    #[test]
    fn manager_config_defaults_without_env() {
        temp_env::with_vars_unset([LIFETIME_ENV, SWEEP_INTERVAL_ENV], || {
            let config = ClientManagerConfig::from_env().unwrap();
            assert_eq!(config, ClientManagerConfig::default());
        });
    }

    #[test]
    fn manager_config_rejects_garbage() {
        temp_env::with_var(LIFETIME_ENV, Some("soon"), || {
            let err = ClientManagerConfig::from_env().unwrap_err();
            assert!(matches!(err, SessionError::Configuration(_)));
        });
    }
}
