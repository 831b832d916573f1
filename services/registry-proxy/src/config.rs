//! Proxy configuration.
//!
//! Every key is optional; an empty file configures a Docker Hub proxy
//! listening on port 5000.
//!
//! ```toml
//! listen = "0.0.0.0:5000"
//! max_request_body = 1048576
//!
//! [upstream]
//! registry = "https://registry-1.docker.io"
//! auth = "https://auth.docker.io/token"
//! service = "registry.docker.io"
//! token_ttl = 300
//! ```

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use http::Uri;
use serde::Deserialize;

use crate::token::DEFAULT_TOKEN_TTL;

/// Docker Hub registry API base.
pub const DEFAULT_REGISTRY: &str = "https://registry-1.docker.io";

/// Docker Hub token endpoint.
pub const DEFAULT_AUTH: &str = "https://auth.docker.io/token";

/// Service name sent to the Docker Hub token endpoint.
pub const DEFAULT_SERVICE: &str = "registry.docker.io";

/// Default inbound body limit, 1 MiB.
pub const DEFAULT_MAX_REQUEST_BODY: usize = 1024 * 1024;

/// Top level proxy configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyConfig {
    /// Address the binary listens on.
    pub listen: SocketAddr,

    /// Largest inbound request body accepted, in bytes.
    pub max_request_body: usize,

    /// Upstream registry and token service.
    pub upstream: UpstreamConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 5000)),
            max_request_body: DEFAULT_MAX_REQUEST_BODY,
            upstream: UpstreamConfig::default(),
        }
    }
}

/// The registry being proxied, and where its tokens come from.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpstreamConfig {
    /// Registry API base; request paths are appended to it.
    #[serde(with = "uri")]
    pub registry: Uri,

    /// Token endpoint.
    #[serde(with = "uri")]
    pub auth: Uri,

    /// `service` parameter sent to the token endpoint.
    pub service: String,

    /// How long an acquired token is cached, in whole seconds.
    #[serde(with = "seconds")]
    pub token_ttl: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            registry: Uri::from_static(DEFAULT_REGISTRY),
            auth: Uri::from_static(DEFAULT_AUTH),
            service: DEFAULT_SERVICE.to_owned(),
            token_ttl: DEFAULT_TOKEN_TTL,
        }
    }
}

mod uri {
    use http::Uri;
    use serde::{Deserialize as _, Deserializer};

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Uri, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let uri: Uri = s.parse().map_err(serde::de::Error::custom)?;
        if uri.scheme().is_none() || uri.authority().is_none() {
            return Err(serde::de::Error::custom(format!(
                "expected an absolute URL, got {s:?}"
            )));
        }
        Ok(uri)
    }
}

mod seconds {
    use std::time::Duration;

    use serde::{Deserialize as _, Deserializer};

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match u64::deserialize(deserializer)? {
            0 => Err(serde::de::Error::custom("token_ttl must be at least one second")),
            secs => Ok(Duration::from_secs(secs)),
        }
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    #[test]
    fn empty_config_uses_docker_hub() {
        let config: ProxyConfig = toml_edit::de::from_str("").unwrap();
        assert_eq!(config.listen.port(), 5000);
        assert_eq!(config.max_request_body, 1048576);
        assert_eq!(config.upstream.registry, Uri::from_static(DEFAULT_REGISTRY));
        assert_eq!(config.upstream.auth, Uri::from_static(DEFAULT_AUTH));
        assert_eq!(config.upstream.service, "registry.docker.io");
        assert_eq!(config.upstream.token_ttl, Duration::from_secs(300));
    }

    #[test]
    fn full_config() {
        let config: ProxyConfig = toml_edit::de::from_str(indoc! {r#"
            listen = "127.0.0.1:8080"
            max_request_body = 4096

            [upstream]
            registry = "https://ghcr.io"
            auth = "https://ghcr.io/token"
            service = "ghcr.io"
            token_ttl = 60
        "#})
        .unwrap();

        assert_eq!(config.listen, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.max_request_body, 4096);
        assert_eq!(config.upstream.registry, "https://ghcr.io/");
        assert_eq!(config.upstream.auth, "https://ghcr.io/token");
        assert_eq!(config.upstream.service, "ghcr.io");
        assert_eq!(config.upstream.token_ttl, Duration::from_secs(60));
    }

    #[test]
    fn partial_upstream_keeps_defaults() {
        let config: ProxyConfig = toml_edit::de::from_str(indoc! {r#"
            [upstream]
            token_ttl = 30
        "#})
        .unwrap();

        assert_eq!(config.upstream.registry, Uri::from_static(DEFAULT_REGISTRY));
        assert_eq!(config.upstream.token_ttl, Duration::from_secs(30));
    }

    #[test]
    fn rejects_zero_ttl() {
        let err = toml_edit::de::from_str::<ProxyConfig>(indoc! {r#"
            [upstream]
            token_ttl = 0
        "#})
        .unwrap_err();
        assert!(err.to_string().contains("token_ttl"), "{err}");
    }

    #[test]
    fn rejects_relative_registry() {
        let result = toml_edit::de::from_str::<ProxyConfig>(indoc! {r#"
            [upstream]
            registry = "/v2"
        "#});
        assert!(result.is_err());
    }
}
