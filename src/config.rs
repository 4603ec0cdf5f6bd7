//! Configuration management for Gatekeeper.
//!
//! Configuration is read from an optional YAML file and then overridden by
//! `GATEKEEPER__`-prefixed environment variables, with `__` separating nested
//! keys (for example `GATEKEEPER__SERVER__HTTP_ADDR=0.0.0.0:8080`).

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

use crate::error::{AdmissionError, Result};
use crate::ratelimit::{CategoryRule, FailurePolicy, PolicyTable};
use crate::upstream::{UpstreamLimits, UpstreamTable};

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "GATEKEEPER";

/// Main configuration for the Gatekeeper service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Inbound rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Outbound throttle limits per upstream
    #[serde(default)]
    pub upstreams: UpstreamTable,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Inbound rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Behavior when the counter store is unavailable
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Attach rate limit headers to allowed responses
    #[serde(default = "default_true")]
    pub emit_headers: bool,

    /// How callers are identified from HTTP requests
    #[serde(default)]
    pub identity: IdentityConfig,

    /// How often expired counters are purged, in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Per-category policies
    #[serde(default)]
    pub policies: PolicyTable,

    /// Replacement classification rules, in priority order
    #[serde(default)]
    pub classifier_rules: Option<Vec<CategoryRule>>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::default(),
            emit_headers: default_true(),
            identity: IdentityConfig::default(),
            sweep_interval_secs: default_sweep_interval(),
            policies: PolicyTable::default(),
            classifier_rules: None,
        }
    }
}

/// Trusted request metadata used for client identification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Use the first `X-Forwarded-For` hop as the source address
    #[serde(default)]
    pub trust_forwarded_for: bool,

    /// Header carrying the authenticated user id, set by a trusted auth proxy
    #[serde(default)]
    pub user_header: Option<String>,
}

impl RateLimitingConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn default_true() -> bool {
    true
}

fn default_sweep_interval() -> u64 {
    60
}

impl AdmissionConfig {
    /// Load configuration from an optional file plus environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path, "Loading configuration file");
            builder = builder.add_source(config::File::with_name(path).format(config::FileFormat::Yaml));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: AdmissionConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: AdmissionConfig =
            serde_yaml::from_str(yaml).map_err(|e| AdmissionError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would wedge the service.
    pub fn validate(&self) -> Result<()> {
        if let Some(header) = &self.rate_limiting.identity.user_header {
            if axum::http::HeaderName::from_bytes(header.as_bytes()).is_err() {
                return Err(AdmissionError::Config(format!(
                    "rate_limiting.identity.user_header '{}' is not a valid header name",
                    header
                )));
            }
        }

        if self.rate_limiting.sweep_interval_secs == 0 {
            return Err(AdmissionError::Config(
                "rate_limiting.sweep_interval_secs must be greater than 0".to_string(),
            ));
        }

        let upstreams = std::iter::once(("default", &self.upstreams.default)).chain(
            self.upstreams
                .services
                .iter()
                .map(|(name, limits)| (name.as_str(), limits)),
        );
        for (name, limits) in upstreams {
            if limits.max_concurrent == 0 {
                return Err(AdmissionError::Config(format!(
                    "upstream '{}' must allow at least one concurrent call",
                    name
                )));
            }
            let rps = limits.requests_per_second;
            if !rps.is_finite() || (rps > 0.0 && rps < UpstreamLimits::MIN_REQUESTS_PER_SECOND) {
                return Err(AdmissionError::Config(format!(
                    "upstream '{}' has an invalid requests_per_second {}; use 0 to disable pacing or at least {}",
                    name,
                    rps,
                    UpstreamLimits::MIN_REQUESTS_PER_SECOND
                )));
            }
        }

        Ok(())
    }
}
