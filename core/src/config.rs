//! Service configuration.
//!
//! # Design
//! `ServiceConfig` is plain serde data so hosts can ship it as JSON next to
//! their other settings. Validation happens once, in `validate`, which turns
//! it into the parsed base URL and the trust validator the service runs with.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ConfigError;
use crate::trust::{PinningPolicy, TrustValidator};

/// What to do when a request violates a usage contract (cross-host path,
/// header set twice).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationPolicy {
    /// Panic on the calling thread. Meant for development builds.
    Panic,
    /// Log a warning and carry on (or fail the single request).
    #[default]
    Report,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Scheme, host, port and base path every request is resolved against.
    pub base_url: String,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub pinning: PinningPolicy,
    /// Base64 SHA-256 digests of accepted certificates.
    #[serde(default)]
    pub pinned_certificates: Vec<String>,
    /// Base64 SHA-256 digests of accepted SubjectPublicKeyInfo blocks.
    #[serde(default)]
    pub pinned_public_keys: Vec<String>,
    /// Default for `can_send_in_background` on new requests.
    #[serde(default)]
    pub background_default: bool,
    #[serde(default)]
    pub violations: ViolationPolicy,
}

impl ServiceConfig {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            user_agent: None,
            pinning: PinningPolicy::None,
            pinned_certificates: Vec::new(),
            pinned_public_keys: Vec::new(),
            background_default: false,
            violations: ViolationPolicy::Report,
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_user_agent(mut self, user_agent: &str) -> Self {
        self.user_agent = Some(user_agent.to_string());
        self
    }

    pub fn with_pinning(mut self, pinning: PinningPolicy, pins: Vec<String>) -> Self {
        self.pinning = pinning;
        match pinning {
            PinningPolicy::PublicKey => self.pinned_public_keys = pins,
            _ => self.pinned_certificates = pins,
        }
        self
    }

    pub fn with_violations(mut self, violations: ViolationPolicy) -> Self {
        self.violations = violations;
        self
    }

    /// Parses the base URL and builds the trust validator for its host.
    pub(crate) fn validate(&self) -> Result<(Url, TrustValidator), ConfigError> {
        let mut base_url = Url::parse(&self.base_url)?;
        if !matches!(base_url.scheme(), "http" | "https") || base_url.host_str().is_none() {
            return Err(ConfigError::BaseUrlScheme(self.base_url.clone()));
        }
        // Relative paths resolve under the base path only with a trailing slash.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        base_url.set_query(None);
        base_url.set_fragment(None);

        let host = base_url.host_str().unwrap_or_default().to_string();
        let validator = TrustValidator::new(
            &host,
            self.pinning,
            &self.pinned_certificates,
            &self.pinned_public_keys,
        )?;
        Ok((base_url, validator))
    }
}
