//! Server trust evaluation and certificate / public-key pinning.
//!
//! # Design
//! The transport owns the TLS handshake. When its TLS stack raises a trust
//! challenge it packs what it learned into a `ServerTrust`: the host it
//! connected to, the presented chain (leaf first) and the platform's own
//! chain verdict. `TrustValidator` then applies the configured policy on top
//! of that verdict. Pins are base64 SHA-256 digests of the DER certificate or
//! of the DER SubjectPublicKeyInfo.
//!
//! The policy that tolerates recoverable failures (self-signed certificates)
//! only exists when the crate is built with the `test-environments` feature.

use std::collections::HashSet;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::error::ConfigError;

/// SHA-256 digest used for pin comparison.
pub type Fingerprint = [u8; 32];

/// How presented certificates are checked beyond the platform verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinningPolicy {
    #[default]
    None,
    PublicKey,
    Certificate,
    /// Accepts recoverable failures such as self-signed certificates.
    #[cfg(feature = "test-environments")]
    NoneAcceptRecoverableFailure,
}

/// Why a server trust was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrustFailure {
    #[error("certificate presented for {presented}, expected {expected}")]
    DomainMismatch { expected: String, presented: String },

    #[error("certificate chain does not lead to a trusted root")]
    UntrustedRoot,

    #[error("no certificate in the chain matches a pinned value")]
    PinMismatch,

    #[error("certificate expired or not yet valid")]
    Expired,

    #[error("server presented no certificates")]
    EmptyChain,
}

/// Platform verdict on the presented chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvaluation {
    Trusted,
    /// Failure the user or policy may override (self-signed leaf, unknown root).
    RecoverableFailure(TrustFailure),
    Failed(TrustFailure),
}

/// One certificate of the presented chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    der: Vec<u8>,
    public_key: Vec<u8>,
}

impl Certificate {
    /// `der` is the encoded certificate, `public_key` its DER SubjectPublicKeyInfo.
    pub fn new(der: impl Into<Vec<u8>>, public_key: impl Into<Vec<u8>>) -> Self {
        Self {
            der: der.into(),
            public_key: public_key.into(),
        }
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    pub fn fingerprint(&self) -> Fingerprint {
        fingerprint(&self.der)
    }

    pub fn public_key_fingerprint(&self) -> Fingerprint {
        fingerprint(&self.public_key)
    }
}

/// Trust object handed over by the transport's TLS challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerTrust {
    pub host: String,
    pub chain: Vec<Certificate>,
    pub evaluation: ChainEvaluation,
}

/// Outcome of a trust evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustDecision {
    Accept,
    Reject(TrustFailure),
}

impl TrustDecision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, TrustDecision::Accept)
    }

    pub fn into_result(self) -> Result<(), TrustFailure> {
        match self {
            TrustDecision::Accept => Ok(()),
            TrustDecision::Reject(reason) => Err(reason),
        }
    }
}

pub fn fingerprint(bytes: &[u8]) -> Fingerprint {
    Sha256::digest(bytes).into()
}

/// Pin string (base64 SHA-256) for the given DER bytes.
pub fn pin_for(bytes: &[u8]) -> String {
    STANDARD.encode(fingerprint(bytes))
}

fn parse_pin(pin: &str) -> Result<Fingerprint, ConfigError> {
    let encoded = pin.trim().trim_start_matches("sha256/");
    let decoded = STANDARD.decode(encoded).map_err(|e| ConfigError::Pin {
        pin: pin.to_string(),
        reason: e.to_string(),
    })?;
    Fingerprint::try_from(decoded.as_slice()).map_err(|_| ConfigError::Pin {
        pin: pin.to_string(),
        reason: format!("expected 32 digest bytes, got {}", decoded.len()),
    })
}

fn parse_pins(pins: &[String]) -> Result<HashSet<Fingerprint>, ConfigError> {
    pins.iter().map(|p| parse_pin(p)).collect()
}

/// Applies one `PinningPolicy` to trust challenges for a single host.
#[derive(Debug, Clone)]
pub struct TrustValidator {
    host: String,
    policy: PinningPolicy,
    certificate_pins: HashSet<Fingerprint>,
    public_key_pins: HashSet<Fingerprint>,
}

impl TrustValidator {
    pub fn new(
        host: &str,
        policy: PinningPolicy,
        certificate_pins: &[String],
        public_key_pins: &[String],
    ) -> Result<Self, ConfigError> {
        let certificate_pins = parse_pins(certificate_pins)?;
        let public_key_pins = parse_pins(public_key_pins)?;
        match policy {
            PinningPolicy::Certificate if certificate_pins.is_empty() => {
                return Err(ConfigError::MissingPins("certificate"))
            }
            PinningPolicy::PublicKey if public_key_pins.is_empty() => {
                return Err(ConfigError::MissingPins("public key"))
            }
            _ => {}
        }
        Ok(Self {
            host: host.to_ascii_lowercase(),
            policy,
            certificate_pins,
            public_key_pins,
        })
    }

    pub fn policy(&self) -> PinningPolicy {
        self.policy
    }

    pub fn validate(&self, trust: &ServerTrust) -> TrustDecision {
        match self.evaluate(trust) {
            Ok(()) => TrustDecision::Accept,
            Err(reason) => TrustDecision::Reject(reason),
        }
    }

    fn evaluate(&self, trust: &ServerTrust) -> Result<(), TrustFailure> {
        if !trust.host.eq_ignore_ascii_case(&self.host) {
            return Err(TrustFailure::DomainMismatch {
                expected: self.host.clone(),
                presented: trust.host.to_ascii_lowercase(),
            });
        }
        match self.policy {
            PinningPolicy::None => default_evaluation(trust),
            PinningPolicy::Certificate => {
                default_evaluation(trust)?;
                pinned(trust, &self.certificate_pins, Certificate::fingerprint)
            }
            PinningPolicy::PublicKey => {
                default_evaluation(trust)?;
                pinned(trust, &self.public_key_pins, Certificate::public_key_fingerprint)
            }
            #[cfg(feature = "test-environments")]
            PinningPolicy::NoneAcceptRecoverableFailure => match &trust.evaluation {
                ChainEvaluation::Trusted | ChainEvaluation::RecoverableFailure(_) => Ok(()),
                ChainEvaluation::Failed(reason) => Err(reason.clone()),
            },
        }
    }
}

pub(crate) fn default_evaluation(trust: &ServerTrust) -> Result<(), TrustFailure> {
    match &trust.evaluation {
        ChainEvaluation::Trusted => Ok(()),
        ChainEvaluation::RecoverableFailure(reason) | ChainEvaluation::Failed(reason) => {
            Err(reason.clone())
        }
    }
}

fn pinned(
    trust: &ServerTrust,
    pins: &HashSet<Fingerprint>,
    digest: fn(&Certificate) -> Fingerprint,
) -> Result<(), TrustFailure> {
    if trust.chain.is_empty() {
        return Err(TrustFailure::EmptyChain);
    }
    if trust.chain.iter().any(|cert| pins.contains(&digest(cert))) {
        Ok(())
    } else {
        Err(TrustFailure::PinMismatch)
    }
}
