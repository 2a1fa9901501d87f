//! Security policy - decides whether a presented server identity is acceptable
//!
//! Evaluation is a pure function of the policy and the chain:
//! - `None` accepts every chain (the session still applies baseline trust)
//! - `PublicKey` accepts when any presented key matches a pinned key
//! - `Certificate` accepts when any presented certificate is byte-identical
//!   to a pinned one, after the chain validates against the pinned set

use crate::error::TrustError;
use crate::security::{Anchors, Certificate, PlatformTrust, X509Trust};
use bytes::Bytes;
use netsession_types::PinningMode;
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Immutable pinning configuration shared by every evaluation in a session
///
/// Changing the pinned set produces a new policy; in-flight evaluations keep
/// the set they started with.
#[derive(Clone)]
pub struct SecurityPolicy {
    mode: PinningMode,
    pinned_certificates: Arc<HashSet<Certificate>>,
    pinned_public_keys: Arc<HashSet<Bytes>>,
    allow_invalid_certificates: bool,
    validates_domain_name: bool,
    platform: Arc<dyn PlatformTrust>,
}

impl SecurityPolicy {
    /// No pinning, invalid certificates refused, domain names validated
    pub fn default_policy() -> Self {
        Self {
            mode: PinningMode::None,
            pinned_certificates: Arc::new(HashSet::new()),
            pinned_public_keys: Arc::new(HashSet::new()),
            allow_invalid_certificates: false,
            validates_domain_name: true,
            platform: X509Trust::native(),
        }
    }

    pub fn with_pinning_mode(mode: PinningMode) -> Self {
        Self {
            mode,
            ..Self::default_policy()
        }
    }

    pub fn with_pinned_certificates(
        mode: PinningMode,
        certificates: impl IntoIterator<Item = Certificate>,
    ) -> Self {
        Self::with_pinning_mode(mode).set_pinned_certificates(certificates)
    }

    /// Policy pinned to every certificate file found in `dir`
    pub fn with_certificates_in_dir(mode: PinningMode, dir: &Path) -> Result<Self, TrustError> {
        let certificates = crate::security::certificates_in_dir(dir)?;
        Ok(Self::with_pinned_certificates(mode, certificates))
    }

    pub fn with_platform_trust(mut self, platform: Arc<dyn PlatformTrust>) -> Self {
        self.platform = platform;
        self
    }

    pub fn allow_invalid_certificates(mut self, allow: bool) -> Self {
        self.allow_invalid_certificates = allow;
        self
    }

    pub fn validates_domain_name(mut self, validate: bool) -> Self {
        self.validates_domain_name = validate;
        self
    }

    /// Replace the pinned set, deriving the pinned public keys from it
    pub fn set_pinned_certificates(
        mut self,
        certificates: impl IntoIterator<Item = Certificate>,
    ) -> Self {
        let certificates: HashSet<Certificate> = certificates.into_iter().collect();
        let mut keys = HashSet::new();
        for certificate in &certificates {
            match certificate.public_key() {
                Ok(key) => {
                    keys.insert(key);
                }
                Err(e) => warn!("Pinned certificate has no usable public key: {}", e),
            }
        }

        self.pinned_certificates = Arc::new(certificates);
        self.pinned_public_keys = Arc::new(keys);
        self
    }

    pub fn mode(&self) -> PinningMode {
        self.mode
    }

    pub fn pinned_certificates(&self) -> &HashSet<Certificate> {
        &self.pinned_certificates
    }

    pub fn allows_invalid_certificates(&self) -> bool {
        self.allow_invalid_certificates
    }

    pub fn validates_domain(&self) -> bool {
        self.validates_domain_name
    }

    /// Pinning decision for a leaf-first chain
    pub fn evaluate(&self, chain: &[Certificate], domain: Option<&str>) -> bool {
        match self.check_pinning(chain, domain) {
            Ok(()) => true,
            Err(e) => {
                debug!("Pinning evaluation failed: {}", e);
                false
            }
        }
    }

    /// Full server trust decision used when answering a trust challenge
    ///
    /// With pinning disabled the chain must still pass baseline validation
    /// against the platform roots unless invalid certificates are allowed.
    pub fn evaluate_server_trust(
        &self,
        chain: &[Certificate],
        domain: Option<&str>,
    ) -> Result<(), TrustError> {
        match self.mode {
            PinningMode::None => {
                if self.allow_invalid_certificates {
                    return Ok(());
                }
                self.platform.verify_chain(chain, Anchors::System)?;
                self.check_domain(chain, domain)
            }
            PinningMode::PublicKey | PinningMode::Certificate => self.check_pinning(chain, domain),
        }
    }

    fn check_pinning(&self, chain: &[Certificate], domain: Option<&str>) -> Result<(), TrustError> {
        match self.mode {
            PinningMode::None => Ok(()),
            _ if self.pinned_certificates.is_empty() => Err(TrustError::PinningMismatch),
            PinningMode::Certificate => {
                if !self.allow_invalid_certificates {
                    let anchors: Vec<Certificate> =
                        self.pinned_certificates.iter().cloned().collect();
                    self.platform.verify_chain(chain, Anchors::Only(&anchors))?;
                    self.check_domain(chain, domain)?;
                }

                if chain.iter().any(|c| self.pinned_certificates.contains(c)) {
                    Ok(())
                } else {
                    Err(TrustError::PinningMismatch)
                }
            }
            PinningMode::PublicKey => {
                let matched = chain
                    .iter()
                    .filter_map(|c| c.public_key().ok())
                    .any(|key| self.pinned_public_keys.contains(&key));
                if !matched {
                    return Err(TrustError::PinningMismatch);
                }

                if !self.allow_invalid_certificates {
                    self.check_domain(chain, domain)?;
                }
                Ok(())
            }
        }
    }

    /// Hostname check on the leaf; skipped without a domain
    fn check_domain(&self, chain: &[Certificate], domain: Option<&str>) -> Result<(), TrustError> {
        match (self.validates_domain_name, domain, chain.first()) {
            (true, Some(domain), Some(leaf)) => self.platform.verify_hostname(leaf, domain),
            (true, Some(_), None) => Err(TrustError::EmptyChain),
            _ => Ok(()),
        }
    }
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self::default_policy()
    }
}

impl fmt::Debug for SecurityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityPolicy")
            .field("mode", &self.mode)
            .field("pinned_certificates", &self.pinned_certificates.len())
            .field("allow_invalid_certificates", &self.allow_invalid_certificates)
            .field("validates_domain_name", &self.validates_domain_name)
            .finish()
    }
}
