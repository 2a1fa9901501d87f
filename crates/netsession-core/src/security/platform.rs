//! Baseline chain and hostname validation
//!
//! The pinning policy delegates the generic parts of trust evaluation
//! (validity periods, issuer linkage, anchoring, hostname matching) to a
//! [`PlatformTrust`]. [`X509Trust`] is the portable implementation built on
//! `x509-parser`; callers can substitute their own.

use crate::error::TrustError;
use crate::security::Certificate;
use std::net::IpAddr;
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;

/// Trust anchors a chain is validated against
#[derive(Debug, Clone, Copy)]
pub enum Anchors<'a> {
    /// The verifier's default root store
    System,
    /// Exactly these certificates, ignoring the default store
    Only(&'a [Certificate]),
}

/// Generic certificate validation, independent of pinning
pub trait PlatformTrust: Send + Sync {
    /// Validate validity periods, issuer linkage and anchoring of a leaf-first chain
    fn verify_chain(&self, chain: &[Certificate], anchors: Anchors<'_>) -> Result<(), TrustError>;

    /// Check that the leaf certificate names `domain`
    fn verify_hostname(&self, leaf: &Certificate, domain: &str) -> Result<(), TrustError>;
}

/// [`PlatformTrust`] over parsed X.509 structures
#[derive(Debug, Clone, Default)]
pub struct X509Trust {
    roots: Vec<Certificate>,
}

static NATIVE_TRUST: OnceLock<Arc<X509Trust>> = OnceLock::new();

impl X509Trust {
    pub fn new(roots: Vec<Certificate>) -> Self {
        Self { roots }
    }

    /// Verifier anchored in the operating system's root store, loaded once per process
    pub fn native() -> Arc<X509Trust> {
        NATIVE_TRUST
            .get_or_init(|| {
                let roots = match rustls_native_certs::load_native_certs() {
                    Ok(certs) => certs
                        .into_iter()
                        .map(|c| Certificate::from_der(c.as_ref().to_vec()))
                        .collect(),
                    Err(e) => {
                        warn!("Failed to load native root certificates: {}", e);
                        Vec::new()
                    }
                };
                debug!("Loaded {} native root certificates", roots.len());
                Arc::new(X509Trust::new(roots))
            })
            .clone()
    }

    pub fn roots(&self) -> &[Certificate] {
        &self.roots
    }
}

impl PlatformTrust for X509Trust {
    fn verify_chain(&self, chain: &[Certificate], anchors: Anchors<'_>) -> Result<(), TrustError> {
        if chain.is_empty() {
            return Err(TrustError::EmptyChain);
        }

        let anchors = match anchors {
            Anchors::System => self.roots.as_slice(),
            Anchors::Only(certs) => certs,
        };

        let parsed = chain
            .iter()
            .map(|c| c.parse())
            .collect::<Result<Vec<_>, _>>()?;

        for cert in &parsed {
            if !cert.validity().is_valid() {
                return Err(TrustError::Expired {
                    subject: cert.subject().to_string(),
                });
            }
        }

        for (position, cert) in parsed.iter().enumerate() {
            // A presented certificate that is itself an anchor ends the walk
            if anchors.contains(&chain[position]) {
                return Ok(());
            }

            match parsed.get(position + 1) {
                Some(issuer) => {
                    if !is_issued_by(cert, issuer) {
                        return Err(TrustError::BrokenChain { position });
                    }
                }
                None => {
                    return if anchors.iter().any(|anchor| is_anchored_by(cert, anchor)) {
                        Ok(())
                    } else {
                        Err(TrustError::UntrustedRoot)
                    };
                }
            }
        }

        Err(TrustError::UntrustedRoot)
    }

    fn verify_hostname(&self, leaf: &Certificate, domain: &str) -> Result<(), TrustError> {
        let cert = leaf.parse()?;
        let domain = domain.trim_end_matches('.').to_ascii_lowercase();
        let mismatch = || TrustError::HostnameMismatch {
            domain: domain.clone(),
        };

        let alt_names = cert
            .subject_alternative_name()
            .map_err(|e| TrustError::Malformed(e.to_string()))?
            .map(|ext| ext.value.general_names.clone())
            .unwrap_or_default();

        if let Ok(ip) = domain.parse::<IpAddr>() {
            let matched = alt_names.iter().any(|name| match name {
                GeneralName::IPAddress(bytes) => ip_matches(&ip, bytes),
                _ => false,
            });
            return if matched { Ok(()) } else { Err(mismatch()) };
        }

        let mut dns_names: Vec<String> = alt_names
            .iter()
            .filter_map(|name| match name {
                GeneralName::DNSName(dns) => Some(dns.to_ascii_lowercase()),
                _ => None,
            })
            .collect();

        // Legacy certificates without SANs carry the host in the common name
        if dns_names.is_empty() {
            dns_names = cert
                .subject()
                .iter_common_name()
                .filter_map(|cn| cn.as_str().ok())
                .map(|cn| cn.to_ascii_lowercase())
                .collect();
        }

        if dns_names.iter().any(|pattern| hostname_matches(pattern, &domain)) {
            Ok(())
        } else {
            Err(mismatch())
        }
    }
}

fn is_issued_by(cert: &X509Certificate<'_>, issuer: &X509Certificate<'_>) -> bool {
    cert.issuer().as_raw() == issuer.subject().as_raw()
        && cert.verify_signature(Some(issuer.public_key())).is_ok()
}

fn is_anchored_by(cert: &X509Certificate<'_>, anchor: &Certificate) -> bool {
    match anchor.parse() {
        Ok(anchor) => anchor.validity().is_valid() && is_issued_by(cert, &anchor),
        Err(_) => false,
    }
}

fn ip_matches(ip: &IpAddr, bytes: &[u8]) -> bool {
    match ip {
        IpAddr::V4(v4) => bytes == v4.octets(),
        IpAddr::V6(v6) => bytes == v6.octets(),
    }
}

/// Match a certificate name against a host; `*` covers exactly the left-most label
pub(crate) fn hostname_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.trim_end_matches('.');
    if let Some(suffix) = pattern.strip_prefix("*.") {
        return match host.split_once('.') {
            Some((label, rest)) => !label.is_empty() && rest == suffix,
            None => false,
        };
    }
    pattern == host
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::test_certs::{self, TestCa};

    #[test]
    fn test_chain_anchored_in_root_store() {
        let ca = TestCa::new("Test Root");
        let leaf = ca.issue("api.example.com");
        let trust = X509Trust::new(vec![ca.certificate()]);

        assert!(trust.verify_chain(&[leaf.clone()], Anchors::System).is_ok());
        assert!(trust
            .verify_chain(&[leaf, ca.certificate()], Anchors::System)
            .is_ok());
    }

    #[test]
    fn test_chain_from_unknown_root_is_untrusted() {
        let ca = TestCa::new("Test Root");
        let other = TestCa::new("Other Root");
        let leaf = ca.issue("api.example.com");
        let trust = X509Trust::new(vec![other.certificate()]);

        assert_eq!(
            trust.verify_chain(&[leaf], Anchors::System),
            Err(TrustError::UntrustedRoot)
        );
    }

    #[test]
    fn test_explicit_anchors_replace_root_store() {
        let ca = TestCa::new("Test Root");
        let leaf = ca.issue("api.example.com");
        let trust = X509Trust::new(vec![ca.certificate()]);

        assert!(trust
            .verify_chain(&[leaf.clone()], Anchors::Only(&[]))
            .is_err());
        assert!(trust
            .verify_chain(&[leaf.clone()], Anchors::Only(&[leaf]))
            .is_ok());
    }

    #[test]
    fn test_broken_linkage_is_reported() {
        let ca = TestCa::new("Test Root");
        let other = TestCa::new("Other Root");
        let leaf = ca.issue("api.example.com");
        let trust = X509Trust::new(vec![other.certificate()]);

        assert_eq!(
            trust.verify_chain(&[leaf, other.certificate()], Anchors::System),
            Err(TrustError::BrokenChain { position: 0 })
        );
    }

    #[test]
    fn test_expired_certificate_fails_even_when_anchored() {
        let expired = test_certs::expired_self_signed("old.example.com");
        let trust = X509Trust::default();

        assert!(matches!(
            trust.verify_chain(&[expired.clone()], Anchors::Only(&[expired])),
            Err(TrustError::Expired { .. })
        ));
    }

    #[test]
    fn test_expired_leaf_under_trusted_root() {
        let ca = TestCa::new("Test Root");
        let leaf = ca.issue_expired("api.example.com");
        let trust = X509Trust::new(vec![ca.certificate()]);

        assert!(matches!(
            trust.verify_chain(&[leaf, ca.certificate()], Anchors::System),
            Err(TrustError::Expired { .. })
        ));
    }

    #[test]
    fn test_empty_chain() {
        let trust = X509Trust::default();
        assert_eq!(
            trust.verify_chain(&[], Anchors::System),
            Err(TrustError::EmptyChain)
        );
    }

    #[test]
    fn test_hostname_verification() {
        let cert = test_certs::self_signed("api.example.com");
        let trust = X509Trust::default();

        assert!(trust.verify_hostname(&cert, "api.example.com").is_ok());
        assert!(trust.verify_hostname(&cert, "API.Example.com.").is_ok());
        assert!(trust.verify_hostname(&cert, "evil.example.com").is_err());
    }

    #[test]
    fn test_wildcard_matching() {
        assert!(hostname_matches("*.example.com", "api.example.com"));
        assert!(!hostname_matches("*.example.com", "example.com"));
        assert!(!hostname_matches("*.example.com", "a.b.example.com"));
        assert!(hostname_matches("example.com", "example.com"));
        assert!(!hostname_matches("example.com", "www.example.com"));
    }
}
