//! Server trust decided inside the TLS handshake
//!
//! The client's certificate verifier hands the presented chain (leaf first,
//! then intermediates) to the session delegate as a server trust challenge.
//! A rejection fails the handshake, so no request bytes reach the peer.

use crate::backend::{
    AuthChallenge, AuthenticationMethod, ChallengeDisposition, ProtectionSpace, ServerTrust,
    SessionDelegate,
};
use crate::error::{SessionError, TrustError};
use crate::security::{Anchors, Certificate, PlatformTrust, X509Trust};
use parking_lot::{Mutex, RwLock};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, SignatureScheme};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Delegate link and trust verdicts shared by the backend and its verifier
pub(crate) struct TrustGate {
    delegate: RwLock<Option<Weak<dyn SessionDelegate>>>,
    /// Validate against native roots before consulting the delegate
    verifies_certificates: bool,
    rejected_hosts: Mutex<HashSet<String>>,
}

impl TrustGate {
    pub fn new(verifies_certificates: bool) -> Self {
        Self {
            delegate: RwLock::new(None),
            verifies_certificates,
            rejected_hosts: Mutex::new(HashSet::new()),
        }
    }

    pub fn bind(&self, delegate: Weak<dyn SessionDelegate>) {
        *self.delegate.write() = Some(delegate);
    }

    pub fn delegate(&self) -> Option<Arc<dyn SessionDelegate>> {
        self.delegate.read().as_ref().and_then(|d| d.upgrade())
    }

    /// Whether the last handshake with `host` failed on trust
    pub fn was_rejected(&self, host: &str) -> bool {
        self.rejected_hosts.lock().contains(host)
    }

    /// Decide whether `host` presenting `chain` may carry requests
    pub fn admit(&self, chain: Vec<Certificate>, host: &str) -> bool {
        if self.verifies_certificates {
            if let Err(e) = validate_with_native_roots(&chain, host) {
                warn!("Certificate for {} failed validation: {}", host, e);
                return self.reject(host);
            }
        }

        let Some(delegate) = self.delegate() else {
            return self.reject(host);
        };

        let challenge = AuthChallenge {
            protection_space: ProtectionSpace {
                host: host.to_string(),
                // The handshake does not see the port
                port: 443,
                scheme: "https".to_string(),
                realm: None,
                method: AuthenticationMethod::ServerTrust,
            },
            server_trust: Some(ServerTrust {
                chain,
                verified_by_transport: self.verifies_certificates,
            }),
            previous_failure_count: 0,
            failure_response: None,
        };

        match delegate.did_receive_challenge(None, &challenge) {
            ChallengeDisposition::CancelChallenge | ChallengeDisposition::RejectProtectionSpace => {
                warn!("Server trust for {} was rejected", host);
                self.reject(host)
            }
            _ => {
                debug!("Server trust for {} accepted", host);
                self.rejected_hosts.lock().remove(host);
                true
            }
        }
    }

    fn reject(&self, host: &str) -> bool {
        self.rejected_hosts.lock().insert(host.to_string());
        false
    }
}

fn validate_with_native_roots(chain: &[Certificate], host: &str) -> Result<(), TrustError> {
    let trust = X509Trust::native();
    trust.verify_chain(chain, Anchors::System)?;
    match chain.first() {
        Some(leaf) => trust.verify_hostname(leaf, host),
        None => Err(TrustError::EmptyChain),
    }
}

/// rustls verifier that routes every server certificate through a [`TrustGate`]
pub(crate) struct GateVerifier {
    gate: Arc<TrustGate>,
    provider: Arc<CryptoProvider>,
}

impl fmt::Debug for GateVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GateVerifier")
            .field("verifies_certificates", &self.gate.verifies_certificates)
            .finish()
    }
}

impl ServerCertVerifier for GateVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let host = match server_name {
            ServerName::DnsName(name) => name.as_ref().to_string(),
            ServerName::IpAddress(ip) => std::net::IpAddr::from(*ip).to_string(),
            _ => return Err(rustls::Error::General("unsupported server name".to_string())),
        };

        let chain = std::iter::once(end_entity)
            .chain(intermediates)
            .map(|der| Certificate::from_der(der.as_ref().to_vec()))
            .collect();

        if self.gate.admit(chain, &host) {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Client TLS configuration whose certificate check is `gate`
pub(crate) fn client_tls_config(gate: Arc<TrustGate>) -> Result<ClientConfig, SessionError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = Arc::new(GateVerifier {
        gate,
        provider: provider.clone(),
    });

    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| SessionError::InvalidConfiguration(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::test_certs;

    #[test]
    fn test_gate_without_session_rejects() {
        let gate = TrustGate::new(false);
        let cert = test_certs::self_signed("api.example.com");

        assert!(!gate.admit(vec![cert], "api.example.com"));
        assert!(gate.was_rejected("api.example.com"));
        assert!(!gate.was_rejected("other.example.com"));
    }

    #[test]
    fn test_transport_validation_runs_before_the_delegate() {
        // A self-signed certificate is never in the native store
        let gate = TrustGate::new(true);
        let cert = test_certs::self_signed("api.example.com");

        assert!(!gate.admit(vec![cert], "api.example.com"));
        assert!(gate.was_rejected("api.example.com"));
    }
}
