//! DER certificates and the byte-level encodings used for pinning

use crate::error::TrustError;
use bytes::Bytes;
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use tracing::{debug, warn};
use x509_parser::certificate::X509Certificate;
use x509_parser::pem::Pem;

/// An X.509 certificate in DER form
///
/// Equality and hashing are over the raw bytes, which is exactly what
/// certificate pinning compares.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Certificate {
    der: Bytes,
}

impl Certificate {
    pub fn from_der(der: impl Into<Bytes>) -> Self {
        Self { der: der.into() }
    }

    /// Parse every `CERTIFICATE` block of a PEM document
    pub fn from_pem(pem: &[u8]) -> Result<Vec<Certificate>, TrustError> {
        let mut certificates = Vec::new();
        for block in Pem::iter_from_buffer(pem) {
            let block = block.map_err(|e| TrustError::Malformed(e.to_string()))?;
            if block.label == "CERTIFICATE" {
                certificates.push(Certificate::from_der(block.contents));
            }
        }
        Ok(certificates)
    }

    pub fn as_der(&self) -> &[u8] {
        &self.der
    }

    pub(crate) fn parse(&self) -> Result<X509Certificate<'_>, TrustError> {
        let (_, cert) = x509_parser::parse_x509_certificate(&self.der)
            .map_err(|e| TrustError::Malformed(e.to_string()))?;
        Ok(cert)
    }

    /// DER encoding of the certificate's SubjectPublicKeyInfo
    pub fn public_key(&self) -> Result<Bytes, TrustError> {
        let cert = self.parse()?;
        Ok(Bytes::copy_from_slice(cert.public_key().raw))
    }

    /// Human-readable subject, for diagnostics
    pub fn subject(&self) -> String {
        match self.parse() {
            Ok(cert) => cert.subject().to_string(),
            Err(_) => "<malformed>".to_string(),
        }
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("subject", &self.subject())
            .field("len", &self.der.len())
            .finish()
    }
}

impl From<Vec<u8>> for Certificate {
    fn from(der: Vec<u8>) -> Self {
        Certificate::from_der(der)
    }
}

/// Load every certificate file (`.cer`, `.der`, `.crt`, `.pem`) in a directory
///
/// Files that cannot be read or parsed are skipped with a warning.
pub fn certificates_in_dir(dir: &Path) -> Result<HashSet<Certificate>, TrustError> {
    let entries = std::fs::read_dir(dir).map_err(|e| TrustError::Io(e.to_string()))?;
    let mut certificates = HashSet::new();

    for entry in entries {
        let path = entry.map_err(|e| TrustError::Io(e.to_string()))?.path();
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());

        let loaded = match extension.as_deref() {
            Some("cer") | Some("der") | Some("crt") | Some("pem") => load_certificate_file(&path),
            _ => continue,
        };

        match loaded {
            Ok(found) => {
                debug!("Loaded {} certificate(s) from {}", found.len(), path.display());
                certificates.extend(found);
            }
            Err(e) => warn!("Skipping certificate file {}: {}", path.display(), e),
        }
    }

    Ok(certificates)
}

/// Load a single certificate file, accepting PEM or raw DER contents
pub fn load_certificate_file(path: &Path) -> Result<Vec<Certificate>, TrustError> {
    let contents = std::fs::read(path).map_err(|e| TrustError::Io(e.to_string()))?;

    if contents.starts_with(b"-----BEGIN") {
        return Certificate::from_pem(&contents);
    }

    let certificate = Certificate::from_der(contents);
    certificate.parse()?;
    Ok(vec![certificate])
}
