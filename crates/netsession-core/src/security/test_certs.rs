//! Certificate fixtures generated at test time

use crate::security::Certificate;
use rcgen::{
    date_time_ymd, BasicConstraints, CertificateParams, DnType, IsCa, KeyPair,
};

pub(crate) struct TestCa {
    pub cert: rcgen::Certificate,
    pub key: KeyPair,
}

impl TestCa {
    pub fn new(name: &str) -> Self {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let cert = params.self_signed(&key).unwrap();
        Self { cert, key }
    }

    pub fn certificate(&self) -> Certificate {
        Certificate::from_der(self.cert.der().to_vec())
    }

    /// Issue a leaf certificate for `host`
    pub fn issue(&self, host: &str) -> Certificate {
        let key = KeyPair::generate().unwrap();
        let cert = leaf_params(host).signed_by(&key, &self.cert, &self.key).unwrap();
        Certificate::from_der(cert.der().to_vec())
    }

    /// Issue a leaf certificate for `host` whose validity ended in 2001
    pub fn issue_expired(&self, host: &str) -> Certificate {
        let key = KeyPair::generate().unwrap();
        let mut params = leaf_params(host);
        params.not_before = date_time_ymd(2000, 1, 1);
        params.not_after = date_time_ymd(2001, 1, 1);
        let cert = params.signed_by(&key, &self.cert, &self.key).unwrap();
        Certificate::from_der(cert.der().to_vec())
    }
}

fn leaf_params(host: &str) -> CertificateParams {
    let mut params = CertificateParams::new(vec![host.to_string()]).unwrap();
    params.distinguished_name.push(DnType::CommonName, host);
    params
}

pub(crate) fn self_signed(host: &str) -> Certificate {
    let key = KeyPair::generate().unwrap();
    self_signed_with_key(host, &key)
}

pub(crate) fn self_signed_with_key(host: &str, key: &KeyPair) -> Certificate {
    let cert = leaf_params(host).self_signed(key).unwrap();
    Certificate::from_der(cert.der().to_vec())
}

pub(crate) fn self_signed_pem(host: &str) -> (Certificate, String) {
    let key = KeyPair::generate().unwrap();
    let cert = leaf_params(host).self_signed(&key).unwrap();
    (Certificate::from_der(cert.der().to_vec()), cert.pem())
}

pub(crate) fn expired_self_signed(host: &str) -> Certificate {
    let key = KeyPair::generate().unwrap();
    let mut params = leaf_params(host);
    params.not_before = date_time_ymd(2000, 1, 1);
    params.not_after = date_time_ymd(2001, 1, 1);
    let cert = params.self_signed(&key).unwrap();
    Certificate::from_der(cert.der().to_vec())
}
