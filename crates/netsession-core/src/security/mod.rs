//! Transport security
//!
//! - DER certificates and pinned-certificate loading
//! - Baseline chain/hostname validation
//! - Pinning policy evaluation

mod certificate;
mod platform;
mod policy;

#[cfg(test)]
pub(crate) mod test_certs;

pub use certificate::*;
pub use platform::*;
pub use policy::*;
