//! netsession core - HTTP session task engine
//!
//! This crate keeps per-task state behind an async HTTP session: delegate
//! records, upload/download progress, response serialization, and server
//! trust evaluation with certificate or public key pinning.

mod backend;
mod engine;
mod error;
mod http;
mod request;
mod security;
mod serializer;
mod session;

#[cfg(test)]
mod testing;

pub use backend::*;
pub use engine::*;
pub use error::*;
pub use http::*;
pub use request::*;
pub use security::*;
pub use serializer::*;
pub use session::*;

pub use netsession_types;
