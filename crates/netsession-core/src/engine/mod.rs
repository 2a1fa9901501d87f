//! Task engine - per-task state behind a session
//!
//! - Progress tracking with cancel/pause controls
//! - Delegate records and the registry that owns them
//! - Session-wide handler table with per-task overrides
//! - Completion dispatch onto an explicit execution context

mod delegate;
mod dispatch;
mod handlers;
mod progress;
mod registry;

pub use delegate::*;
pub use dispatch::*;
pub use handlers::*;
pub use progress::*;
pub use registry::*;
