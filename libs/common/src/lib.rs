//! invsrv basic library
//!
//! Provides functions shared by invsrv entry points:
//! - logging bootstrap
//! - command-line arguments
//! - graceful shutdown

pub mod bootstrap_args;
pub mod logging;
pub mod service_bootstrap;
pub mod shutdown;

// Re-export common dependencies
pub use anyhow;
pub use tokio;

#[cfg(feature = "cli")]
pub use clap;
