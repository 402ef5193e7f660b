//! Consumer-facing capability interface
//!
//! Adapters depend on this trait only, never on the coordinator type.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::{CoordinatorError, WriteError};
use crate::register_map::RegisterMap;
use crate::snapshot::TelemetrySnapshot;

/// Destination of a write: a writable key or a holding-register address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteTarget {
    Key(String),
    Address(u16),
}

impl WriteTarget {
    pub fn key(key: impl Into<String>) -> Self {
        WriteTarget::Key(key.into())
    }
}

impl FromStr for WriteTarget {
    type Err = std::convert::Infallible;

    /// Numeric strings are register addresses, anything else is a key
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Ok(match s.parse::<u16>() {
            Ok(address) => WriteTarget::Address(address),
            Err(_) => WriteTarget::Key(s.to_string()),
        })
    }
}

impl fmt::Display for WriteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteTarget::Key(key) => f.write_str(key),
            WriteTarget::Address(address) => write!(f, "register {address}"),
        }
    }
}

#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// Latest complete snapshot, or None before the first successful cycle
    fn snapshot(&self) -> Option<Arc<TelemetrySnapshot>>;

    /// Run an out-of-cycle poll and wait for it
    async fn request_refresh(&self) -> Result<Arc<TelemetrySnapshot>, CoordinatorError>;

    /// Encode and send one value; a refresh follows on success
    async fn write(&self, target: WriteTarget, value: f64) -> Result<(), WriteError>;

    /// Fires once per successful cycle
    fn subscribe(&self) -> broadcast::Receiver<Arc<TelemetrySnapshot>>;

    fn register_map(&self) -> &RegisterMap;
}
