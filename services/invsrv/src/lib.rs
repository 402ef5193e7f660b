//! Inverter Service Library (invsrv)
//!
//! Polls Voltx/Solplanet hybrid inverters over Modbus TCP and exposes decoded
//! telemetry plus a small set of writable control registers.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌─────────────────┐    ┌─────────────────┐
//! │  RegisterMap    │───►│   Coordinator   │───►│    Snapshot     │
//! │  (blocks/fields)│    │  (timer, lock)  │    │   (arc-swap)    │
//! └─────────────────┘    └─────────────────┘    └─────────────────┘
//!                                 │                       │
//!                                 ▼                       ▼
//!                        ┌─────────────────┐    ┌─────────────────┐
//!                        │ ModbusTransport │    │    Entities     │
//!                        │ (FC03/04/06)    │    │ (sensor/number) │
//!                        └─────────────────┘    └─────────────────┘
//! ```
//!
//! - **`codec`**: raw word to typed value conversion
//! - **`register_map`**: block layout, field decoding recipes, writable keys
//! - **`protocols::modbus`**: PDU, MBAP framing, TCP transport
//! - **`coordinator`**: scheduled polling, writes, post-write refresh
//! - **`entity`**: consumer adapters built on [`TelemetrySource`]

pub mod codec;
pub mod config;
pub mod coordinator;
pub mod entity;
pub mod error;
pub mod protocols;
pub mod register_map;
pub mod snapshot;
pub mod source;

pub use config::{DeviceConfig, InvsrvConfig};
pub use coordinator::{Coordinator, CoordinatorPhase, CoordinatorStats};
pub use error::{ConfigError, CoordinatorError, Result, TransportError, WriteError};
pub use register_map::RegisterMap;
pub use snapshot::{TelemetrySnapshot, TelemetryValue};
pub use source::{TelemetrySource, WriteTarget};
