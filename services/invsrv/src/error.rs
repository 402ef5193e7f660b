//! Error types for the inverter service
//!
//! Transport failures are split into "could not reach the device" and "the
//! device answered but rejected or garbled the request". The coordinator lifts
//! them into cycle-level and write-level errors.

use thiserror::Error;

/// Failure of a single Modbus round trip
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// TCP connect, send or receive failed, or timed out
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Device responded but the request was rejected, short or malformed
    #[error("Protocol error: {0}")]
    ProtocolError(String),
}

impl TransportError {
    pub fn connection(msg: impl Into<String>) -> Self {
        TransportError::ConnectionError(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        TransportError::ProtocolError(msg.into())
    }

    /// Modbus exception response (function code with the 0x80 bit set)
    pub fn exception(function_code: u8, exception_code: u8) -> Self {
        TransportError::ProtocolError(format!(
            "Modbus exception on FC{:02X}: code {:02X} ({})",
            function_code & 0x7F,
            exception_code,
            exception_description(exception_code)
        ))
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, TransportError::ConnectionError(_))
    }
}

fn exception_description(code: u8) -> &'static str {
    match code {
        0x01 => "illegal function",
        0x02 => "illegal data address",
        0x03 => "illegal data value",
        0x04 => "server device failure",
        0x05 => "acknowledge",
        0x06 => "server device busy",
        0x0A => "gateway path unavailable",
        0x0B => "gateway target failed to respond",
        _ => "unknown exception",
    }
}

/// Rejected or failed write request
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WriteError {
    #[error("Unknown writable key: {0}")]
    UnknownKey(String),

    #[error("Register {0} is not writable")]
    NotWritable(u16),

    #[error("Value {value} for {key} is outside {min}..={max}")]
    OutOfRange {
        key: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Value {value} for {key} is not a finite number")]
    InvalidValue { key: String, value: f64 },

    #[error("Unknown option '{option}' for {key}")]
    UnknownOption { key: String, option: String },

    #[error("Write to register {address} failed: {source}")]
    Transport {
        address: u16,
        #[source]
        source: TransportError,
    },
}

/// Poll-cycle and lifecycle errors raised by the coordinator
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoordinatorError {
    /// No block produced data; the previous snapshot is kept
    #[error("Could not fetch data from {device}: all {blocks} register blocks failed (last: {last})")]
    AllBlocksFailed {
        device: String,
        blocks: usize,
        last: TransportError,
    },

    /// The device never produced a snapshot; it must not be brought online
    #[error("First poll of {device} failed: {reason}")]
    FirstCycleFailed { device: String, reason: String },

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error("Invalid poll interval: {0}")]
    InvalidInterval(String),
}

/// Invalid service configuration or register map
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration: {field}: {reason}")]
    Invalid { field: String, reason: String },

    #[error("Failed to load configuration: {0}")]
    Load(String),

    #[error("Invalid register map: {0}")]
    RegisterMap(String),
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn register_map(msg: impl Into<String>) -> Self {
        ConfigError::RegisterMap(msg.into())
    }
}

/// Result type alias for coordinator operations
pub type Result<T, E = CoordinatorError> = std::result::Result<T, E>;
