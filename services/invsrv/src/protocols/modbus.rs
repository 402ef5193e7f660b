//! Modbus TCP client: PDU building, MBAP framing and the register transport

pub mod constants;
pub mod pdu;
pub mod transport;

pub use transport::{ModbusTcpTransport, RegisterTransport};
