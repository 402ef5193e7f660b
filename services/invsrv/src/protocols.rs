//! Device protocols

pub mod modbus;
