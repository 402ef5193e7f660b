//! Modbus PDU construction and response parsing
//!
//! Requests are built into a fixed-size stack buffer. Responses are validated
//! strictly: a read must return exactly the requested number of registers and
//! a single-register write must echo the request.

use crate::error::TransportError;
use tracing::trace;

use super::constants::{
    EXCEPTION_FLAG, FC_READ_HOLDING_REGISTERS, FC_READ_INPUT_REGISTERS, FC_WRITE_SINGLE_REGISTER,
    MAX_PDU_SIZE, MODBUS_MAX_READ_REGISTERS,
};

type Result<T> = std::result::Result<T, TransportError>;

/// PDU backed by a fixed stack array
#[derive(Debug, Clone)]
pub struct ModbusPdu {
    data: [u8; MAX_PDU_SIZE],
    len: usize,
}

impl ModbusPdu {
    #[inline]
    pub fn new() -> Self {
        Self {
            data: [0; MAX_PDU_SIZE],
            len: 0,
        }
    }

    /// Create a PDU from a received byte slice
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        if data.len() > MAX_PDU_SIZE {
            return Err(TransportError::protocol(format!(
                "PDU too large: {} bytes (max {})",
                data.len(),
                MAX_PDU_SIZE
            )));
        }

        let mut pdu = Self::new();
        pdu.data[..data.len()].copy_from_slice(data);
        pdu.len = data.len();
        Ok(pdu)
    }

    #[inline]
    pub fn push(&mut self, byte: u8) -> Result<()> {
        if self.len >= MAX_PDU_SIZE {
            return Err(TransportError::protocol("PDU buffer full"));
        }
        self.data[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    /// Push u16 in big-endian
    #[inline]
    pub fn push_u16(&mut self, value: u16) -> Result<()> {
        for byte in value.to_be_bytes() {
            self.push(byte)?;
        }
        Ok(())
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn function_code(&self) -> Option<u8> {
        self.as_slice().first().copied()
    }

    #[inline]
    pub fn is_exception(&self) -> bool {
        self.function_code()
            .map(|fc| fc & EXCEPTION_FLAG != 0)
            .unwrap_or(false)
    }

    #[inline]
    pub fn exception_code(&self) -> Option<u8> {
        if self.is_exception() {
            self.as_slice().get(1).copied()
        } else {
            None
        }
    }

    fn u16_at(&self, offset: usize) -> Option<u16> {
        let bytes = self.as_slice().get(offset..offset + 2)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    /// Human-readable function code description
    pub fn function_code_description(fc: u8) -> &'static str {
        match fc & !EXCEPTION_FLAG {
            FC_READ_HOLDING_REGISTERS => "Read Holding Registers",
            FC_READ_INPUT_REGISTERS => "Read Input Registers",
            FC_WRITE_SINGLE_REGISTER => "Write Single Register",
            _ => "Unsupported Function",
        }
    }
}

impl Default for ModbusPdu {
    fn default() -> Self {
        Self::new()
    }
}

/// Build FC03/FC04 request PDU
pub fn build_read_request(function_code: u8, start_address: u16, quantity: u16) -> Result<ModbusPdu> {
    if function_code != FC_READ_HOLDING_REGISTERS && function_code != FC_READ_INPUT_REGISTERS {
        return Err(TransportError::protocol(format!(
            "Unsupported read function code {function_code:02X}"
        )));
    }
    if quantity == 0 || quantity > MODBUS_MAX_READ_REGISTERS {
        return Err(TransportError::protocol(format!(
            "Invalid register count {quantity} (1..={MODBUS_MAX_READ_REGISTERS})"
        )));
    }

    let mut pdu = ModbusPdu::new();
    pdu.push(function_code)?;
    pdu.push_u16(start_address)?;
    pdu.push_u16(quantity)?;
    trace!(
        "PDU built: FC={:02X} ({}), start={}, qty={}",
        function_code,
        ModbusPdu::function_code_description(function_code),
        start_address,
        quantity
    );
    Ok(pdu)
}

/// Build FC06 request PDU
pub fn build_write_single_request(address: u16, value: u16) -> Result<ModbusPdu> {
    let mut pdu = ModbusPdu::new();
    pdu.push(FC_WRITE_SINGLE_REGISTER)?;
    pdu.push_u16(address)?;
    pdu.push_u16(value)?;
    Ok(pdu)
}

/// Reject exception responses and function-code mismatches
fn check_function_code(pdu: &ModbusPdu, expected_fc: u8) -> Result<()> {
    let fc = pdu
        .function_code()
        .ok_or_else(|| TransportError::protocol("Empty response PDU"))?;

    if pdu.is_exception() {
        return Err(TransportError::exception(fc, pdu.exception_code().unwrap_or(0)));
    }

    if fc != expected_fc {
        return Err(TransportError::protocol(format!(
            "Function code mismatch: expected {expected_fc:02X}, got {fc:02X}"
        )));
    }
    Ok(())
}

/// Parse FC03/FC04 response into exactly `expected_count` registers
pub fn parse_read_response(
    pdu: &ModbusPdu,
    function_code: u8,
    expected_count: u16,
) -> Result<Vec<u16>> {
    check_function_code(pdu, function_code)?;

    let data = pdu.as_slice();
    let byte_count = *data
        .get(1)
        .ok_or_else(|| TransportError::protocol("Response missing byte count"))?
        as usize;
    let expected_bytes = expected_count as usize * 2;

    if byte_count != expected_bytes {
        return Err(TransportError::protocol(format!(
            "Byte count mismatch for FC{function_code:02X}: expected {expected_bytes}, got {byte_count}"
        )));
    }
    if data.len() != 2 + byte_count {
        return Err(TransportError::protocol(format!(
            "Short response: declared {} data bytes, received {}",
            byte_count,
            data.len().saturating_sub(2)
        )));
    }

    Ok(data[2..]
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

/// Validate FC06 echo response
pub fn parse_write_single_response(pdu: &ModbusPdu, address: u16, value: u16) -> Result<()> {
    check_function_code(pdu, FC_WRITE_SINGLE_REGISTER)?;

    match (pdu.u16_at(1), pdu.u16_at(3)) {
        (Some(echo_addr), Some(echo_value)) if echo_addr == address && echo_value == value => {
            Ok(())
        },
        (Some(echo_addr), Some(echo_value)) => Err(TransportError::protocol(format!(
            "Write echo mismatch: sent {address}={value:#06X}, device echoed {echo_addr}={echo_value:#06X}"
        ))),
        _ => Err(TransportError::protocol("Short write response")),
    }
}
