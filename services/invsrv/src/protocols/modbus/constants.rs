//! Modbus protocol constants
//!
//! Derived from the Modbus application protocol specification:
//! - Maximum PDU size: 253 bytes (inherited from RS485 ADU limit of 256 bytes)
//! - Register limits are calculated to fit within the PDU size constraint

use std::time::Duration;

// ============================================================================
// Frame Size Constants
// ============================================================================

/// Modbus MBAP header length preceding the length-counted part
/// Format: Transaction ID(2) + Protocol ID(2) + Length(2) = 6 bytes
/// The Unit ID is counted by the Length field together with the PDU.
pub const MBAP_HEADER_LEN: usize = 6;

/// Maximum PDU (Protocol Data Unit) size
/// RS485 ADU (256 bytes) - Slave Address (1 byte) - CRC (2 bytes) = 253 bytes
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum MBAP length field value (Unit ID + PDU) = 254 bytes
pub const MAX_MBAP_LENGTH: usize = 1 + MAX_PDU_SIZE;

/// Maximum number of registers for FC03/FC04
///
/// Response PDU: FC(1) + Byte Count(1) + N × 2 ≤ 253, so N ≤ 125
pub const MODBUS_MAX_READ_REGISTERS: u16 = 125;

// ============================================================================
// Function Codes
// ============================================================================

pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;

/// Bit set on the function code of an exception response
pub const EXCEPTION_FLAG: u8 = 0x80;

// ============================================================================
// Addressing
// ============================================================================

/// Vendor documentation base for input registers (doc 30001 = frame 0)
pub const INPUT_DOC_BASE: u32 = 30001;

/// Vendor documentation base for holding registers (doc 40001 = frame 0)
pub const HOLDING_DOC_BASE: u32 = 40001;

// ============================================================================
// Session Defaults
// ============================================================================

/// Standard Modbus TCP port
pub const DEFAULT_MODBUS_PORT: u16 = 502;

/// Bound on connect and on each response read
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Calculate total Modbus TCP frame size (MBAP header + Unit ID + PDU)
#[inline]
pub const fn mbap_frame_size(pdu_len: usize) -> usize {
    MBAP_HEADER_LEN + 1 + pdu_len
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_register_limit_fits_pdu() {
        let read_pdu_size = 1 + 1 + (MODBUS_MAX_READ_REGISTERS as usize * 2);
        assert!(read_pdu_size <= MAX_PDU_SIZE);
        assert_eq!(MODBUS_MAX_READ_REGISTERS, 125);
        assert_eq!(MAX_MBAP_LENGTH, 254);
    }

    #[test]
    fn test_mbap_frame_size_helper() {
        // FC06 request: FC + address + value = 5 bytes
        assert_eq!(mbap_frame_size(5), 12);
        assert_eq!(mbap_frame_size(MAX_PDU_SIZE), 260);
    }
}
