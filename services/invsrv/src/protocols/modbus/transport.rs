//! Modbus TCP transport
//!
//! One TCP session per call: connect, send one MBAP frame, read one response,
//! close. No retries and no pooling; the coordinator's next cycle is the retry.

use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::constants::{mbap_frame_size, DEFAULT_IO_TIMEOUT, MAX_MBAP_LENGTH, MBAP_HEADER_LEN};
use super::pdu::{
    build_read_request, build_write_single_request, parse_read_response,
    parse_write_single_response, ModbusPdu,
};
use crate::error::TransportError;
use crate::register_map::RegisterBlock;

type Result<T> = std::result::Result<T, TransportError>;

/// Device-facing register I/O
#[async_trait]
pub trait RegisterTransport: Send + Sync {
    /// Read a whole block; returns exactly `block.count` words
    async fn read_block(&self, block: &RegisterBlock) -> Result<Vec<u16>>;

    /// FC06 single-register write
    async fn write_register(&self, address: u16, raw: u16) -> Result<()>;
}

/// Decoded MBAP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    /// Unit ID + PDU byte count
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    pub fn parse(bytes: &[u8; MBAP_HEADER_LEN + 1]) -> Self {
        Self {
            transaction_id: u16::from_be_bytes([bytes[0], bytes[1]]),
            protocol_id: u16::from_be_bytes([bytes[2], bytes[3]]),
            length: u16::from_be_bytes([bytes[4], bytes[5]]),
            unit_id: bytes[6],
        }
    }
}

/// Build a complete Modbus TCP ADU
pub fn build_tcp_frame(transaction_id: u16, unit_id: u8, pdu: &ModbusPdu) -> BytesMut {
    let mut frame = BytesMut::with_capacity(mbap_frame_size(pdu.len()));
    frame.put_u16(transaction_id);
    frame.put_u16(0); // protocol id
    frame.put_u16((pdu.len() + 1) as u16);
    frame.put_u8(unit_id);
    frame.extend_from_slice(pdu.as_slice());
    frame
}

/// Modbus TCP client for one device
#[derive(Debug)]
pub struct ModbusTcpTransport {
    host: String,
    port: u16,
    unit_id: u8,
    io_timeout: Duration,
    next_transaction_id: AtomicU16,
}

impl ModbusTcpTransport {
    pub fn new(host: impl Into<String>, port: u16, unit_id: u8) -> Self {
        Self {
            host: host.into(),
            port,
            unit_id,
            io_timeout: DEFAULT_IO_TIMEOUT,
            next_transaction_id: AtomicU16::new(1),
        }
    }

    pub fn with_timeout(mut self, io_timeout: Duration) -> Self {
        self.io_timeout = io_timeout;
        self
    }

    /// `host:port` for logs; IPv6 literals are bracketed
    pub fn endpoint(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    fn next_transaction_id(&self) -> u16 {
        // Wraps from 0xFFFF to 0x0000
        self.next_transaction_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn connect(&self) -> Result<TcpStream> {
        let addr = self.endpoint();
        match timeout(
            self.io_timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("TCP_NODELAY failed for {}: {}", addr, e);
                }
                Ok(stream)
            },
            Ok(Err(e)) => Err(TransportError::connection(format!(
                "Connect to {addr} failed: {e}"
            ))),
            Err(_) => Err(TransportError::connection(format!(
                "Connect to {addr} timed out after {:?}",
                self.io_timeout
            ))),
        }
    }

    /// Send one request and return the validated response PDU
    async fn round_trip(&self, request: &ModbusPdu) -> Result<ModbusPdu> {
        let mut stream = self.connect().await?;
        let transaction_id = self.next_transaction_id();
        let frame = build_tcp_frame(transaction_id, self.unit_id, request);

        debug!(
            "TX {}: trans_id={:04X}, unit_id={}, FC={:02X}, {} bytes",
            self.endpoint(),
            transaction_id,
            self.unit_id,
            request.function_code().unwrap_or(0),
            frame.len()
        );

        match timeout(self.io_timeout, stream.write_all(&frame)).await {
            Ok(Ok(())) => {},
            Ok(Err(e)) => return Err(TransportError::connection(format!("Send failed: {e}"))),
            Err(_) => return Err(TransportError::connection("Send timed out")),
        }

        let mut header_buf = [0u8; MBAP_HEADER_LEN + 1];
        match timeout(self.io_timeout, stream.read_exact(&mut header_buf)).await {
            Ok(Ok(_)) => {},
            Ok(Err(e)) => {
                return Err(TransportError::connection(format!(
                    "Header read failed: {e}"
                )))
            },
            Err(_) => return Err(TransportError::connection("Header read timed out")),
        }
        let header = MbapHeader::parse(&header_buf);

        if header.protocol_id != 0 {
            return Err(TransportError::protocol(format!(
                "Invalid protocol ID: expected 0, got {}",
                header.protocol_id
            )));
        }
        let length = header.length as usize;
        if !(2..=MAX_MBAP_LENGTH).contains(&length) {
            return Err(TransportError::protocol(format!(
                "Invalid MBAP length field: {length}"
            )));
        }

        let mut body = vec![0u8; length - 1];
        match timeout(self.io_timeout, stream.read_exact(&mut body)).await {
            Ok(Ok(_)) => {},
            Ok(Err(e)) => {
                return Err(TransportError::protocol(format!(
                    "Truncated response body: {e}"
                )))
            },
            Err(_) => return Err(TransportError::connection("PDU read timed out")),
        }

        if header.transaction_id != transaction_id {
            return Err(TransportError::protocol(format!(
                "Transaction ID mismatch: sent {:04X}, got {:04X}",
                transaction_id, header.transaction_id
            )));
        }
        if header.unit_id != self.unit_id {
            return Err(TransportError::protocol(format!(
                "Unit ID mismatch: sent {}, got {}",
                self.unit_id, header.unit_id
            )));
        }

        let response = ModbusPdu::from_slice(&body)?;
        debug!(
            "RX {}: trans_id={:04X}, FC={:02X}, {} bytes",
            self.endpoint(),
            header.transaction_id,
            response.function_code().unwrap_or(0),
            response.len()
        );

        // Close the session; a failed FIN does not invalidate the response
        let _ = stream.shutdown().await;
        Ok(response)
    }
}

#[async_trait]
impl RegisterTransport for ModbusTcpTransport {
    async fn read_block(&self, block: &RegisterBlock) -> Result<Vec<u16>> {
        let fc = block.function_code.code();
        let request = build_read_request(fc, block.start_address, block.count)?;
        let response = self.round_trip(&request).await?;
        parse_read_response(&response, fc, block.count)
    }

    async fn write_register(&self, address: u16, raw: u16) -> Result<()> {
        let request = build_write_single_request(address, raw)?;
        let response = self.round_trip(&request).await?;
        parse_write_single_response(&response, address, raw)
    }
}
