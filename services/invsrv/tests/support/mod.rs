//! Shared test fixtures: a recording mock transport and a Modbus TCP simulator
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;

use invsrv::register_map::{ReadFunction, RegisterBlock};
use invsrv::protocols::modbus::RegisterTransport;
use invsrv::{DeviceConfig, TransportError};

// ============================================================================
// Mock transport
// ============================================================================

/// Transport call boundary as seen by the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    ReadStart(String),
    ReadEnd(String),
    WriteStart(u16, u16),
    WriteEnd(u16, u16),
}

/// In-memory transport that records every call in order
#[derive(Default)]
pub struct MockTransport {
    input: Mutex<HashMap<u16, u16>>,
    holding: Mutex<HashMap<u16, u16>>,
    failing_blocks: Mutex<HashMap<String, TransportError>>,
    write_failure: Mutex<Option<TransportError>>,
    delay: Mutex<Duration>,
    events: Mutex<Vec<Event>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Sleep inside every call so concurrent callers would overlap
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn set_input(&self, address: u16, value: u16) {
        self.input.lock().insert(address, value);
    }

    pub fn set_holding(&self, address: u16, value: u16) {
        self.holding.lock().insert(address, value);
    }

    pub fn holding(&self, address: u16) -> Option<u16> {
        self.holding.lock().get(&address).copied()
    }

    pub fn fail_block(&self, name: &str, error: TransportError) {
        self.failing_blocks.lock().insert(name.to_string(), error);
    }

    pub fn heal_block(&self, name: &str) {
        self.failing_blocks.lock().remove(name);
    }

    pub fn fail_all(&self, error: TransportError) {
        for name in ["inverter", "battery_status", "battery", "settings"] {
            self.fail_block(name, error.clone());
        }
    }

    pub fn fail_writes(&self, error: Option<TransportError>) {
        *self.write_failure.lock() = error;
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn clear_events(&self) {
        self.events.lock().clear();
    }

    pub fn read_count(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, Event::ReadStart(_)))
            .count()
    }

    pub fn writes(&self) -> Vec<(u16, u16)> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::WriteStart(address, raw) => Some((*address, *raw)),
                _ => None,
            })
            .collect()
    }

    fn delay(&self) -> Duration {
        *self.delay.lock()
    }
}

#[async_trait]
impl RegisterTransport for MockTransport {
    async fn read_block(&self, block: &RegisterBlock) -> Result<Vec<u16>, TransportError> {
        self.events.lock().push(Event::ReadStart(block.name.clone()));
        let delay = self.delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let failure = self.failing_blocks.lock().get(&block.name).cloned();
        let result = match failure {
            Some(error) => Err(error),
            None => {
                let registers = match block.function_code {
                    ReadFunction::ReadInput => self.input.lock(),
                    ReadFunction::ReadHolding => self.holding.lock(),
                };
                Ok((0..block.count)
                    .map(|i| {
                        registers
                            .get(&(block.start_address + i))
                            .copied()
                            .unwrap_or(0)
                    })
                    .collect())
            },
        };

        self.events.lock().push(Event::ReadEnd(block.name.clone()));
        result
    }

    async fn write_register(&self, address: u16, raw: u16) -> Result<(), TransportError> {
        self.events.lock().push(Event::WriteStart(address, raw));
        let delay = self.delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let failure = self.write_failure.lock().clone();
        let result = match failure {
            Some(error) => Err(error),
            None => {
                self.holding.lock().insert(address, raw);
                Ok(())
            },
        };

        self.events.lock().push(Event::WriteEnd(address, raw));
        result
    }
}

/// Device settings pointing nowhere; the mock ignores them
pub fn test_device(name: &str) -> DeviceConfig {
    DeviceConfig::new(name, "192.0.2.10")
}

/// Fill the mock with a plausible inverter state
pub fn seed_inverter(mock: &MockTransport) {
    mock.set_input(1308, 1); // flg Normal
    mock.set_input(1310, 412); // tmp 41.2
    mock.set_input(1358, 2301); // vac 230.1
    mock.set_input(1367, 5001); // fac 50.01
    mock.set_input(1370, 0xFFFF); // pac hi
    mock.set_input(1371, 0xF830); // pac lo: -2000
    mock.set_input(1607, 2); // bst Charging
    mock.set_input(1621, 87); // soc
    mock.set_input(1625, 0x0000);
    mock.set_input(1626, 123); // e_chg_today 12.3
    mock.set_holding(1103, 2); // work_mode Self-consumption
    mock.set_holding(1151, 1); // chflg Stop
    mock.set_holding(1153, 9000); // soc_max 90
    mock.set_holding(1154, 1000); // soc_min 10
}

// ============================================================================
// Modbus TCP simulator
// ============================================================================

/// Misbehaviours the simulator can be told to exhibit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Fault {
    #[default]
    None,
    /// Reply with one register fewer than requested
    ShortRead,
    /// Reply with a different transaction id
    WrongTransaction,
    /// Echo a different value on FC06
    BadEcho,
    /// Accept the connection and never answer
    Silent,
}

/// In-memory Modbus TCP server for transport tests
#[derive(Default)]
pub struct ModbusSimulator {
    unit_id: u8,
    holding_registers: RwLock<HashMap<u16, u16>>,
    input_registers: RwLock<HashMap<u16, u16>>,
    /// Addresses answered with exception 0x02
    illegal_addresses: RwLock<HashSet<u16>>,
    fault: RwLock<Fault>,
    connections: Mutex<usize>,
}

impl ModbusSimulator {
    pub fn new(unit_id: u8) -> Arc<Self> {
        Arc::new(Self {
            unit_id,
            ..Default::default()
        })
    }

    pub async fn set_input(&self, address: u16, values: &[u16]) {
        let mut input = self.input_registers.write().await;
        for (i, value) in values.iter().enumerate() {
            input.insert(address + i as u16, *value);
        }
    }

    pub async fn set_holding(&self, address: u16, values: &[u16]) {
        let mut holding = self.holding_registers.write().await;
        for (i, value) in values.iter().enumerate() {
            holding.insert(address + i as u16, *value);
        }
    }

    pub async fn holding(&self, address: u16) -> Option<u16> {
        self.holding_registers.read().await.get(&address).copied()
    }

    pub async fn mark_illegal(&self, address: u16) {
        self.illegal_addresses.write().await.insert(address);
    }

    pub async fn set_fault(&self, fault: Fault) {
        *self.fault.write().await = fault;
    }

    pub fn connections(&self) -> usize {
        *self.connections.lock()
    }

    /// Bind to an ephemeral local port and serve until the runtime stops
    pub async fn start(self: &Arc<Self>) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let local_addr = listener.local_addr()?;

        let sim = Arc::clone(self);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                *sim.connections.lock() += 1;
                let sim = Arc::clone(&sim);
                tokio::spawn(async move {
                    let _ = sim.handle_connection(stream).await;
                });
            }
        });

        Ok(local_addr)
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> std::io::Result<()> {
        loop {
            let mut header = [0u8; 7];
            if stream.read_exact(&mut header).await.is_err() {
                return Ok(());
            }
            let transaction_id = u16::from_be_bytes([header[0], header[1]]);
            let length = u16::from_be_bytes([header[4], header[5]]) as usize;
            let mut pdu = vec![0u8; length.saturating_sub(1)];
            stream.read_exact(&mut pdu).await?;

            let fault = *self.fault.read().await;
            if fault == Fault::Silent {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                return Ok(());
            }

            let response_pdu = self.process(&pdu, fault).await;
            let transaction_id = if fault == Fault::WrongTransaction {
                transaction_id.wrapping_add(100)
            } else {
                transaction_id
            };

            let mut frame = Vec::with_capacity(7 + response_pdu.len());
            frame.extend_from_slice(&transaction_id.to_be_bytes());
            frame.extend_from_slice(&[0x00, 0x00]);
            frame.extend_from_slice(&((response_pdu.len() + 1) as u16).to_be_bytes());
            frame.push(self.unit_id);
            frame.extend_from_slice(&response_pdu);
            stream.write_all(&frame).await?;
        }
    }

    async fn process(&self, pdu: &[u8], fault: Fault) -> Vec<u8> {
        if pdu.len() < 5 {
            return vec![pdu.first().copied().unwrap_or(0) | 0x80, 0x03];
        }
        let function_code = pdu[0];
        let address = u16::from_be_bytes([pdu[1], pdu[2]]);
        let operand = u16::from_be_bytes([pdu[3], pdu[4]]);

        let illegal = self.illegal_addresses.read().await;
        match function_code {
            0x03 | 0x04 => {
                if (address..address.saturating_add(operand)).any(|a| illegal.contains(&a)) {
                    return vec![function_code | 0x80, 0x02];
                }
                let registers = if function_code == 0x03 {
                    self.holding_registers.read().await
                } else {
                    self.input_registers.read().await
                };
                let count = if fault == Fault::ShortRead {
                    operand.saturating_sub(1)
                } else {
                    operand
                };
                let mut response = vec![function_code, (count * 2) as u8];
                for i in 0..count {
                    let value = registers.get(&(address + i)).copied().unwrap_or(0);
                    response.extend_from_slice(&value.to_be_bytes());
                }
                response
            },
            0x06 => {
                if illegal.contains(&address) {
                    return vec![0x86, 0x02];
                }
                self.holding_registers.write().await.insert(address, operand);
                let echoed = if fault == Fault::BadEcho {
                    operand.wrapping_add(1)
                } else {
                    operand
                };
                let mut response = vec![0x06];
                response.extend_from_slice(&address.to_be_bytes());
                response.extend_from_slice(&echoed.to_be_bytes());
                response
            },
            other => vec![other | 0x80, 0x01],
        }
    }
}
