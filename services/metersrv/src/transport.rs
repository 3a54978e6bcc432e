//! Register transport
//!
//! The acquisition loop only needs one primitive from the wire: read a run
//! of holding registers. [`ModbusRtuTransport`] provides it over RS-485 with
//! `tokio-modbus`; [`MemoryTransport`] provides it from an in-memory register
//! image for tests and dry runs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_modbus::prelude::*;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info};

use crate::config::{Parity, SerialConfig};
use crate::error::{MeterSrvError, TransportError};

/// Word-level read access to one meter
#[async_trait]
pub trait Transport: Send {
    /// Read `count` holding registers starting at 0-based `index`
    async fn read_registers(&mut self, index: u16, count: u16)
        -> Result<Vec<u16>, TransportError>;

    /// Human readable endpoint, used in logs
    fn describe(&self) -> String;
}

// ============================================================================
// Serial discovery
// ============================================================================

/// Pick the first USB serial adapter or Windows COM port
pub fn pick_serial_port<I, S>(candidates: I) -> Option<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    candidates
        .into_iter()
        .find(|name| {
            let name = name.as_ref();
            name.starts_with("/dev/ttyUSB") || name.starts_with("COM")
        })
        .map(|name| name.as_ref().to_string())
}

/// Find the serial port to use, honoring an explicit configuration
pub fn discover_serial_port(configured: Option<&str>) -> Result<String, MeterSrvError> {
    if let Some(port) = configured.filter(|p| !p.trim().is_empty()) {
        return Ok(port.to_string());
    }

    let ports = tokio_serial::available_ports()
        .map_err(|e| MeterSrvError::device_not_found(format!("cannot list serial ports: {}", e)))?;
    let names: Vec<String> = ports.into_iter().map(|p| p.port_name).collect();
    debug!("Serial ports: {:?}", names);

    pick_serial_port(&names).ok_or_else(|| {
        MeterSrvError::device_not_found("no /dev/ttyUSB* or COM* serial device found")
    })
}

// ============================================================================
// Modbus RTU transport
// ============================================================================

/// Modbus RTU client on a serial line (function 0x03)
pub struct ModbusRtuTransport {
    ctx: client::Context,
    port: String,
    slave_id: u8,
    timeout: Duration,
}

impl ModbusRtuTransport {
    /// Open the serial port and attach to one slave
    pub fn open(port: &str, serial: &SerialConfig, slave_id: u8) -> Result<Self, MeterSrvError> {
        let data_bits = match serial.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };
        let stop_bits = match serial.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };
        let parity = match serial.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        };

        let stream = tokio_serial::new(port, serial.baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .flow_control(tokio_serial::FlowControl::None)
            .timeout(serial.timeout)
            .open_native_async()
            .map_err(|e| MeterSrvError::device_not_found(format!("{}: {}", port, e)))?;

        let ctx = rtu::attach_slave(stream, Slave(slave_id));
        info!(
            "Modbus RTU on {} @ {} baud, slave {}",
            port, serial.baud_rate, slave_id
        );

        Ok(Self {
            ctx,
            port: port.to_string(),
            slave_id,
            timeout: serial.timeout,
        })
    }
}

#[async_trait]
impl Transport for ModbusRtuTransport {
    async fn read_registers(
        &mut self,
        index: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let request = self.ctx.read_holding_registers(index, count);
        let words = match tokio::time::timeout(self.timeout, request).await {
            Err(_) => return Err(TransportError::Timeout(self.timeout)),
            Ok(Err(e)) => return Err(TransportError::Io(e.to_string())),
            Ok(Ok(Err(code))) => return Err(TransportError::Exception(format!("{:?}", code))),
            Ok(Ok(Ok(words))) => words,
        };

        if words.len() < usize::from(count) {
            return Err(TransportError::ShortResponse {
                expected: usize::from(count),
                got: words.len(),
            });
        }
        Ok(words)
    }

    fn describe(&self) -> String {
        format!("modbus-rtu://{}#{}", self.port, self.slave_id)
    }
}

// ============================================================================
// In-memory transport
// ============================================================================

#[derive(Debug, Default)]
struct MemoryState {
    registers: HashMap<u16, u16>,
    failures: HashMap<u16, TransportError>,
    requests: Vec<(u16, u16)>,
    latency: Duration,
}

/// Register image served from memory
///
/// Clones share state, so a test can keep a handle after moving the
/// transport into a scheduler. Setter addresses are 1-based datasheet
/// addresses, like the register maps.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_words(&self, address: u16, words: &[u16]) -> &Self {
        let mut state = self.state.lock();
        let start = address.saturating_sub(1);
        for (offset, word) in words.iter().enumerate() {
            state.registers.insert(start + offset as u16, *word);
        }
        self
    }

    pub fn set_f32(&self, address: u16, value: f32) -> &Self {
        let bits = value.to_bits();
        self.set_words(address, &[(bits >> 16) as u16, bits as u16])
    }

    pub fn set_u32(&self, address: u16, value: u32) -> &Self {
        self.set_words(address, &[(value >> 16) as u16, value as u16])
    }

    pub fn set_text(&self, address: u16, text: &str, byte_len: usize) -> &Self {
        let mut bytes = text.as_bytes().to_vec();
        bytes.resize(byte_len + byte_len % 2, 0);
        let words: Vec<u16> = bytes
            .chunks(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        self.set_words(address, &words)
    }

    /// Make every read touching `address` fail with `error`
    pub fn fail_at(&self, address: u16, error: TransportError) -> &Self {
        self.state
            .lock()
            .failures
            .insert(address.saturating_sub(1), error);
        self
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// Simulated per-request latency
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    /// Requests seen so far as (0-based index, count)
    pub fn requests(&self) -> Vec<(u16, u16)> {
        self.state.lock().requests.clone()
    }

    fn serve(&self, index: u16, count: u16) -> Result<Vec<u16>, TransportError> {
        let mut state = self.state.lock();
        state.requests.push((index, count));

        let failure = (0..count)
            .find_map(|offset| state.failures.get(&index.wrapping_add(offset)))
            .cloned();
        if let Some(err) = failure {
            return Err(err);
        }

        let mut words = Vec::with_capacity(usize::from(count));
        for offset in 0..count {
            let register = index.wrapping_add(offset);
            match state.registers.get(&register) {
                Some(word) => words.push(*word),
                None => {
                    return Err(TransportError::Exception(format!(
                        "IllegalDataAddress ({})",
                        register
                    )))
                },
            }
        }
        Ok(words)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn read_registers(
        &mut self,
        index: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let latency = self.state.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.serve(index, count)
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}
