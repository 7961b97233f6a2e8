// Transaction engine: framed request/response over the half-duplex bus
//
// Owns the serial port exclusively. One transfer is always one write
// followed by one (or, for SyncRead, several) framed reads; nothing
// interleaves because every entry point takes &mut self.

use std::collections::HashMap;
use std::io;
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use super::protocol::{
    self, Instruction, BROADCAST_ID, HEADER, MIN_HEADER_SIZE,
};
use super::serial::SerialIo;
use crate::config::{DEFAULT_TRANSACTION_TIMEOUT, READ_CHUNK_SIZE, SYNC_WRITE_GAP};
use crate::error::{DxlError, Result};

/// Per-servo payload for a SyncWrite broadcast.
#[derive(Debug, Clone)]
pub struct SyncWriteData {
    pub id: u8,
    pub data: Vec<u8>,
}

/// Per-servo outcome of a SyncRead. Outcomes are independent: one servo
/// timing out does not taint the others.
#[derive(Debug)]
pub struct SyncReadData {
    pub id: u8,
    pub data: Result<Vec<u8>>,
}

pub struct Driver {
    port: Box<dyn SerialIo>,
    timeout: Duration,
    // Bytes read off the wire but not yet consumed. Trailing bytes of one
    // response stay here and serve the next read_packet call.
    rx_buf: Vec<u8>,
}

/// Index of the first complete `FF FF FD` triple, if any. A partial match
/// (a lone `FF FF` at the tail) is simply not found yet; more bytes may
/// complete it on the next pass.
fn find_packet_start(data: &[u8]) -> Option<usize> {
    data.windows(HEADER.len()).position(|w| w == HEADER)
}

impl Driver {
    pub fn new<P: SerialIo + 'static>(port: P) -> Self {
        Self::with_timeout(port, DEFAULT_TRANSACTION_TIMEOUT)
    }

    pub fn with_timeout<P: SerialIo + 'static>(port: P, timeout: Duration) -> Self {
        Self {
            port: Box::new(port),
            timeout,
            rx_buf: Vec::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Slice one complete packet out of the receive buffer, discarding any
    /// noise before its header and retaining everything after it.
    fn try_extract_packet(&mut self) -> Option<Vec<u8>> {
        let start = find_packet_start(&self.rx_buf)?;
        if self.rx_buf.len() < start + MIN_HEADER_SIZE {
            return None;
        }
        let body_len =
            u16::from_le_bytes([self.rx_buf[start + 5], self.rx_buf[start + 6]]) as usize;
        let total = MIN_HEADER_SIZE + body_len;
        if self.rx_buf.len() < start + total {
            return None;
        }
        let pkt = self.rx_buf[start..start + total].to_vec();
        self.rx_buf.drain(..start + total);
        Some(pkt)
    }

    /// Read until one complete packet can be sliced out of the stream or the
    /// deadline passes. OS-level read timeouts are polls, not failures.
    fn read_packet(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut chunk = [0u8; READ_CHUNK_SIZE];

        loop {
            if let Some(pkt) = self.try_extract_packet() {
                return Ok(pkt);
            }
            if Instant::now() >= deadline {
                return Err(DxlError::ReadTimeout {
                    buffered: self.rx_buf.clone(),
                });
            }
            match self.port.read(&mut chunk) {
                Ok(0) => {}
                Ok(n) => self.rx_buf.extend_from_slice(&chunk[..n]),
                Err(e)
                    if e.kind() == io::ErrorKind::TimedOut
                        || e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(DxlError::Io(e)),
            }
        }
    }

    /// Send a packet and wait for the single response frame.
    pub fn transfer(&mut self, tx: &[u8]) -> Result<Vec<u8>> {
        self.port.write_all(tx)?;
        self.port.flush()?;
        self.read_packet(self.timeout)
    }

    /// Round-trip one instruction and parse the status, folding a non-zero
    /// servo error byte into the result.
    fn transact(&mut self, id: u8, inst: Instruction, params: &[u8]) -> Result<protocol::StatusPacket> {
        let tx = protocol::build_packet(id, inst, params)?;
        let rx = self.transfer(&tx)?;
        let status = protocol::parse_status(&rx)?;
        if status.error != 0 {
            return Err(DxlError::MotorError {
                id: status.id,
                code: status.error,
            });
        }
        Ok(status)
    }

    /// Ping one servo, returning its model number.
    pub fn ping(&mut self, id: u8) -> Result<u16> {
        let status = self.transact(id, Instruction::Ping, &[])?;
        // Payload is model_l, model_h, firmware version; the firmware byte
        // is not interesting here.
        match status.params.get(..2) {
            Some(model) => Ok(u16::from_le_bytes([model[0], model[1]])),
            None => Err(DxlError::InvalidResponse {
                id,
                reason: format!("ping payload too short: {} bytes", status.params.len()),
            }),
        }
    }

    /// Write `data` to the control table at `addr`.
    pub fn write(&mut self, id: u8, addr: u16, data: &[u8]) -> Result<()> {
        let mut params = Vec::with_capacity(2 + data.len());
        params.extend_from_slice(&addr.to_le_bytes());
        params.extend_from_slice(data);
        debug!(id, addr, len = data.len(), "write");
        self.transact(id, Instruction::Write, &params)?;
        Ok(())
    }

    /// Read `len` bytes from the control table at `addr`. The payload length
    /// is returned as-is; callers validate it.
    pub fn read(&mut self, id: u8, addr: u16, len: u16) -> Result<Vec<u8>> {
        let mut params = [0u8; 4];
        params[..2].copy_from_slice(&addr.to_le_bytes());
        params[2..].copy_from_slice(&len.to_le_bytes());
        let status = self.transact(id, Instruction::Read, &params)?;
        Ok(status.params)
    }

    pub fn write_u32(&mut self, id: u8, addr: u16, value: u32) -> Result<()> {
        self.write(id, addr, &value.to_le_bytes())
    }

    pub fn read_u32(&mut self, id: u8, addr: u16) -> Result<u32> {
        let data = self.read(id, addr, 4)?;
        let bytes: [u8; 4] = data
            .as_slice()
            .try_into()
            .map_err(|_| DxlError::LengthMismatch {
                expected: 4,
                actual: data.len(),
            })?;
        Ok(u32::from_le_bytes(bytes))
    }

    /// Write the same register on several servos with one broadcast frame.
    /// No status responses come back; a short gap lets the OS flush the
    /// frame before the next transaction starts.
    pub fn sync_write(&mut self, addr: u16, data_len: u16, motors: &[SyncWriteData]) -> Result<()> {
        if motors.is_empty() {
            return Err(DxlError::InvalidArgument("no motors provided".into()));
        }
        for m in motors {
            if m.data.len() != data_len as usize {
                return Err(DxlError::InvalidArgument(format!(
                    "motor {}: data length mismatch (expected {}, got {})",
                    m.id,
                    data_len,
                    m.data.len()
                )));
            }
        }

        let mut params = Vec::with_capacity(4 + motors.len() * (1 + data_len as usize));
        params.extend_from_slice(&addr.to_le_bytes());
        params.extend_from_slice(&data_len.to_le_bytes());
        for m in motors {
            params.push(m.id);
            params.extend_from_slice(&m.data);
        }

        let tx = protocol::build_packet(BROADCAST_ID, Instruction::SyncWrite, &params)?;
        self.port.write_all(&tx)?;
        self.port.flush()?;
        thread::sleep(SYNC_WRITE_GAP);
        Ok(())
    }

    /// SyncWrite of 4-byte little-endian values.
    pub fn sync_write_u32(&mut self, addr: u16, values: &[(u8, u32)]) -> Result<()> {
        let motors: Vec<SyncWriteData> = values
            .iter()
            .map(|&(id, value)| SyncWriteData {
                id,
                data: value.to_le_bytes().to_vec(),
            })
            .collect();
        self.sync_write(addr, 4, &motors)
    }

    /// Read the same register from several servos: one broadcast, then one
    /// status response per listed id, collected in list order. A timeout or
    /// parse failure for one id leaves the rest untouched.
    pub fn sync_read(&mut self, addr: u16, data_len: u16, ids: &[u8]) -> Result<Vec<SyncReadData>> {
        if ids.is_empty() {
            return Err(DxlError::InvalidArgument("no motor ids provided".into()));
        }

        let mut params = Vec::with_capacity(4 + ids.len());
        params.extend_from_slice(&addr.to_le_bytes());
        params.extend_from_slice(&data_len.to_le_bytes());
        params.extend_from_slice(ids);

        let tx = protocol::build_packet(BROADCAST_ID, Instruction::SyncRead, &params)?;
        self.port.write_all(&tx)?;
        self.port.flush()?;

        let mut results = Vec::with_capacity(ids.len());
        for &id in ids {
            let data = self
                .read_packet(self.timeout)
                .map_err(|e| match e {
                    DxlError::ReadTimeout { .. } => DxlError::NoResponse { id },
                    other => other,
                })
                .and_then(|rx| {
                    let status = protocol::parse_status(&rx)?;
                    if status.error != 0 {
                        return Err(DxlError::MotorError {
                            id: status.id,
                            code: status.error,
                        });
                    }
                    Ok(status.params)
                });
            results.push(SyncReadData { id, data });
        }
        Ok(results)
    }

    /// SyncRead of 4-byte values. Servos that failed are dropped from the
    /// map; the call itself fails only when every servo failed.
    pub fn sync_read_u32(&mut self, addr: u16, ids: &[u8]) -> Result<HashMap<u8, u32>> {
        let results = self.sync_read(addr, 4, ids)?;

        let mut values = HashMap::new();
        let mut last_err = None;
        for entry in results {
            match entry.data {
                Ok(data) => match <[u8; 4]>::try_from(data.as_slice()) {
                    Ok(bytes) => {
                        values.insert(entry.id, u32::from_le_bytes(bytes));
                    }
                    Err(_) => {
                        last_err = Some(DxlError::LengthMismatch {
                            expected: 4,
                            actual: data.len(),
                        });
                    }
                },
                Err(e) => last_err = Some(e),
            }
        }

        match (values.is_empty(), last_err) {
            (true, Some(err)) => Err(err),
            _ => Ok(values),
        }
    }
}
