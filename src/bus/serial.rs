// Serial port setup for the half-duplex servo bus

use std::io;

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use tracing::debug;

use crate::config::SERIAL_POLL_TIMEOUT;
use crate::error::Result;

/// What the transaction engine needs from a port: byte-oriented blocking
/// reads with a short OS timeout and writes that return once the OS has
/// queued the bytes. Blanket-implemented so both real ports and in-memory
/// mocks qualify.
pub trait SerialIo: io::Read + io::Write + Send {}

impl<T: io::Read + io::Write + Send + ?Sized> SerialIo for T {}

/// Open and configure a bus port: 8N1, raw, no flow control, exclusive,
/// with the receive and transmit FIFOs purged.
///
/// The short port timeout is deliberate. The driver enforces the real
/// transaction deadline itself and treats an OS timeout as "no bytes yet".
pub fn open(path: &str, baud_rate: u32) -> Result<Box<dyn SerialPort>> {
    let port = serialport::new(path, baud_rate)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .timeout(SERIAL_POLL_TIMEOUT)
        .open()?;

    port.clear(ClearBuffer::All)?;
    debug!(path, baud_rate, "serial port configured");
    Ok(port)
}
