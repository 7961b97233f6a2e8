// Error types for the Dynamixel bus stack

use thiserror::Error;

/// Error type covering the whole stack, from serial I/O up to the
/// trajectory executor.
#[derive(Debug, Error)]
pub enum DxlError {
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("serial i/o failed: {0}")]
    Io(#[from] std::io::Error),

    /// No complete packet arrived before the transaction deadline. Carries
    /// whatever bytes were sitting in the receive buffer for diagnosis.
    #[error("read timeout, buffered: {buffered:02x?}")]
    ReadTimeout { buffered: Vec<u8> },

    #[error("packet too short: {len} bytes")]
    PacketTooShort { len: usize },

    #[error("invalid packet header")]
    InvalidHeader,

    #[error("length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("crc mismatch: expected {expected:04X}, got {actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },

    #[error("not a status packet: instruction {inst:#04X}")]
    NotStatus { inst: u8 },

    /// The servo answered with a non-zero error byte in its status packet.
    /// Bit 7 is the hardware alert latch, the low bits the processing error.
    #[error("motor {id} returned error status {code:#04X}")]
    MotorError { id: u8, code: u8 },

    #[error("invalid response from motor {id}: {reason}")]
    InvalidResponse { id: u8, reason: String },

    #[error("no response from motor {id}")]
    NoResponse { id: u8 },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("command channel full")]
    CommandChannelFull,

    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, DxlError>;
