// Dynamixel Protocol 2.0 bus stack
//
// Provides:
// - Wire codec (framing, byte stuffing, CRC-16/IBM)
// - Serial port setup for the half-duplex bus
// - Transaction engine with resynchronization and Sync Read/Write

mod driver;
pub mod protocol;
pub mod serial;

pub use driver::{Driver, SyncReadData, SyncWriteData};
pub use serial::SerialIo;
