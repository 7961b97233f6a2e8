// Bus timing and channel tuning constants
use std::time::Duration;

/// Default baudrate for X-series servos as shipped
pub const DEFAULT_BAUD_RATE: u32 = 1_000_000;

/// Default deadline for one request/response transaction
pub const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_millis(100);

/// OS-level serial read/write timeout. Short so the driver's deadline loop
/// polls the port instead of blocking indefinitely.
pub const SERIAL_POLL_TIMEOUT: Duration = Duration::from_millis(10);

/// Chunk size for draining the serial receive buffer
pub const READ_CHUNK_SIZE: usize = 1024;

/// Gap after a SyncWrite broadcast so OS buffers flush before the next frame
pub const SYNC_WRITE_GAP: Duration = Duration::from_millis(1);

/// Command channel capacity. Single slot: the loop drains it every tick and
/// the freshest setpoint is the one that matters.
pub const COMMAND_CHANNEL_CAPACITY: usize = 1;

/// Feedback channel capacity. Sends are non-blocking and drop on full.
pub const FEEDBACK_CHANNEL_CAPACITY: usize = 100;

/// Settle time after writing the operating mode register (EEPROM write plus
/// mode stabilization inside the servo).
pub const EEPROM_SETTLE_DELAY: Duration = Duration::from_millis(1000);

/// Settle time after a torque enable write before reading it back
pub const TORQUE_SETTLE_DELAY: Duration = Duration::from_millis(50);
