// Host-side runtime for Dynamixel Protocol 2.0 servo buses
//
// Provides:
// - Wire codec and transaction engine for the half-duplex serial bus
// - A control loop multiplexing setpoints and telemetry over channels
// - Trapezoidal motion profiles and a trajectory executor feeding the loop

pub mod bus;
pub mod cancel;
pub mod config;
pub mod controller;
pub mod error;
pub mod messages;
pub mod trajectory;

pub use bus::{Driver, SerialIo, SyncReadData, SyncWriteData};
pub use cancel::CancelToken;
pub use controller::{Controller, ControllerConfig, MotorModel, OperatingMode};
pub use error::{DxlError, Result};
pub use messages::{Command, Feedback};
pub use trajectory::{clamp_to_u32, TrajectoryExecutor, TrajectoryPoint, TrapezoidalProfile};
