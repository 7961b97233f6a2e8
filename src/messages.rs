// Message types crossing the controller's channels

use crate::error::DxlError;

/// A write command for one servo. The register it lands in is the
/// controller's active goal address, so the same type carries position,
/// velocity or PWM setpoints depending on the operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub id: u8,
    pub value: u32,
}

/// One telemetry sample for one servo, taken each loop tick at the present
/// position register. Carries its own error so a dead servo in a batch does
/// not hide readings from the live ones.
#[derive(Debug)]
pub struct Feedback {
    pub id: u8,
    pub value: u32,
    pub error: Option<DxlError>,
}

impl Feedback {
    pub fn ok(id: u8, value: u32) -> Self {
        Self {
            id,
            value,
            error: None,
        }
    }

    pub fn err(id: u8, error: DxlError) -> Self {
        Self {
            id,
            value: 0,
            error: Some(error),
        }
    }
}
