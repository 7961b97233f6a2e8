// Trapezoidal motion profiles and the executor that streams them into the
// controller's command channel.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::cancel::CancelToken;
use crate::controller::Controller;
use crate::error::{DxlError, Result};
use crate::messages::Command;

/// Closed-form trapezoidal velocity profile: constant acceleration up to a
/// cruise velocity, constant cruise, constant deceleration. Falls back to a
/// triangular profile when the distance is too short to reach `max_velocity`.
/// Immutable once constructed.
#[derive(Debug, Clone)]
pub struct TrapezoidalProfile {
    start: f64,
    target: f64,
    max_velocity: f64,
    acceleration: f64,

    distance: f64,
    direction: f64,
    accel_time: f64,
    cruise_time: f64,
    decel_time: f64,
    cruise_velocity: f64,
    total_time: f64,
}

/// One sample of a profile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrajectoryPoint {
    /// Seconds from the start of motion
    pub time: f64,
    pub position: f64,
    pub velocity: f64,
    pub acceleration: f64,
}

impl TrapezoidalProfile {
    /// Plan a move from `start` to `target` in motor units. `max_velocity`
    /// is units/s, `acceleration` units/s^2; both must be positive.
    pub fn new(start: f64, target: f64, max_velocity: f64, acceleration: f64) -> Result<Self> {
        if max_velocity <= 0.0 {
            return Err(DxlError::InvalidArgument(
                "max velocity must be positive".into(),
            ));
        }
        if acceleration <= 0.0 {
            return Err(DxlError::InvalidArgument(
                "acceleration must be positive".into(),
            ));
        }

        let distance = (target - start).abs();
        let direction = if target >= start { 1.0 } else { -1.0 };

        if distance == 0.0 {
            return Ok(Self {
                start,
                target,
                max_velocity,
                acceleration,
                distance,
                direction: 0.0,
                accel_time: 0.0,
                cruise_time: 0.0,
                decel_time: 0.0,
                cruise_velocity: 0.0,
                total_time: 0.0,
            });
        }

        // Distance consumed by a symmetric ramp up to max velocity and back
        let ramp_time = max_velocity / acceleration;
        let ramp_distance = max_velocity * ramp_time;

        let (cruise_velocity, accel_time, cruise_time) = if ramp_distance > distance {
            // Triangular: peak velocity is set by the distance
            let peak = (acceleration * distance).sqrt();
            (peak, peak / acceleration, 0.0)
        } else {
            (
                max_velocity,
                ramp_time,
                (distance - ramp_distance) / max_velocity,
            )
        };
        let decel_time = accel_time;

        Ok(Self {
            start,
            target,
            max_velocity,
            acceleration,
            distance,
            direction,
            accel_time,
            cruise_time,
            decel_time,
            cruise_velocity,
            total_time: accel_time + cruise_time + decel_time,
        })
    }

    pub fn start(&self) -> f64 {
        self.start
    }

    pub fn target(&self) -> f64 {
        self.target
    }

    pub fn cruise_velocity(&self) -> f64 {
        self.cruise_velocity
    }

    pub fn cruise_time(&self) -> f64 {
        self.cruise_time
    }

    /// Total motion time in seconds
    pub fn total_time(&self) -> f64 {
        self.total_time
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.total_time)
    }

    /// Sample the profile at `t` seconds from the start of motion. Clamps to
    /// the endpoints outside `[0, total_time]`.
    pub fn sample(&self, t: f64) -> TrajectoryPoint {
        if t <= 0.0 || self.total_time == 0.0 {
            return TrajectoryPoint {
                time: 0.0,
                position: self.start,
                velocity: 0.0,
                acceleration: 0.0,
            };
        }
        if t >= self.total_time {
            return TrajectoryPoint {
                time: self.total_time,
                position: self.target,
                velocity: 0.0,
                acceleration: 0.0,
            };
        }

        let accel_distance = 0.5 * self.acceleration * self.accel_time * self.accel_time;
        let (pos, vel, acc) = if t <= self.accel_time {
            (
                0.5 * self.acceleration * t * t,
                self.acceleration * t,
                self.acceleration,
            )
        } else if t <= self.accel_time + self.cruise_time {
            let tau = t - self.accel_time;
            (
                accel_distance + self.cruise_velocity * tau,
                self.cruise_velocity,
                0.0,
            )
        } else {
            let tau = t - self.accel_time - self.cruise_time;
            let cruise_end = accel_distance + self.cruise_velocity * self.cruise_time;
            (
                cruise_end + self.cruise_velocity * tau - 0.5 * self.acceleration * tau * tau,
                self.cruise_velocity - self.acceleration * tau,
                -self.acceleration,
            )
        };

        TrajectoryPoint {
            time: t,
            position: self.start + self.direction * pos,
            velocity: self.direction * vel,
            acceleration: self.direction * acc,
        }
    }

    /// Sample the whole profile at `rate_hz`. The last sample is clamped to
    /// the total time so the trajectory always ends exactly on target. A
    /// zero-distance profile yields a single sample at the start.
    pub fn generate(&self, rate_hz: f64) -> Vec<TrajectoryPoint> {
        if self.total_time == 0.0 {
            return vec![self.sample(0.0)];
        }

        let dt = 1.0 / rate_hz;
        let count = (self.total_time * rate_hz).ceil() as usize + 1;
        (0..count)
            .map(|i| self.sample((i as f64 * dt).min(self.total_time)))
            .collect()
    }
}

/// Convert a profile position to a register value: NaN and negatives clamp
/// to 0, values past the register range clamp to `u32::MAX`.
pub fn clamp_to_u32(x: f64) -> u32 {
    if x.is_nan() || x <= 0.0 {
        0
    } else if x >= u32::MAX as f64 {
        u32::MAX
    } else {
        x as u32
    }
}

/// Streams profile samples into a controller's command channel at a fixed
/// rate. Cheap to clone; each clone shares the controller's ambient
/// cancellation token.
#[derive(Clone)]
pub struct TrajectoryExecutor {
    commands: mpsc::Sender<Vec<Command>>,
    cancel: CancelToken,
    motor_id: u8,
}

impl TrajectoryExecutor {
    pub fn new(controller: &Controller, motor_id: u8) -> Self {
        Self {
            commands: controller.commands(),
            cancel: controller.cancel_token(),
            motor_id,
        }
    }

    fn tick_period(rate_hz: f64) -> Result<Duration> {
        if rate_hz <= 0.0 {
            return Err(DxlError::InvalidArgument(
                "update rate must be positive".into(),
            ));
        }
        Ok(Duration::from_nanos((1e9 / rate_hz) as u64))
    }

    fn command_for(&self, point: &TrajectoryPoint) -> Vec<Command> {
        vec![Command {
            id: self.motor_id,
            value: clamp_to_u32(point.position),
        }]
    }

    /// Run the trajectory to completion, pushing one position command per
    /// tick. Returns once the last sample has been pushed; the servo may
    /// still be settling at that point.
    pub async fn execute(&self, profile: &TrapezoidalProfile, rate_hz: f64) -> Result<()> {
        let period = Self::tick_period(rate_hz)?;
        let points = profile.generate(rate_hz);

        let mut ticker = tokio::time::interval(period);
        ticker.tick().await; // first tick resolves immediately

        let last = points.len() - 1;
        for (i, point) in points.iter().enumerate() {
            self.commands
                .send(self.command_for(point))
                .await
                .map_err(|_| DxlError::Cancelled)?;
            if i < last {
                ticker.tick().await;
            }
        }
        Ok(())
    }

    /// Like [`execute`](Self::execute), but every send and every tick races
    /// the cancellation token, so a cancel aborts mid-trajectory without
    /// draining the remaining samples.
    pub async fn execute_with_cancel(
        &self,
        cancel: &CancelToken,
        profile: &TrapezoidalProfile,
        rate_hz: f64,
    ) -> Result<()> {
        let period = Self::tick_period(rate_hz)?;
        let points = profile.generate(rate_hz);

        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;

        let last = points.len() - 1;
        for (i, point) in points.iter().enumerate() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(DxlError::Cancelled),
                sent = self.commands.send(self.command_for(point)) => {
                    sent.map_err(|_| DxlError::Cancelled)?;
                }
            }
            if i < last {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(DxlError::Cancelled),
                    _ = ticker.tick() => {}
                }
            }
        }
        Ok(())
    }

    /// Spawn the trajectory on the runtime. The returned channel yields the
    /// final error, or closes cleanly on success. This variant never blocks
    /// on the command channel: a full channel is reported as
    /// [`DxlError::CommandChannelFull`]. The controller's ambient
    /// cancellation aborts it.
    pub fn execute_async(
        &self,
        profile: TrapezoidalProfile,
        rate_hz: f64,
    ) -> mpsc::Receiver<DxlError> {
        let (err_tx, err_rx) = mpsc::channel(1);
        let executor = self.clone();

        tokio::spawn(async move {
            if let Err(e) = executor.run_non_blocking(&profile, rate_hz).await {
                let _ = err_tx.send(e).await;
            }
        });

        err_rx
    }

    async fn run_non_blocking(&self, profile: &TrapezoidalProfile, rate_hz: f64) -> Result<()> {
        let period = Self::tick_period(rate_hz)?;
        let points = profile.generate(rate_hz);

        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;

        let last = points.len() - 1;
        for (i, point) in points.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(DxlError::Cancelled);
            }
            match self.commands.try_send(self.command_for(point)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => return Err(DxlError::CommandChannelFull),
                Err(TrySendError::Closed(_)) => return Err(DxlError::Cancelled),
            }
            if i < last {
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(DxlError::Cancelled),
                    _ = ticker.tick() => {}
                }
            }
        }
        Ok(())
    }
}
