// Trapezoidal trajectory test: plans a profile, previews it, then streams
// it to one servo in position mode, optionally looping back and forth.
//
// Usage: trajectory_run --port /dev/ttyUSB0 --start 0 --target 2048

use clap::Parser;
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use dxl2_runtime::config::DEFAULT_BAUD_RATE;
use dxl2_runtime::{
    Command, Controller, ControllerConfig, DxlError, MotorModel, OperatingMode,
    TrajectoryExecutor, TrapezoidalProfile,
};

use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(about = "Run a trapezoidal position trajectory on one servo")]
struct Args {
    /// Serial port device
    #[arg(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Bus baudrate
    #[arg(long, default_value_t = DEFAULT_BAUD_RATE)]
    baud: u32,

    /// Servo id
    #[arg(long, default_value_t = 1)]
    id: u8,

    /// Start position (0-4095)
    #[arg(long, default_value_t = 0.0)]
    start: f64,

    /// Target position (0-4095)
    #[arg(long, default_value_t = 2048.0)]
    target: f64,

    /// Max velocity in units/s
    #[arg(long, default_value_t = 500.0)]
    vel: f64,

    /// Acceleration in units/s^2
    #[arg(long, default_value_t = 2000.0)]
    accel: f64,

    /// Command rate in Hz
    #[arg(long, default_value_t = 100.0)]
    rate: f64,

    /// Run back and forth until interrupted
    #[arg(long, default_value_t = false)]
    r#loop: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let args = Args::parse();
    std::process::exit(run(args).await);
}

async fn run(args: Args) -> i32 {
    let profile = match TrapezoidalProfile::new(args.start, args.target, args.vel, args.accel) {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "invalid profile parameters");
            return 1;
        }
    };

    info!(
        duration_s = format!("{:.3}", profile.total_time()),
        cruise_vel = format!("{:.1}", profile.cruise_velocity()),
        "profile planned"
    );
    for point in profile.generate(args.rate).iter().take(10) {
        info!(
            "  t={:.3}s pos={:.1} vel={:.1} acc={:.1}",
            point.time, point.position, point.velocity, point.acceleration
        );
    }

    let mut config = ControllerConfig::new(&args.port, args.baud, MotorModel::X_SERIES);
    config.motor_ids = vec![args.id];
    let mut ctrl = Controller::new(config);
    let mut feedback = ctrl.take_feedback().expect("fresh controller");

    if let Err(e) = ctrl.start() {
        error!(error = %e, "startup failed");
        return 1;
    }

    if let Err(e) = ctrl.set_operating_mode(args.id, OperatingMode::Position) {
        error!(error = %e, "failed to set position mode");
        ctrl.stop();
        return 2;
    }

    // Wire Ctrl-C into the controller's ambient cancellation
    let cancel = ctrl.cancel_token();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        }
    });

    // Print positions as they stream back
    tokio::spawn(async move {
        let started = Instant::now();
        while let Some(batch) = feedback.recv().await {
            for fb in &batch {
                match &fb.error {
                    None => info!(
                        "t={:.2}s id={} position={}",
                        started.elapsed().as_secs_f64(),
                        fb.id,
                        fb.value
                    ),
                    Some(e) => warn!(id = fb.id, error = %e, "feedback error"),
                }
            }
        }
    });

    // Move to the start position before the profile begins
    info!(position = args.start, "moving to start");
    if ctrl
        .commands()
        .send(vec![Command {
            id: args.id,
            value: dxl2_runtime::clamp_to_u32(args.start),
        }])
        .await
        .is_err()
    {
        error!("command channel closed");
        ctrl.stop();
        return 2;
    }
    sleep(Duration::from_secs(2)).await;

    let executor = TrajectoryExecutor::new(&ctrl, args.id);
    let mut forward = true;
    let mut iteration = 0u32;

    loop {
        iteration += 1;
        let (from, to) = if forward {
            (args.start, args.target)
        } else {
            (args.target, args.start)
        };
        let profile = match TrapezoidalProfile::new(from, to, args.vel, args.accel) {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "profile error");
                ctrl.stop();
                return 2;
            }
        };

        info!(
            iteration,
            from, to,
            duration_s = format!("{:.3}", profile.total_time()),
            "executing trajectory"
        );
        match executor.execute_with_cancel(&cancel, &profile, args.rate).await {
            Ok(()) => info!("trajectory complete"),
            Err(DxlError::Cancelled) => {
                info!("interrupted, stopping");
                ctrl.stop();
                return 130;
            }
            Err(e) => {
                error!(error = %e, "trajectory failed");
                ctrl.stop();
                return 2;
            }
        }

        if !args.r#loop {
            break;
        }
        forward = !forward;
        sleep(Duration::from_millis(500)).await;
    }

    ctrl.stop();
    0
}
