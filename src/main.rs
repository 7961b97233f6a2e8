// Position sweep test: rotates one servo across its range and back,
// advancing whenever feedback reports arrival at the current target.
//
// Usage: position_sweep --port /dev/ttyUSB0 --baud 1000000 --id 1

use clap::Parser;
use tokio::time::sleep;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use dxl2_runtime::config::DEFAULT_BAUD_RATE;
use dxl2_runtime::{Command, Controller, ControllerConfig, MotorModel};

use std::time::Duration;

/// How close (in encoder ticks) feedback must be to count as arrived
const ARRIVAL_THRESHOLD: u32 = 20;

const TARGETS: [u32; 5] = [0, 1024, 2048, 3072, 4095];

#[derive(Parser, Debug)]
#[command(about = "Sweep a servo across its position range and back")]
struct Args {
    /// Serial port device
    #[arg(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Bus baudrate
    #[arg(long, default_value_t = DEFAULT_BAUD_RATE)]
    baud: u32,

    /// Servo id to sweep
    #[arg(long, default_value_t = 1)]
    id: u8,
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
    info!(port = %args.port, baud = args.baud, id = args.id, "starting position sweep");

    let mut config = ControllerConfig::new(&args.port, args.baud, MotorModel::X_SERIES);
    config.motor_ids = vec![args.id];
    let mut ctrl = Controller::new(config);
    let mut feedback = ctrl.take_feedback().expect("fresh controller");

    if let Err(e) = ctrl.start() {
        error!(error = %e, "startup failed");
        return 1;
    }

    let commands = ctrl.commands();
    let mut idx = 0usize;
    let mut forward = true;
    let mut target = TARGETS[idx];

    info!(target, "moving");
    if commands
        .send(vec![Command { id: args.id, value: target }])
        .await
        .is_err()
    {
        error!("command channel closed");
        ctrl.stop();
        return 2;
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, stopping");
                ctrl.stop();
                return 130;
            }
            batch = feedback.recv() => {
                let Some(batch) = batch else {
                    error!("feedback channel closed");
                    ctrl.stop();
                    return 2;
                };
                let Some(fb) = batch.iter().find(|fb| fb.id == args.id) else {
                    continue;
                };
                if let Some(e) = &fb.error {
                    error!(error = %e, "feedback error");
                    continue;
                }

                if fb.value.abs_diff(target) < ARRIVAL_THRESHOLD {
                    info!(position = fb.value, requested = target, "arrived, moving on");

                    if forward {
                        idx += 1;
                        if idx >= TARGETS.len() {
                            idx = TARGETS.len() - 2;
                            forward = false;
                        }
                    } else if idx == 0 {
                        idx = 1;
                        forward = true;
                    } else {
                        idx -= 1;
                    }
                    target = TARGETS[idx];

                    // Brief pause so the stop is visible before the next move
                    sleep(Duration::from_millis(500)).await;
                    info!(target, "moving");
                    if commands
                        .send(vec![Command { id: args.id, value: target }])
                        .await
                        .is_err()
                    {
                        error!("command channel closed");
                        ctrl.stop();
                        return 2;
                    }
                }
            }
        }
    }
}
