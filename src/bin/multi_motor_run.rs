// Multi-servo test: drives several servos through staggered position
// targets with one SyncWrite per batch and samples them all with SyncRead.
//
// Usage: multi_motor_run --port /dev/ttyUSB0 --ids 1,2,3

use clap::Parser;
use tokio::time::interval;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use dxl2_runtime::config::DEFAULT_BAUD_RATE;
use dxl2_runtime::{Command, Controller, ControllerConfig, MotorModel, OperatingMode};

use std::time::Duration;

const TARGETS: [u32; 3] = [2048, 3072, 1024];

#[derive(Parser, Debug)]
#[command(about = "Cycle several servos through positions using sync read/write")]
struct Args {
    /// Serial port device
    #[arg(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Bus baudrate
    #[arg(long, default_value_t = DEFAULT_BAUD_RATE)]
    baud: u32,

    /// Servo ids, comma separated
    #[arg(long, value_delimiter = ',', default_value = "1,2,3")]
    ids: Vec<u8>,
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
    info!(ids = ?args.ids, "multi-servo sync control test");

    let mut config = ControllerConfig::new(&args.port, args.baud, MotorModel::X_SERIES);
    config.motor_ids = args.ids.clone();
    let mut ctrl = Controller::new(config);
    let mut feedback = ctrl.take_feedback().expect("fresh controller");

    if let Err(e) = ctrl.start() {
        error!(error = %e, "startup failed");
        return 1;
    }

    info!("setting all servos to position mode");
    for &id in &args.ids {
        if let Err(e) = ctrl.set_operating_mode(id, OperatingMode::Position) {
            error!(id, error = %e, "failed to set position mode");
            ctrl.stop();
            return 2;
        }
    }

    let commands = ctrl.commands();
    let mut ticker = interval(Duration::from_secs(2));
    let mut pos_idx = 0usize;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, stopping");
                ctrl.stop();
                return 130;
            }
            _ = ticker.tick() => {
                // Staggered targets so neighboring servos move differently
                let batch: Vec<Command> = args
                    .ids
                    .iter()
                    .enumerate()
                    .map(|(i, &id)| Command {
                        id,
                        value: TARGETS[(pos_idx + i) % TARGETS.len()],
                    })
                    .collect();
                for cmd in &batch {
                    info!(id = cmd.id, target = cmd.value, "commanding");
                }
                if commands.send(batch).await.is_err() {
                    error!("command channel closed");
                    ctrl.stop();
                    return 2;
                }
                pos_idx = (pos_idx + 1) % TARGETS.len();
            }
            batch = feedback.recv() => {
                let Some(batch) = batch else {
                    error!("feedback channel closed");
                    ctrl.stop();
                    return 2;
                };
                for fb in &batch {
                    match &fb.error {
                        None => info!(id = fb.id, position = fb.value, "feedback"),
                        Some(e) => warn!(id = fb.id, error = %e, "feedback error"),
                    }
                }
            }
        }
    }
}
