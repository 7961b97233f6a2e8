// Control loop over one Dynamixel bus
//
// The controller owns the driver, which owns the port; applications talk to
// the loop exclusively through the command and feedback channels. The loop
// runs on its own OS thread because every tick blocks on serial I/O.

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, error, info, warn};

use crate::bus::{serial, Driver, SerialIo};
use crate::cancel::CancelToken;
use crate::config::{
    COMMAND_CHANNEL_CAPACITY, DEFAULT_BAUD_RATE, DEFAULT_TRANSACTION_TIMEOUT,
    EEPROM_SETTLE_DELAY, FEEDBACK_CHANNEL_CAPACITY, TORQUE_SETTLE_DELAY,
};
use crate::error::{DxlError, Result};
use crate::messages::{Command, Feedback};

/// Control-table addresses for one servo family. Only the registers the
/// control loop touches; everything else stays with the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotorModel {
    pub torque_enable: u16,
    pub goal_position: u16,
    pub goal_velocity: u16,
    pub goal_pwm: u16,
    /// Not every family maps a current setpoint
    pub goal_current: Option<u16>,
    pub present_position: u16,
    pub operating_mode: u16,
}

impl MotorModel {
    /// X-series (XM430, XC430, ...) and MX-series on Protocol 2.0 firmware
    pub const X_SERIES: MotorModel = MotorModel {
        torque_enable: 64,
        goal_position: 116,
        goal_velocity: 104,
        goal_pwm: 100,
        goal_current: Some(102),
        present_position: 132,
        operating_mode: 11,
    };

    /// Pro-series (H54, H42, ...). Check the manual for the exact variant.
    pub const PRO_SERIES: MotorModel = MotorModel {
        torque_enable: 562,
        goal_position: 596,
        goal_velocity: 600,
        goal_pwm: 584,
        goal_current: None,
        present_position: 611,
        operating_mode: 11,
    };
}

/// Servo behavior selector, written to the operating mode register.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatingMode {
    Current = 0,
    Velocity = 1,
    Position = 3,
    ExtendedPosition = 4,
    CurrentBasedPosition = 5,
    Pwm = 16,
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub device_port: String,
    pub baud_rate: u32,
    pub model: MotorModel,
    /// Servos the loop commands and samples
    pub motor_ids: Vec<u8>,
    /// Deadline for one bus transaction
    pub transaction_timeout: Duration,
    /// None lets the loop free-run at bus speed; Some paces each tick
    pub loop_period: Option<Duration>,
    /// Fail startup and mode changes when the torque enable read-back does
    /// not confirm the write, instead of logging a warning
    pub strict_torque_check: bool,
    /// Settle time after writing the operating mode register
    pub eeprom_settle: Duration,
}

impl ControllerConfig {
    pub fn new(device_port: impl Into<String>, baud_rate: u32, model: MotorModel) -> Self {
        Self {
            device_port: device_port.into(),
            baud_rate,
            model,
            motor_ids: vec![1],
            transaction_timeout: DEFAULT_TRANSACTION_TIMEOUT,
            loop_period: None,
            strict_torque_check: false,
            eeprom_settle: EEPROM_SETTLE_DELAY,
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self::new("/dev/ttyUSB0", DEFAULT_BAUD_RATE, MotorModel::X_SERIES)
    }
}

// State shared between the loop and external callers. Writers are rare
// (set_motor_ids, set_operating_mode); the loop takes the read lock once
// per tick.
#[derive(Debug)]
struct SharedState {
    active_goal_addr: u16,
    motor_ids: Vec<u8>,
    sync_mode: bool,
}

pub struct Controller {
    config: ControllerConfig,
    driver: Option<Arc<Mutex<Driver>>>,
    state: Arc<RwLock<SharedState>>,
    cancel: CancelToken,
    cmd_tx: mpsc::Sender<Vec<Command>>,
    cmd_rx: Option<mpsc::Receiver<Vec<Command>>>,
    fb_tx: mpsc::Sender<Vec<Feedback>>,
    fb_rx: Option<mpsc::Receiver<Vec<Feedback>>>,
    loop_handle: Option<thread::JoinHandle<()>>,
}

impl Controller {
    pub fn new(config: ControllerConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (fb_tx, fb_rx) = mpsc::channel(FEEDBACK_CHANNEL_CAPACITY);

        let state = SharedState {
            active_goal_addr: config.model.goal_position,
            motor_ids: config.motor_ids.clone(),
            sync_mode: config.motor_ids.len() > 1,
        };

        Self {
            config,
            driver: None,
            state: Arc::new(RwLock::new(state)),
            cancel: CancelToken::new(),
            cmd_tx,
            cmd_rx: Some(cmd_rx),
            fb_tx,
            fb_rx: Some(fb_rx),
            loop_handle: None,
        }
    }

    /// Sender half of the command channel. Clones freely; batches sent here
    /// are dispatched on the next loop tick.
    pub fn commands(&self) -> mpsc::Sender<Vec<Command>> {
        self.cmd_tx.clone()
    }

    /// Receiver half of the feedback channel. Can only be taken once.
    pub fn take_feedback(&mut self) -> Option<mpsc::Receiver<Vec<Feedback>>> {
        self.fb_rx.take()
    }

    /// The ambient cancellation handle shared with executors.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Register the loop currently writes commands to.
    pub fn active_goal_addr(&self) -> u16 {
        self.read_state().active_goal_addr
    }

    /// Replace the set of controlled servos. Sync read/write kicks in
    /// automatically for more than one. Takes effect by the next tick.
    pub fn set_motor_ids(&self, ids: Vec<u8>) -> Result<()> {
        if ids.is_empty() {
            return Err(DxlError::InvalidArgument("empty motor id list".into()));
        }
        let mut state = self.write_state();
        state.sync_mode = ids.len() > 1;
        state.motor_ids = ids;
        Ok(())
    }

    /// Open the serial port and bring the loop up.
    pub fn start(&mut self) -> Result<()> {
        info!(
            port = %self.config.device_port,
            baud = self.config.baud_rate,
            "opening serial port"
        );
        let port = serial::open(&self.config.device_port, self.config.baud_rate)?;
        self.start_with_port(port)
    }

    /// Bring the loop up on an already-open port. Public seam for virtual
    /// and simulated buses.
    ///
    /// Verifies servo 1 answers a ping, enables its torque, then spawns the
    /// control loop thread.
    pub fn start_with_port<P: SerialIo + 'static>(&mut self, port: P) -> Result<()> {
        if self.loop_handle.is_some() {
            return Err(DxlError::InvalidArgument(
                "controller already started".into(),
            ));
        }
        let cmd_rx = self
            .cmd_rx
            .take()
            .ok_or_else(|| DxlError::InvalidArgument("controller already started".into()))?;

        if self.read_state().motor_ids.is_empty() {
            return Err(DxlError::InvalidArgument("empty motor id list".into()));
        }

        let driver = Arc::new(Mutex::new(Driver::with_timeout(
            port,
            self.config.transaction_timeout,
        )));

        {
            let mut drv = driver.lock().unwrap_or_else(PoisonError::into_inner);

            // Bring-up handshake always targets servo 1
            match drv.ping(1) {
                Ok(model) => info!(id = 1, model, "servo responded to ping"),
                Err(e) => {
                    warn!(id = 1, error = %e, "ping failed, check power/id/baudrate");
                    return Err(DxlError::NoResponse { id: 1 });
                }
            }

            self.enable_torque(&mut drv, 1)?;
        }

        self.driver = Some(driver.clone());

        let ctx = LoopContext {
            driver,
            state: self.state.clone(),
            cancel: self.cancel.clone(),
            cmd_rx,
            fb_tx: self.fb_tx.clone(),
            present_position: self.config.model.present_position,
            loop_period: self.config.loop_period,
        };

        let handle = thread::Builder::new()
            .name("dxl-control-loop".into())
            .spawn(move || control_loop(ctx))
            .map_err(DxlError::Io)?;
        self.loop_handle = Some(handle);

        info!("control loop running");
        Ok(())
    }

    /// Switch a servo's operating mode: torque off, write the mode register,
    /// wait out the EEPROM settle time, retarget the loop's goal address,
    /// torque back on. Holds the driver for the whole sequence, which pauses
    /// the loop until the change is complete.
    pub fn set_operating_mode(&self, id: u8, mode: OperatingMode) -> Result<()> {
        let driver = self
            .driver
            .as_ref()
            .ok_or_else(|| DxlError::InvalidArgument("controller not started".into()))?;
        let mut drv = driver.lock().unwrap_or_else(PoisonError::into_inner);

        info!(id, ?mode, "switching operating mode");
        drv.write(id, self.config.model.torque_enable, &[0])?;
        drv.write(id, self.config.model.operating_mode, &[mode as u8])?;

        // Operating mode lives in EEPROM; give the servo time to flash and
        // re-stabilize before anything else touches the bus.
        thread::sleep(self.config.eeprom_settle);

        let goal_addr = match mode {
            OperatingMode::Velocity => self.config.model.goal_velocity,
            OperatingMode::Pwm => self.config.model.goal_pwm,
            OperatingMode::Position
            | OperatingMode::ExtendedPosition
            | OperatingMode::CurrentBasedPosition => self.config.model.goal_position,
            OperatingMode::Current => match self.config.model.goal_current {
                Some(addr) => addr,
                None => {
                    warn!("no goal current register configured, using goal position");
                    self.config.model.goal_position
                }
            },
        };
        self.write_state().active_goal_addr = goal_addr;

        self.enable_torque(&mut drv, id)
    }

    /// Signal the loop to exit, wait for it, and release the port.
    /// Idempotent.
    pub fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.loop_handle.take() {
            if handle.join().is_err() {
                error!("control loop thread panicked");
            }
        }
        // Last driver handle: dropping it closes the port
        self.driver = None;
    }

    fn enable_torque(&self, drv: &mut Driver, id: u8) -> Result<()> {
        debug!(id, addr = self.config.model.torque_enable, "enabling torque");
        drv.write(id, self.config.model.torque_enable, &[1])?;
        thread::sleep(TORQUE_SETTLE_DELAY);

        // Read-back is best effort: some servos answer the follow-up read
        // unreliably right after the write.
        match drv.read(id, self.config.model.torque_enable, 1) {
            Ok(data) if data.first() == Some(&1) => Ok(()),
            Ok(data) => {
                if self.config.strict_torque_check {
                    return Err(DxlError::InvalidResponse {
                        id,
                        reason: format!("torque enable read-back {data:02x?}"),
                    });
                }
                warn!(id, ?data, "torque enable read-back mismatch, write accepted");
                Ok(())
            }
            Err(e) => {
                if self.config.strict_torque_check {
                    return Err(e);
                }
                warn!(id, error = %e, "could not verify torque enable, assuming success");
                Ok(())
            }
        }
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, SharedState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, SharedState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.stop();
    }
}

struct LoopContext {
    driver: Arc<Mutex<Driver>>,
    state: Arc<RwLock<SharedState>>,
    cancel: CancelToken,
    cmd_rx: mpsc::Receiver<Vec<Command>>,
    fb_tx: mpsc::Sender<Vec<Feedback>>,
    present_position: u16,
    loop_period: Option<Duration>,
}

fn control_loop(mut ctx: LoopContext) {
    debug!("control loop thread up");

    while !ctx.cancel.is_cancelled() {
        let tick_start = Instant::now();

        let (goal_addr, motor_ids, sync_mode) = {
            let state = ctx.state.read().unwrap_or_else(PoisonError::into_inner);
            (
                state.active_goal_addr,
                state.motor_ids.clone(),
                state.sync_mode,
            )
        };

        // Commands first, then telemetry
        match ctx.cmd_rx.try_recv() {
            Ok(batch) => {
                let mut drv = ctx.driver.lock().unwrap_or_else(PoisonError::into_inner);
                dispatch_commands(&mut drv, goal_addr, sync_mode, &batch);
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {}
        }

        let feedbacks = {
            let mut drv = ctx.driver.lock().unwrap_or_else(PoisonError::into_inner);
            sample_feedback(&mut drv, ctx.present_position, sync_mode, &motor_ids)
        };

        // Non-blocking publish: a full channel drops the new batch, a slow
        // listener never sees stale data.
        if !feedbacks.is_empty() {
            let _ = ctx.fb_tx.try_send(feedbacks);
        }

        if let Some(period) = ctx.loop_period {
            if let Some(remaining) = period.checked_sub(tick_start.elapsed()) {
                thread::sleep(remaining);
            }
        }
    }

    debug!("control loop thread exiting");
}

fn dispatch_commands(drv: &mut Driver, goal_addr: u16, sync_mode: bool, batch: &[Command]) {
    if batch.is_empty() {
        return;
    }
    if sync_mode {
        let values: Vec<(u8, u32)> = batch.iter().map(|cmd| (cmd.id, cmd.value)).collect();
        if let Err(e) = drv.sync_write_u32(goal_addr, &values) {
            warn!(error = %e, "sync write failed");
        }
    } else {
        for cmd in batch {
            if let Err(e) = drv.write_u32(cmd.id, goal_addr, cmd.value) {
                warn!(id = cmd.id, error = %e, "write failed");
            }
        }
    }
}

fn sample_feedback(
    drv: &mut Driver,
    present_position: u16,
    sync_mode: bool,
    motor_ids: &[u8],
) -> Vec<Feedback> {
    if sync_mode {
        match drv.sync_read(present_position, 4, motor_ids) {
            Ok(results) => results
                .into_iter()
                .map(|entry| match entry.data {
                    Ok(data) => match <[u8; 4]>::try_from(data.as_slice()) {
                        Ok(bytes) => Feedback::ok(entry.id, u32::from_le_bytes(bytes)),
                        Err(_) => Feedback::err(
                            entry.id,
                            DxlError::LengthMismatch {
                                expected: 4,
                                actual: data.len(),
                            },
                        ),
                    },
                    Err(e) => Feedback::err(entry.id, e),
                })
                .collect(),
            Err(e) => {
                warn!(error = %e, "sync read failed");
                Vec::new()
            }
        }
    } else {
        motor_ids
            .iter()
            .map(|&id| match drv.read_u32(id, present_position) {
                Ok(value) => Feedback::ok(id, value),
                Err(e) => Feedback::err(id, e),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::protocol::{self, build_status, Instruction, BROADCAST_ID};
    use std::collections::HashMap;
    use std::collections::VecDeque;
    use std::io;

    /// Register-level servo bus simulator. Parses instruction packets as
    /// they are written and queues the status responses a real bus would
    /// produce, so tests stay deterministic however the loop interleaves.
    #[derive(Clone)]
    struct ServoSim {
        inner: Arc<Mutex<SimInner>>,
    }

    struct SimInner {
        model: MotorModel,
        servos: Vec<u8>,
        registers: HashMap<(u8, u16), Vec<u8>>,
        rx: VecDeque<u8>,
        tx_buf: Vec<u8>,
        broadcasts: Vec<u8>,
    }

    impl ServoSim {
        fn new(model: MotorModel, servos: &[u8]) -> Self {
            Self {
                inner: Arc::new(Mutex::new(SimInner {
                    model,
                    servos: servos.to_vec(),
                    registers: HashMap::new(),
                    rx: VecDeque::new(),
                    tx_buf: Vec::new(),
                    broadcasts: Vec::new(),
                })),
            }
        }

        fn set_position(&self, id: u8, value: u32) {
            let mut inner = self.inner.lock().unwrap();
            let addr = inner.model.present_position;
            inner.registers.insert((id, addr), value.to_le_bytes().to_vec());
        }

        fn register(&self, id: u8, addr: u16) -> Option<Vec<u8>> {
            self.inner.lock().unwrap().registers.get(&(id, addr)).cloned()
        }

        fn saw_broadcast(&self, inst: Instruction) -> bool {
            self.inner.lock().unwrap().broadcasts.contains(&(inst as u8))
        }
    }

    impl SimInner {
        fn handle_packet(&mut self, pkt: &[u8]) {
            let id = pkt[4];
            let inst = pkt[7];
            let params = protocol::destuff_params(&pkt[8..pkt.len() - 2]);
            if id == BROADCAST_ID {
                self.broadcasts.push(inst);
            }

            match inst {
                x if x == Instruction::Ping as u8 => {
                    if self.servos.contains(&id) {
                        let reply = build_status(id, 0, &[0x24, 0x04, 0x2A]);
                        self.rx.extend(reply);
                    }
                }
                x if x == Instruction::Read as u8 => {
                    if !self.servos.contains(&id) {
                        return;
                    }
                    let addr = u16::from_le_bytes([params[0], params[1]]);
                    let len = u16::from_le_bytes([params[2], params[3]]) as usize;
                    let mut data = self.registers.get(&(id, addr)).cloned().unwrap_or_default();
                    data.resize(len, 0);
                    let reply = build_status(id, 0, &data);
                    self.rx.extend(reply);
                }
                x if x == Instruction::Write as u8 => {
                    if !self.servos.contains(&id) {
                        return;
                    }
                    let addr = u16::from_le_bytes([params[0], params[1]]);
                    self.registers.insert((id, addr), params[2..].to_vec());
                    let reply = build_status(id, 0, &[]);
                    self.rx.extend(reply);
                }
                x if x == Instruction::SyncWrite as u8 => {
                    let addr = u16::from_le_bytes([params[0], params[1]]);
                    let len = u16::from_le_bytes([params[2], params[3]]) as usize;
                    for entry in params[4..].chunks(1 + len) {
                        self.registers
                            .insert((entry[0], addr), entry[1..].to_vec());
                    }
                }
                x if x == Instruction::SyncRead as u8 => {
                    let addr = u16::from_le_bytes([params[0], params[1]]);
                    let len = u16::from_le_bytes([params[2], params[3]]) as usize;
                    for &sid in &params[4..] {
                        if !self.servos.contains(&sid) {
                            continue;
                        }
                        let mut data = self
                            .registers
                            .get(&(sid, addr))
                            .cloned()
                            .unwrap_or_default();
                        data.resize(len, 0);
                        let reply = build_status(sid, 0, &data);
                        self.rx.extend(reply);
                    }
                }
                _ => {}
            }
        }
    }

    impl io::Read for ServoSim {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut inner = self.inner.lock().unwrap();
            if inner.rx.is_empty() {
                drop(inner);
                thread::sleep(Duration::from_millis(1));
                return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
            }
            let n = buf.len().min(inner.rx.len());
            for slot in buf.iter_mut().take(n) {
                *slot = inner.rx.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl io::Write for ServoSim {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut inner = self.inner.lock().unwrap();
            inner.tx_buf.extend_from_slice(buf);

            // Slice out and handle every complete instruction packet
            loop {
                let Some(start) = inner
                    .tx_buf
                    .windows(3)
                    .position(|w| w == [0xFF, 0xFF, 0xFD])
                else {
                    break;
                };
                if inner.tx_buf.len() < start + 7 {
                    break;
                }
                let body =
                    u16::from_le_bytes([inner.tx_buf[start + 5], inner.tx_buf[start + 6]]) as usize;
                let total = 7 + body;
                if inner.tx_buf.len() < start + total {
                    break;
                }
                let pkt: Vec<u8> = inner.tx_buf[start..start + total].to_vec();
                inner.tx_buf.drain(..start + total);
                inner.handle_packet(&pkt);
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn test_config() -> ControllerConfig {
        let mut config = ControllerConfig::new("sim", DEFAULT_BAUD_RATE, MotorModel::X_SERIES);
        config.transaction_timeout = Duration::from_millis(20);
        config.loop_period = Some(Duration::from_millis(2));
        config.eeprom_settle = Duration::from_millis(10);
        config
    }

    async fn wait_for_register(sim: &ServoSim, id: u8, addr: u16, expected: &[u8]) {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if sim.register(id, addr).as_deref() == Some(expected) {
                return;
            }
            assert!(
                Instant::now() < deadline,
                "register ({id}, {addr}) never became {expected:02x?}, got {:?}",
                sim.register(id, addr)
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn start_fails_when_nothing_answers_the_ping() {
        let sim = ServoSim::new(MotorModel::X_SERIES, &[]);
        let mut ctrl = Controller::new(test_config());

        let err = ctrl.start_with_port(sim).unwrap_err();
        assert!(matches!(err, DxlError::NoResponse { id: 1 }));
    }

    #[tokio::test]
    async fn startup_publishes_feedback_and_dispatches_commands() {
        let sim = ServoSim::new(MotorModel::X_SERIES, &[1]);
        sim.set_position(1, 2048);

        let mut ctrl = Controller::new(test_config());
        let mut feedback = ctrl.take_feedback().unwrap();
        ctrl.start_with_port(sim.clone()).unwrap();

        // Torque was enabled on the way up
        assert_eq!(sim.register(1, 64).as_deref(), Some(&[1u8][..]));

        let batch = tokio::time::timeout(Duration::from_secs(2), feedback.recv())
            .await
            .expect("feedback should arrive")
            .expect("channel open");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, 1);
        assert_eq!(batch[0].value, 2048);
        assert!(batch[0].error.is_none());

        // A command lands in the goal position register by default
        ctrl.commands()
            .send(vec![Command { id: 1, value: 3000 }])
            .await
            .unwrap();
        wait_for_register(&sim, 1, 116, &3000u32.to_le_bytes()).await;

        ctrl.stop();
    }

    #[tokio::test]
    async fn operating_mode_switch_retargets_the_goal_address() {
        let sim = ServoSim::new(MotorModel::X_SERIES, &[1]);
        sim.set_position(1, 0);

        let mut ctrl = Controller::new(test_config());
        ctrl.start_with_port(sim.clone()).unwrap();
        assert_eq!(ctrl.active_goal_addr(), 116);

        ctrl.set_operating_mode(1, OperatingMode::Velocity).unwrap();
        assert_eq!(ctrl.active_goal_addr(), 104);
        assert_eq!(sim.register(1, 11).as_deref(), Some(&[1u8][..]));

        ctrl.commands()
            .send(vec![Command { id: 1, value: 250 }])
            .await
            .unwrap();
        wait_for_register(&sim, 1, 104, &250u32.to_le_bytes()).await;

        ctrl.stop();
    }

    #[tokio::test]
    async fn current_mode_falls_back_to_position_without_a_current_register() {
        let sim = ServoSim::new(MotorModel::PRO_SERIES, &[1]);
        sim.set_position(1, 0);

        let mut config = test_config();
        config.model = MotorModel::PRO_SERIES;
        let mut ctrl = Controller::new(config);
        ctrl.start_with_port(sim.clone()).unwrap();

        ctrl.set_operating_mode(1, OperatingMode::Current).unwrap();
        assert_eq!(ctrl.active_goal_addr(), MotorModel::PRO_SERIES.goal_position);

        ctrl.stop();
    }

    #[tokio::test]
    async fn multiple_servos_use_the_sync_paths() {
        let sim = ServoSim::new(MotorModel::X_SERIES, &[1, 2]);
        sim.set_position(1, 100);
        sim.set_position(2, 200);

        let mut ctrl = Controller::new(test_config());
        ctrl.set_motor_ids(vec![1, 2]).unwrap();
        let mut feedback = ctrl.take_feedback().unwrap();
        ctrl.start_with_port(sim.clone()).unwrap();

        let batch = tokio::time::timeout(Duration::from_secs(2), feedback.recv())
            .await
            .expect("feedback should arrive")
            .expect("channel open");
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].id, 1);
        assert_eq!(batch[0].value, 100);
        assert_eq!(batch[1].id, 2);
        assert_eq!(batch[1].value, 200);
        assert!(sim.saw_broadcast(Instruction::SyncRead));

        ctrl.commands()
            .send(vec![
                Command { id: 1, value: 1111 },
                Command { id: 2, value: 2222 },
            ])
            .await
            .unwrap();
        wait_for_register(&sim, 1, 116, &1111u32.to_le_bytes()).await;
        wait_for_register(&sim, 2, 116, &2222u32.to_le_bytes()).await;
        assert!(sim.saw_broadcast(Instruction::SyncWrite));

        ctrl.stop();
    }

    #[tokio::test]
    async fn sync_read_reports_dead_servos_per_id() {
        // Servo 2 is configured but not on the bus
        let sim = ServoSim::new(MotorModel::X_SERIES, &[1]);
        sim.set_position(1, 42);

        let mut ctrl = Controller::new(test_config());
        ctrl.set_motor_ids(vec![1, 2]).unwrap();
        let mut feedback = ctrl.take_feedback().unwrap();
        ctrl.start_with_port(sim).unwrap();

        let batch = tokio::time::timeout(Duration::from_secs(2), feedback.recv())
            .await
            .expect("feedback should arrive")
            .expect("channel open");
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].value, 42);
        assert!(batch[0].error.is_none());
        assert!(matches!(
            batch[1].error,
            Some(DxlError::NoResponse { id: 2 })
        ));

        ctrl.stop();
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let sim = ServoSim::new(MotorModel::X_SERIES, &[1]);
        sim.set_position(1, 0);

        let mut ctrl = Controller::new(test_config());
        ctrl.start_with_port(sim).unwrap();
        ctrl.stop();
        ctrl.stop();
    }

    #[tokio::test]
    async fn guards_against_misuse() {
        let ctrl = Controller::new(test_config());
        assert!(matches!(
            ctrl.set_motor_ids(vec![]).unwrap_err(),
            DxlError::InvalidArgument(_)
        ));
        assert!(matches!(
            ctrl.set_operating_mode(1, OperatingMode::Position).unwrap_err(),
            DxlError::InvalidArgument(_)
        ));
    }
}
