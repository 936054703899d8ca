//! Per-sensor acquisition task.
//!
//! One thread per configured sensor polls the device's busy/ready flag and
//! emits exactly one [`Sample`] per completed conversion, fanning it out to
//! the log-merge queue and the display queue. Emission is edge-triggered: a
//! sample goes out only on a busy-to-ready transition, so a sustained ready
//! state (however long the task was unscheduled or the consumer paused) never
//! re-emits a stale conversion.
//!
//! The task never blocks on a queue read. Control is a non-blocking mailbox
//! poll once per iteration; `run` and `halt` are no-ops here because pausing
//! is a consumer-side concern and the bus is observed regardless.

use std::thread;
use std::time::Duration;

use tokio::sync::mpsc::Sender;
use tracing::{debug, info, warn};

use crate::control::{self, Control, ControlReceiver, TaskHandle};
use crate::error::{Error, Result};
use crate::sensor::{Sample, SensorDevice};

/// Poll interval while waiting out the cold-start conversion.
pub const INITIAL_POLL: Duration = Duration::from_millis(50);

/// Steady-state poll interval; bounds emission latency after a conversion.
///
/// The device reports not-ready both while converting and after its result
/// has been read out, so the not-ready phase between two conversions always
/// outlasts this interval regardless of the mode's rate. Even a 240 Hz
/// sensor, whose conversion itself takes only ~4 ms, is safe: the reading
/// that emitted the previous sample is the busy observation arming the next
/// edge.
pub const STEADY_POLL: Duration = Duration::from_millis(200);

/// Spawns the polling thread for one sensor and returns its handle.
pub fn spawn(
    device: SensorDevice,
    log_tx: Sender<Sample>,
    display_tx: Sender<Sample>,
) -> Result<TaskHandle> {
    let (mailbox, commands) = control::mailbox();
    let thread_name = format!("acq-{:#04x}", device.address());
    let join = thread::Builder::new()
        .name(thread_name)
        .spawn(move || run(device, commands, log_tx, display_tx))
        .map_err(|err| Error::Lifecycle {
            task: "acquisition",
            message: err.to_string(),
        })?;
    Ok(TaskHandle::new("acquisition", mailbox, join))
}

fn run(
    mut device: SensorDevice,
    mut commands: ControlReceiver,
    log_tx: Sender<Sample>,
    display_tx: Sender<Sample>,
) {
    let address = device.address();
    info!(
        "Acquisition task for {:#04x} started ({}-bit mode)",
        address,
        device.mode().bits
    );

    if !discard_cold_start(&mut device, &mut commands) {
        info!("Acquisition task for {:#04x} quit during warm-up", address);
        return;
    }

    // Busy/ready edge detector: `triggered` is set on the first not-ready
    // observation and cleared when the matching ready arrives.
    let mut triggered = false;
    loop {
        if let Some(Control::Quit) = control::poll(&mut commands) {
            break;
        }
        match device.read_raw_and_status() {
            Ok((_, ready)) => {
                if triggered && ready {
                    triggered = false;
                    emit(&device, &log_tx, &display_tx);
                } else if !triggered && !ready {
                    triggered = true;
                }
            }
            Err(err) => {
                warn!("Conversion read on {:#04x} failed, retrying: {}", address, err);
            }
        }
        thread::sleep(STEADY_POLL);
    }
    info!("Acquisition task for {:#04x} stopped", address);
}

/// Waits for the power-on conversion to finish and throws its value away.
/// Returns `false` if quit arrived first.
fn discard_cold_start(device: &mut SensorDevice, commands: &mut ControlReceiver) -> bool {
    let address = device.address();
    loop {
        if let Some(Control::Quit) = control::poll(commands) {
            return false;
        }
        match device.read_status() {
            Ok(true) => {
                debug!("Discarded cold-start reading from {:#04x}", address);
                return true;
            }
            Ok(false) => {}
            Err(err) => {
                warn!("Warm-up status read on {:#04x} failed: {}", address, err);
            }
        }
        thread::sleep(INITIAL_POLL);
    }
}

/// Pushes the latched conversion to both consumers.
///
/// The sends block when a queue is full, pacing this task against slow
/// consumers. A closed queue means teardown already dropped the receiver;
/// the sample is simply discarded.
fn emit(device: &SensorDevice, log_tx: &Sender<Sample>, display_tx: &Sender<Sample>) {
    let sample = device.sample();
    if log_tx.blocking_send(sample).is_err() {
        debug!("Log queue for {:#04x} closed, dropping sample", sample.address);
    }
    if display_tx.blocking_send(sample).is_err() {
        debug!(
            "Display queue for {:#04x} closed, dropping sample",
            sample.address
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{I2cBus, SharedBus};
    use crate::sensor::ConversionMode;
    use crate::sim::{SimBus, SimProfile};
    use std::time::Instant;
    use tokio::sync::mpsc;

    const ADDR: u8 = 0x68;
    /// 18-bit mode: the 267 ms busy phase is longer than the 200 ms poll,
    /// so every edge is observed deterministically.
    const MODE_18: usize = 3;
    /// One-shot 18-bit configuration with the trigger bit.
    const TRIGGER_18: u8 = 0x8C;

    fn device_on(sim: &SimBus) -> SensorDevice {
        let bus = SharedBus::new(Box::new(sim.clone()));
        let mode = ConversionMode::from_index(MODE_18).unwrap();
        SensorDevice::new(bus, ADDR, mode, 1.0, 0.0)
    }

    #[test]
    fn test_emits_once_per_busy_ready_edge() {
        let sim = SimBus::new().with_sensor(ADDR, SimProfile::Constant(100));
        let mut device = device_on(&sim);
        device.configure().unwrap();
        device.stop_continuous().unwrap();

        let (log_tx, mut log_rx) = mpsc::channel(100);
        let (display_tx, mut display_rx) = mpsc::channel(100);
        let handle = spawn(device, log_tx, display_tx).unwrap();
        let mut sim_writer = sim.clone();

        // Let the cold-start conversion settle and be discarded, then fire
        // two one-shot triggers with room for the edge to complete.
        std::thread::sleep(Duration::from_millis(400));
        sim_writer.write_byte(ADDR, TRIGGER_18).unwrap();
        std::thread::sleep(Duration::from_millis(700));
        sim_writer.write_byte(ADDR, TRIGGER_18).unwrap();
        std::thread::sleep(Duration::from_millis(700));

        handle.signal(Control::Quit);
        handle.join().unwrap();

        let mut emitted = 0;
        while let Ok(sample) = log_rx.try_recv() {
            assert_eq!(sample.address, ADDR);
            assert_eq!(sample.raw, 100);
            emitted += 1;
        }
        assert_eq!(emitted, 2, "one sample per trigger, no repeats on sustained ready");
        assert_eq!(display_rx.try_recv().unwrap().raw, 100);
    }

    #[test]
    fn test_no_reemission_without_new_conversion() {
        let sim = SimBus::new().with_sensor(ADDR, SimProfile::Constant(7));
        let mut device = device_on(&sim);
        device.configure().unwrap();
        device.stop_continuous().unwrap();

        let (log_tx, mut log_rx) = mpsc::channel(100);
        let (display_tx, _display_rx) = mpsc::channel(100);
        let handle = spawn(device, log_tx, display_tx).unwrap();
        let mut sim_writer = sim.clone();

        // One trigger, then a long idle stretch with nothing new to read.
        std::thread::sleep(Duration::from_millis(400));
        sim_writer.write_byte(ADDR, TRIGGER_18).unwrap();
        std::thread::sleep(Duration::from_millis(1500));

        handle.signal(Control::Quit);
        handle.join().unwrap();

        let mut emitted = 0;
        while log_rx.try_recv().is_ok() {
            emitted += 1;
        }
        assert_eq!(emitted, 1);
    }

    #[test]
    fn test_quit_during_warm_up() {
        // Busy forever: reads fail, so the warm-up loop never sees ready.
        let sim = SimBus::new().with_sensor(ADDR, SimProfile::Constant(0));
        sim.fail_reads(ADDR, true);
        let device = device_on(&sim);

        let (log_tx, _log_rx) = mpsc::channel(10);
        let (display_tx, _display_rx) = mpsc::channel(10);
        let handle = spawn(device, log_tx, display_tx).unwrap();

        std::thread::sleep(Duration::from_millis(120));
        let started = Instant::now();
        handle.signal(Control::Quit);
        handle.join().unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));
    }
}
