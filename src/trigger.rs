//! Bus-wide synchronized trigger task.
//!
//! One thread owns the sampling cadence: every period it issues a single
//! general-call convert, so all sensors start their conversion at the same
//! physical instant, and queues the wall-clock timestamp of that bus write
//! for the log-merge task. The timestamp is taken while still holding the
//! bus lock, so it marks the write itself rather than some later point.
//!
//! Between firings the thread polls its mailbox instead of busy-waiting,
//! which bounds command latency to one poll interval without burning CPU.

use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use tokio::sync::mpsc::Sender;
use tracing::{debug, info, warn};

use crate::bus::{SharedBus, GC_CONVERT, GENERAL_CALL};
use crate::control::{self, Control, ControlReceiver, TaskHandle};
use crate::error::{Error, Result};

/// How close to the deadline the task stops polling commands and commits to
/// the final sleep.
pub const DEADLINE_SLACK: Duration = Duration::from_millis(250);

/// Mailbox poll interval while idle or halted.
pub const COMMAND_POLL: Duration = Duration::from_millis(150);

/// Settle delay after the initialization trigger: the worst-case (18-bit)
/// conversion time, so the power-on garbage conversion is over before the
/// pipeline starts.
pub const SETTLE: Duration = Duration::from_millis(267);

/// Spawns the trigger thread; it starts halted.
pub fn spawn(
    bus: SharedBus,
    period: Duration,
    tick_tx: Sender<DateTime<Local>>,
) -> Result<TaskHandle> {
    let (mailbox, commands) = control::mailbox();
    let join = thread::Builder::new()
        .name("trigger".into())
        .spawn(move || run(bus, period, commands, tick_tx))
        .map_err(|err| Error::Lifecycle {
            task: "trigger",
            message: err.to_string(),
        })?;
    Ok(TaskHandle::new("trigger", mailbox, join))
}

fn run(
    bus: SharedBus,
    period: Duration,
    mut commands: ControlReceiver,
    tick_tx: Sender<DateTime<Local>>,
) {
    info!("Trigger task started, period {:?}", period);
    let mut running = false;
    let mut deadline = Instant::now();

    loop {
        // Command phase: poll the mailbox until the next firing is close.
        // Halted, this loop is the whole task.
        loop {
            match control::poll(&mut commands) {
                Some(Control::Run) => {
                    if !running {
                        running = true;
                        // Coming out of halt the next trigger fires at once.
                        deadline = Instant::now();
                    }
                }
                Some(Control::Halt) => running = false,
                Some(Control::Quit) => {
                    info!("Trigger task stopped");
                    return;
                }
                None => {}
            }
            if running && deadline.saturating_duration_since(Instant::now()) <= DEADLINE_SLACK {
                break;
            }
            thread::sleep(COMMAND_POLL);
        }

        // Fire phase: sleep out the remainder, broadcast, queue the stamp.
        let remaining = deadline.saturating_duration_since(Instant::now());
        if !remaining.is_zero() {
            thread::sleep(remaining);
        }
        deadline += period;

        let stamped = bus.with_bus(|raw| {
            raw.write_byte(GENERAL_CALL, GC_CONVERT)
                .map(|()| Local::now())
        });
        match stamped {
            Ok(stamp) => {
                if tick_tx.blocking_send(stamp).is_err() {
                    debug!("Tick queue closed, dropping trigger timestamp");
                }
            }
            Err(err) => warn!("Broadcast trigger failed: {}", err),
        }
    }
}
