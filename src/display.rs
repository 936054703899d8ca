//! Display feed: per-sensor history buffer and repaint signaling.
//!
//! Rendering itself lives outside this crate; what lives here is the queue
//! contract. Running, the task drains everything currently queued into a
//! fixed-size ring and signals one repaint per drain cycle, not one per
//! sample, so burst arrival never causes redundant redraws. Halted, it
//! drains and discards so a paused display cannot back the queue up into
//! the producers.
//!
//! The UI holds a [`DisplayHandle`]: a snapshot view of the ring plus a
//! watch channel that ticks once per repaint request.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc::Receiver, watch};
use tracing::info;

use crate::control::{self, Control, ControlReceiver, TaskHandle};
use crate::error::{Error, Result};
use crate::sensor::Sample;

/// Mailbox and queue poll interval.
pub const DRAIN_POLL: Duration = Duration::from_millis(250);

/// Fixed-capacity ring of the most recent samples, oldest first.
#[derive(Debug)]
pub struct History {
    points: VecDeque<Sample>,
    capacity: usize,
}

impl History {
    /// Empty ring holding at most `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        Self {
            points: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends a sample, dropping the oldest when full.
    pub fn push(&mut self, sample: Sample) {
        if self.points.len() == self.capacity {
            self.points.pop_front();
        }
        self.points.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Most recent sample, if any.
    pub fn latest(&self) -> Option<Sample> {
        self.points.back().copied()
    }

    /// Copies the ring out oldest-first.
    pub fn to_vec(&self) -> Vec<Sample> {
        self.points.iter().copied().collect()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Read-side view of one sensor's display feed.
#[derive(Debug, Clone)]
pub struct DisplayHandle {
    history: Arc<RwLock<History>>,
    repaint: watch::Receiver<u64>,
}

impl DisplayHandle {
    /// Copy of the current history, oldest first.
    pub fn snapshot(&self) -> Vec<Sample> {
        self.history.read().to_vec()
    }

    /// Most recent sample, if any.
    pub fn latest(&self) -> Option<Sample> {
        self.history.read().latest()
    }

    /// Watch channel that ticks once per repaint request; a renderer can
    /// await `changed()` on a clone of this.
    pub fn repaint(&self) -> watch::Receiver<u64> {
        self.repaint.clone()
    }

    /// Number of repaint requests so far.
    pub fn repaint_count(&self) -> u64 {
        *self.repaint.borrow()
    }
}

/// Spawns the display feed thread for one sensor; it starts halted.
pub fn spawn(
    address: u8,
    capacity: usize,
    data_rx: Receiver<Sample>,
) -> Result<(TaskHandle, DisplayHandle)> {
    let (mailbox, commands) = control::mailbox();
    let history = Arc::new(RwLock::new(History::new(capacity)));
    let (repaint_tx, repaint_rx) = watch::channel(0u64);
    let shared = Arc::clone(&history);
    let join = thread::Builder::new()
        .name(format!("display-{address:#04x}"))
        .spawn(move || run(address, commands, data_rx, shared, repaint_tx))
        .map_err(|err| Error::Lifecycle {
            task: "display",
            message: err.to_string(),
        })?;
    Ok((
        TaskHandle::new("display", mailbox, join),
        DisplayHandle {
            history,
            repaint: repaint_rx,
        },
    ))
}

fn run(
    address: u8,
    mut commands: ControlReceiver,
    mut data_rx: Receiver<Sample>,
    history: Arc<RwLock<History>>,
    repaint_tx: watch::Sender<u64>,
) {
    info!("Display feed for {:#04x} started", address);
    let mut running = false;

    loop {
        match control::poll(&mut commands) {
            Some(Control::Run) => {
                if !running {
                    running = true;
                    // Fresh paint of whatever history survived the pause.
                    repaint_tx.send_modify(|n| *n += 1);
                }
            }
            Some(Control::Halt) => running = false,
            Some(Control::Quit) => break,
            None => {}
        }

        if running {
            let mut drained = 0usize;
            while let Ok(sample) = data_rx.try_recv() {
                // Teardown pushes a control marker to unblock drains; it is
                // not data and never enters the history.
                if sample.is_sentinel() {
                    continue;
                }
                history.write().push(sample);
                drained += 1;
            }
            if drained > 0 {
                repaint_tx.send_modify(|n| *n += 1);
            }
        } else {
            while data_rx.try_recv().is_ok() {}
        }
        thread::sleep(DRAIN_POLL);
    }
    info!("Display feed for {:#04x} stopped", address);
}
