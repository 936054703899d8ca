//! Control-plane messages and per-task mailboxes.
//!
//! Every worker thread owns one bounded mailbox carrying [`Control`] messages
//! from the lifecycle layer. Mailboxes are distinct from data queues: they are
//! small, never block the sender, and every task polls its mailbox
//! non-blockingly at a fixed cadence.

use std::thread::JoinHandle;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Capacity of every control mailbox.
pub const MAILBOX_CAPACITY: usize = 10;

/// Control messages accepted by every task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Begin or continue normal operation.
    Run,
    /// Suspend consumption. Data queues are left intact unless a task's
    /// contract says otherwise (display feeds discard while halted).
    Halt,
    /// Exit the task loop.
    Quit,
}

/// Sending half of a task mailbox.
pub type ControlSender = mpsc::Sender<Control>;
/// Receiving half of a task mailbox.
pub type ControlReceiver = mpsc::Receiver<Control>;

/// Allocates one bounded control mailbox.
pub fn mailbox() -> (ControlSender, ControlReceiver) {
    mpsc::channel(MAILBOX_CAPACITY)
}

/// Non-blocking mailbox poll; at most one message per call.
///
/// A disconnected mailbox means the lifecycle layer is gone, so it is
/// reported as [`Control::Quit`] and the orphaned task exits instead of
/// spinning forever.
pub fn poll(mailbox: &mut ControlReceiver) -> Option<Control> {
    match mailbox.try_recv() {
        Ok(msg) => Some(msg),
        Err(mpsc::error::TryRecvError::Empty) => None,
        Err(mpsc::error::TryRecvError::Disconnected) => Some(Control::Quit),
    }
}

/// Mailbox sender plus join handle for one spawned task thread.
pub struct TaskHandle {
    name: &'static str,
    mailbox: ControlSender,
    join: JoinHandle<()>,
}

impl TaskHandle {
    /// Bundles the control sender and thread handle for `name`.
    pub(crate) fn new(name: &'static str, mailbox: ControlSender, join: JoinHandle<()>) -> Self {
        Self {
            name,
            mailbox,
            join,
        }
    }

    /// Task name used in logs and lifecycle errors.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Queues a control message without blocking.
    ///
    /// A full or closed mailbox is logged and ignored: a slow or
    /// already-exited task must not wedge the caller.
    pub fn signal(&self, msg: Control) {
        if let Err(err) = self.mailbox.try_send(msg) {
            debug!("Control message {:?} for {} not delivered: {}", msg, self.name, err);
        }
    }

    /// Waits for the task thread to exit.
    pub fn join(self) -> Result<()> {
        self.join.join().map_err(|_| {
            warn!("Task {} panicked", self.name);
            Error::Lifecycle {
                task: self.name,
                message: "task thread panicked".into(),
            }
        })
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("name", &self.name)
            .field("finished", &self.join.is_finished())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_empty_mailbox() {
        let (_tx, mut rx) = mailbox();
        assert_eq!(poll(&mut rx), None);
    }

    #[test]
    fn test_poll_delivers_in_order() {
        let (tx, mut rx) = mailbox();
        tx.try_send(Control::Run).unwrap();
        tx.try_send(Control::Halt).unwrap();
        assert_eq!(poll(&mut rx), Some(Control::Run));
        assert_eq!(poll(&mut rx), Some(Control::Halt));
        assert_eq!(poll(&mut rx), None);
    }

    #[test]
    fn test_disconnected_mailbox_reads_as_quit() {
        let (tx, mut rx) = mailbox();
        drop(tx);
        assert_eq!(poll(&mut rx), Some(Control::Quit));
    }

    #[test]
    fn test_signal_tolerates_closed_mailbox() {
        let (tx, rx) = mailbox();
        let join = std::thread::spawn(|| {});
        let handle = TaskHandle::new("test", tx, join);
        drop(rx);
        // Must not panic or block.
        handle.signal(Control::Quit);
        handle.join().unwrap();
    }
}
