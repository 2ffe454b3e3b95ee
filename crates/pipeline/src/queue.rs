//! Bounded priority queue
//!
//! Four bands, FIFO within a band. When full, `critical` and `high`
//! submissions displace the oldest `low` entry; `normal` and `low`
//! submissions are rejected outright.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use orchestrator_core::Priority;

use crate::gate::SessionTicket;

/// A queued request together with its session-ordering ticket.
#[derive(Debug)]
pub struct QueuedCommand {
    pub request: orchestrator_core::CommandRequest,
    pub ticket: Option<SessionTicket>,
}

/// Outcome of a push.
#[derive(Debug)]
pub enum SubmitOutcome {
    Enqueued,
    /// Admitted by evicting the oldest `low` entry, which the caller
    /// must complete with `rejected-overload`.
    Displaced(QueuedCommand),
    Rejected(QueuedCommand),
}

struct Bands {
    bands: [VecDeque<QueuedCommand>; Priority::COUNT],
    len: usize,
}

pub struct CommandQueue {
    inner: Mutex<Bands>,
    notify: Notify,
    capacity: usize,
}

impl CommandQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Bands {
                bands: Default::default(),
                len: 0,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Admit a command under the displacement policy.
    pub fn push(&self, command: QueuedCommand) -> SubmitOutcome {
        let mut inner = self.inner.lock();
        let band = command.request.priority.band();

        if inner.len < self.capacity {
            inner.bands[band].push_back(command);
            inner.len += 1;
            drop(inner);
            self.notify.notify_one();
            return SubmitOutcome::Enqueued;
        }

        if command.request.priority.displaces() {
            if let Some(victim) = inner.bands[Priority::Low.band()].pop_front() {
                inner.bands[band].push_back(command);
                // len unchanged: one out, one in
                drop(inner);
                self.notify.notify_one();
                return SubmitOutcome::Displaced(victim);
            }
        }

        SubmitOutcome::Rejected(command)
    }

    fn pop(&self) -> Option<QueuedCommand> {
        let mut inner = self.inner.lock();
        for band in inner.bands.iter_mut() {
            if let Some(command) = band.pop_front() {
                inner.len -= 1;
                return Some(command);
            }
        }
        None
    }

    /// Wait for the next command. Returns `None` once `shutdown` fires.
    ///
    /// The wait is a bounded poll: wake-ups can coalesce under bursts,
    /// so waiters re-check the queue at a short interval as well.
    pub async fn dequeue(&self, shutdown: &CancellationToken) -> Option<QueuedCommand> {
        loop {
            if let Some(command) = self.pop() {
                return Some(command);
            }
            if shutdown.is_cancelled() {
                return None;
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(std::time::Duration::from_millis(50)) => {}
                _ = shutdown.cancelled() => return None,
            }
        }
    }

    /// Remove everything still queued, oldest and highest priority first.
    pub fn drain(&self) -> Vec<QueuedCommand> {
        let mut inner = self.inner.lock();
        let mut drained = Vec::with_capacity(inner.len);
        for band in inner.bands.iter_mut() {
            drained.extend(band.drain(..));
        }
        inner.len = 0;
        drained
    }
}
