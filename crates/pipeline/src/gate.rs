//! Per-session FIFO gate
//!
//! Each session key gets a monotonically increasing sequence; a worker
//! may only start dispatching ticket `n` once every ticket below `n`
//! has finished. Tickets that terminate early (rejected, displaced,
//! cancelled, timed out) still finish, so a dead request never wedges
//! its session.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// An ordering ticket for one request on one session key.
#[derive(Debug, Clone)]
pub struct SessionTicket {
    pub key: String,
    pub seq: u64,
}

struct GateState {
    /// Next sequence allowed to start
    next: u64,
    /// Next sequence to hand out
    tail: u64,
    /// Sequences finished ahead of `next`
    done_ahead: BTreeSet<u64>,
    notify: Arc<Notify>,
}

#[derive(Default)]
pub struct SessionGate {
    sessions: Mutex<HashMap<String, GateState>>,
}

impl SessionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the next sequence number for a session key.
    pub fn enroll(&self, key: &str) -> SessionTicket {
        let mut sessions = self.sessions.lock();
        let state = sessions.entry(key.to_string()).or_insert_with(|| GateState {
            next: 0,
            tail: 0,
            done_ahead: BTreeSet::new(),
            notify: Arc::new(Notify::new()),
        });
        let seq = state.tail;
        state.tail += 1;
        SessionTicket {
            key: key.to_string(),
            seq,
        }
    }

    /// Wait until the ticket's turn, the deadline, or cancellation —
    /// whichever comes first. The caller re-checks deadline/cancel at
    /// the stage boundary as usual.
    pub async fn wait_turn(
        &self,
        ticket: &SessionTicket,
        deadline: Instant,
        cancel: &CancellationToken,
    ) {
        loop {
            let notify = {
                let sessions = self.sessions.lock();
                let Some(state) = sessions.get(&ticket.key) else {
                    return;
                };
                if state.next >= ticket.seq {
                    return;
                }
                state.notify.clone()
            };

            // Register for the notification before re-checking, so a
            // finish() between the check and the wait cannot be lost.
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_turn(ticket) {
                return;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return,
                _ = cancel.cancelled() => return,
            }
        }
    }

    /// Whether the ticket may start now.
    pub fn is_turn(&self, ticket: &SessionTicket) -> bool {
        self.sessions
            .lock()
            .get(&ticket.key)
            .map(|state| state.next >= ticket.seq)
            .unwrap_or(true)
    }

    /// Mark a ticket finished, unblocking the session's next request.
    /// Must be called exactly once per enrolled ticket.
    pub fn finish(&self, ticket: &SessionTicket) {
        let mut sessions = self.sessions.lock();
        let Some(state) = sessions.get_mut(&ticket.key) else {
            return;
        };

        if ticket.seq == state.next {
            state.next += 1;
            while state.done_ahead.remove(&state.next) {
                state.next += 1;
            }
        } else if ticket.seq > state.next {
            // Finished out of turn (e.g. displaced from the queue)
            state.done_ahead.insert(ticket.seq);
        }

        state.notify.notify_waiters();

        // Nothing outstanding: drop the entry so keys do not accumulate
        if state.next == state.tail && state.done_ahead.is_empty() {
            sessions.remove(&ticket.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_tickets_run_in_order() {
        let gate = Arc::new(SessionGate::new());
        let first = gate.enroll("sess_a");
        let second = gate.enroll("sess_a");

        assert!(gate.is_turn(&first));
        assert!(!gate.is_turn(&second));

        gate.finish(&first);
        assert!(gate.is_turn(&second));
        gate.finish(&second);
    }

    #[tokio::test]
    async fn test_out_of_order_finish_does_not_skip() {
        let gate = SessionGate::new();
        let a = gate.enroll("sess_a");
        let b = gate.enroll("sess_a");
        let c = gate.enroll("sess_a");

        // b dies early (displaced); c must still wait for a
        gate.finish(&b);
        assert!(!gate.is_turn(&c));

        gate.finish(&a);
        // a done and b already finished: c's turn
        assert!(gate.is_turn(&c));
        gate.finish(&c);
    }

    #[tokio::test]
    async fn test_independent_sessions_do_not_block() {
        let gate = SessionGate::new();
        let a1 = gate.enroll("sess_a");
        let _a2 = gate.enroll("sess_a");
        let b1 = gate.enroll("sess_b");

        assert!(gate.is_turn(&a1));
        assert!(gate.is_turn(&b1));
    }

    #[tokio::test]
    async fn test_wait_turn_unblocks_on_finish() {
        let gate = Arc::new(SessionGate::new());
        let first = gate.enroll("sess_a");
        let second = gate.enroll("sess_a");

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move {
                gate.wait_turn(
                    &second,
                    Instant::now() + Duration::from_secs(5),
                    &CancellationToken::new(),
                )
                .await;
                second
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        gate.finish(&first);
        let second = waiter.await.unwrap();
        assert!(gate.is_turn(&second));
    }

    #[tokio::test]
    async fn test_wait_turn_respects_deadline_and_cancel() {
        let gate = SessionGate::new();
        let _first = gate.enroll("sess_a");
        let second = gate.enroll("sess_a");

        // Deadline passes while first is still running
        gate.wait_turn(
            &second,
            Instant::now() + Duration::from_millis(20),
            &CancellationToken::new(),
        )
        .await;
        assert!(!gate.is_turn(&second));

        // Cancellation returns immediately
        let cancel = CancellationToken::new();
        cancel.cancel();
        gate.wait_turn(&second, Instant::now() + Duration::from_secs(5), &cancel)
            .await;
    }
}
