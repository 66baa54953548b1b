//! Single-slot handshake timer.
//!
//! Each connection owns one [`HandshakeTimer`]. Arming spawns a sleep task
//! that posts a [`TimerFired`] into the connection's timer channel; arming
//! again or disarming aborts that task first. Every arm bumps a generation
//! counter and [`HandshakeTimer::accept`] drops firings from older
//! generations, so a firing that was already queued when the timer was
//! re-armed never reaches the state machine.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// What the timer is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Waiting for the peer's next handshake message.
    WaitForReady,
    /// Time to ask the peer for more hello waiting time.
    SendProlongationRequest,
    /// Waiting for the answer to our prolongation request.
    ProlongRequestReply,
}

/// Posted by the sleep task when a deadline passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub kind: TimerKind,
    pub generation: u64,
}

struct Pending {
    kind: TimerKind,
    deadline: Instant,
    generation: u64,
    task: JoinHandle<()>,
}

pub struct HandshakeTimer {
    generation: u64,
    pending: Option<Pending>,
    fired_tx: mpsc::UnboundedSender<TimerFired>,
}

impl HandshakeTimer {
    /// Create a timer and the receiver its firings are delivered on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimerFired>) {
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        (
            Self {
                generation: 0,
                pending: None,
                fired_tx,
            },
            fired_rx,
        )
    }

    /// Arm the timer, replacing any pending deadline.
    pub fn arm(&mut self, kind: TimerKind, duration: Duration) {
        self.disarm();
        self.generation += 1;
        let generation = self.generation;
        let deadline = Instant::now() + duration;
        let tx = self.fired_tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = tx.send(TimerFired { kind, generation });
        });
        self.pending = Some(Pending {
            kind,
            deadline,
            generation,
            task,
        });
    }

    pub fn disarm(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.task.abort();
        }
    }

    /// Validate a firing. Returns its kind if it belongs to the armed deadline.
    pub fn accept(&mut self, fired: TimerFired) -> Option<TimerKind> {
        match &self.pending {
            Some(pending) if pending.generation == fired.generation => {
                self.pending = None;
                Some(fired.kind)
            }
            _ => None,
        }
    }

    #[cfg(test)]
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    #[cfg(test)]
    pub fn pending_kind(&self) -> Option<TimerKind> {
        self.pending.as_ref().map(|p| p.kind)
    }

    /// Time left until the pending deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.pending
            .as_ref()
            .map(|p| p.deadline.saturating_duration_since(Instant::now()))
    }
}

impl Drop for HandshakeTimer {
    fn drop(&mut self) {
        self.disarm();
    }
}
