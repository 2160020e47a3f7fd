//! Control surface for a hosted run.
//!
//! Signals are posted into a single-slot mailbox that the runner drains only at
//! iteration boundaries. Queries read the last committed snapshot from a watch
//! channel and never touch the runner.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, watch};

use crate::errors::ControlError;
use crate::models::{Progress, RunStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlSignal {
    Pause,
    Resume,
    Cancel,
}

impl ControlSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Cancel => "cancel",
        }
    }
}

/// Single-slot signal mailbox. A later signal replaces an earlier one, except
/// that a pending cancel is never replaced.
#[derive(Debug, Default)]
pub struct Mailbox {
    slot: Mutex<Option<ControlSignal>>,
    notify: Notify,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Option<ControlSignal>> {
        // The slot holds a Copy value, so a poisoned guard is still consistent.
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn post(&self, signal: ControlSignal) {
        {
            let mut slot = self.slot();
            if *slot != Some(ControlSignal::Cancel) {
                *slot = Some(signal);
            }
        }
        self.notify.notify_waiters();
    }

    /// Post whatever `decide` returns for the currently pending signal, with
    /// the slot locked for the whole decision. Returns whether anything was
    /// posted. A pending cancel is left alone and `decide` is not called.
    pub fn post_with<E>(
        &self,
        decide: impl FnOnce(Option<ControlSignal>) -> Result<Option<ControlSignal>, E>,
    ) -> Result<bool, E> {
        let posted = {
            let mut slot = self.slot();
            if *slot == Some(ControlSignal::Cancel) {
                return Ok(false);
            }
            match decide(*slot)? {
                Some(signal) => {
                    *slot = Some(signal);
                    true
                }
                None => false,
            }
        };
        if posted {
            self.notify.notify_waiters();
        }
        Ok(posted)
    }

    /// Remove and return the pending signal.
    pub fn take(&self) -> Option<ControlSignal> {
        self.slot().take()
    }

    pub fn peek(&self) -> Option<ControlSignal> {
        *self.slot()
    }

    pub fn cancel_pending(&self) -> bool {
        self.peek() == Some(ControlSignal::Cancel)
    }

    /// Wait until some signal is pending, then take it.
    pub async fn recv(&self) -> ControlSignal {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(signal) = self.take() {
                return signal;
            }
            notified.await;
        }
    }

    /// Resolve once a cancel is pending. Leaves the signal in place.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.cancel_pending() {
                return;
            }
            notified.await;
        }
    }
}

/// Outcome of a posted signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalAck {
    /// Queued for the runner.
    Accepted,
    /// Had nothing to do, e.g. pausing a paused run or cancelling a finished one.
    NoOp,
}

/// Caller-side handle to one run: progress queries and signals.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    run_id: String,
    mailbox: Arc<Mailbox>,
    progress: watch::Receiver<Progress>,
}

impl ControlHandle {
    pub fn new(run_id: String, mailbox: Arc<Mailbox>, progress: watch::Receiver<Progress>) -> Self {
        Self {
            run_id,
            mailbox,
            progress,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn progress(&self) -> Progress {
        self.progress.borrow().clone()
    }

    /// A receiver that observes every committed snapshot from now on.
    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.progress.clone()
    }

    pub fn status(&self) -> RunStatus {
        self.progress.borrow().status
    }

    /// Wait for the run to reach a terminal status and return the final snapshot.
    ///
    /// Fails with `RunnerStopped` if the runner goes away before that, which
    /// happens when it hits a checkpoint error.
    pub async fn wait_terminal(&mut self) -> Result<Progress, ControlError> {
        match self.progress.wait_for(|p| p.status.is_terminal()).await {
            Ok(progress) => Ok(progress.clone()),
            Err(_) => Err(ControlError::RunnerStopped {
                run_id: self.run_id.clone(),
            }),
        }
    }

    /// Whether the runner behind this handle still exists.
    pub fn is_live(&self) -> bool {
        self.progress.has_changed().is_ok()
    }

    fn ack(posted: bool) -> SignalAck {
        if posted {
            SignalAck::Accepted
        } else {
            SignalAck::NoOp
        }
    }

    /// Acks are decided from the committed status together with the pending
    /// signal, so a pause sent right after an unapplied resume (or the other
    /// way round) replaces it instead of being dropped.
    pub fn pause(&self) -> Result<SignalAck, ControlError> {
        let status = self.status();
        let posted = self.mailbox.post_with(|pending| {
            Ok::<_, ControlError>(match (status, pending) {
                (RunStatus::Running, Some(ControlSignal::Pause)) => None,
                (RunStatus::Running, _) => Some(ControlSignal::Pause),
                (RunStatus::Paused, Some(ControlSignal::Resume)) => Some(ControlSignal::Pause),
                _ => None,
            })
        })?;
        Ok(Self::ack(posted))
    }

    pub fn resume(&self) -> Result<SignalAck, ControlError> {
        let status = self.status();
        let posted = self.mailbox.post_with(|pending| match (status, pending) {
            (RunStatus::Paused, Some(ControlSignal::Resume)) => Ok(None),
            (RunStatus::Paused, _) => Ok(Some(ControlSignal::Resume)),
            (RunStatus::Running, Some(ControlSignal::Pause)) => Ok(Some(ControlSignal::Resume)),
            (RunStatus::Running, _) => Err(ControlError::Conflict {
                run_id: self.run_id.clone(),
                signal: ControlSignal::Resume.as_str().to_string(),
                status: RunStatus::Running,
            }),
            _ => Ok(None),
        })?;
        Ok(Self::ack(posted))
    }

    pub fn cancel(&self) -> Result<SignalAck, ControlError> {
        if self.status().is_terminal() {
            return Ok(SignalAck::NoOp);
        }
        self.mailbox.post(ControlSignal::Cancel);
        Ok(SignalAck::Accepted)
    }

    pub fn signal(&self, signal: ControlSignal) -> Result<SignalAck, ControlError> {
        match signal {
            ControlSignal::Pause => self.pause(),
            ControlSignal::Resume => self.resume(),
            ControlSignal::Cancel => self.cancel(),
        }
    }
}
