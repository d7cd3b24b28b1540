use log::{debug, info, warn};
use tokio::time::{Duration, Instant};

use crate::device::types::LoopStopReason;

#[derive(Debug, Clone)]
pub struct LoopSendJob {
    pub payload: Vec<u8>,
    pub period: Duration,
    next_tick: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Not running, or the next tick is not due yet.
    Idle,
    Sent,
    Stopped { wrote: bool, reason: LoopStopReason },
}

/// Repeats one payload at a fixed period until stopped or until a write fails.
///
/// The sender does not own a timer. Its owner waits for `deadline()` and then calls `tick()`,
/// so once `stop()` has returned no further write can happen.
#[derive(Debug, Default)]
pub struct LoopSender {
    job: Option<LoopSendJob>,
}

impl LoopSender {
    pub fn new() -> Self {
        LoopSender::default()
    }

    pub fn is_running(&self) -> bool {
        self.job.is_some()
    }

    pub fn job(&self) -> Option<&LoopSendJob> {
        self.job.as_ref()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.job.as_ref().map(|job| job.next_tick)
    }

    /// Returns `false` without touching the running job if one is already active.
    /// The first tick is due immediately.
    pub fn start(&mut self, payload: Vec<u8>, period: Duration, now: Instant) -> bool {
        if self.job.is_some() {
            return false;
        }

        info!("Loop send started: {} bytes every {:?}", payload.len(), period);
        self.job = Some(LoopSendJob { payload, period, next_tick: now });
        true
    }

    /// Returns the reason if a job was actually stopped.
    pub fn stop(&mut self, reason: LoopStopReason) -> Option<LoopStopReason> {
        self.job.take()?;
        info!("Loop send stopped: {}", reason);
        Some(reason)
    }

    pub fn tick<W>(&mut self, now: Instant, capability_held: bool, write: W) -> TickOutcome
    where
        W: FnOnce(&[u8]) -> bool,
    {
        let job = match self.job.as_mut() {
            Some(job) if job.next_tick <= now => job,
            _ => return TickOutcome::Idle,
        };

        if !capability_held {
            warn!("Connect capability lost while loop sending");
            self.job = None;
            return TickOutcome::Stopped { wrote: false, reason: LoopStopReason::CapabilityRevoked };
        }

        if !write(&job.payload) {
            warn!("Loop write failed; stopping");
            self.job = None;
            return TickOutcome::Stopped { wrote: true, reason: LoopStopReason::WriteFailed };
        }

        job.next_tick = now + job.period;
        debug!("Loop tick sent; next at {:?}", job.next_tick);
        TickOutcome::Sent
    }
}
