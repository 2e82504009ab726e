//! Shutdown coordination.
//!
//! Two pieces live here:
//!
//! - [`ShutdownFlag`], the process-wide stop request. The daemon's signal
//!   handler sets it; every thread observes it at each iteration and stops
//!   initiating new work.
//! - [`request_stop`], the escalation protocol applied to one encoder:
//!
//! ```text
//! REQUESTED -> GRACEFUL_SENT -> WAIT1 -> TERMINATE_SENT -> WAIT2 -> KILLED -> REAPED
//! ```
//!
//! The escalation is not itself cancellable. It is used for staleness/crash
//! restarts and for daemon shutdown alike, and every wait in it is bounded.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::RecorderConfig;
use crate::encoder::EncoderProcess;
use crate::session::EncoderExit;

/// Upper bound on a single uninterrupted sleep anywhere in the daemon.
const SLEEP_SLICE: Duration = Duration::from_millis(50);
const ESCALATION_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Cooperative, process-wide shutdown request.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag {
    requested: Arc<AtomicBool>,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        if !self.requested.swap(true, Ordering::SeqCst) {
            info!("Shutdown requested");
        }
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Sleeps for `duration` in short slices. Returns `true` if shutdown was
    /// requested before or during the sleep.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = deadline_after(duration);
        loop {
            if self.is_requested() {
                return true;
            }
            match next_slice(deadline, SLEEP_SLICE) {
                Some(slice) => thread::sleep(slice),
                None => return false,
            }
        }
    }
}

/// `now + duration`, or `None` (no deadline) when `Instant` cannot represent it.
pub(crate) fn deadline_after(duration: Duration) -> Option<Instant> {
    Instant::now().checked_add(duration)
}

/// Next sleep before re-checking, at most `slice`. `None` once `deadline` has passed.
pub(crate) fn next_slice(deadline: Option<Instant>, slice: Duration) -> Option<Duration> {
    let Some(deadline) = deadline else {
        return Some(slice);
    };
    let now = Instant::now();
    if now >= deadline {
        None
    } else {
        Some((deadline - now).min(slice))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EscalationStage {
    Requested,
    GracefulSent,
    Wait1,
    TerminateSent,
    Wait2,
    Killed,
    Reaped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalationTimeouts {
    pub graceful_quit: Duration,
    pub terminate: Duration,
    pub poll: Duration,
}

impl EscalationTimeouts {
    pub fn from_config(config: &RecorderConfig) -> Self {
        Self {
            graceful_quit: config.graceful_quit_timeout,
            terminate: config.terminate_timeout,
            poll: ESCALATION_POLL_INTERVAL,
        }
    }
}

/// Result of one escalation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopOutcome {
    pub exit: EncoderExit,
    /// Every stage entered, with the time since the request.
    pub transitions: Vec<(EscalationStage, Duration)>,
}

impl StopOutcome {
    /// Most forceful action that was needed.
    pub fn escalated_to(&self) -> EscalationStage {
        self.transitions
            .iter()
            .map(|(stage, _)| *stage)
            .filter(|stage| {
                matches!(
                    stage,
                    EscalationStage::GracefulSent
                        | EscalationStage::TerminateSent
                        | EscalationStage::Killed
                )
            })
            .max()
            .unwrap_or(EscalationStage::Requested)
    }

    pub fn entered_at(&self, stage: EscalationStage) -> Option<Duration> {
        self.transitions
            .iter()
            .find(|(entered, _)| *entered == stage)
            .map(|(_, at)| *at)
    }
}

struct Transitions {
    started: Instant,
    entries: Vec<(EscalationStage, Duration)>,
}

impl Transitions {
    fn new() -> Self {
        let mut transitions = Self {
            started: Instant::now(),
            entries: Vec::new(),
        };
        transitions.enter(EscalationStage::Requested);
        transitions
    }

    fn enter(&mut self, stage: EscalationStage) {
        let elapsed = self.started.elapsed();
        debug!(stage = ?stage, elapsed_ms = elapsed.as_millis() as u64, "Escalation stage");
        self.entries.push((stage, elapsed));
    }

    fn finish(mut self, exit: EncoderExit) -> StopOutcome {
        self.enter(EscalationStage::Reaped);
        StopOutcome {
            exit,
            transitions: self.entries,
        }
    }
}

/// Stops `process`, escalating graceful quit → terminate → kill.
///
/// Returns only once the process has been reaped. The only error is a failure
/// of the final blocking wait after the kill signal.
pub fn request_stop<P>(process: &mut P, timeouts: &EscalationTimeouts) -> io::Result<StopOutcome>
where
    P: EncoderProcess + ?Sized,
{
    let pid = process.id();
    let mut transitions = Transitions::new();

    if let Some(exit) = poll_logged(process) {
        return Ok(transitions.finish(exit));
    }

    let graceful_sent = match process.send_graceful_quit() {
        Ok(sent) => sent,
        Err(err) => {
            warn!(pid, error = %err, "Failed to send graceful quit to encoder");
            false
        }
    };

    if graceful_sent {
        transitions.enter(EscalationStage::GracefulSent);
        transitions.enter(EscalationStage::Wait1);
        if let Some(exit) = wait_for_exit(process, timeouts.graceful_quit, timeouts.poll) {
            info!(pid, exit = %exit, "Encoder quit gracefully");
            return Ok(transitions.finish(exit));
        }
        warn!(
            pid,
            timeout_secs = timeouts.graceful_quit.as_secs_f64(),
            "Encoder ignored graceful quit; sending terminate signal"
        );
    } else {
        debug!(pid, "Encoder has no input channel; skipping graceful quit");
    }

    transitions.enter(EscalationStage::TerminateSent);
    if let Err(err) = process.terminate() {
        warn!(pid, error = %err, "Failed to send terminate signal to encoder");
    }
    transitions.enter(EscalationStage::Wait2);
    if let Some(exit) = wait_for_exit(process, timeouts.terminate, timeouts.poll) {
        info!(pid, exit = %exit, "Encoder terminated");
        return Ok(transitions.finish(exit));
    }

    warn!(
        pid,
        timeout_secs = timeouts.terminate.as_secs_f64(),
        "Encoder ignored terminate signal; killing"
    );
    transitions.enter(EscalationStage::Killed);
    if let Err(err) = process.kill() {
        warn!(pid, error = %err, "Failed to send kill signal to encoder");
    }
    let exit = process.wait()?;
    info!(pid, exit = %exit, "Encoder killed");
    Ok(transitions.finish(exit))
}

fn poll_logged<P: EncoderProcess + ?Sized>(process: &mut P) -> Option<EncoderExit> {
    match process.poll_exit() {
        Ok(exit) => exit,
        Err(err) => {
            warn!(pid = process.id(), error = %err, "Failed to poll encoder exit");
            None
        }
    }
}

fn wait_for_exit<P: EncoderProcess + ?Sized>(
    process: &mut P,
    timeout: Duration,
    poll: Duration,
) -> Option<EncoderExit> {
    let deadline = deadline_after(timeout);
    loop {
        if let Some(exit) = poll_logged(process) {
            return Some(exit);
        }
        thread::sleep(next_slice(deadline, poll)?);
    }
}
