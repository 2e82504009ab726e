//! Restart policy: exit classification and relaunch decisions.
//!
//! Exit codes 0 (clean), 255 (interrupted) and 137 (SIGKILL from our own
//! escalation) are expected. Anything else, or a staleness kill, is a crash.
//!
//! Crashes relaunch immediately until they cluster: more than `MAX_CRASHES`
//! inside `CRASH_WINDOW` adds a growing delay, capped at `CRASH_BACKOFF_MAX`.

use std::cmp;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::liveness::StaleReason;
use crate::session::EncoderExit;

pub const EXPECTED_EXIT_CODES: [i32; 3] = [0, 255, 137];

const CRASH_WINDOW: Duration = Duration::from_secs(120);
const MAX_CRASHES: usize = 3;
const CRASH_BACKOFF_STEP: Duration = Duration::from_secs(10);
const CRASH_BACKOFF_MAX: Duration = Duration::from_secs(60);

const LAUNCH_BACKOFF_STEP: Duration = Duration::from_secs(2);
const LAUNCH_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Consecutive launch failures after which each further failure is logged as an error.
pub const LAUNCH_FAILURE_ALERT_THRESHOLD: u32 = 5;

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(EncoderExit),
    Stale(StaleReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    Expected,
    Crash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    Restart { delay: Duration },
    Stop,
}

pub fn classify(termination: &Termination) -> ExitClass {
    match termination {
        Termination::Exited(exit) if EXPECTED_EXIT_CODES.contains(&exit.code()) => {
            ExitClass::Expected
        }
        Termination::Exited(_) | Termination::Stale(_) => ExitClass::Crash,
    }
}

#[derive(Debug, Clone)]
pub struct RestartPolicy {
    crashes: VecDeque<Instant>,
    crash_window: Duration,
    max_crashes: usize,
    crash_backoff_step: Duration,
    crash_backoff_max: Duration,
    launch_backoff_step: Duration,
    launch_backoff_max: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            crashes: VecDeque::new(),
            crash_window: CRASH_WINDOW,
            max_crashes: MAX_CRASHES,
            crash_backoff_step: CRASH_BACKOFF_STEP,
            crash_backoff_max: CRASH_BACKOFF_MAX,
            launch_backoff_step: LAUNCH_BACKOFF_STEP,
            launch_backoff_max: LAUNCH_BACKOFF_MAX,
        }
    }
}

impl RestartPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_launch_backoff(mut self, step: Duration, max: Duration) -> Self {
        self.launch_backoff_step = step;
        self.launch_backoff_max = max;
        self
    }

    pub fn with_crash_backoff(mut self, step: Duration, max: Duration) -> Self {
        self.crash_backoff_step = step;
        self.crash_backoff_max = max;
        self
    }

    pub fn decide(
        &mut self,
        termination: &Termination,
        shutdown_requested: bool,
        now: Instant,
    ) -> RestartDecision {
        if shutdown_requested {
            return RestartDecision::Stop;
        }

        match classify(termination) {
            ExitClass::Expected => RestartDecision::Restart {
                delay: Duration::ZERO,
            },
            ExitClass::Crash => {
                let delay = self.record_crash(now).unwrap_or(Duration::ZERO);
                if !delay.is_zero() {
                    warn!(
                        crashes = self.crashes.len(),
                        backoff_secs = delay.as_secs_f64(),
                        "Encoder crash loop backoff engaged"
                    );
                }
                RestartDecision::Restart { delay }
            }
        }
    }

    /// Delay before retrying after `consecutive_failures` failed launches (>= 1).
    pub fn launch_backoff(&self, consecutive_failures: u32) -> Duration {
        let backoff = self
            .launch_backoff_step
            .saturating_mul(consecutive_failures.max(1));
        cmp::min(backoff, self.launch_backoff_max)
    }

    /// Crashes currently inside the window.
    pub fn recent_crashes(&self) -> usize {
        self.crashes.len()
    }

    fn record_crash(&mut self, now: Instant) -> Option<Duration> {
        while let Some(oldest) = self.crashes.front() {
            if now.saturating_duration_since(*oldest) > self.crash_window {
                self.crashes.pop_front();
            } else {
                break;
            }
        }

        self.crashes.push_back(now);

        if self.crashes.len() <= self.max_crashes {
            return None;
        }

        let extra = self.crashes.len().saturating_sub(self.max_crashes) as u32;
        let backoff = self.crash_backoff_step.saturating_mul(extra);
        Some(cmp::min(backoff, self.crash_backoff_max))
    }
}
