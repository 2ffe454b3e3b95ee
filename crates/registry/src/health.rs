//! Health state machine
//!
//! States: unknown, healthy, degraded, unhealthy. Invocation outcomes,
//! probe results, and heartbeat age drive the transitions of §service
//! policy: consecutive-failure windows demote, consecutive fast
//! successes promote, and probes recover unhealthy services one level.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use orchestrator_core::HealthStatus;

/// Consecutive failures are only counted within this window.
const FAILURE_WINDOW: Duration = Duration::from_secs(30);

/// Soft failures to demote healthy -> degraded.
const SOFT_FAILURES_TO_DEGRADE: u32 = 2;

/// Hard failures to demote degraded -> unhealthy.
const HARD_FAILURES_TO_UNHEALTHY: u32 = 3;

/// Fast successes to promote degraded -> healthy.
const SUCCESSES_TO_RECOVER: u32 = 3;

/// Sliding latency window size and the minimum samples before the p95
/// rule can demote.
const LATENCY_WINDOW: usize = 64;
const MIN_LATENCY_SAMPLES: usize = 5;

/// Per-service health bookkeeping.
#[derive(Debug)]
pub struct HealthState {
    status: HealthStatus,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    consecutive_hard: u32,
    consecutive_fast_successes: u32,
    latencies: VecDeque<Duration>,
    unhealthy_since: Option<Instant>,
    failed_probes: u32,
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            status: HealthStatus::Unknown,
            consecutive_failures: 0,
            last_failure: None,
            consecutive_hard: 0,
            consecutive_fast_successes: 0,
            latencies: VecDeque::with_capacity(LATENCY_WINDOW),
            unhealthy_since: None,
            failed_probes: 0,
        }
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn failed_probes(&self) -> u32 {
        self.failed_probes
    }

    /// How long the service has been continuously unhealthy.
    pub fn unhealthy_for(&self, now: Instant) -> Option<Duration> {
        self.unhealthy_since.map(|since| now - since)
    }

    /// A successful invocation with its latency.
    pub fn on_success(&mut self, latency: Duration, threshold: Duration) {
        self.consecutive_failures = 0;
        self.consecutive_hard = 0;
        self.last_failure = None;
        self.push_latency(latency);

        if latency < threshold {
            self.consecutive_fast_successes += 1;
        } else {
            self.consecutive_fast_successes = 0;
        }

        match self.status {
            HealthStatus::Unknown => self.set_status(HealthStatus::Healthy),
            HealthStatus::Degraded => {
                if self.consecutive_fast_successes >= SUCCESSES_TO_RECOVER {
                    self.set_status(HealthStatus::Healthy);
                    // Stale slow samples must not immediately re-demote
                    self.latencies.clear();
                }
            }
            HealthStatus::Healthy => {
                if self.p95().map(|p| p > threshold).unwrap_or(false) {
                    self.set_status(HealthStatus::Degraded);
                }
            }
            HealthStatus::Unhealthy => {}
        }
    }

    /// A structured downstream error (5xx-equivalent).
    pub fn on_soft_failure(&mut self, now: Instant) {
        self.record_failure(now, false);
        if self.status == HealthStatus::Healthy
            && self.consecutive_failures >= SOFT_FAILURES_TO_DEGRADE
        {
            self.set_status(HealthStatus::Degraded);
        }
    }

    /// A timeout or transport failure.
    pub fn on_hard_failure(&mut self, now: Instant) {
        self.record_failure(now, true);
        if self.status == HealthStatus::Healthy
            && self.consecutive_failures >= SOFT_FAILURES_TO_DEGRADE
        {
            self.set_status(HealthStatus::Degraded);
        }
        if self.status == HealthStatus::Degraded
            && self.consecutive_hard >= HARD_FAILURES_TO_UNHEALTHY
        {
            self.set_status(HealthStatus::Unhealthy);
        }
    }

    fn record_failure(&mut self, now: Instant, hard: bool) {
        let in_window = self
            .last_failure
            .map(|t| now - t < FAILURE_WINDOW)
            .unwrap_or(false);
        if in_window {
            self.consecutive_failures += 1;
            if hard {
                self.consecutive_hard += 1;
            }
        } else {
            self.consecutive_failures = 1;
            self.consecutive_hard = u32::from(hard);
        }
        self.last_failure = Some(now);
        self.consecutive_fast_successes = 0;
    }

    /// A successful health probe.
    pub fn on_probe_success(&mut self) {
        self.failed_probes = 0;
        match self.status {
            HealthStatus::Unknown => self.set_status(HealthStatus::Healthy),
            HealthStatus::Unhealthy => self.set_status(HealthStatus::Degraded),
            _ => {}
        }
    }

    /// A probe that reported degraded (e.g. HTTP 503).
    pub fn on_probe_degraded(&mut self) {
        self.failed_probes = 0;
        if self.status == HealthStatus::Healthy || self.status == HealthStatus::Unknown {
            self.set_status(HealthStatus::Degraded);
        }
    }

    /// A probe that failed outright.
    pub fn on_probe_failure(&mut self) {
        self.failed_probes += 1;
    }

    /// Heartbeat-age demotions: one level at 3x the interval, straight
    /// to unhealthy at 5x.
    pub fn on_heartbeat_age(&mut self, age: Duration, interval: Duration) {
        if age >= interval * 5 {
            if self.status != HealthStatus::Unhealthy {
                self.set_status(HealthStatus::Unhealthy);
            }
        } else if age >= interval * 3 {
            let demoted = self.status.demoted();
            if demoted != self.status {
                self.set_status(demoted);
            }
        }
    }

    pub fn force(&mut self, status: HealthStatus) {
        self.set_status(status);
    }

    fn set_status(&mut self, status: HealthStatus) {
        if status == self.status {
            return;
        }
        tracing::debug!(from = %self.status, to = %status, "health transition");
        if status == HealthStatus::Unhealthy {
            self.unhealthy_since = Some(Instant::now());
        } else {
            self.unhealthy_since = None;
        }
        if status == HealthStatus::Healthy || status == HealthStatus::Degraded {
            self.consecutive_fast_successes = 0;
        }
        self.status = status;
    }

    fn push_latency(&mut self, latency: Duration) {
        if self.latencies.len() == LATENCY_WINDOW {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency);
    }

    /// p95 over the sliding window, once enough samples exist.
    fn p95(&self) -> Option<Duration> {
        if self.latencies.len() < MIN_LATENCY_SAMPLES {
            return None;
        }
        let mut sorted: Vec<Duration> = self.latencies.iter().copied().collect();
        sorted.sort();
        let rank = ((sorted.len() as f64) * 0.95).ceil() as usize;
        sorted.get(rank.saturating_sub(1)).copied()
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}
