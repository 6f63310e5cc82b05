//! Consecutive-failure tracking for a single node.

use tracing::{debug, warn};

/// Result of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The endpoint answered (TCP accept or HTTP 2xx).
    Healthy,
    /// The endpoint answered with a non-2xx status.
    Unhealthy,
    /// The probe could not be executed (connection refused, timeout).
    Failed,
}

impl ProbeResult {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeResult::Healthy)
    }
}

/// Health verdict derived from a run of probe results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// No probe recorded yet.
    Unknown,
    Healthy,
    /// At or past the consecutive-failure threshold.
    Unhealthy,
}

/// Tracks consecutive probe results for a single node.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    status: HealthStatus,
    consecutive_failures: u32,
    /// Failures in a row before marking unhealthy.
    unhealthy_threshold: u32,
}

impl HealthTracker {
    /// Create a tracker; a single success marks the node healthy.
    pub fn new(unhealthy_threshold: u32) -> Self {
        Self {
            status: HealthStatus::Unknown,
            consecutive_failures: 0,
            unhealthy_threshold: unhealthy_threshold.max(1),
        }
    }

    /// Record a probe result and return the new health status.
    pub fn record(&mut self, result: ProbeResult) -> HealthStatus {
        match result {
            ProbeResult::Healthy => {
                if self.status != HealthStatus::Healthy {
                    debug!("node healthy");
                }
                self.consecutive_failures = 0;
                self.status = HealthStatus::Healthy;
            }
            ProbeResult::Unhealthy | ProbeResult::Failed => {
                self.consecutive_failures += 1;

                if self.consecutive_failures >= self.unhealthy_threshold {
                    if self.status != HealthStatus::Unhealthy {
                        warn!(
                            failures = self.consecutive_failures,
                            threshold = self.unhealthy_threshold,
                            "node marked unhealthy"
                        );
                    }
                    self.status = HealthStatus::Unhealthy;
                }
            }
        }

        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}
