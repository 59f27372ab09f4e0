//! Bounded auto-restart with exponential backoff.

use std::time::Duration;

use mission_protocol::SessionConfig;

use crate::backend::BackendError;
use crate::backend::FailureKind;
use crate::config::RestartSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl RestartPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    pub fn from_settings(settings: &RestartSettings) -> Self {
        Self::new(settings.base_delay(), settings.max_delay())
    }

    /// `base * 2^restart_count`, capped at `max`.
    pub fn backoff_delay(&self, restart_count: u32) -> Duration {
        let factor = 1u32.checked_shl(restart_count).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::from_settings(&RestartSettings::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartDecision {
    /// Re-run the backend after `delay`; `attempt` is the new restart count.
    Restart { attempt: u32, delay: Duration },
    /// The failure is terminal for this session.
    GiveUp,
}

pub fn decide(
    policy: &RestartPolicy,
    config: &SessionConfig,
    restart_count: u32,
    error: &BackendError,
) -> RestartDecision {
    if error.kind() != FailureKind::Transient {
        return RestartDecision::GiveUp;
    }
    if !config.auto_restart || restart_count >= config.max_restarts {
        return RestartDecision::GiveUp;
    }
    RestartDecision::Restart {
        attempt: restart_count + 1,
        delay: policy.backoff_delay(restart_count),
    }
}
