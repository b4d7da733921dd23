use std::time::Duration;
use serde::Serialize;
use tracing::{info, warn};

/// What a client shows about its link to the room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Retries are exhausted; only a manual reconnect leaves this state.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    /// `base * 2^(attempt-1)`, capped at `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectStep {
    Retry { attempt: u32, delay: Duration },
    Exhausted,
}

/// Backoff state machine driven by connection outcomes.
#[derive(Debug, Clone)]
pub struct Reconnector {
    policy: ReconnectPolicy,
    attempts: u32,
    reauthed: bool,
    status: ConnectionStatus,
}

impl Reconnector {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            reauthed: false,
            status: ConnectionStatus::Disconnected,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn on_connecting(&mut self) {
        if !matches!(self.status, ConnectionStatus::Reconnecting { .. }) {
            self.status = ConnectionStatus::Connecting;
        }
    }

    /// The room accepted us: start over with a fresh budget.
    pub fn on_connected(&mut self) {
        self.attempts = 0;
        self.reauthed = false;
        self.status = ConnectionStatus::Connected;
    }

    pub fn on_unexpected_close(&mut self) -> ReconnectStep {
        if self.attempts >= self.policy.max_attempts {
            warn!("Giving up after {} reconnect attempts", self.attempts);
            self.status = ConnectionStatus::Failed;
            return ReconnectStep::Exhausted;
        }
        self.attempts += 1;
        self.status = ConnectionStatus::Reconnecting { attempt: self.attempts };
        ReconnectStep::Retry {
            attempt: self.attempts,
            delay: self.policy.delay(self.attempts),
        }
    }

    /// The token expired. The first time this happens since the last
    /// successful connect, retry at once with a fresh token; afterwards it
    /// counts like any other failure.
    pub fn on_auth_expired(&mut self) -> ReconnectStep {
        if self.reauthed {
            return self.on_unexpected_close();
        }
        self.reauthed = true;
        info!("Token expired, re-authenticating");
        self.status = ConnectionStatus::Reconnecting { attempt: self.attempts };
        ReconnectStep::Retry {
            attempt: self.attempts,
            delay: Duration::ZERO,
        }
    }

    /// Manual retry: reset the budget and skip any pending backoff.
    pub fn reconnect_now(&mut self) {
        self.attempts = 0;
        self.reauthed = false;
        self.status = ConnectionStatus::Connecting;
    }

    pub fn on_disconnect(&mut self) {
        self.attempts = 0;
        self.status = ConnectionStatus::Disconnected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_millis(1000),
            max_attempts: 5,
        }
    }

    #[test]
    fn delays_double_up_to_the_cap() {
        let p = policy();
        let delays: Vec<u64> = (1..=6).map(|n| p.delay(n).as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
        assert_eq!(p.delay(200), Duration::from_millis(1000));
    }

    #[test]
    fn attempt_after_the_last_is_terminal() {
        let mut r = Reconnector::new(policy());
        for n in 1..=5 {
            assert_eq!(
                r.on_unexpected_close(),
                ReconnectStep::Retry { attempt: n, delay: policy().delay(n) }
            );
            assert_eq!(r.status(), ConnectionStatus::Reconnecting { attempt: n });
        }
        assert_eq!(r.on_unexpected_close(), ReconnectStep::Exhausted);
        assert_eq!(r.status(), ConnectionStatus::Failed);
    }

    #[test]
    fn reconnect_now_resets_the_budget() {
        let mut r = Reconnector::new(policy());
        for _ in 0..6 {
            r.on_unexpected_close();
        }
        assert_eq!(r.status(), ConnectionStatus::Failed);

        r.reconnect_now();
        assert_eq!(r.status(), ConnectionStatus::Connecting);
        assert_eq!(
            r.on_unexpected_close(),
            ReconnectStep::Retry { attempt: 1, delay: Duration::from_millis(100) }
        );
    }

    #[test]
    fn expired_token_retries_immediately_once() {
        let mut r = Reconnector::new(policy());
        assert_eq!(
            r.on_auth_expired(),
            ReconnectStep::Retry { attempt: 0, delay: Duration::ZERO }
        );
        assert_eq!(
            r.on_auth_expired(),
            ReconnectStep::Retry { attempt: 1, delay: Duration::from_millis(100) }
        );

        r.on_connected();
        assert_eq!(r.attempts(), 0);
        assert_eq!(
            r.on_auth_expired(),
            ReconnectStep::Retry { attempt: 0, delay: Duration::ZERO }
        );
    }

    #[test]
    fn status_serializes_with_a_tag() {
        let json = serde_json::to_value(ConnectionStatus::Reconnecting { attempt: 2 }).unwrap();
        assert_eq!(json, serde_json::json!({ "status": "reconnecting", "attempt": 2 }));
    }
}
