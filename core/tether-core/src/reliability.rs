//! Reconnect scheduling.
//!
//! Pure state machine: the engine feeds it transport outcomes and arms a
//! single deadline from whatever delay it returns. The attempt counter only
//! resets on a confirmed handshake (`welcome`), so a server that accepts the
//! socket and then drops it still backs off.

use std::time::Duration;

use tether_protocol::NORMAL_CLOSE_CODE;

use crate::config::BackoffPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPhase {
    Idle,
    BackoffScheduled { attempt: u32, delay: Duration },
    Connecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectKind {
    /// Caller asked for it (`disconnect()`, terminate, superseding `connect()`).
    Deliberate,
    /// Server closed with 1000.
    ServerNormalClose,
    Unexpected,
}

impl DisconnectKind {
    pub fn classify(close_code: Option<u16>) -> Self {
        match close_code {
            Some(NORMAL_CLOSE_CODE) => DisconnectKind::ServerNormalClose,
            _ => DisconnectKind::Unexpected,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReliabilityCoordinator {
    policy: BackoffPolicy,
    phase: ReconnectPhase,
    attempt: u32,
    wants_connection: bool,
}

impl ReliabilityCoordinator {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            phase: ReconnectPhase::Idle,
            attempt: 0,
            wants_connection: false,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn on_connect_requested(&mut self) {
        self.wants_connection = true;
        self.phase = ReconnectPhase::Connecting;
    }

    pub fn on_handshake_confirmed(&mut self) {
        self.attempt = 0;
        self.phase = ReconnectPhase::Idle;
    }

    /// Returns the delay before the next attempt, or `None` when no retry
    /// should happen.
    pub fn on_disconnect(&mut self, kind: DisconnectKind) -> Option<Duration> {
        match kind {
            DisconnectKind::Deliberate | DisconnectKind::ServerNormalClose => {
                self.wants_connection = false;
                self.phase = ReconnectPhase::Idle;
                None
            }
            DisconnectKind::Unexpected if !self.wants_connection => {
                self.phase = ReconnectPhase::Idle;
                None
            }
            DisconnectKind::Unexpected => {
                let delay = self.policy.delay_for(self.attempt);
                self.attempt = self.attempt.saturating_add(1);
                self.phase = ReconnectPhase::BackoffScheduled {
                    attempt: self.attempt,
                    delay,
                };
                Some(delay)
            }
        }
    }

    /// Backoff deadline fired. Returns true if a connect should be issued.
    pub fn on_backoff_elapsed(&mut self) -> bool {
        if matches!(self.phase, ReconnectPhase::BackoffScheduled { .. }) && self.wants_connection {
            self.phase = ReconnectPhase::Connecting;
            return true;
        }
        false
    }

    pub fn cancel_reconnection(&mut self) {
        if matches!(self.phase, ReconnectPhase::BackoffScheduled { .. }) {
            self.phase = ReconnectPhase::Idle;
        }
        self.wants_connection = false;
    }

    /// Zeroes the attempt counter. A pending backoff stays scheduled but is
    /// shortened to the first-attempt delay, which is returned so the caller
    /// can re-arm its deadline.
    pub fn reset_reconnection_state(&mut self) -> Option<Duration> {
        self.attempt = 0;
        match self.phase {
            ReconnectPhase::BackoffScheduled { .. } if self.wants_connection => {
                let delay = self.policy.delay_for(0);
                self.phase = ReconnectPhase::BackoffScheduled { attempt: 0, delay };
                Some(delay)
            }
            _ => None,
        }
    }

    /// True once retries have reached the capped interval.
    pub fn is_at_cap(&self, delay: Duration) -> bool {
        delay >= self.policy.cap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> ReliabilityCoordinator {
        let mut coordinator = ReliabilityCoordinator::new(BackoffPolicy::default());
        coordinator.on_connect_requested();
        coordinator
    }

    #[test]
    fn test_unexpected_disconnects_follow_schedule() {
        let mut coordinator = coordinator();
        let delays: Vec<u64> = (0..7)
            .map(|_| {
                coordinator
                    .on_disconnect(DisconnectKind::Unexpected)
                    .map(|delay| delay.as_secs())
                    .unwrap_or_default()
            })
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
        assert!(coordinator.is_at_cap(Duration::from_secs(30)));
    }

    #[test]
    fn test_socket_open_without_welcome_keeps_attempt() {
        let mut coordinator = coordinator();
        coordinator.on_disconnect(DisconnectKind::Unexpected);
        assert!(coordinator.on_backoff_elapsed());
        coordinator.on_connect_requested();
        // Socket opened but dropped before the welcome frame.
        let delay = coordinator.on_disconnect(DisconnectKind::Unexpected);
        assert_eq!(delay, Some(Duration::from_secs(2)));
        assert_eq!(coordinator.attempt(), 2);
    }

    #[test]
    fn test_handshake_resets_attempt() {
        let mut coordinator = coordinator();
        coordinator.on_disconnect(DisconnectKind::Unexpected);
        coordinator.on_disconnect(DisconnectKind::Unexpected);
        coordinator.on_handshake_confirmed();
        assert_eq!(coordinator.attempt(), 0);
        assert_eq!(
            coordinator.on_disconnect(DisconnectKind::Unexpected),
            Some(Duration::from_secs(1))
        );
    }

    #[test]
    fn test_deliberate_disconnect_does_not_count() {
        let mut coordinator = coordinator();
        coordinator.on_disconnect(DisconnectKind::Unexpected);
        assert_eq!(coordinator.on_disconnect(DisconnectKind::Deliberate), None);
        assert_eq!(coordinator.attempt(), 1);
        assert_eq!(coordinator.phase, ReconnectPhase::Idle);
        assert!(!coordinator.on_backoff_elapsed());
    }

    #[test]
    fn test_server_normal_close_is_not_retried() {
        let mut coordinator = coordinator();
        let kind = DisconnectKind::classify(Some(1000));
        assert_eq!(kind, DisconnectKind::ServerNormalClose);
        assert_eq!(coordinator.on_disconnect(kind), None);
        assert_eq!(DisconnectKind::classify(None), DisconnectKind::Unexpected);
        assert_eq!(DisconnectKind::classify(Some(1006)), DisconnectKind::Unexpected);
    }

    #[test]
    fn test_cancel_reconnection_drops_schedule() {
        let mut coordinator = coordinator();
        coordinator.on_disconnect(DisconnectKind::Unexpected);
        coordinator.cancel_reconnection();
        assert_eq!(coordinator.phase, ReconnectPhase::Idle);
        assert!(!coordinator.on_backoff_elapsed());
    }

    #[test]
    fn test_reset_reconnection_state() {
        let mut coordinator = coordinator();
        coordinator.on_disconnect(DisconnectKind::Unexpected);
        coordinator.on_disconnect(DisconnectKind::Unexpected);
        assert_eq!(
            coordinator.reset_reconnection_state(),
            Some(Duration::from_secs(1))
        );
        assert_eq!(coordinator.attempt(), 0);
        assert!(coordinator.wants_connection);
    }

    #[test]
    fn test_reset_during_backoff_still_reconnects() {
        let mut coordinator = coordinator();
        coordinator.on_disconnect(DisconnectKind::Unexpected);
        coordinator.on_disconnect(DisconnectKind::Unexpected);
        coordinator.reset_reconnection_state();
        assert!(coordinator.on_backoff_elapsed());
        assert_eq!(coordinator.phase, ReconnectPhase::Connecting);
        coordinator.on_connect_requested();
        assert_eq!(
            coordinator.on_disconnect(DisconnectKind::Unexpected),
            Some(Duration::from_secs(1))
        );
    }

    #[test]
    fn test_reset_while_idle_schedules_nothing() {
        let mut coordinator = coordinator();
        coordinator.on_handshake_confirmed();
        assert_eq!(coordinator.reset_reconnection_state(), None);
        coordinator.cancel_reconnection();
        coordinator.on_disconnect(DisconnectKind::Unexpected);
        assert_eq!(coordinator.reset_reconnection_state(), None);
        assert!(!coordinator.on_backoff_elapsed());
    }
}
