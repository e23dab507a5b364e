//! App foreground/background/terminate handling.
//!
//! Backgrounding is debounced by a grace window so a brief system sheet or
//! app-switcher glance never touches the socket. Only once the window
//! expires does the engine tell the server and pause the heartbeat; the
//! socket itself stays open.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppTransition {
    Foreground,
    Background,
    Terminate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    Foreground,
    BackgroundGrace { deadline: Instant },
    Background,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    SendBackgroundingNotice,
    PauseHeartbeat,
    ResumeHeartbeat,
    Reconnect,
    Disconnect,
}

#[derive(Debug, Clone)]
pub struct LifecycleCoordinator {
    grace: Duration,
    phase: LifecyclePhase,
    pause_deferred: bool,
}

impl LifecycleCoordinator {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            phase: LifecyclePhase::Foreground,
            pause_deferred: false,
        }
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.phase
    }

    pub fn is_backgrounded(&self) -> bool {
        matches!(
            self.phase,
            LifecyclePhase::Background | LifecyclePhase::Terminated
        )
    }

    pub fn grace_deadline(&self) -> Option<Instant> {
        match self.phase {
            LifecyclePhase::BackgroundGrace { deadline } => Some(deadline),
            _ => None,
        }
    }

    pub fn on_background(&mut self, now: Instant) {
        if self.phase == LifecyclePhase::Foreground {
            self.phase = LifecyclePhase::BackgroundGrace {
                deadline: now + self.grace,
            };
        }
    }

    /// Grace deadline fired. A reply still streaming keeps the heartbeat
    /// alive until [`on_stream_settled`](Self::on_stream_settled).
    pub fn on_grace_elapsed(
        &mut self,
        now: Instant,
        connected: bool,
        stream_active: bool,
    ) -> Vec<LifecycleAction> {
        let LifecyclePhase::BackgroundGrace { deadline } = self.phase else {
            return Vec::new();
        };
        if now < deadline {
            return Vec::new();
        }

        self.phase = LifecyclePhase::Background;
        let mut actions = Vec::new();
        if connected {
            actions.push(LifecycleAction::SendBackgroundingNotice);
        }
        if stream_active {
            self.pause_deferred = true;
        } else {
            actions.push(LifecycleAction::PauseHeartbeat);
        }
        actions
    }

    pub fn on_stream_settled(&mut self) -> Option<LifecycleAction> {
        if self.pause_deferred && self.phase == LifecyclePhase::Background {
            self.pause_deferred = false;
            return Some(LifecycleAction::PauseHeartbeat);
        }
        None
    }

    pub fn on_foreground(&mut self, connected: bool) -> Vec<LifecycleAction> {
        let previous = self.phase;
        self.phase = LifecyclePhase::Foreground;
        self.pause_deferred = false;

        match (previous, connected) {
            (_, false) => vec![LifecycleAction::Reconnect],
            // Never paused; nothing to undo.
            (LifecyclePhase::BackgroundGrace { .. } | LifecyclePhase::Foreground, true) => {
                Vec::new()
            }
            (LifecyclePhase::Background | LifecyclePhase::Terminated, true) => {
                vec![LifecycleAction::ResumeHeartbeat]
            }
        }
    }

    pub fn on_terminate(&mut self) -> Vec<LifecycleAction> {
        self.phase = LifecyclePhase::Terminated;
        self.pause_deferred = false;
        vec![LifecycleAction::Disconnect]
    }
}
