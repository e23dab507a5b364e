//! Liveness pings for the primary connection.

use tokio::time::Instant;

use crate::config::HeartbeatConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    SendPing,
    /// Too many pings went unanswered; treat the socket as dead.
    Stale { missed: u32 },
}

#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    running: bool,
    paused: bool,
    next_ping: Option<Instant>,
    outstanding: u32,
}

impl HeartbeatMonitor {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            running: false,
            paused: false,
            next_ping: None,
            outstanding: 0,
        }
    }

    /// Called once the handshake is confirmed.
    pub fn start(&mut self, now: Instant) {
        self.running = true;
        self.paused = false;
        self.outstanding = 0;
        self.next_ping = Some(now + self.config.interval());
    }

    pub fn stop(&mut self) {
        self.running = false;
        self.paused = false;
        self.outstanding = 0;
        self.next_ping = None;
    }

    pub fn pause(&mut self) {
        if self.running {
            self.paused = true;
            self.next_ping = None;
        }
    }

    pub fn resume(&mut self, now: Instant) {
        if self.running && self.paused {
            self.paused = false;
            self.outstanding = 0;
            self.next_ping = Some(now + self.config.interval());
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.next_ping
    }

    pub fn on_pong(&mut self) {
        self.outstanding = 0;
    }

    pub fn on_tick(&mut self, now: Instant) -> Option<HeartbeatAction> {
        let deadline = self.next_ping?;
        if now < deadline {
            return None;
        }
        if self.outstanding >= self.config.max_missed_pongs {
            let missed = self.outstanding;
            self.stop();
            return Some(HeartbeatAction::Stale { missed });
        }
        self.outstanding += 1;
        self.next_ping = Some(now + self.config.interval());
        Some(HeartbeatAction::SendPing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn monitor() -> HeartbeatMonitor {
        HeartbeatMonitor::new(HeartbeatConfig {
            interval_ms: 1_000,
            max_missed_pongs: 2,
        })
    }

    #[test]
    fn test_ping_fires_after_interval() {
        let mut monitor = monitor();
        let start = Instant::now();
        monitor.start(start);
        assert_eq!(monitor.on_tick(start), None);
        assert_eq!(
            monitor.on_tick(start + Duration::from_secs(1)),
            Some(HeartbeatAction::SendPing)
        );
        assert_eq!(
            monitor.next_deadline(),
            Some(start + Duration::from_secs(2))
        );
    }

    #[test]
    fn test_missed_pongs_declare_stale() {
        let mut monitor = monitor();
        let start = Instant::now();
        monitor.start(start);
        let mut now = start;
        for _ in 0..2 {
            now += Duration::from_secs(1);
            assert_eq!(monitor.on_tick(now), Some(HeartbeatAction::SendPing));
        }
        now += Duration::from_secs(1);
        assert_eq!(
            monitor.on_tick(now),
            Some(HeartbeatAction::Stale { missed: 2 })
        );
        assert!(!monitor.is_running());
    }

    #[test]
    fn test_pong_clears_outstanding() {
        let mut monitor = monitor();
        let start = Instant::now();
        monitor.start(start);
        let mut now = start;
        for _ in 0..5 {
            now += Duration::from_secs(1);
            assert_eq!(monitor.on_tick(now), Some(HeartbeatAction::SendPing));
            monitor.on_pong();
        }
    }

    #[test]
    fn test_pause_and_resume() {
        let mut monitor = monitor();
        let start = Instant::now();
        monitor.start(start);
        monitor.pause();
        assert!(monitor.is_paused());
        assert_eq!(monitor.next_deadline(), None);
        assert_eq!(monitor.on_tick(start + Duration::from_secs(10)), None);

        let later = start + Duration::from_secs(20);
        monitor.resume(later);
        assert_eq!(
            monitor.next_deadline(),
            Some(later + Duration::from_secs(1))
        );
    }

    #[test]
    fn test_resume_without_start_is_noop() {
        let mut monitor = monitor();
        monitor.resume(Instant::now());
        assert_eq!(monitor.next_deadline(), None);
    }
}
