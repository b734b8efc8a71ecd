use std::time::{Duration, Instant};

use crate::config::FramePacingConfig;

/// Decides when the periodic scheduling pass is due.
///
/// The pacer owns no timer; the embedder calls [`crate::VgpuEngine::frame_tick`]
/// from its own frame clock and the pacer filters ticks that arrive early.
#[derive(Debug, Clone)]
pub struct FramePacer {
    enabled: bool,
    interval: Duration,
    last_tick: Option<Instant>,
    ticks: u64,
}

impl FramePacer {
    pub fn new(config: &FramePacingConfig) -> Self {
        Self {
            enabled: config.enabled,
            interval: config.interval(),
            last_tick: None,
            ticks: 0,
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        if !self.enabled {
            return false;
        }
        match self.last_tick {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        }
    }

    /// Record a tick at `now` if one is due.
    pub fn try_tick(&mut self, now: Instant) -> bool {
        if !self.is_due(now) {
            return false;
        }
        self.last_tick = Some(now);
        self.ticks += 1;
        true
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pacer(enabled: bool) -> FramePacer {
        FramePacer::new(&FramePacingConfig {
            enabled,
            interval_us: 10_000,
        })
    }

    #[test]
    fn first_tick_is_always_due() {
        let mut p = pacer(true);
        assert!(p.try_tick(Instant::now()));
        assert_eq!(p.ticks(), 1);
    }

    #[test]
    fn early_ticks_are_skipped() {
        let mut p = pacer(true);
        let t0 = Instant::now();
        assert!(p.try_tick(t0));
        assert!(!p.try_tick(t0 + Duration::from_millis(5)));
        assert!(p.try_tick(t0 + Duration::from_millis(10)));
        assert_eq!(p.ticks(), 2);
    }

    #[test]
    fn disabled_pacer_never_ticks() {
        let mut p = pacer(false);
        assert!(!p.try_tick(Instant::now()));
    }
}
