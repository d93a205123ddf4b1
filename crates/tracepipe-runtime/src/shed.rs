use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tracing::{info, warn};

use tracepipe_streams::{StreamDb, streams};

use crate::config::BackpressureConfig;
use crate::shutdown::Shutdown;
use crate::worker::WORKER_GROUP;
use crate::Result;

/// Load-shedding tier, ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShedMode {
    Normal = 0,
    Warn = 1,
    Shed = 2,
    ShedPause = 3,
}

impl ShedMode {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ShedMode::Warn,
            2 => ShedMode::Shed,
            3 => ShedMode::ShedPause,
            _ => ShedMode::Normal,
        }
    }

}

/// Shared load-shedding state: written by the backpressure monitor, read by
/// the fast path before every batch.
#[derive(Default)]
pub struct ShedState {
    mode: AtomicU8,
}

impl ShedState {
    pub fn mode(&self) -> ShedMode {
        ShedMode::from_u8(self.mode.load(Ordering::Relaxed))
    }

    fn set_mode(&self, mode: ShedMode) {
        self.mode.store(mode as u8, Ordering::Relaxed);
    }

    /// Batch-size bound under the current tier: halved from shed upward
    pub fn effective_b_max(&self, base: usize) -> usize {
        if self.mode() >= ShedMode::Shed {
            (base / 2).max(1)
        } else {
            base
        }
    }

    /// Batch window under the current tier: doubled from shed upward
    pub fn effective_t_batch(&self, base: Duration) -> Duration {
        if self.mode() >= ShedMode::Shed {
            base * 2
        } else {
            base
        }
    }

    /// Inter-batch pause, only in the top tier
    pub fn pause(&self, t_pause: Duration) -> Option<Duration> {
        (self.mode() == ShedMode::ShedPause).then_some(t_pause)
    }
}

/// Samples the CDC backlog (undelivered plus unacknowledged entries of the
/// worker group) and drives [`ShedState`].
///
/// Escalation is immediate; recovery is hysteretic: the depth must sit
/// below the midpoint of the band beneath the current tier for two
/// consecutive probes, after which the mode drops straight to the tier the
/// depth implies.
pub struct BackpressureMonitor {
    streams: Arc<StdMutex<StreamDb>>,
    shed: Arc<ShedState>,
    config: BackpressureConfig,
}

impl BackpressureMonitor {
    pub fn new(
        streams: Arc<StdMutex<StreamDb>>,
        shed: Arc<ShedState>,
        config: BackpressureConfig,
    ) -> Self {
        Self {
            streams,
            shed,
            config,
        }
    }

    fn tier_for(&self, depth: u64) -> ShedMode {
        if depth >= self.config.pause_depth {
            ShedMode::ShedPause
        } else if depth >= self.config.shed_depth {
            ShedMode::Shed
        } else if depth >= self.config.warn_depth {
            ShedMode::Warn
        } else {
            ShedMode::Normal
        }
    }

    /// Depth below which recovery from `mode` becomes eligible
    fn recovery_threshold(&self, mode: ShedMode) -> u64 {
        match mode {
            ShedMode::Normal => 0,
            ShedMode::Warn => self.config.warn_depth / 2,
            ShedMode::Shed => (self.config.warn_depth + self.config.shed_depth) / 2,
            ShedMode::ShedPause => (self.config.shed_depth + self.config.pause_depth) / 2,
        }
    }

    fn depth(&self) -> Result<u64> {
        let db = self.streams.lock().expect("stream db lock poisoned");
        Ok(db.group_lag(streams::CDC, WORKER_GROUP)?)
    }

    /// One probe step; exposed for tests, driven by [`run`](Self::run)
    pub fn probe(&self, depth: u64, calm_probes: &mut u32) {
        let current = self.shed.mode();
        let target = self.tier_for(depth);

        if target > current {
            *calm_probes = 0;
            self.shed.set_mode(target);
            warn!(depth, ?target, "cdc backlog escalated load shedding");
        } else if target < current {
            if depth < self.recovery_threshold(current) {
                *calm_probes += 1;
                if *calm_probes >= 2 {
                    self.shed.set_mode(target);
                    *calm_probes = 0;
                    info!(depth, ?target, "cdc backlog receding, easing load shedding");
                }
            } else {
                *calm_probes = 0;
            }
        } else {
            *calm_probes = 0;
            if current == ShedMode::Warn {
                warn!(depth, "cdc pending depth elevated");
            }
        }
    }

    pub async fn run(self, mut shutdown: Shutdown) {
        let mut calm_probes = 0u32;
        loop {
            if shutdown.idle(self.config.t_mon()).await {
                return;
            }
            match self.depth() {
                Ok(depth) => self.probe(depth, &mut calm_probes),
                Err(err) => warn!(error = %err, "backpressure probe failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> (BackpressureMonitor, Arc<ShedState>) {
        let shed = Arc::new(ShedState::default());
        let streams = Arc::new(StdMutex::new(StreamDb::open_in_memory().unwrap()));
        let monitor = BackpressureMonitor::new(streams, shed.clone(), BackpressureConfig::default());
        (monitor, shed)
    }

    #[test]
    fn test_escalation_is_immediate() {
        let (monitor, shed) = monitor();
        let mut calm = 0;

        monitor.probe(60_000, &mut calm);
        assert_eq!(shed.mode(), ShedMode::Shed);

        monitor.probe(150_000, &mut calm);
        assert_eq!(shed.mode(), ShedMode::ShedPause);
    }

    #[test]
    fn test_shed_halves_batch_and_doubles_window() {
        let (monitor, shed) = monitor();
        let mut calm = 0;
        monitor.probe(60_000, &mut calm);

        assert_eq!(shed.effective_b_max(100), 50);
        assert_eq!(
            shed.effective_t_batch(Duration::from_millis(100)),
            Duration::from_millis(200)
        );
        assert_eq!(shed.pause(Duration::from_secs(1)), None);
    }

    #[test]
    fn test_pause_tier_pauses() {
        let (monitor, shed) = monitor();
        let mut calm = 0;
        monitor.probe(120_000, &mut calm);
        assert_eq!(shed.pause(Duration::from_secs(1)), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_recovery_requires_two_calm_probes_below_midpoint() {
        let (monitor, shed) = monitor();
        let mut calm = 0;
        monitor.probe(60_000, &mut calm);
        assert_eq!(shed.mode(), ShedMode::Shed);

        // Below shed entry but above the 30k midpoint: no recovery
        monitor.probe(40_000, &mut calm);
        monitor.probe(40_000, &mut calm);
        assert_eq!(shed.mode(), ShedMode::Shed);

        // One calm probe is not enough
        monitor.probe(8_000, &mut calm);
        assert_eq!(shed.mode(), ShedMode::Shed);

        // Second consecutive calm probe resumes normal directly
        monitor.probe(8_000, &mut calm);
        assert_eq!(shed.mode(), ShedMode::Normal);
        assert_eq!(shed.effective_b_max(100), 100);
        assert_eq!(
            shed.effective_t_batch(Duration::from_millis(100)),
            Duration::from_millis(100)
        );
    }

    #[test]
    fn test_recovery_lands_on_the_tier_the_depth_implies() {
        let (monitor, shed) = monitor();
        let mut calm = 0;
        monitor.probe(120_000, &mut calm);
        assert_eq!(shed.mode(), ShedMode::ShedPause);

        // Two probes below the 75k midpoint, depth in the warn band
        monitor.probe(29_000, &mut calm);
        monitor.probe(29_000, &mut calm);
        assert_eq!(shed.mode(), ShedMode::Warn);
        assert_eq!(shed.effective_b_max(100), 100);
    }

    #[test]
    fn test_spike_resets_calm_counter() {
        let (monitor, shed) = monitor();
        let mut calm = 0;
        monitor.probe(60_000, &mut calm);
        monitor.probe(29_000, &mut calm);
        monitor.probe(45_000, &mut calm);
        monitor.probe(29_000, &mut calm);
        assert_eq!(shed.mode(), ShedMode::Shed);
    }
}
