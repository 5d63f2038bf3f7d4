//! Tower light controller
//!
//! Maps bench states to light patterns:
//!
//! - `Ready`       green steady
//! - `Testing`     yellow steady
//! - `Fault`       red steady
//! - `Estop`       red blink
//! - `TestPass`    green blink
//! - `TestFail`    red blink + buzzer
//! - `Stabilizing` yellow blink
//! - `Draining`    yellow/green alternating
//!
//! Static patterns are written straight to the hardware; blink patterns
//! run a 500 ms alternating task that is cancelled whenever the pattern
//! changes or the controller stops.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::hardware::{BusError, HardwareBackend, TowerChannels};

/// Blink half-period.
pub const BLINK_INTERVAL: Duration = Duration::from_millis(500);

/// Named light patterns.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LightPattern {
    #[default]
    Off,
    Ready,
    Testing,
    Fault,
    Estop,
    TestPass,
    TestFail,
    Stabilizing,
    Draining,
}

const OFF: TowerChannels = TowerChannels {
    red: false,
    yellow: false,
    green: false,
    buzzer: false,
};
const RED: TowerChannels = TowerChannels {
    red: true,
    yellow: false,
    green: false,
    buzzer: false,
};
const YELLOW: TowerChannels = TowerChannels {
    red: false,
    yellow: true,
    green: false,
    buzzer: false,
};
const GREEN: TowerChannels = TowerChannels {
    red: false,
    yellow: false,
    green: true,
    buzzer: false,
};
const RED_BUZZER: TowerChannels = TowerChannels {
    red: true,
    yellow: false,
    green: false,
    buzzer: true,
};

impl LightPattern {
    /// The frame sequence for a pattern; one frame means steady, two mean
    /// a 500 ms alternating blink.
    fn frames(&self) -> &'static [TowerChannels] {
        match self {
            LightPattern::Off => &[OFF],
            LightPattern::Ready => &[GREEN],
            LightPattern::Testing => &[YELLOW],
            LightPattern::Fault => &[RED],
            LightPattern::Estop => &[RED, OFF],
            LightPattern::TestPass => &[GREEN, OFF],
            LightPattern::TestFail => &[RED_BUZZER, OFF],
            LightPattern::Stabilizing => &[YELLOW, OFF],
            LightPattern::Draining => &[YELLOW, GREEN],
        }
    }
}

struct TowerState {
    pattern: LightPattern,
    blink: Option<JoinHandle<()>>,
}

/// The tower light service.
pub struct TowerLight {
    backend: Arc<dyn HardwareBackend>,
    state: Mutex<TowerState>,
}

impl TowerLight {
    pub fn new(backend: Arc<dyn HardwareBackend>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            state: Mutex::new(TowerState {
                pattern: LightPattern::Off,
                blink: None,
            }),
        })
    }

    /// Apply a pattern. A no-op when the pattern is already active;
    /// otherwise any running blink task is cancelled first.
    pub async fn set(&self, pattern: LightPattern) -> Result<(), BusError> {
        let mut state = self.state.lock().await;
        if state.pattern == pattern {
            return Ok(());
        }
        if let Some(task) = state.blink.take() {
            task.abort();
        }
        state.pattern = pattern;
        debug!(?pattern, "tower light pattern");

        let frames = pattern.frames();
        if frames.len() == 1 {
            self.backend.tower(frames[0]).await?;
        } else {
            let backend = Arc::clone(&self.backend);
            state.blink = Some(tokio::spawn(async move {
                let mut idx = 0usize;
                loop {
                    let _ = backend.tower(frames[idx % frames.len()]).await;
                    idx += 1;
                    tokio::time::sleep(BLINK_INTERVAL).await;
                }
            }));
        }
        Ok(())
    }

    pub async fn pattern(&self) -> LightPattern {
        self.state.lock().await.pattern
    }

    /// Cancel any blink and switch everything off.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if let Some(task) = state.blink.take() {
            task.abort();
        }
        state.pattern = LightPattern::Off;
        let _ = self.backend.tower(OFF).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::Simulator;

    #[tokio::test]
    async fn static_pattern_applied_directly() {
        let sim = Arc::new(Simulator::new());
        let tower = TowerLight::new(sim.clone());
        tower.set(LightPattern::Ready).await.unwrap();
        let channels = sim.with_state(|s| s.tower);
        assert!(channels.green && !channels.red && !channels.yellow);
        assert_eq!(tower.pattern().await, LightPattern::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn blink_pattern_alternates_until_changed() {
        let sim = Arc::new(Simulator::new());
        let tower = TowerLight::new(sim.clone());
        tower.set(LightPattern::Estop).await.unwrap();

        // Sample across several half-periods; both frames must appear.
        let mut seen_on = false;
        let mut seen_off = false;
        for _ in 0..6 {
            tokio::time::advance(BLINK_INTERVAL).await;
            let channels = sim.with_state(|s| s.tower);
            if channels.red {
                seen_on = true;
            } else {
                seen_off = true;
            }
        }
        assert!(seen_on && seen_off);

        // Switching to a static pattern cancels the blink.
        tower.set(LightPattern::Testing).await.unwrap();
        let channels = sim.with_state(|s| s.tower);
        assert!(channels.yellow && !channels.red);
        tokio::time::advance(BLINK_INTERVAL).await;
        tokio::time::advance(BLINK_INTERVAL).await;
        let channels = sim.with_state(|s| s.tower);
        assert!(channels.yellow && !channels.red);
    }

    #[tokio::test]
    async fn same_pattern_is_a_no_op() {
        let sim = Arc::new(Simulator::new());
        let tower = TowerLight::new(sim);
        tower.set(LightPattern::TestFail).await.unwrap();
        let first = tower.pattern().await;
        tower.set(LightPattern::TestFail).await.unwrap();
        assert_eq!(tower.pattern().await, first);
        tower.stop().await;
        assert_eq!(tower.pattern().await, LightPattern::Off);
    }
}
