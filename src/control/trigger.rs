use std::time::Duration;

use enum_dispatch::enum_dispatch;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSecondsWithFrac};

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CycleProgress {
    pub elapsed: Duration,
    pub frames: u64,
}

#[enum_dispatch]
pub trait RealignTrigger {
    fn is_due(&self, progress: &CycleProgress) -> bool;

    /// Upper bound on how long to sleep before checking again, when known.
    fn time_until_due(&self, _progress: &CycleProgress) -> Option<Duration> {
        None
    }
}

#[serde_as]
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct ElapsedTimeTrigger {
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub threshold: Duration,
}

impl RealignTrigger for ElapsedTimeTrigger {
    fn is_due(&self, progress: &CycleProgress) -> bool {
        progress.elapsed >= self.threshold
    }

    fn time_until_due(&self, progress: &CycleProgress) -> Option<Duration> {
        Some(self.threshold.saturating_sub(progress.elapsed))
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct FrameCountTrigger {
    pub threshold: u64,
}

impl RealignTrigger for FrameCountTrigger {
    fn is_due(&self, progress: &CycleProgress) -> bool {
        progress.frames >= self.threshold
    }
}

#[enum_dispatch(RealignTrigger)]
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
#[serde(tag = "type")]
pub enum TriggerPolicy {
    ElapsedTime(ElapsedTimeTrigger),
    FrameCount(FrameCountTrigger),
}

impl TriggerPolicy {
    pub fn elapsed(threshold: Duration) -> Self {
        ElapsedTimeTrigger { threshold }.into()
    }

    pub fn frames(threshold: u64) -> Self {
        FrameCountTrigger { threshold }.into()
    }
}

impl Default for TriggerPolicy {
    fn default() -> Self {
        TriggerPolicy::elapsed(Duration::from_secs(450))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elapsed_time_trigger() {
        let trigger = TriggerPolicy::elapsed(Duration::from_secs(600));
        let mut progress = CycleProgress {
            elapsed: Duration::from_secs(599),
            frames: 1_000_000,
        };
        assert!(!trigger.is_due(&progress));
        assert_eq!(trigger.time_until_due(&progress), Some(Duration::from_secs(1)));

        progress.elapsed = Duration::from_secs(600);
        assert!(trigger.is_due(&progress));
        assert_eq!(trigger.time_until_due(&progress), Some(Duration::ZERO));
    }

    #[test]
    fn test_frame_count_trigger() {
        let trigger = TriggerPolicy::frames(30);
        let progress = CycleProgress {
            elapsed: Duration::from_secs(10_000),
            frames: 29,
        };
        assert!(!trigger.is_due(&progress));
        assert!(trigger.is_due(&CycleProgress { frames: 30, ..progress }));
        assert_eq!(trigger.time_until_due(&progress), None);
    }

    #[test]
    fn test_policy_json() {
        let policy: TriggerPolicy =
            serde_json::from_str(r#"{"type": "ElapsedTime", "threshold": 12.5}"#).unwrap();
        assert_eq!(policy, TriggerPolicy::elapsed(Duration::from_millis(12_500)));

        let policy: TriggerPolicy =
            serde_json::from_str(r#"{"type": "FrameCount", "threshold": 200}"#).unwrap();
        assert_eq!(policy, TriggerPolicy::frames(200));

        assert!(serde_json::from_str::<TriggerPolicy>(r#"{"type": "Both"}"#).is_err());
    }
}
