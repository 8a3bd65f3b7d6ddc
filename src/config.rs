use std::{fs, path::Path, path::PathBuf, time::Duration};

use log::info;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSecondsWithFrac};

use crate::{
    alignment::BinarizeMethod,
    bus::FrameEncoding,
    capture::{CorrelationPolicy, SequencerSettings},
    control::{HandshakeTopics, TriggerPolicy},
    error::{AlignmentError, Result},
};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ScopeTopics {
    pub commands: String,
    /// Inbound frames, matched by prefix.
    pub frames: String,
}

impl Default for ScopeTopics {
    fn default() -> Self {
        Self {
            commands: "scope".to_string(),
            frames: "frame".to_string(),
        }
    }
}

#[serde_as]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct AlignmentConfig {
    pub method: BinarizeMethod,
    /// Spacing between stack planes, in piezo units.
    pub step: f64,
    pub reps: usize,
    pub trigger: TriggerPolicy,
    pub target_frames: usize,
    pub safe_mode: bool,

    pub n_planes: u32,
    pub volume_reps: u32,

    pub scope: ScopeTopics,
    pub handshake: HandshakeTopics,
    pub encoding: FrameEncoding,
    pub correlation: CorrelationPolicy,

    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub frame_wait_timeout: Duration,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub pause_timeout: Duration,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub settle_delay: Duration,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub poll_interval: Duration,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub flush_interval: Duration,

    pub save_path: Option<PathBuf>,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            method: BinarizeMethod::Otsu,
            step: 3.0,
            reps: 5,
            trigger: TriggerPolicy::default(),
            target_frames: 15,
            safe_mode: false,
            n_planes: 5,
            volume_reps: 5000,
            scope: ScopeTopics::default(),
            handshake: HandshakeTopics::default(),
            encoding: FrameEncoding::default(),
            correlation: CorrelationPolicy::default(),
            frame_wait_timeout: Duration::from_secs(30),
            pause_timeout: Duration::from_secs(60),
            settle_delay: Duration::from_secs(1),
            poll_interval: Duration::from_millis(100),
            flush_interval: Duration::from_secs(600),
            save_path: None,
        }
    }
}

impl AlignmentConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: AlignmentConfig = serde_json::from_str(&text)?;
        config.validate()?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.step.is_finite() || self.step <= 0.0 {
            return Err(AlignmentError::invalid(format!(
                "step must be positive, got {}",
                self.step
            )));
        }
        if self.reps == 0 {
            return Err(AlignmentError::invalid("reps must be at least 1"));
        }
        if self.target_frames == 0 {
            return Err(AlignmentError::invalid("target_frames must be at least 1"));
        }
        if let TriggerPolicy::FrameCount(trigger) = &self.trigger {
            if trigger.threshold == 0 {
                return Err(AlignmentError::invalid("frame count threshold must be at least 1"));
            }
        }
        if self.n_planes == 0 {
            return Err(AlignmentError::invalid("n_planes must be at least 1"));
        }
        if self.poll_interval.is_zero() {
            return Err(AlignmentError::invalid("poll_interval must be positive"));
        }
        Ok(())
    }

    pub fn sequencer_settings(&self) -> SequencerSettings {
        SequencerSettings {
            frame_timeout: self.frame_wait_timeout,
            settle_delay: self.settle_delay,
            correlation: self.correlation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AlignmentConfig::default();
        config.validate().unwrap();
        assert_eq!(config.method, BinarizeMethod::Otsu);
        assert_eq!(config.trigger, TriggerPolicy::elapsed(Duration::from_secs(450)));
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: AlignmentConfig = serde_json::from_str(
            r#"{
                "method": "mean",
                "step": 2.5,
                "trigger": {"type": "FrameCount", "threshold": 300},
                "correlation": {"type": "Epoch"},
                "settle_delay": 0.25
            }"#,
        )
        .unwrap();

        assert_eq!(config.method, BinarizeMethod::Mean);
        assert_eq!(config.step, 2.5);
        assert_eq!(config.reps, 5);
        assert_eq!(config.trigger, TriggerPolicy::frames(300));
        assert_eq!(config.correlation, CorrelationPolicy::Epoch);
        assert_eq!(config.settle_delay, Duration::from_millis(250));
        assert_eq!(config.scope.commands, "scope");
        assert_eq!(config.handshake.proceed, "proceed");
    }

    #[test]
    fn test_rejects_unknown_method() {
        let result = serde_json::from_str::<AlignmentConfig>(r#"{"method": "median"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_validate() {
        let invalid = [
            AlignmentConfig {
                reps: 0,
                ..Default::default()
            },
            AlignmentConfig {
                step: -1.0,
                ..Default::default()
            },
            AlignmentConfig {
                target_frames: 0,
                ..Default::default()
            },
            AlignmentConfig {
                trigger: TriggerPolicy::frames(0),
                ..Default::default()
            },
        ];
        for config in invalid {
            assert!(matches!(
                config.validate(),
                Err(AlignmentError::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn test_load_round_trip() {
        let path = std::env::temp_dir().join(format!("planelock-config-{}.json", std::process::id()));
        let config = AlignmentConfig {
            safe_mode: true,
            pause_timeout: Duration::from_millis(1500),
            ..Default::default()
        };
        fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();
        let loaded = AlignmentConfig::load(&path).unwrap();
        assert!(loaded.safe_mode);
        assert_eq!(loaded.pause_timeout, config.pause_timeout);
        assert_eq!(loaded.trigger, config.trigger);
        assert_eq!(loaded.correlation, config.correlation);
        let _ = fs::remove_file(path);
    }
}
