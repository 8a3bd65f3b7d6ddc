use std::{sync::Arc, time::Duration};

use chrono::Utc;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSecondsWithFrac};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{AlignmentError, Result},
    image::{median_frames, Image},
};

use super::{
    commands::{ScopeClient, ScopeCommand},
    frame_buffer::{FrameBuffer, Window},
    types::ZStack,
};

#[serde_as]
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
#[serde(tag = "type")]
pub enum CorrelationPolicy {
    /// Frames stamped after the settle delay, minus `lookback`, belong to the
    /// latest command.
    Timestamp {
        #[serde_as(as = "DurationSecondsWithFrac<f64>")]
        #[serde(default)]
        lookback: Duration,
    },
    Epoch,
}

impl Default for CorrelationPolicy {
    fn default() -> Self {
        CorrelationPolicy::Timestamp {
            lookback: Duration::ZERO,
        }
    }
}

impl CorrelationPolicy {
    pub fn tags_commands(&self) -> bool {
        matches!(self, CorrelationPolicy::Epoch)
    }
}

#[derive(Clone, Debug)]
pub struct SequencerSettings {
    pub frame_timeout: Duration,
    pub settle_delay: Duration,
    pub correlation: CorrelationPolicy,
}

impl Default for SequencerSettings {
    fn default() -> Self {
        Self {
            frame_timeout: Duration::from_secs(30),
            settle_delay: Duration::from_secs(1),
            correlation: CorrelationPolicy::default(),
        }
    }
}

pub struct StackSequencer {
    scope: Arc<ScopeClient>,
    buffer: Arc<FrameBuffer>,
    settings: SequencerSettings,
    cancel: CancellationToken,
}

impl StackSequencer {
    pub fn new(
        scope: Arc<ScopeClient>,
        buffer: Arc<FrameBuffer>,
        settings: SequencerSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            scope,
            buffer,
            settings,
            cancel,
        }
    }

    pub fn settings(&self) -> &SequencerSettings {
        &self.settings
    }

    /// Parks the scanner on the target plane and returns the median of the
    /// first `frames` frames it produces. Scanning is stopped afterwards.
    pub async fn acquire_target(&self, frames: usize) -> Result<Image<f32>> {
        if frames == 0 {
            return Err(AlignmentError::invalid("target needs at least one frame"));
        }
        info!("acquiring target plane");

        self.scope.send(ScopeCommand::Reset).await?;
        self.settle().await?;
        self.scope.send(ScopeCommand::target_plane()).await?;
        self.scope.send(ScopeCommand::Run).await?;
        self.settle().await?;
        self.scope.send(ScopeCommand::Reset).await?;
        self.settle().await?;
        self.scope.send(ScopeCommand::continuous_plane()).await?;
        let epoch = self.scope.send(ScopeCommand::Run).await?;

        let target = self.acquire_plane(epoch, frames).await;
        self.scope.send(ScopeCommand::Reset).await?;
        let target = target?;

        info!("target plane acquired");
        Ok(target)
    }

    /// Acquires planes at `-2s, -s, 0, +s, +2s` around the current plane and
    /// moves back to it, even when an acquisition fails.
    pub async fn gather_stack(&self, spacing: f64, reps: usize) -> Result<ZStack> {
        if !spacing.is_finite() || spacing <= 0.0 {
            return Err(AlignmentError::invalid(format!(
                "stack spacing must be positive, got {spacing}"
            )));
        }
        if reps == 0 {
            return Err(AlignmentError::invalid("reps must be at least 1"));
        }
        info!("gathering stack with spacing {spacing} and {reps} reps");

        self.scope.send(ScopeCommand::Reset).await?;
        self.settle().await?;
        self.scope.send(ScopeCommand::continuous_plane()).await?;
        let epoch = self.scope.send(ScopeCommand::Run).await?;

        let mut offset = 0.0;
        let stack = self.acquire_around(epoch, spacing, reps, &mut offset).await;
        let restored = self.restore(offset).await;

        let stack = stack?;
        restored?;
        Ok(stack)
    }

    async fn acquire_around(
        &self,
        epoch: u64,
        spacing: f64,
        reps: usize,
        offset: &mut f64,
    ) -> Result<ZStack> {
        let target = self.acquire_plane(epoch, reps).await?;

        let mut above = Vec::with_capacity(2);
        for _ in 0..2 {
            let epoch = self.move_by(spacing, offset).await?;
            above.push(self.acquire_plane(epoch, reps).await?);
        }

        let mut below = Vec::with_capacity(2);
        for step in [-3.0 * spacing, -spacing] {
            let epoch = self.move_by(step, offset).await?;
            below.push(self.acquire_plane(epoch, reps).await?);
        }

        let (Ok(above), Ok(below)) = (<[_; 2]>::try_from(above), <[_; 2]>::try_from(below))
        else {
            return Err(AlignmentError::invalid("incomplete stack"));
        };
        ZStack::from_parts(below, target, above)
    }

    async fn move_by(&self, amount: f64, offset: &mut f64) -> Result<u64> {
        let epoch = self.scope.send(ScopeCommand::MoveRelative(amount)).await?;
        *offset += amount;
        Ok(epoch)
    }

    async fn restore(&self, offset: f64) -> Result<()> {
        if offset != 0.0 {
            debug!("restoring plane offset {offset}");
            self.scope.send(ScopeCommand::MoveRelative(-offset)).await?;
        }
        self.scope.send(ScopeCommand::Reset).await?;
        Ok(())
    }

    async fn acquire_plane(&self, epoch: u64, reps: usize) -> Result<Image<f32>> {
        let window = self.open_window(epoch).await?;
        self.buffer
            .wait_for_count(window, reps, self.settings.frame_timeout, &self.cancel)
            .await?;

        let frames = self.buffer.front(window, reps);
        let median = median_frames(&frames)?;
        let cut = self.buffer.cut(Utc::now());
        debug!("plane acquired from {} frames, {cut:?}", frames.len());
        Ok(median)
    }

    async fn open_window(&self, epoch: u64) -> Result<Window> {
        self.settle().await?;
        match self.settings.correlation {
            CorrelationPolicy::Timestamp { lookback } => {
                let lookback = chrono::Duration::from_std(lookback).unwrap_or_else(|_| {
                    warn!("correlation lookback {lookback:?} out of range, using zero");
                    chrono::Duration::zero()
                });
                let reference = Utc::now() - lookback;
                self.buffer.cut(reference);
                Ok(Window::Since(reference))
            }
            CorrelationPolicy::Epoch => {
                self.buffer.cut_before_epoch(epoch);
                Ok(Window::Epoch(epoch))
            }
        }
    }

    async fn settle(&self) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(AlignmentError::Cancelled),
            _ = tokio::time::sleep(self.settings.settle_delay) => Ok(()),
        }
    }
}
