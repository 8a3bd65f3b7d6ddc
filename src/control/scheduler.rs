use std::{sync::Arc, time::Duration};

use chrono::Utc;
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::{
    sync::{watch, Notify},
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{
    alignment::{AlignmentEngine, MatchResult},
    bus::MessageBus,
    capture::{FrameBuffer, ScopeClient, ScopeCommand, StackSequencer},
    config::AlignmentConfig,
    error::{AlignmentError, Result},
    image::{median_frames, Image},
};

use super::{
    handshake::PauseHandshake,
    trigger::{CycleProgress, RealignTrigger},
};

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Scanning,
    Aligning,
    AwaitingPause,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CycleReason {
    Scheduled,
    Requested,
    /// The stimulus controller paused without being asked.
    Proceed,
}

#[derive(Clone)]
pub struct ControlHandle {
    cancel: CancellationToken,
    manual: Arc<Notify>,
    state: watch::Receiver<SchedulerState>,
}

impl ControlHandle {
    pub fn request_alignment(&self) {
        self.manual.notify_one();
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.state.clone()
    }
}

/// Keeps the imaging plane on the target: scans volumetrically and
/// periodically interrupts the scan to realign.
pub struct ControlLoop {
    config: AlignmentConfig,
    engine: AlignmentEngine,
    scope: Arc<ScopeClient>,
    buffer: Arc<FrameBuffer>,
    sequencer: StackSequencer,
    handshake: PauseHandshake,
    state: watch::Sender<SchedulerState>,
    manual: Arc<Notify>,
    cancel: CancellationToken,

    target: Option<Image<f32>>,
    last_match: Option<MatchResult>,
    alignments_completed: u64,
    last_aligned: Instant,
    frames_at_alignment: u64,
    last_flush: Instant,
}

impl ControlLoop {
    pub fn new(
        config: AlignmentConfig,
        bus: Arc<dyn MessageBus>,
        buffer: Arc<FrameBuffer>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        config.validate()?;

        let scope = Arc::new(ScopeClient::new(
            bus.clone(),
            config.scope.commands.clone(),
            config.correlation.tags_commands(),
        ));
        let sequencer = StackSequencer::new(
            scope.clone(),
            buffer.clone(),
            config.sequencer_settings(),
            cancel.clone(),
        );
        let handshake = PauseHandshake::new(bus, config.handshake.clone(), config.pause_timeout)?;
        let (state, _) = watch::channel(SchedulerState::Idle);

        Ok(Self {
            engine: AlignmentEngine::new(config.method),
            config,
            scope,
            buffer,
            sequencer,
            handshake,
            state,
            manual: Arc::new(Notify::new()),
            cancel,
            target: None,
            last_match: None,
            alignments_completed: 0,
            last_aligned: Instant::now(),
            frames_at_alignment: 0,
            last_flush: Instant::now(),
        })
    }

    pub fn handle(&self) -> ControlHandle {
        ControlHandle {
            cancel: self.cancel.clone(),
            manual: self.manual.clone(),
            state: self.state.subscribe(),
        }
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    fn set_state(&self, state: SchedulerState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!("scheduler {current:?} -> {state:?}");
            *current = state;
            true
        });
    }

    pub fn target(&self) -> Option<&Image<f32>> {
        self.target.as_ref()
    }

    /// Replaces the target plane. An idle loop skips target acquisition.
    pub fn set_target(&mut self, target: Image<f32>) {
        self.target = Some(target);
    }

    pub fn update_target_from_recent(&mut self, n: usize) -> Result<()> {
        let frames = self.buffer.last(n);
        if frames.is_empty() {
            return Err(AlignmentError::invalid("no frames buffered"));
        }
        self.target = Some(median_frames(&frames)?);
        info!("target updated using {} frames", frames.len());
        Ok(())
    }

    pub fn live_similarity(&self) -> Result<Option<f64>> {
        let (Some(target), Some(frame)) = (&self.target, self.buffer.newest()) else {
            return Ok(None);
        };
        self.engine.score(target, &frame.image.to_f32()).map(Some)
    }

    pub fn last_match(&self) -> Option<&MatchResult> {
        self.last_match.as_ref()
    }

    pub fn alignments_completed(&self) -> u64 {
        self.alignments_completed
    }

    pub fn elapsed_since_alignment(&self) -> Duration {
        self.last_aligned.elapsed()
    }

    pub fn progress(&self) -> CycleProgress {
        CycleProgress {
            elapsed: self.elapsed_since_alignment(),
            frames: self
                .buffer
                .total_received()
                .saturating_sub(self.frames_at_alignment),
        }
    }

    /// Runs until cancelled. Errors that an alignment cycle cannot recover
    /// from stop the loop.
    pub async fn run(&mut self) -> Result<()> {
        info!("control loop running");
        let result = loop {
            match self.step().await {
                Ok(()) => {}
                Err(AlignmentError::Cancelled) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        self.set_state(SchedulerState::Idle);
        info!("control loop stopped");
        result
    }

    pub async fn step(&mut self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(AlignmentError::Cancelled);
        }
        match self.state() {
            SchedulerState::Idle => self.start().await,
            _ => {
                let reason = self.wait_for_trigger().await?;
                self.run_cycle(reason).await
            }
        }
    }

    async fn start(&mut self) -> Result<()> {
        if self.target.is_none() {
            match self.sequencer.acquire_target(self.config.target_frames).await {
                Ok(target) => self.target = Some(target),
                Err(e) if e.is_recoverable() => {
                    warn!("target acquisition failed, retrying: {e}");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
        self.start_volume_scan().await?;
        self.mark_aligned();
        self.set_state(SchedulerState::Scanning);
        Ok(())
    }

    async fn start_volume_scan(&self) -> Result<()> {
        self.scope
            .send(ScopeCommand::volumetric(
                self.config.n_planes,
                self.config.volume_reps,
            ))
            .await?;
        self.scope.send(ScopeCommand::Run).await?;
        Ok(())
    }

    fn mark_aligned(&mut self) {
        let now = Instant::now();
        self.last_aligned = now;
        self.last_flush = now;
        self.frames_at_alignment = self.buffer.total_received();
    }

    async fn wait_for_trigger(&mut self) -> Result<CycleReason> {
        loop {
            let progress = self.progress();
            if self.config.trigger.is_due(&progress) {
                info!(
                    "realignment due after {:.1}s and {} frames",
                    progress.elapsed.as_secs_f64(),
                    progress.frames
                );
                return Ok(CycleReason::Scheduled);
            }

            if self.last_flush.elapsed() >= self.config.flush_interval {
                let flushed = self.buffer.clear();
                debug!("flushed {flushed} buffered frames");
                self.last_flush = Instant::now();
            }

            let poll = self.config.poll_interval;
            let nap = self
                .config
                .trigger
                .time_until_due(&progress)
                .map_or(poll, |due| due.min(poll));

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(AlignmentError::Cancelled),
                _ = self.manual.notified() => {
                    info!("alignment requested");
                    return Ok(CycleReason::Requested);
                }
                _ = self.handshake.next_proceed() => {
                    info!("received pause confirmation from stimulus controller");
                    return Ok(CycleReason::Proceed);
                }
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }

    async fn run_cycle(&mut self, reason: CycleReason) -> Result<()> {
        info!("alignment: status: initiated");
        self.set_state(SchedulerState::Aligning);

        let paused = match reason {
            CycleReason::Proceed => true,
            _ if self.config.safe_mode => {
                self.set_state(SchedulerState::AwaitingPause);
                if let Err(e) = self.handshake.request(&self.cancel).await {
                    return self.fail_cycle(e);
                }
                self.set_state(SchedulerState::Aligning);
                true
            }
            _ => false,
        };

        let aligned = self.align().await;

        let resumed = self.start_volume_scan().await;
        let released = if paused {
            self.handshake.release().await
        } else {
            Ok(())
        };
        if let Err(e) = resumed.and(released) {
            return self.fail_cycle(e);
        }

        match aligned {
            Ok(result) => {
                self.last_match = Some(result);
                self.alignments_completed += 1;
                self.buffer.cut(Utc::now());
                self.mark_aligned();
                self.set_state(SchedulerState::Scanning);
                Ok(())
            }
            Err(e) => self.fail_cycle(e),
        }
    }

    async fn align(&self) -> Result<MatchResult> {
        let target = self
            .target
            .as_ref()
            .ok_or_else(|| AlignmentError::invalid("no target plane acquired"))?;

        let stack = self
            .sequencer
            .gather_stack(self.config.step, self.config.reps)
            .await?;
        let result = self.engine.select_best_match(target, stack.planes())?;

        let movement = result.displacement(self.config.step)?;
        if movement != 0.0 {
            self.scope.send(ScopeCommand::MoveRelative(movement)).await?;
        }
        info!("alignment: status: completed with {movement} movement");
        Ok(result)
    }

    /// Recoverable failures resume scanning and wait for the next trigger;
    /// anything else leaves the loop idle and is returned.
    fn fail_cycle(&mut self, e: AlignmentError) -> Result<()> {
        if e.is_recoverable() {
            warn!("alignment cycle aborted, resuming scan: {e}");
            self.mark_aligned();
            self.set_state(SchedulerState::Scanning);
            return Ok(());
        }
        if !matches!(e, AlignmentError::Cancelled) {
            error!("alignment cycle failed: {e}");
        }
        self.set_state(SchedulerState::Idle);
        Err(e)
    }
}
