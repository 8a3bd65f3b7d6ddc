//! Stand-ins for the scanner firmware and the stimulus controller, speaking
//! the same bus protocol as the real hardware.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use chrono::Utc;
use futures::StreamExt;
use image::Luma;
use imageproc::drawing::draw_filled_circle_mut;
use log::{debug, info, warn};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    bus::{encode_frame, MessageBus},
    capture::{ScopeCommand, TaggedCommand},
    control::HandshakeTopics,
    error::Result,
    image::{FrameImage, Image},
};

const BACKGROUND: u16 = 100;
const FOREGROUND: u16 = 3000;
const MIN_RADIUS: f64 = 1.0;

#[derive(Clone, Debug)]
pub struct ScannerSettings {
    pub frame_interval: Duration,
    pub width: u32,
    pub height: u32,
    /// Disk radius, in pixels, when the sample is in focus.
    pub focused_radius: f64,
    /// Radius change per piezo unit of focal error.
    pub radius_per_unit: f64,
    pub initial_offset: f64,
    /// Sample drift in piezo units per second.
    pub drift_per_second: f64,
    pub noise: u16,
    pub seed: u64,
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            frame_interval: Duration::from_millis(20),
            width: 64,
            height: 64,
            focused_radius: 14.0,
            radius_per_unit: 1.0,
            initial_offset: 0.0,
            drift_per_second: 0.0,
            noise: 40,
            seed: 7,
        }
    }
}

/// A bright disk whose radius encodes the focal error.
pub fn render_plane(
    settings: &ScannerSettings,
    focus_error: f64,
    rng: Option<&mut StdRng>,
) -> Image<u16> {
    let mut image = Image::from_pixel(settings.width, settings.height, Luma([BACKGROUND]));
    let radius = (settings.focused_radius + settings.radius_per_unit * focus_error).max(MIN_RADIUS);
    let center = ((settings.width / 2) as i32, (settings.height / 2) as i32);
    draw_filled_circle_mut(&mut image, center, radius.round() as i32, Luma([FOREGROUND]));

    if let Some(rng) = rng {
        if settings.noise > 0 {
            for pixel in image.pixels_mut() {
                pixel[0] = pixel[0].saturating_add(rng.gen_range(0..=settings.noise));
            }
        }
    }
    image
}

#[derive(Clone, Debug, PartialEq)]
enum ScanMode {
    Stopped,
    Continuous,
    Finite(u32),
}

#[derive(Debug)]
struct ScannerState {
    mode: ScanMode,
    program: Option<String>,
    piezo: f64,
    epoch: Option<u64>,
    started: Instant,
}

/// Every scan program is rendered as the current plane.
#[derive(Clone)]
pub struct SimulatedScanner {
    settings: ScannerSettings,
    state: Arc<Mutex<ScannerState>>,
}

impl SimulatedScanner {
    pub fn new(settings: ScannerSettings) -> Self {
        Self {
            settings,
            state: Arc::new(Mutex::new(ScannerState {
                mode: ScanMode::Stopped,
                program: None,
                piezo: 0.0,
                epoch: None,
                started: Instant::now(),
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScannerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Piezo position plus sample drift; zero means the target plane is in focus.
    pub fn focus_error(&self) -> f64 {
        let state = self.lock();
        let drift = self.settings.drift_per_second * state.started.elapsed().as_secs_f64();
        state.piezo + self.settings.initial_offset + drift
    }

    pub fn is_scanning(&self) -> bool {
        self.lock().mode != ScanMode::Stopped
    }

    fn apply(&self, text: &str) {
        let tagged: TaggedCommand = match text.parse() {
            Ok(tagged) => tagged,
            Err(e) => {
                warn!("scanner ignoring '{text}': {e}");
                return;
            }
        };

        let mut state = self.lock();
        if tagged.epoch.is_some() {
            state.epoch = tagged.epoch;
        }
        match tagged.command {
            ScopeCommand::Reset => {
                state.mode = ScanMode::Stopped;
                state.program = None;
            }
            ScopeCommand::Run => state.mode = ScanMode::Continuous,
            ScopeCommand::RunFinite(0) => state.mode = ScanMode::Stopped,
            ScopeCommand::RunFinite(frames) => state.mode = ScanMode::Finite(frames),
            ScopeCommand::MoveRelative(amount) => state.piezo += amount,
            ScopeCommand::ScanProgram(program) => state.program = Some(program),
        }
        debug!(
            "scanner {:?} at piezo {} running {:?}",
            state.mode, state.piezo, state.program
        );
    }

    fn next_frame(&self, rng: &mut StdRng) -> Option<(Image<u16>, Option<u64>)> {
        let focus_error = self.focus_error();
        let mut state = self.lock();
        match state.mode {
            ScanMode::Stopped => return None,
            ScanMode::Continuous => {}
            ScanMode::Finite(left) => {
                state.mode = if left > 1 {
                    ScanMode::Finite(left - 1)
                } else {
                    ScanMode::Stopped
                };
            }
        }
        Some((render_plane(&self.settings, focus_error, Some(rng)), state.epoch))
    }

    pub fn spawn(
        &self,
        bus: Arc<dyn MessageBus>,
        command_topic: &str,
        frame_topic: &str,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>> {
        let mut commands = bus.subscribe(command_topic)?;
        let frame_topic = frame_topic.to_string();
        let scanner = self.clone();

        Ok(tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(scanner.settings.seed);
            let mut ticker = tokio::time::interval(scanner.settings.frame_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!("simulated scanner publishing on '{frame_topic}'");

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    command = commands.next() => match command {
                        Some(message) => {
                            if let Some(text) = message.text() {
                                scanner.apply(text);
                            }
                        }
                        None => break,
                    },
                    _ = ticker.tick() => {
                        if let Some((image, epoch)) = scanner.next_frame(&mut rng) {
                            let payload = encode_frame(&FrameImage::U16(image), Some(Utc::now()), epoch);
                            if let Err(e) = bus.publish(&frame_topic, payload).await {
                                warn!("scanner failed to publish frame: {e}");
                                break;
                            }
                        }
                    }
                }
            }
            info!("simulated scanner stopped");
        }))
    }
}

pub fn spawn_stimulus_controller(
    bus: Arc<dyn MessageBus>,
    topics: HandshakeTopics,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>> {
    let mut requests = bus.subscribe(&topics.alignment)?;

    Ok(tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                message = requests.next() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            match message.text() {
                Some(text) if text == topics.pause => {
                    info!("stimulus paused");
                    if let Err(e) = bus.publish_text(&topics.stimulus, &topics.proceed).await {
                        warn!("stimulus controller failed to reply: {e}");
                    }
                }
                Some(text) if text == topics.unpause => info!("stimulus resumed"),
                other => debug!("stimulus controller ignoring {other:?}"),
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{decode_frame, FrameEncoding, LocalBus};

    #[test]
    fn test_radius_tracks_focus() {
        let settings = ScannerSettings::default();
        let area = |offset: f64| {
            render_plane(&settings, offset, None)
                .pixels()
                .filter(|p| p[0] == FOREGROUND)
                .count()
        };
        assert!(area(-3.0) < area(0.0));
        assert!(area(0.0) < area(3.0));
        assert!(area(-100.0) > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scanner_follows_commands() {
        let bus = Arc::new(LocalBus::new());
        let cancel = CancellationToken::new();
        let scanner = SimulatedScanner::new(ScannerSettings::default());
        scanner.spawn(bus.clone(), "scope", "frame", cancel.clone()).unwrap();
        let mut frames = bus.subscribe("frame").unwrap();

        bus.publish_text("scope", "piezo: move_rel+2.5 #epoch=4").await.unwrap();
        bus.publish_text("scope", "scanner: run_finite2").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(scanner.focus_error(), 2.5);
        assert!(!scanner.is_scanning());

        for _ in 0..2 {
            let frame = decode_frame(&frames.next().await.unwrap().payload, FrameEncoding::Canonical)
                .unwrap();
            assert_eq!(frame.epoch, Some(4));
            assert_eq!(frame.image.dimensions(), (64, 64));
        }
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_stimulus_controller_answers_pause() {
        let bus = Arc::new(LocalBus::new());
        let cancel = CancellationToken::new();
        let mut replies = bus.subscribe("stimbuddy").unwrap();
        spawn_stimulus_controller(bus.clone(), HandshakeTopics::default(), cancel.clone()).unwrap();

        bus.publish_text("alignment", "pause").await.unwrap();
        assert_eq!(replies.next().await.unwrap().text(), Some("proceed"));
        cancel.cancel();
    }
}
