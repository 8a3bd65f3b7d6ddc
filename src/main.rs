use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::{ArgAction, Parser, ValueHint};
use log::{error, info, LevelFilter};
use tokio_util::sync::CancellationToken;

use planelock::{
    bus::{LocalBus, MessageBus},
    capture::{spawn_frame_receiver, FrameBuffer, SaveStream},
    control::ControlLoop,
    logging,
    simulator::{spawn_stimulus_controller, ScannerSettings, SimulatedScanner},
    AlignmentConfig, Result,
};

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Keeps a scanning microscope locked on its target focal plane"
)]
struct Cli {
    /// JSON configuration file; defaults are used for anything it omits
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Also write the log to planelock.log in this directory
    #[arg(long, value_hint = ValueHint::DirPath)]
    log_dir: Option<PathBuf>,

    /// Log debug output
    #[arg(short, long, action = ArgAction::SetTrue)]
    verbose: bool,

    /// Stop after this many seconds instead of waiting for Ctrl-C
    #[arg(long, value_parser = parse_seconds)]
    duration: Option<Duration>,

    /// Drift of the simulated sample, in piezo units per second
    #[arg(long, default_value_t = 0.01)]
    drift: f64,

    /// Pause the stimulus controller around every alignment
    #[arg(long)]
    safe_mode: bool,

    /// Record every inbound frame message to this file
    #[arg(long, value_hint = ValueHint::FilePath)]
    save: Option<PathBuf>,
}

fn parse_seconds(arg: &str) -> std::result::Result<Duration, String> {
    let secs: f64 = arg.parse().map_err(|e| format!("{e}"))?;
    Duration::try_from_secs_f64(secs).map_err(|e| format!("{secs} seconds: {e}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    logging::init(level, cli.log_dir.as_deref())?;

    let mut config = match &cli.config {
        Some(path) => AlignmentConfig::load(path)?,
        None => AlignmentConfig::default(),
    };
    config.safe_mode |= cli.safe_mode;
    if cli.save.is_some() {
        config.save_path = cli.save.clone();
    }

    let bus: Arc<dyn MessageBus> = Arc::new(LocalBus::new());
    let buffer = Arc::new(FrameBuffer::new());
    let cancel = CancellationToken::new();

    let scanner = SimulatedScanner::new(ScannerSettings {
        drift_per_second: cli.drift,
        ..ScannerSettings::default()
    });
    let mut tasks = vec![
        scanner.spawn(
            bus.clone(),
            &config.scope.commands,
            &config.scope.frames,
            cancel.clone(),
        )?,
        spawn_stimulus_controller(bus.clone(), config.handshake.clone(), cancel.clone())?,
    ];

    let save = config
        .save_path
        .as_deref()
        .map(SaveStream::create)
        .transpose()?;
    tasks.push(spawn_frame_receiver(
        bus.clone(),
        &config.scope.frames,
        buffer.clone(),
        config.encoding,
        save,
        cancel.clone(),
    )?);

    let mut control = ControlLoop::new(config, bus, buffer.clone(), cancel.clone())?;
    let handle = control.handle();

    tokio::spawn({
        let mut states = handle.subscribe();
        async move {
            while states.changed().await.is_ok() {
                let state = *states.borrow_and_update();
                info!("scheduler is {state:?}");
            }
        }
    });

    tokio::spawn({
        let handle = handle.clone();
        let duration = cli.duration;
        async move {
            match duration {
                Some(duration) => tokio::time::sleep(duration).await,
                None => {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        error!("Failed to listen for Ctrl-C: {e}");
                    }
                }
            }
            info!("Shutting down");
            handle.cancel();
        }
    });

    let result = control.run().await;
    cancel.cancel();
    for task in tasks {
        let _ = task.await;
    }

    info!(
        "{} alignments completed, simulated focus error {:.3}, {} frames received ({} out of order)",
        control.alignments_completed(),
        scanner.focus_error(),
        buffer.total_received(),
        buffer.ordering_violations()
    );
    if let Some(result) = control.last_match() {
        info!("last match: plane {} with scores {:?}", result.index, result.scores);
    }
    result
}
