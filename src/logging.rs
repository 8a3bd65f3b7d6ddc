use std::{fs, path::Path};

use fern::colors::ColoredLevelConfig;
use log::LevelFilter;

use crate::error::Result;

const LOG_FILE_NAME: &str = "planelock.log";

pub fn init(level: LevelFilter, log_dir: Option<&Path>) -> Result<()> {
    let colors = ColoredLevelConfig::default();

    let stdout = fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "{} {:<5} [{}] {}",
                chrono::Local::now().format("%H:%M:%S%.3f"),
                colors.color(record.level()),
                record.target(),
                message
            ))
        })
        .chain(std::io::stdout());

    let mut dispatch = fern::Dispatch::new()
        .level(level)
        // The tokio and rayon internals are noisy at debug level.
        .level_for("tokio", LevelFilter::Warn)
        .level_for("rayon_core", LevelFilter::Warn)
        .chain(stdout);

    if let Some(dir) = log_dir {
        fs::create_dir_all(dir)?;
        let file = fern::Dispatch::new()
            .format(|out, message, record| {
                out.finish(format_args!(
                    "{} {} [{}] {}",
                    chrono::Local::now().to_rfc3339(),
                    record.level(),
                    record.target(),
                    message
                ))
            })
            .chain(fern::log_file(dir.join(LOG_FILE_NAME))?);
        dispatch = dispatch.chain(file);
    }

    dispatch.apply()?;
    Ok(())
}
