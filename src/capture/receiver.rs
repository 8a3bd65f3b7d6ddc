use std::{
    fs::{File, OpenOptions},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::Utc;
use futures::StreamExt;
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    bus::{decode_frame, FrameEncoding, Message, MessageBus},
    error::Result,
};

use super::{frame_buffer::FrameBuffer, types::Frame};

/// Records every inbound message as a `"<timestamp>_<payload>"` line.
pub struct SaveStream {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl SaveStream {
    pub fn create(path: &Path) -> Result<Self> {
        let path = unique_path(path);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "{} ", Utc::now())?;
        writer.flush()?;
        info!("Saving inbound stream to {}", path.display());
        Ok(Self { path, writer })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&mut self, message: &Message) -> io::Result<()> {
        let payload = String::from_utf8_lossy(&message.payload);
        writeln!(self.writer, "{}_{}", Utc::now(), payload)?;
        self.writer.flush()
    }
}

/// `name.txt`, then `name_1.txt`, `name_2.txt`, ... for the first free name.
pub fn unique_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    (1..)
        .map(|n| path.with_file_name(format!("{stem}_{n}.txt")))
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| path.to_path_buf())
}

/// Receives frames from `topic` and appends them to the buffer until
/// cancelled or the bus closes. Payloads that fail to decode are logged and
/// dropped.
pub fn spawn_frame_receiver(
    bus: Arc<dyn MessageBus>,
    topic: &str,
    buffer: Arc<FrameBuffer>,
    encoding: FrameEncoding,
    mut save: Option<SaveStream>,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>> {
    let mut messages = bus.subscribe(topic)?;
    let topic = topic.to_string();

    Ok(tokio::spawn(async move {
        info!("Frame receiver listening on '{topic}'");
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                message = messages.next() => match message {
                    Some(message) => message,
                    None => {
                        warn!("Frame stream on '{topic}' closed");
                        break;
                    }
                },
            };

            if let Some(save) = save.as_mut() {
                if let Err(e) = save.record(&message) {
                    error!("Failed to record message to {}: {e}", save.path().display());
                }
            }

            match decode_frame(&message.payload, encoding) {
                Ok(decoded) => {
                    let frame = Frame {
                        timestamp: decoded.timestamp.unwrap_or_else(Utc::now),
                        epoch: decoded.epoch,
                        image: decoded.image,
                    };
                    debug!(
                        "received {:?} frame on {} (epoch {:?})",
                        frame.image.dimensions(),
                        message.topic,
                        frame.epoch
                    );
                    buffer.append(frame);
                }
                Err(e) => warn!("Dropping undecodable message on {}: {e}", message.topic),
            }
        }
        info!("Frame receiver stopped");
    }))
}
