use std::{
    fmt,
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use log::debug;

use crate::{
    bus::MessageBus,
    error::{AlignmentError, Result},
};

const MOVE_PREFIX: &str = "piezo: move_rel";
const RUN_FINITE_PREFIX: &str = "scanner: run_finite";
const EPOCH_MARKER: &str = " #epoch=";

pub const TARGET_PLANE_PROGRAM: &str = "s4 p2";
pub const CONTINUOUS_PLANE_PROGRAM: &str = "s1 s3";

#[derive(Clone, Debug, PartialEq)]
pub enum ScopeCommand {
    Reset,
    Run,
    MoveRelative(f64),
    RunFinite(u32),
    ScanProgram(String),
}

impl ScopeCommand {
    pub fn target_plane() -> Self {
        ScopeCommand::ScanProgram(TARGET_PLANE_PROGRAM.to_string())
    }

    pub fn continuous_plane() -> Self {
        ScopeCommand::ScanProgram(CONTINUOUS_PLANE_PROGRAM.to_string())
    }

    /// A free-form scan program. Text that would read back as another
    /// command, or that the wire format would alter, is rejected.
    pub fn scan_program(program: impl Into<String>) -> Result<Self> {
        let program = program.into();
        check_program(&program)?;
        Ok(ScopeCommand::ScanProgram(program))
    }

    pub fn volumetric(n_planes: u32, reps: u32) -> Self {
        ScopeCommand::ScanProgram(format!(
            r#"s4 s2 p0 "1000 (p1 "20 (s3 s5? p3 "20){n_planes}){reps}"#
        ))
    }
}

fn check_program(program: &str) -> Result<()> {
    let reserved = program.is_empty()
        || program.trim() != program
        || program == "RESET"
        || program == "RUN"
        || program.starts_with(MOVE_PREFIX)
        || program.starts_with(RUN_FINITE_PREFIX)
        || program.contains(EPOCH_MARKER)
        || program.contains(['\n', '\r']);
    if reserved {
        return Err(AlignmentError::invalid(format!(
            "'{program}' cannot be sent as a scan program"
        )));
    }
    Ok(())
}

impl fmt::Display for ScopeCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeCommand::Reset => write!(f, "RESET"),
            ScopeCommand::Run => write!(f, "RUN"),
            ScopeCommand::MoveRelative(amount) => write!(f, "{MOVE_PREFIX}{amount:+}"),
            ScopeCommand::RunFinite(frames) => write!(f, "{RUN_FINITE_PREFIX}{frames}"),
            ScopeCommand::ScanProgram(program) => write!(f, "{program}"),
        }
    }
}

impl FromStr for ScopeCommand {
    type Err = AlignmentError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AlignmentError::invalid("empty scope command"));
        }
        if s == "RESET" {
            return Ok(ScopeCommand::Reset);
        }
        if s == "RUN" {
            return Ok(ScopeCommand::Run);
        }
        if let Some(amount) = s.strip_prefix(MOVE_PREFIX) {
            return amount
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|a| a.is_finite())
                .map(ScopeCommand::MoveRelative)
                .ok_or_else(|| AlignmentError::invalid(format!("bad move amount in '{s}'")));
        }
        if let Some(frames) = s.strip_prefix(RUN_FINITE_PREFIX) {
            return frames
                .trim()
                .parse()
                .map(ScopeCommand::RunFinite)
                .map_err(|_| AlignmentError::invalid(format!("bad frame count in '{s}'")));
        }
        Ok(ScopeCommand::ScanProgram(s.to_string()))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TaggedCommand {
    pub command: ScopeCommand,
    pub epoch: Option<u64>,
}

impl fmt::Display for TaggedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.epoch {
            Some(epoch) => write!(f, "{}{EPOCH_MARKER}{epoch}", self.command),
            None => write!(f, "{}", self.command),
        }
    }
}

impl FromStr for TaggedCommand {
    type Err = AlignmentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.rsplit_once(EPOCH_MARKER) {
            Some((command, epoch)) => Ok(TaggedCommand {
                command: command.parse()?,
                epoch: Some(epoch.trim().parse().map_err(|_| {
                    AlignmentError::invalid(format!("bad epoch in '{s}'"))
                })?),
            }),
            None => Ok(TaggedCommand {
                command: s.parse()?,
                epoch: None,
            }),
        }
    }
}

pub struct ScopeClient {
    bus: Arc<dyn MessageBus>,
    topic: String,
    tag_epochs: bool,
    epoch: AtomicU64,
}

impl ScopeClient {
    pub fn new(bus: Arc<dyn MessageBus>, topic: impl Into<String>, tag_epochs: bool) -> Self {
        Self {
            bus,
            topic: topic.into(),
            tag_epochs,
            epoch: AtomicU64::new(0),
        }
    }

    /// Sends the command and returns the epoch it was issued under.
    pub async fn send(&self, command: ScopeCommand) -> Result<u64> {
        if let ScopeCommand::ScanProgram(program) = &command {
            check_program(program)?;
        }
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let tagged = TaggedCommand {
            command,
            epoch: self.tag_epochs.then_some(epoch),
        };
        let text = tagged.to_string();
        debug!("scope <- {text}");
        self.bus.publish_text(&self.topic, &text).await?;
        Ok(epoch)
    }

    pub fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }
}
