pub mod handshake;
pub mod scheduler;
pub mod trigger;

pub use handshake::{HandshakeTopics, PauseHandshake};
pub use scheduler::{ControlHandle, ControlLoop, SchedulerState};
pub use trigger::{
    CycleProgress, ElapsedTimeTrigger, FrameCountTrigger, RealignTrigger, TriggerPolicy,
};
