pub mod commands;
pub mod frame_buffer;
pub mod receiver;
pub mod sequencer;
pub mod types;

pub use commands::{ScopeClient, ScopeCommand, TaggedCommand};
pub use frame_buffer::{FrameBuffer, Window};
pub use receiver::{spawn_frame_receiver, SaveStream};
pub use sequencer::{CorrelationPolicy, SequencerSettings, StackSequencer};
pub use types::{CutOutcome, Frame, ZStack};
