//! Live TV: tuner allocation, input feeds, session buffers and the streamer task.

pub mod buffer;
pub mod input;
pub mod streamer;
pub mod tuner;

pub use input::{FileReplayInput, LiveSources, SourceBinding, StreamError, TsInput};
pub use streamer::{LiveHandle, LiveStreamer, StreamerConfig};
pub use tuner::TunerPool;
