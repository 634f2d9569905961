//! Playback access to stored recordings.

pub mod index;
pub mod reader;

pub use reader::{IFrame, RecordingError, RecordingReader, MAX_BLOCK_SIZE};
