//! Collaborator stores for channels, timers, recordings and the programme guide.
//!
//! Reads hand out immutable snapshots; writes replace the snapshot atomically
//! and announce the change on the event channel.

mod filter;
mod memory;
pub(crate) mod models;
mod setup;
mod watcher;

pub use filter::{ChannelFilter, ProviderEntry};
pub use memory::{Catalog, MemoryStore};
pub use models::*;
pub use setup::{setup_names, timeshift_mode, SetupError, SetupStore};
pub use watcher::spawn_catalog_watcher;

#[cfg(test)]
pub(crate) use memory::test_util::{sample_catalog, sample_store};

use std::sync::Arc;

use thiserror::Error;
use vnsi_protocol::ReturnCode;

/// Store error types.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid data: {0}")]
    Invalid(String),

    #[error("Already exists: {0}")]
    Duplicate(String),

    #[error("Timer {0} is recording")]
    RecordingRunning(u32),

    #[error("In use: {0}")]
    InUse(String),

    #[error("Name clash: {0}")]
    NameClash(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Catalog parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

impl StoreError {
    pub fn return_code(&self) -> ReturnCode {
        match self {
            StoreError::NotFound(_) => ReturnCode::DataUnknown,
            StoreError::Invalid(_) => ReturnCode::DataInvalid,
            StoreError::Duplicate(_) | StoreError::InUse(_) => ReturnCode::DataLocked,
            StoreError::RecordingRunning(_) => ReturnCode::RecordingRunning,
            StoreError::NameClash(_) | StoreError::Io(_) | StoreError::Parse(_) => ReturnCode::Error,
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Change notifications pushed to connections with the status interface enabled.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    TimersChanged,
    ChannelsChanged,
    /// A single channel's tuning data changed.
    ChannelModified(u32),
    RecordingsChanged,
    EpgChanged,
    Recording {
        device: u32,
        on: bool,
        name: String,
        file: String,
    },
    Message(String),
}

pub trait ChannelStore: Send + Sync {
    fn channels(&self) -> Arc<Vec<Channel>>;

    fn channel_by_uid(&self, uid: u32) -> Option<Channel> {
        self.channels().iter().find(|c| c.uid() == uid).cloned()
    }

    fn channel_by_number(&self, number: u32) -> Option<Channel> {
        self.channels().iter().find(|c| c.number == number).cloned()
    }

    fn max_number(&self) -> u32 {
        self.channels().iter().map(|c| c.number).max().unwrap_or(0)
    }
}

pub trait TimerStore: Send + Sync {
    fn timers(&self) -> Arc<Vec<Timer>>;

    fn add_timer(&self, timer: Timer) -> Result<()>;

    /// Replace timer `number` (1-based).
    fn update_timer(&self, number: u32, timer: Timer) -> Result<()>;

    fn delete_timer(&self, number: u32, force: bool) -> Result<()>;
}

pub trait RecordingStore: Send + Sync {
    fn recordings(&self) -> Arc<Vec<Recording>>;

    fn deleted_recordings(&self) -> Arc<Vec<Recording>>;

    fn recording_by_uid(&self, uid: u32) -> Option<Recording> {
        self.recordings().iter().find(|r| r.uid == uid).cloned()
    }

    fn rename_recording(&self, uid: u32, title: &str) -> Result<()>;

    /// Move a recording to the deleted list.
    fn delete_recording(&self, uid: u32) -> Result<()>;

    fn undelete_recording(&self, uid: u32) -> Result<()>;

    /// Drop a deleted recording for good.
    fn purge_recording(&self, uid: u32) -> Result<()>;

    fn purge_all(&self) -> Result<()>;

    fn disk_space(&self) -> DiskSpace;
}

pub trait EpgStore: Send + Sync {
    /// Events of one channel ordered by start time.
    fn schedule(&self, channel_uid: u32) -> Option<Arc<Vec<EpgEvent>>>;

    /// `(channel uid, start of last event)` for every non-empty schedule.
    fn last_events(&self) -> Vec<(u32, u32)>;
}
