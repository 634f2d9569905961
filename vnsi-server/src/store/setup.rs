//! Persisted runtime setup values and the channel filter.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::{debug, info};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{Channel, ChannelFilter};

/// Setup names understood by GetSetup and StoreSetup.
pub mod setup_names {
    pub const PMT_TIMEOUT: &str = "PmtTimeout";
    pub const TIMESHIFT: &str = "Timeshift";
    pub const TIMESHIFT_BUFFER_SIZE: &str = "TimeshiftBufferSize";
    pub const TIMESHIFT_BUFFER_FILE_SIZE: &str = "TimeshiftBufferFileSize";
    pub const PLAY_RECORDING: &str = "PlayRecording";

    pub const ALL: &[(&str, u32)] = &[
        (PMT_TIMEOUT, 5),
        (TIMESHIFT, 0),
        (TIMESHIFT_BUFFER_SIZE, 5),
        (TIMESHIFT_BUFFER_FILE_SIZE, 6),
        (PLAY_RECORDING, 0),
    ];
}

/// Timeshift modes stored under `Timeshift`.
pub mod timeshift_mode {
    pub const OFF: u32 = 0;
    pub const RAM: u32 = 1;
    pub const FILE: u32 = 2;
}

#[derive(Error, Debug)]
pub enum SetupError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct SetupDocument {
    values: BTreeMap<String, u32>,
    filter: ChannelFilter,
}

pub struct SetupStore {
    path: Option<PathBuf>,
    document: RwLock<SetupDocument>,
}

fn canonical_name(name: &str) -> Option<&'static str> {
    setup_names::ALL
        .iter()
        .map(|(n, _)| *n)
        .find(|n| n.eq_ignore_ascii_case(name))
}

impl SetupStore {
    /// Store that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            document: RwLock::new(SetupDocument::default()),
        }
    }

    /// Load from `path`; a missing file starts with defaults.
    pub fn open(path: &Path) -> Result<Self, SetupError> {
        let document = match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("Setup file {:?} not found, using defaults", path);
                SetupDocument::default()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: Some(path.to_path_buf()),
            document: RwLock::new(document),
        })
    }

    /// Current value of a known setting, matched case-insensitively.
    pub fn get(&self, name: &str) -> Option<u32> {
        let name = canonical_name(name)?;
        let document = self.document.read();
        document.values.get(name).copied().or_else(|| {
            setup_names::ALL
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, v)| *v)
        })
    }

    /// Store a known setting. Returns `false` for unknown names.
    pub fn set(&self, name: &str, value: u32) -> Result<bool, SetupError> {
        let Some(name) = canonical_name(name) else {
            debug!("Ignoring unknown setup name '{}'", name);
            return Ok(false);
        };
        let snapshot = {
            let mut document = self.document.write();
            document.values.insert(name.to_string(), value);
            document.clone()
        };
        info!("Setup {} = {}", name, value);
        self.persist(&snapshot)?;
        Ok(true)
    }

    pub fn filter(&self) -> ChannelFilter {
        self.document.read().filter.clone()
    }

    pub fn passes_filter(&self, channel: &Channel) -> bool {
        self.document.read().filter.passes(channel)
    }

    pub fn update_filter<F>(&self, update: F) -> Result<(), SetupError>
    where
        F: FnOnce(&mut ChannelFilter),
    {
        let snapshot = {
            let mut document = self.document.write();
            update(&mut document.filter);
            document.clone()
        };
        self.persist(&snapshot)
    }

    fn persist(&self, document: &SetupDocument) -> Result<(), SetupError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(document)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}
