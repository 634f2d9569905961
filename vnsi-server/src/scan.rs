//! Channel scan coordination.
//!
//! At most one scan runs process-wide. The connection that started it owns
//! the [`ScanCoordinator`] until the scan finishes, is stopped, or the
//! connection goes away.

use std::sync::Arc;

use bytes::Bytes;
use log::{info, warn};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use vnsi_protocol::{FieldWriter, ResponsePacket, ScanEventKind};

/// Parameters of a ScanStart request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSetup {
    pub delivery: u32,
    pub tv: bool,
    pub radio: bool,
    pub fta: bool,
    pub scrambled: bool,
    pub hd: bool,
    pub country: u32,
    pub dvbc_inversion: u32,
    pub dvbc_symbolrate: u32,
    pub dvbc_qam: u32,
    pub dvbt_inversion: u32,
    pub sat_index: u32,
    pub atsc_type: u32,
}

/// Country or satellite known to the scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanEntry {
    pub index: u32,
    pub name: String,
    pub long_name: String,
}

/// Progress reported by a running scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    Percentage(u32),
    Signal { strength: u32, locked: bool },
    Device(String),
    Transponder(String),
    NewChannel {
        radio: bool,
        encrypted: bool,
        hd: bool,
        name: String,
    },
    Finished,
    Status(u32),
}

impl ScanEvent {
    pub fn to_frame(&self) -> Bytes {
        let resp = match self {
            ScanEvent::Percentage(percent) => {
                let mut resp = ResponsePacket::scan(ScanEventKind::Percentage);
                resp.add_u32(*percent);
                resp
            }
            ScanEvent::Signal { strength, locked } => {
                let mut resp = ResponsePacket::scan(ScanEventKind::Signal);
                resp.add_u32(*strength).add_u32(*locked as u32);
                resp
            }
            ScanEvent::Device(name) => {
                let mut resp = ResponsePacket::scan(ScanEventKind::Device);
                resp.add_string(name);
                resp
            }
            ScanEvent::Transponder(name) => {
                let mut resp = ResponsePacket::scan(ScanEventKind::Transponder);
                resp.add_string(name);
                resp
            }
            ScanEvent::NewChannel {
                radio,
                encrypted,
                hd,
                name,
            } => {
                let mut resp = ResponsePacket::scan(ScanEventKind::NewChannel);
                resp.add_u32(*radio as u32)
                    .add_u32(*encrypted as u32)
                    .add_u32(*hd as u32)
                    .add_string(name);
                resp
            }
            ScanEvent::Finished => ResponsePacket::scan(ScanEventKind::Finished),
            ScanEvent::Status(status) => {
                let mut resp = ResponsePacket::scan(ScanEventKind::Status);
                resp.add_u32(*status);
                resp
            }
        };
        resp.finalise()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScanError {
    #[error("Channel scanning is not supported")]
    Unsupported,

    #[error("Another scan is already running")]
    Busy,

    #[error("Scanner refused to start: {0}")]
    Refused(String),
}

/// Hardware-facing scan backend.
pub trait ChannelScanner: Send + Sync {
    fn is_supported(&self) -> bool;

    /// Bitmask of `vnsi_protocol::scan_support` values.
    fn supported_types(&self) -> u32;

    fn countries(&self) -> Vec<ScanEntry>;

    fn satellites(&self) -> Vec<ScanEntry>;

    /// Begin scanning; progress is reported through `events` and ends with [`ScanEvent::Finished`].
    fn start(&self, setup: &ScanSetup, events: mpsc::UnboundedSender<ScanEvent>) -> Result<(), ScanError>;

    /// Abort a running scan. Returns false if the scanner could not stop it.
    fn stop(&self) -> bool;
}

/// Scanner for deployments without scan hardware.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedScanner;

impl ChannelScanner for UnsupportedScanner {
    fn is_supported(&self) -> bool {
        false
    }

    fn supported_types(&self) -> u32 {
        0
    }

    fn countries(&self) -> Vec<ScanEntry> {
        Vec::new()
    }

    fn satellites(&self) -> Vec<ScanEntry> {
        Vec::new()
    }

    fn start(&self, _setup: &ScanSetup, _events: mpsc::UnboundedSender<ScanEvent>) -> Result<(), ScanError> {
        Err(ScanError::Unsupported)
    }

    fn stop(&self) -> bool {
        false
    }
}

/// Process-wide owner of the scanner.
pub struct ScanCoordinator {
    scanner: Arc<dyn ChannelScanner>,
    owner: Mutex<Option<u64>>,
}

impl ScanCoordinator {
    pub fn new(scanner: Arc<dyn ChannelScanner>) -> Arc<Self> {
        Arc::new(Self {
            scanner,
            owner: Mutex::new(None),
        })
    }

    pub fn scanner(&self) -> &dyn ChannelScanner {
        self.scanner.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.owner.lock().is_some()
    }

    /// Connection currently running a scan.
    pub fn owner(&self) -> Option<u64> {
        *self.owner.lock()
    }

    /// Claim the scanner for `client` and start it.
    pub fn start(
        &self,
        client: u64,
        setup: &ScanSetup,
    ) -> Result<mpsc::UnboundedReceiver<ScanEvent>, ScanError> {
        if !self.scanner.is_supported() {
            return Err(ScanError::Unsupported);
        }
        {
            let mut owner = self.owner.lock();
            if owner.is_some() {
                return Err(ScanError::Busy);
            }
            *owner = Some(client);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if let Err(e) = self.scanner.start(setup, tx) {
            warn!("[Scan] Start for client {} failed: {}", client, e);
            self.release(client);
            return Err(e);
        }
        info!("[Scan] Started by client {} (delivery {:#x})", client, setup.delivery);
        Ok(rx)
    }

    /// Stop the scan owned by `client`.
    pub fn stop(&self, client: u64) -> Result<(), ScanError> {
        if self.owner() != Some(client) {
            return Err(ScanError::Unsupported);
        }
        let stopped = self.scanner.stop();
        self.release(client);
        if stopped {
            info!("[Scan] Stopped by client {}", client);
            Ok(())
        } else {
            Err(ScanError::Refused("stop failed".to_string()))
        }
    }

    /// Drop ownership if `client` holds it. Returns whether it did.
    pub fn release(&self, client: u64) -> bool {
        let mut owner = self.owner.lock();
        if *owner == Some(client) {
            *owner = None;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;

    /// Scanner that replays a fixed event list when started.
    #[derive(Default)]
    pub struct ScriptedScanner {
        pub events: Vec<ScanEvent>,
        pub refuse: bool,
        pub stops: Mutex<u32>,
    }

    impl ChannelScanner for ScriptedScanner {
        fn is_supported(&self) -> bool {
            true
        }

        fn supported_types(&self) -> u32 {
            vnsi_protocol::scan_support::DVB_T | vnsi_protocol::scan_support::DVB_C
        }

        fn countries(&self) -> Vec<ScanEntry> {
            vec![ScanEntry {
                index: 0,
                name: "DE".to_string(),
                long_name: "Germany".to_string(),
            }]
        }

        fn satellites(&self) -> Vec<ScanEntry> {
            Vec::new()
        }

        fn start(&self, _setup: &ScanSetup, events: mpsc::UnboundedSender<ScanEvent>) -> Result<(), ScanError> {
            if self.refuse {
                return Err(ScanError::Refused("busy hardware".to_string()));
            }
            for event in &self.events {
                let _ = events.send(event.clone());
            }
            Ok(())
        }

        fn stop(&self) -> bool {
            *self.stops.lock() += 1;
            true
        }
    }
}
