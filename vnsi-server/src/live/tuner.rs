//! Priority-aware arbitration of tuner devices.
//!
//! A device is tuned to one transponder at a time. Sessions on the same
//! transponder share a device; a higher priority request may take a device
//! away from lower priority holders, whose preemption tokens are cancelled.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info};
use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::store::Channel;

/// Transponder identity: delivery system, network id, transport stream id.
pub type TransponderKey = (String, u16, u16);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TunerError {
    #[error("All tuners are in use by equal or higher priority sessions")]
    Locked,

    #[error("No tuner devices configured")]
    NoDevices,
}

#[derive(Debug)]
struct Holder {
    id: u64,
    priority: i32,
    preempt: CancellationToken,
}

#[derive(Debug, Default)]
struct Device {
    transponder: Option<TransponderKey>,
    holders: Vec<Holder>,
}

impl Device {
    fn top_priority(&self) -> Option<i32> {
        self.holders.iter().map(|h| h.priority).max()
    }
}

pub struct TunerPool {
    devices: Mutex<Vec<Device>>,
    next_id: AtomicU64,
}

impl TunerPool {
    pub fn new(count: usize) -> Arc<Self> {
        let devices = (0..count).map(|_| Device::default()).collect();
        Arc::new(Self {
            devices: Mutex::new(devices),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn device_count(&self) -> usize {
        self.devices.lock().len()
    }

    #[cfg(test)]
    /// Number of sessions holding `device`.
    pub fn holders(&self, device: usize) -> usize {
        self.devices.lock().get(device).map_or(0, |d| d.holders.len())
    }

    /// Acquire a device able to receive `channel`.
    pub fn acquire(self: &Arc<Self>, channel: &Channel, priority: i32) -> Result<TunerLease, TunerError> {
        let key = channel.transponder();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let preempt = CancellationToken::new();

        let mut devices = self.devices.lock();
        if devices.is_empty() {
            return Err(TunerError::NoDevices);
        }

        let shared = devices
            .iter()
            .position(|d| !d.holders.is_empty() && d.transponder.as_ref() == Some(&key));
        let free = || devices.iter().position(|d| d.holders.is_empty());

        let index = match shared.or_else(free) {
            Some(index) => index,
            None => {
                // lowest priority device that is strictly below us
                let victim = devices
                    .iter()
                    .enumerate()
                    .filter_map(|(i, d)| d.top_priority().map(|p| (i, p)))
                    .filter(|(_, p)| *p < priority)
                    .min_by_key(|(_, p)| *p)
                    .map(|(i, _)| i)
                    .ok_or(TunerError::Locked)?;
                let device = &mut devices[victim];
                info!(
                    "Preempting tuner {} ({} holders) for priority {}",
                    victim,
                    device.holders.len(),
                    priority
                );
                for holder in device.holders.drain(..) {
                    holder.preempt.cancel();
                }
                victim
            }
        };

        let device = &mut devices[index];
        if device.holders.is_empty() {
            device.transponder = Some(key.clone());
        }
        device.holders.push(Holder {
            id,
            priority,
            preempt: preempt.clone(),
        });
        debug!(
            "Tuner {} acquired for {:?} (priority {}, {} holders)",
            index,
            key,
            priority,
            device.holders.len()
        );

        Ok(TunerLease {
            pool: Arc::clone(self),
            device: index,
            id,
            preempted: preempt,
        })
    }

    fn release(&self, device: usize, id: u64) {
        let mut devices = self.devices.lock();
        if let Some(d) = devices.get_mut(device) {
            d.holders.retain(|h| h.id != id);
            if d.holders.is_empty() {
                d.transponder = None;
            }
            debug!("Tuner {} released ({} holders left)", device, d.holders.len());
        }
    }
}

/// Claim on one tuner device; released on drop.
#[derive(Debug)]
pub struct TunerLease {
    pool: Arc<TunerPool>,
    device: usize,
    id: u64,
    preempted: CancellationToken,
}

impl TunerLease {
    pub fn device(&self) -> usize {
        self.device
    }

    /// Cancelled when a higher priority session takes the device.
    pub fn preempted(&self) -> &CancellationToken {
        &self.preempted
    }
}

impl Drop for TunerLease {
    fn drop(&mut self) {
        self.pool.release(self.device, self.id);
    }
}

impl std::fmt::Debug for TunerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunerPool")
            .field("devices", &self.device_count())
            .finish()
    }
}
