//! On-screen display bridge.

use log::debug;
use parking_lot::Mutex;

/// Recent key presses kept by [`HeadlessOsd`].
const KEY_HISTORY: usize = 64;

/// Remote-control access to the host's on-screen display.
pub trait OsdProvider: Send + Sync {
    /// Attach a client; returns the OSD size in pixels.
    fn connect(&self, client: u64) -> (u32, u32);

    fn disconnect(&self, client: u64);

    fn hit_key(&self, client: u64, key: u32);
}

/// OSD without a display: reports a fixed size and records key presses.
#[derive(Debug)]
pub struct HeadlessOsd {
    width: u32,
    height: u32,
    state: Mutex<HeadlessState>,
}

#[derive(Debug, Default)]
struct HeadlessState {
    clients: Vec<u64>,
    keys: Vec<(u64, u32)>,
}

impl HeadlessOsd {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            state: Mutex::new(HeadlessState::default()),
        }
    }

    #[cfg(test)]
    pub fn connected(&self) -> usize {
        self.state.lock().clients.len()
    }

    /// Most recent keys, oldest first.
    #[cfg(test)]
    pub fn keys(&self) -> Vec<(u64, u32)> {
        self.state.lock().keys.clone()
    }
}

impl Default for HeadlessOsd {
    fn default() -> Self {
        Self::new(720, 576)
    }
}

impl OsdProvider for HeadlessOsd {
    fn connect(&self, client: u64) -> (u32, u32) {
        let mut state = self.state.lock();
        if !state.clients.contains(&client) {
            state.clients.push(client);
        }
        (self.width, self.height)
    }

    fn disconnect(&self, client: u64) {
        self.state.lock().clients.retain(|c| *c != client);
    }

    fn hit_key(&self, client: u64, key: u32) {
        let mut state = self.state.lock();
        if !state.clients.contains(&client) {
            return;
        }
        debug!("[Client {}] OSD key {:#x}", client, key);
        if state.keys.len() == KEY_HISTORY {
            state.keys.remove(0);
        }
        state.keys.push((client, key));
    }
}
