//! In-memory store loaded from a TOML catalog.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::sync::broadcast;

use super::{
    Channel, ChannelStore, DiskSpace, EpgEvent, EpgStore, Recording, RecordingStore, Result,
    StoreError, StoreEvent, Timer, TimerStore,
};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DiskConfig {
    pub total_mb: u32,
    pub free_mb: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    /// Channel number the events belong to.
    pub channel: u32,
    #[serde(default)]
    pub events: Vec<EpgEvent>,
}

/// Catalog file contents.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Catalog {
    pub disk: DiskConfig,
    pub channels: Vec<Channel>,
    pub timers: Vec<Timer>,
    pub recordings: Vec<Recording>,
    pub deleted: Vec<Recording>,
    pub schedules: Vec<ScheduleConfig>,
}

impl Catalog {
    pub fn parse(text: &str) -> Result<Self> {
        let mut catalog: Catalog = toml::from_str(text)?;
        for recording in catalog.recordings.iter_mut().chain(catalog.deleted.iter_mut()) {
            recording.assign_uid();
        }
        Ok(catalog)
    }

    /// Load a catalog file; relative paths resolve against its directory.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut catalog = Self::parse(&text)?;
        if let Some(base) = path.parent() {
            for channel in &mut catalog.channels {
                if let Some(source) = channel.source.as_mut() {
                    if source.is_relative() {
                        *source = base.join(&*source);
                    }
                }
            }
            for recording in catalog.recordings.iter_mut().chain(catalog.deleted.iter_mut()) {
                if recording.path.is_relative() {
                    recording.path = base.join(&recording.path);
                    recording.assign_uid();
                }
            }
        }
        Ok(catalog)
    }
}

#[derive(Debug, Clone, Default)]
struct Snapshot {
    channels: Arc<Vec<Channel>>,
    timers: Arc<Vec<Timer>>,
    recordings: Arc<Vec<Recording>>,
    deleted: Arc<Vec<Recording>>,
    schedules: Arc<HashMap<u32, Arc<Vec<EpgEvent>>>>,
    disk: DiskSpace,
}

impl Snapshot {
    fn from_catalog(catalog: Catalog) -> Self {
        let mut schedules = HashMap::new();
        for schedule in catalog.schedules {
            let Some(channel) = catalog.channels.iter().find(|c| c.number == schedule.channel)
            else {
                warn!("Schedule for unknown channel number {} ignored", schedule.channel);
                continue;
            };
            let mut events = schedule.events;
            events.sort_by_key(|e| e.start);
            schedules.insert(channel.uid(), Arc::new(events));
        }

        let DiskConfig { total_mb, free_mb } = catalog.disk;
        let used = total_mb.saturating_sub(free_mb);
        let percent_used = if total_mb > 0 {
            (used as u64 * 100 / total_mb as u64) as u32
        } else {
            0
        };

        Self {
            channels: Arc::new(catalog.channels),
            timers: Arc::new(catalog.timers),
            recordings: Arc::new(catalog.recordings),
            deleted: Arc::new(catalog.deleted),
            schedules: Arc::new(schedules),
            disk: DiskSpace {
                total_mb,
                free_mb,
                percent_used,
            },
        }
    }
}

/// Copy-on-write store; every write swaps in a new snapshot under the lock.
pub struct MemoryStore {
    state: RwLock<Snapshot>,
    events: broadcast::Sender<StoreEvent>,
}

impl MemoryStore {
    pub fn new(catalog: Catalog, events: broadcast::Sender<StoreEvent>) -> Self {
        let snapshot = Snapshot::from_catalog(catalog);
        info!(
            "Catalog: {} channels, {} timers, {} recordings, {} schedules",
            snapshot.channels.len(),
            snapshot.timers.len(),
            snapshot.recordings.len(),
            snapshot.schedules.len()
        );
        Self {
            state: RwLock::new(snapshot),
            events,
        }
    }

    pub fn events(&self) -> broadcast::Sender<StoreEvent> {
        self.events.clone()
    }

    fn emit(&self, event: StoreEvent) {
        debug!("Store event: {:?}", event);
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    /// Swap in a new catalog and announce what changed.
    pub fn reload(&self, catalog: Catalog) {
        let next = Snapshot::from_catalog(catalog);
        let mut changes = Vec::new();
        {
            let mut state = self.state.write();

            if state.channels != next.channels {
                for channel in next.channels.iter() {
                    let uid = channel.uid();
                    if let Some(old) = state.channels.iter().find(|c| c.uid() == uid) {
                        if old != channel {
                            changes.push(StoreEvent::ChannelModified(uid));
                        }
                    }
                }
                changes.push(StoreEvent::ChannelsChanged);
            }
            if state.timers != next.timers {
                changes.push(StoreEvent::TimersChanged);
            }
            if state.recordings != next.recordings || state.deleted != next.deleted {
                changes.push(StoreEvent::RecordingsChanged);
            }
            if state.schedules != next.schedules {
                changes.push(StoreEvent::EpgChanged);
            }
            *state = next;
        }

        info!("Catalog reloaded ({} changes)", changes.len());
        for event in changes {
            self.emit(event);
        }
    }

    fn validate_timer(&self, timer: &Timer) -> Result<()> {
        if self.channel_by_uid(timer.channel_uid).is_none() {
            return Err(StoreError::Invalid(format!(
                "unknown channel {}",
                timer.channel_uid
            )));
        }
        if timer.file.trim().is_empty() {
            return Err(StoreError::Invalid("empty file name".to_string()));
        }
        if timer.stop < timer.start {
            return Err(StoreError::Invalid("stop before start".to_string()));
        }
        Ok(())
    }
}

impl ChannelStore for MemoryStore {
    fn channels(&self) -> Arc<Vec<Channel>> {
        self.state.read().channels.clone()
    }
}

impl TimerStore for MemoryStore {
    fn timers(&self) -> Arc<Vec<Timer>> {
        self.state.read().timers.clone()
    }

    fn add_timer(&self, timer: Timer) -> Result<()> {
        self.validate_timer(&timer)?;
        {
            let mut state = self.state.write();
            if let Some(pos) = state.timers.iter().position(|t| t.same_slot(&timer)) {
                return Err(StoreError::Duplicate(format!("timer {}", pos + 1)));
            }
            let mut timers = state.timers.as_ref().clone();
            info!("Timer added: {} on channel {}", timer.file, timer.channel_uid);
            timers.push(timer);
            state.timers = Arc::new(timers);
        }
        self.emit(StoreEvent::TimersChanged);
        Ok(())
    }

    fn update_timer(&self, number: u32, timer: Timer) -> Result<()> {
        {
            let state = self.state.read();
            if number == 0 || number as usize > state.timers.len() {
                return Err(StoreError::NotFound(format!("timer {}", number)));
            }
        }
        self.validate_timer(&timer)?;
        {
            let mut state = self.state.write();
            let index = number as usize - 1;
            if index >= state.timers.len() {
                return Err(StoreError::NotFound(format!("timer {}", number)));
            }
            let mut timers = state.timers.as_ref().clone();
            timers[index] = timer;
            state.timers = Arc::new(timers);
        }
        self.emit(StoreEvent::TimersChanged);
        Ok(())
    }

    fn delete_timer(&self, number: u32, force: bool) -> Result<()> {
        let removed = {
            let mut state = self.state.write();
            if number == 0 || number as usize > state.timers.len() {
                return Err(StoreError::Invalid(format!("timer {}", number)));
            }
            let index = number as usize - 1;
            if state.timers[index].recording && !force {
                return Err(StoreError::RecordingRunning(number));
            }
            let mut timers = state.timers.as_ref().clone();
            let removed = timers.remove(index);
            state.timers = Arc::new(timers);
            removed
        };

        info!("Timer {} deleted: {}", number, removed.file);
        if removed.recording {
            self.emit(StoreEvent::Recording {
                device: 0,
                on: false,
                name: removed.file.clone(),
                file: String::new(),
            });
        }
        self.emit(StoreEvent::TimersChanged);
        Ok(())
    }
}

impl RecordingStore for MemoryStore {
    fn recordings(&self) -> Arc<Vec<Recording>> {
        self.state.read().recordings.clone()
    }

    fn deleted_recordings(&self) -> Arc<Vec<Recording>> {
        self.state.read().deleted.clone()
    }

    fn rename_recording(&self, uid: u32, title: &str) -> Result<()> {
        let title = title.trim();
        if title.is_empty() {
            return Err(StoreError::Invalid("empty title".to_string()));
        }
        {
            let mut state = self.state.write();
            let Some(index) = state.recordings.iter().position(|r| r.uid == uid) else {
                return Err(StoreError::Invalid(format!("unknown recording {}", uid)));
            };
            let mut recordings = state.recordings.as_ref().clone();
            let recording = &mut recordings[index];
            let title = title.replace(' ', "_");
            let name = match recording.name.rfind('~') {
                Some(pos) => format!("{}~{}", &recording.name[..pos], title),
                None => title,
            };
            info!("Renaming recording '{}' to '{}'", recording.name, name);
            recording.name = name;
            state.recordings = Arc::new(recordings);
        }
        self.emit(StoreEvent::RecordingsChanged);
        Ok(())
    }

    fn delete_recording(&self, uid: u32) -> Result<()> {
        {
            let mut state = self.state.write();
            let Some(index) = state.recordings.iter().position(|r| r.uid == uid) else {
                return Err(StoreError::NotFound(format!("recording {}", uid)));
            };
            if state.recordings[index].in_progress {
                return Err(StoreError::InUse(state.recordings[index].name.clone()));
            }
            let mut recordings = state.recordings.as_ref().clone();
            let removed = recordings.remove(index);
            info!("Recording '{}' deleted", removed.name);
            let mut deleted = state.deleted.as_ref().clone();
            deleted.push(removed);
            state.recordings = Arc::new(recordings);
            state.deleted = Arc::new(deleted);
        }
        self.emit(StoreEvent::RecordingsChanged);
        Ok(())
    }

    fn undelete_recording(&self, uid: u32) -> Result<()> {
        let result = {
            let mut state = self.state.write();
            let Some(index) = state.deleted.iter().position(|r| r.uid == uid) else {
                return Err(StoreError::NotFound(format!("deleted recording {}", uid)));
            };
            let name = state.deleted[index].name.clone();
            if state.recordings.iter().any(|r| r.name == name) {
                Err(StoreError::NameClash(name))
            } else {
                let mut deleted = state.deleted.as_ref().clone();
                let restored = deleted.remove(index);
                let mut recordings = state.recordings.as_ref().clone();
                recordings.push(restored);
                state.recordings = Arc::new(recordings);
                state.deleted = Arc::new(deleted);
                Ok(name)
            }
        };

        match result {
            Ok(name) => {
                info!("Recording '{}' undeleted", name);
                self.emit(StoreEvent::RecordingsChanged);
                Ok(())
            }
            Err(e) => {
                warn!("Undelete failed: {}", e);
                self.emit(StoreEvent::Message(format!(
                    "Recording with the same name exists: {}",
                    uid
                )));
                Err(e)
            }
        }
    }

    fn purge_recording(&self, uid: u32) -> Result<()> {
        {
            let mut state = self.state.write();
            let Some(index) = state.deleted.iter().position(|r| r.uid == uid) else {
                return Err(StoreError::NotFound(format!("deleted recording {}", uid)));
            };
            let mut deleted = state.deleted.as_ref().clone();
            let removed = deleted.remove(index);
            debug!("Purged recording '{}'", removed.name);
            state.deleted = Arc::new(deleted);
        }
        self.emit(StoreEvent::RecordingsChanged);
        Ok(())
    }

    fn purge_all(&self) -> Result<()> {
        let purged = {
            let mut state = self.state.write();
            let count = state.deleted.len();
            state.deleted = Arc::new(Vec::new());
            count
        };
        info!("Purged {} deleted recordings", purged);
        if purged > 0 {
            self.emit(StoreEvent::RecordingsChanged);
        }
        Ok(())
    }

    fn disk_space(&self) -> DiskSpace {
        self.state.read().disk
    }
}

impl EpgStore for MemoryStore {
    fn schedule(&self, channel_uid: u32) -> Option<Arc<Vec<EpgEvent>>> {
        self.state.read().schedules.get(&channel_uid).cloned()
    }

    fn last_events(&self) -> Vec<(u32, u32)> {
        self.state
            .read()
            .schedules
            .iter()
            .filter_map(|(uid, events)| events.last().map(|e| (*uid, e.start)))
            .collect()
    }
}


#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;

    #[test]
    fn test_catalog_parse() {
        let text = r#"
            [disk]
            total_mb = 100
            free_mb = 40

            [[channels]]
            number = 1
            name = "One"
            nid = 1
            tsid = 2
            sid = 3
            vpid = 256
            apids = [257]
            source = "one.ts"

            [[recordings]]
            name = "Show"
            path = "/video/show"
            start = 1000

            [[schedules]]
            channel = 1
            events = [{ id = 1, start = 10, duration = 5, title = "A" }]
        "#;
        let catalog = Catalog::parse(text).unwrap();
        assert_eq!(catalog.channels.len(), 1);
        assert_eq!(catalog.channels[0].delivery, "T");
        assert_ne!(catalog.recordings[0].uid, 0);

        let (tx, _rx) = broadcast::channel(4);
        let store = MemoryStore::new(catalog, tx);
        assert_eq!(store.disk_space().percent_used, 60);
        let uid = store.channels()[0].uid();
        assert_eq!(store.schedule(uid).unwrap().len(), 1);
    }

    #[test]
    fn test_lookup_and_snapshots() {
        let (store, _rx) = sample_store();
        assert_eq!(store.max_number(), 3);
        let two = store.channel_by_number(2).unwrap();
        assert_eq!(store.channel_by_uid(two.uid()).unwrap().name, "Two");

        let before = store.timers();
        let mut timer = before[0].clone();
        timer.start += 7200;
        timer.stop += 7200;
        store.add_timer(timer).unwrap();
        // earlier snapshot is unchanged
        assert_eq!(before.len(), 1);
        assert_eq!(store.timers().len(), 2);
    }

    #[test]
    fn test_timer_rules() {
        let (store, mut rx) = sample_store();
        let existing = store.timers()[0].clone();
        assert!(matches!(
            store.add_timer(existing.clone()),
            Err(StoreError::Duplicate(_))
        ));

        let mut bad = existing.clone();
        bad.channel_uid = 1;
        assert_eq!(
            store.add_timer(bad).unwrap_err().return_code(),
            vnsi_protocol::ReturnCode::DataInvalid
        );

        assert!(matches!(
            store.delete_timer(5, false),
            Err(StoreError::Invalid(_))
        ));
        assert!(matches!(
            store.update_timer(5, existing.clone()),
            Err(StoreError::NotFound(_))
        ));

        let mut recording = existing;
        recording.recording = true;
        store.update_timer(1, recording).unwrap();
        assert_eq!(rx.try_recv().unwrap(), StoreEvent::TimersChanged);
        assert!(matches!(
            store.delete_timer(1, false),
            Err(StoreError::RecordingRunning(1))
        ));
        store.delete_timer(1, true).unwrap();
        assert!(matches!(rx.try_recv().unwrap(), StoreEvent::Recording { on: false, .. }));
        assert_eq!(rx.try_recv().unwrap(), StoreEvent::TimersChanged);
        assert!(store.timers().is_empty());
    }

    #[test]
    fn test_recording_lifecycle() {
        let (store, mut rx) = sample_store();
        let uid = store.recordings()[0].uid;

        store.rename_recording(uid, "New Title").unwrap();
        assert_eq!(store.recordings()[0].name, "Films~New_Title");
        assert!(matches!(
            store.rename_recording(7, "x"),
            Err(StoreError::Invalid(_))
        ));

        store.delete_recording(uid).unwrap();
        assert!(store.recordings().is_empty());
        assert_eq!(store.deleted_recordings().len(), 2);
        assert!(matches!(
            store.delete_recording(uid),
            Err(StoreError::NotFound(_))
        ));

        store.undelete_recording(uid).unwrap();
        assert_eq!(store.recordings().len(), 1);

        store.purge_all().unwrap();
        assert!(store.deleted_recordings().is_empty());
        assert!(matches!(
            store.purge_recording(uid),
            Err(StoreError::NotFound(_))
        ));
        while let Ok(event) = rx.try_recv() {
            assert_eq!(event, StoreEvent::RecordingsChanged);
        }
    }

    #[test]
    fn test_undelete_name_clash() {
        let (store, mut rx) = sample_store();
        let mut catalog = sample_catalog();
        catalog.recordings[0].name = "Old".to_string();
        store.reload(catalog);
        while rx.try_recv().is_ok() {}

        let deleted = store.deleted_recordings()[0].uid;
        let err = store.undelete_recording(deleted).unwrap_err();
        assert_eq!(err.return_code(), vnsi_protocol::ReturnCode::Error);
        assert!(matches!(rx.try_recv().unwrap(), StoreEvent::Message(_)));
    }

    #[test]
    fn test_in_progress_recording_locked() {
        let (tx, _rx) = broadcast::channel(4);
        let mut catalog = sample_catalog();
        catalog.recordings[0].in_progress = true;
        let store = MemoryStore::new(catalog, tx);
        let uid = store.recordings()[0].uid;
        assert_eq!(
            store.delete_recording(uid).unwrap_err().return_code(),
            vnsi_protocol::ReturnCode::DataLocked
        );
    }

    #[test]
    fn test_reload_reports_modified_channel() {
        let (store, mut rx) = sample_store();
        let mut catalog = sample_catalog();
        catalog.channels[0].apids.push(0x102);
        let uid = catalog.channels[0].uid();
        store.reload(catalog);

        assert_eq!(rx.try_recv().unwrap(), StoreEvent::ChannelModified(uid));
        assert_eq!(rx.try_recv().unwrap(), StoreEvent::ChannelsChanged);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_last_events() {
        let (store, _rx) = sample_store();
        let uid = store.channel_by_number(1).unwrap().uid();
        assert_eq!(store.last_events(), vec![(uid, 2_000_003_600)]);
        let schedule = store.schedule(uid).unwrap();
        assert_eq!(schedule[0].id, 1);
    }
}
