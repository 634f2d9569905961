//! State shared by every connection.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use super::registry::{HandlerRegistry, RegistryError};
use crate::live::LiveSources;
use crate::osd::OsdProvider;
use crate::scan::ScanCoordinator;
use crate::store::{ChannelStore, EpgStore, MemoryStore, RecordingStore, SetupStore, StoreEvent, TimerStore};

/// Per-connection timing limits.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Bound on reading a request payload once its header arrived.
    pub read_timeout: Duration,
    /// Default no-signal timeout when a live open passes 0.
    pub stream_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(10_000),
            stream_timeout: Duration::from_secs(10),
        }
    }
}

pub struct ServerContext {
    pub channels: Arc<dyn ChannelStore>,
    pub timers: Arc<dyn TimerStore>,
    pub recordings: Arc<dyn RecordingStore>,
    pub epg: Arc<dyn EpgStore>,
    pub events: broadcast::Sender<StoreEvent>,
    pub setup: Arc<SetupStore>,
    pub sources: Arc<LiveSources>,
    pub scan: Arc<ScanCoordinator>,
    pub osd: Arc<dyn OsdProvider>,
    pub registry: HandlerRegistry,
    pub settings: SessionSettings,
}

impl ServerContext {
    /// Wire every collaborator to one [`MemoryStore`] and check the handler table.
    pub fn new(
        store: Arc<MemoryStore>,
        setup: Arc<SetupStore>,
        sources: Arc<LiveSources>,
        scan: Arc<ScanCoordinator>,
        osd: Arc<dyn OsdProvider>,
        settings: SessionSettings,
    ) -> Result<Arc<Self>, RegistryError> {
        let registry = HandlerRegistry::standard();
        registry.validate()?;
        Ok(Arc::new(Self {
            events: store.events(),
            channels: store.clone(),
            timers: store.clone(),
            recordings: store.clone(),
            epg: store,
            setup,
            sources,
            scan,
            osd,
            registry,
            settings,
        }))
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use crate::live::input::test_util::MemoryInput;
    use crate::live::TunerPool;
    use crate::osd::HeadlessOsd;
    use crate::scan::{ChannelScanner, UnsupportedScanner};
    use crate::store::sample_store;

    /// Context over the sample catalog with in-memory inputs.
    pub fn test_context_with(input: MemoryInput, scanner: Arc<dyn ChannelScanner>) -> (Arc<ServerContext>, Arc<MemoryStore>) {
        let (store, _rx) = sample_store();
        let sources = Arc::new(LiveSources::new(TunerPool::new(2), Arc::new(input), 1 << 20));
        let ctx = ServerContext::new(
            Arc::clone(&store),
            Arc::new(SetupStore::in_memory()),
            sources,
            ScanCoordinator::new(scanner),
            Arc::new(HeadlessOsd::default()),
            SessionSettings {
                read_timeout: Duration::from_millis(200),
                stream_timeout: Duration::from_secs(10),
            },
        )
        .unwrap();
        (ctx, store)
    }

    pub fn test_context() -> (Arc<ServerContext>, Arc<MemoryStore>) {
        test_context_with(MemoryInput::default(), Arc::new(UnsupportedScanner))
    }
}
