//! Reloads the catalog file when it changes on disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use log::{debug, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{Catalog, MemoryStore};

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Poll `path` every `interval` and swap a changed catalog into `store`.
///
/// A catalog that fails to parse is logged and the previous snapshot kept.
pub fn spawn_catalog_watcher(
    store: Arc<MemoryStore>,
    path: PathBuf,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last = modified(&path);
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let current = modified(&path);
            if current == last {
                continue;
            }
            last = current;
            debug!("Catalog {:?} changed", path);
            match Catalog::load(&path) {
                Ok(catalog) => store.reload(catalog),
                Err(e) => warn!("Catalog {:?} not reloaded: {}", path, e),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ChannelStore, StoreEvent};
    use tokio::sync::broadcast;

    const CATALOG: &str = r#"
        [[channels]]
        number = 1
        name = "One"
        nid = 1
        tsid = 2
        sid = 3
    "#;

    #[tokio::test]
    async fn test_reload_on_change() {
        let dir = std::env::temp_dir().join(format!("vnsi-watch-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("catalog.toml");
        std::fs::write(&path, CATALOG).unwrap();

        let (tx, mut rx) = broadcast::channel(16);
        let store = Arc::new(MemoryStore::new(Catalog::load(&path).unwrap(), tx));
        let shutdown = CancellationToken::new();
        let task = spawn_catalog_watcher(
            Arc::clone(&store),
            path.clone(),
            Duration::from_millis(20),
            shutdown.clone(),
        );

        // some filesystems keep whole-second mtimes
        tokio::time::sleep(Duration::from_millis(1100)).await;
        std::fs::write(&path, CATALOG.replace("\"One\"", "\"Renamed\"")).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(StoreEvent::ChannelsChanged) = rx.recv().await {
                    break;
                }
            }
        })
        .await;
        assert!(event.is_ok());
        assert_eq!(store.channels()[0].name, "Renamed");

        shutdown.cancel();
        task.await.unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }
}
