use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::store::WalStore;

pub const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Compact once `threshold` appends have piled up since the last rewrite.
/// Returns whether a compaction ran.
pub async fn compact_if_due(store: &WalStore, threshold: u64) -> bool {
    let appends = store.appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match store.compact().await {
        Ok(()) => {
            info!(appends, "compacted reservation log");
            true
        }
        Err(e) => {
            warn!("compaction failed: {e}");
            false
        }
    }
}

/// Background task: periodically checks whether the WAL needs compacting.
pub async fn run_compactor(store: Arc<WalStore>, threshold: u64, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        if !compact_if_due(&store, threshold).await {
            debug!("compaction not due");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::store::{NoopHook, ReservationStore};
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("spincycle_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let store = WalStore::open(path.clone()).unwrap();
        let machine = store.register_machine("Washer-1".into(), Category::Washer).await.unwrap();
        for hour in 0..3 {
            let start = hour * 3_600_000;
            let r = Reservation::booked("u".into(), machine.id, Category::Washer, Span::new(start, start + 3_600_000), 0);
            store.insert_if_free(r, None, &NoopHook).await.unwrap();
        }
        assert_eq!(store.appends_since_compact().await, 4);

        assert!(!compact_if_due(&store, 10).await);
        assert!(compact_if_due(&store, 4).await);
        assert_eq!(store.appends_since_compact().await, 0);
        drop(store);

        let reopened = WalStore::open(path).unwrap();
        assert_eq!(reopened.list_booked(Some("u")).await.unwrap().len(), 3);
    }
}
