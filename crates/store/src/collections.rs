use std::sync::Mutex;

use quarry_core::{Result, SubError};
use quarry_query::{apply_patches, CollectionService, SlicePatch};
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Default)]
struct Collection {
    ids: Vec<String>,
    subs: FxHashMap<String, mpsc::Sender<Vec<SlicePatch>>>,
}

/// In-RAM ordered collections with patch fan-out to subscribers.
pub struct MemCollections {
    inner: Mutex<FxHashMap<String, Collection>>,
    queue_cap: usize,
}

impl Default for MemCollections {
    fn default() -> Self { Self::new(64) }
}

impl MemCollections {
    pub fn new(queue_cap: usize) -> Self { Self { inner: Mutex::new(FxHashMap::default()), queue_cap: queue_cap.max(1) } }

    pub fn set_collection(&self, collection_id: &str, ids: Vec<String>) {
        if let Ok(mut m) = self.inner.lock() {
            m.entry(collection_id.to_string()).or_default().ids = ids;
        }
    }

    pub fn ids(&self, collection_id: &str) -> Vec<String> {
        self.inner.lock().ok().and_then(|m| m.get(collection_id).map(|c| c.ids.clone())).unwrap_or_default()
    }

    /// Applies `patches` and forwards them to every subscriber.
    pub fn apply(&self, collection_id: &str, patches: Vec<SlicePatch>) -> Result<()> {
        let mut m = self.inner.lock().map_err(|_| SubError::StoreUnavailable("collections poisoned".into()))?;
        let c = m.get_mut(collection_id).ok_or_else(|| SubError::NotFound(format!("collection {}", collection_id)))?;
        apply_patches(&mut c.ids, &patches);
        c.subs.retain(|sub_id, tx| match tx.try_send(patches.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(collection = collection_id, sub = %sub_id, "collections: subscriber queue full; patch dropped");
                metrics::counter!("collection_patches_dropped_total", 1u64);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        Ok(())
    }
}

impl CollectionService for MemCollections {
    fn subscribe_for_collection(&self, collection_id: &str, sub_id: &str) -> Result<(Vec<String>, mpsc::Receiver<Vec<SlicePatch>>)> {
        let mut m = self.inner.lock().map_err(|_| SubError::StoreUnavailable("collections poisoned".into()))?;
        let c = m.entry(collection_id.to_string()).or_default();
        let (tx, rx) = mpsc::channel(self.queue_cap);
        c.subs.insert(sub_id.to_string(), tx);
        debug!(collection = collection_id, sub = sub_id, ids = c.ids.len(), "collections: subscribed");
        Ok((c.ids.clone(), rx))
    }

    fn unsubscribe_from_collection(&self, collection_id: &str, sub_id: &str) {
        if let Ok(mut m) = self.inner.lock() {
            if let Some(c) = m.get_mut(collection_id) {
                c.subs.remove(sub_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(v: &[&str]) -> Vec<String> { v.iter().map(|s| s.to_string()).collect() }

    #[tokio::test]
    async fn subscribers_receive_patches() {
        let c = MemCollections::default();
        c.set_collection("col", ids(&["x", "y"]));
        let (initial, mut rx) = c.subscribe_for_collection("col", "s1").expect("subscribe");
        assert_eq!(initial, ids(&["x", "y"]));
        c.apply("col", vec![SlicePatch::Add { after_id: "y".into(), ids: ids(&["z"]) }]).expect("apply");
        assert_eq!(rx.recv().await, Some(vec![SlicePatch::Add { after_id: "y".into(), ids: ids(&["z"]) }]));
        assert_eq!(c.ids("col"), ids(&["x", "y", "z"]));
        c.unsubscribe_from_collection("col", "s1");
        c.apply("col", vec![SlicePatch::Remove { ids: ids(&["x"]) }]).expect("apply");
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn unknown_collection_is_not_found() {
        let c = MemCollections::default();
        assert!(matches!(c.apply("nope", vec![]), Err(SubError::NotFound(_))));
    }
}
