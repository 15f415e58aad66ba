use std::cmp::Ordering;
use std::sync::{Arc, Mutex, RwLock};

use arc_swap::ArcSwap;
use quarry_core::{keys, layout, Details, Record, RelationFormat, Result, SubError};
use quarry_query::{Filter, ObjectStore, Query, RecordSink};
use rustc_hash::FxHashMap;
use tracing::debug;

/// In-RAM object store for one space.
///
/// Queries evaluate the same [`Filter`]/[`quarry_query::Order`] the
/// subscription engine uses; writes are forwarded to every firehose sink.
#[derive(Default)]
pub struct MemStore {
    objects: RwLock<FxHashMap<String, Arc<Details>>>,
    formats: ArcSwap<FxHashMap<String, RelationFormat>>,
    sinks: Mutex<Vec<RecordSink>>,
}

impl MemStore {
    pub fn new() -> Self { Self::default() }

    pub fn set_relation_format(&self, key: &str, format: RelationFormat) {
        self.formats.rcu(|cur| {
            let mut next = FxHashMap::clone(cur);
            next.insert(key.to_string(), format);
            next
        });
    }

    pub fn get(&self, id: &str) -> Option<Arc<Details>> {
        self.objects.read().ok().and_then(|m| m.get(id).cloned())
    }

    pub fn len(&self) -> usize { self.objects.read().map(|m| m.len()).unwrap_or(0) }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Inserts or replaces an object and notifies sinks.
    pub fn put(&self, details: Details) {
        let d = Arc::new(details);
        if let Ok(mut m) = self.objects.write() {
            m.insert(d.id().to_string(), Arc::clone(&d));
        }
        metrics::counter!("store_put_total", 1u64);
        self.notify(Record { details: d });
    }

    pub fn put_many(&self, items: impl IntoIterator<Item = Details>) {
        for d in items { self.put(d); }
    }

    /// Applies `f` to a copy of the stored object and writes it back.
    pub fn update(&self, id: &str, f: impl FnOnce(&mut Details)) -> Result<()> {
        let mut d = Details::clone(&*self.get(id).ok_or_else(|| SubError::NotFound(id.to_string()))?);
        f(&mut d);
        self.put(d);
        Ok(())
    }

    /// Removes an object; sinks receive a tombstone flagged `isDeleted`.
    pub fn delete(&self, id: &str) {
        let removed = self.objects.write().ok().and_then(|mut m| m.remove(id));
        if removed.is_some() {
            metrics::counter!("store_delete_total", 1u64);
            self.notify(Record::new(Details::new().with(keys::ID, id).with(keys::IS_DELETED, true)));
        }
    }

    fn notify(&self, r: Record) {
        let sinks: Vec<RecordSink> = self.sinks.lock().map(|s| s.clone()).unwrap_or_default();
        for s in sinks { s(r.clone()); }
    }

    fn snapshot(&self) -> Result<Vec<Arc<Details>>> {
        let m = self.objects.read().map_err(|_| SubError::StoreUnavailable("poisoned".into()))?;
        let mut all: Vec<Arc<Details>> = m.values().cloned().collect();
        all.sort_by(|a, b| a.id().cmp(b.id()));
        Ok(all)
    }
}

impl ObjectStore for MemStore {
    fn query(&self, q: &Query<'_>) -> Result<Vec<Arc<Details>>> {
        let mut out: Vec<Arc<Details>> = self.snapshot()?.into_iter().filter(|d| q.filter.matches(d)).collect();
        if let Some(order) = q.order {
            out.sort_by(|a, b| match order.compare(a, b) {
                Ordering::Equal => a.id().cmp(b.id()),
                o => o,
            });
        }
        let out: Vec<Arc<Details>> = out.into_iter().skip(q.offset).collect();
        Ok(if q.limit > 0 { out.into_iter().take(q.limit).collect() } else { out })
    }

    fn query_iterate(&self, filter: &Filter, f: &mut dyn FnMut(&Arc<Details>) -> bool) -> Result<()> {
        for d in self.snapshot()? {
            if filter.matches(&d) && !f(&d) { break; }
        }
        Ok(())
    }

    fn query_by_ids(&self, ids: &[String]) -> Result<Vec<Arc<Details>>> {
        let m = self.objects.read().map_err(|_| SubError::StoreUnavailable("poisoned".into()))?;
        Ok(ids.iter().filter_map(|id| m.get(id).cloned()).collect())
    }

    fn relation_format(&self, key: &str) -> Result<RelationFormat> {
        match key {
            keys::ID | keys::NAME | keys::SNIPPET | keys::LAYOUT | keys::ORDER_ID | keys::SPACE_ORDER | keys::SPACE_ID | keys::RELATION_KEY => {
                return Ok(RelationFormat::ShortText)
            }
            keys::IS_ARCHIVED | keys::IS_DELETED => return Ok(RelationFormat::Checkbox),
            _ => {}
        }
        self.formats.load().get(key).copied().ok_or_else(|| SubError::NotFound(format!("relation {}", key)))
    }

    fn list_relation_options(&self, key: &str) -> Result<Vec<Arc<Details>>> {
        let opts: Vec<Arc<Details>> = self
            .snapshot()?
            .into_iter()
            .filter(|d| d.get_str(keys::LAYOUT) == layout::RELATION_OPTION && d.get_str(keys::RELATION_KEY) == key && !d.get_bool(keys::IS_DELETED))
            .collect();
        debug!(key, options = opts.len(), "store: list relation options");
        Ok(opts)
    }

    fn subscribe_for_all(&self, sink: RecordSink) {
        if let Ok(mut s) = self.sinks.lock() { s.push(sink); }
    }
}
