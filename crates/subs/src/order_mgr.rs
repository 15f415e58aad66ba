//! Watchers over the objects dependency-typed sorts read their order from.
//!
//! One watcher per relation key, shared by every parent sorting by it. Tag and
//! status watchers follow the key's option objects; object and file watchers
//! follow the ids referenced through the key.

use std::collections::hash_map::Entry;
use std::sync::Arc;

use quarry_core::{keys, layout, Details, RelationFormat, RelationKey, Result, ORDER_SUFFIX};
use quarry_query::{Filter, ObjectStore};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

#[derive(Debug)]
struct Watcher {
    format: RelationFormat,
    /// Referenced id -> number of objects referencing it through the key.
    ids: FxHashMap<String, usize>,
    /// Referencing object -> the ids it references.
    refs: FxHashMap<String, Vec<String>>,
    parents: FxHashSet<String>,
}

impl Watcher {
    fn new(format: RelationFormat) -> Self {
        Self { format, ids: FxHashMap::default(), refs: FxHashMap::default(), parents: FxHashSet::default() }
    }

    /// Replaces what `referrer` references; ids nobody references any more are released.
    fn set_refs(&mut self, referrer: &str, now: Vec<String>) {
        let before = if now.is_empty() { self.refs.remove(referrer) } else { self.refs.insert(referrer.to_string(), now.clone()) };
        for id in now {
            *self.ids.entry(id).or_default() += 1;
        }
        for id in before.unwrap_or_default() {
            if let Entry::Occupied(mut o) = self.ids.entry(id) {
                *o.get_mut() -= 1;
                if *o.get() == 0 {
                    o.remove();
                }
            }
        }
    }

    fn tracks(&self, key: &str, d: &Details) -> bool {
        if self.format.is_option() {
            d.get_str(keys::LAYOUT) == layout::RELATION_OPTION && d.get_str(keys::RELATION_KEY) == key
        } else {
            self.ids.contains_key(d.id())
        }
    }
}

#[derive(Debug, Default)]
pub struct OrderManager {
    watchers: FxHashMap<RelationKey, Watcher>,
}

impl OrderManager {
    pub fn new() -> Self { Self::default() }

    pub fn sub_id(key: &str) -> String { format!("{}{}", key, ORDER_SUFFIX) }

    pub fn len(&self) -> usize { self.watchers.len() }
    pub fn is_empty(&self) -> bool { self.watchers.is_empty() }
    pub fn is_watching(&self, key: &str) -> bool { self.watchers.contains_key(key) }

    /// Registers `parent` on the watcher of each related key, starting watchers as needed.
    pub fn init_order_subscription(&mut self, store: &dyn ObjectStore, parent: &str, related: &[(RelationKey, RelationFormat)]) -> Result<()> {
        for (key, format) in related {
            let w = match self.watchers.entry(key.clone()) {
                Entry::Occupied(o) => o.into_mut(),
                Entry::Vacant(v) => {
                    let mut w = Watcher::new(*format);
                    if !format.is_option() {
                        let referencing = Filter::Not(Box::new(Filter::Empty { key: key.clone() }));
                        store.query_iterate(&referencing, &mut |d| {
                            w.set_refs(d.id(), references(key, d));
                            true
                        })?;
                    }
                    debug!(sub_id = %Self::sub_id(key), ids = w.ids.len(), "order: watcher started");
                    v.insert(w)
                }
            };
            w.parents.insert(parent.to_string());
        }
        Ok(())
    }

    /// Recomputes, for each changed object, the ids it references through
    /// watched object keys.
    pub fn track_references(&mut self, entries: &[Arc<Details>]) {
        for (key, w) in self.watchers.iter_mut().filter(|(_, w)| !w.format.is_option()) {
            for d in entries {
                w.set_refs(d.id(), references(key, d));
            }
        }
    }

    /// Ids the object watcher of `key` follows.
    pub fn watched_ids(&self, key: &str) -> usize { self.watchers.get(key).map_or(0, |w| w.ids.len()) }

    /// Drops `parent` everywhere; watchers without parents stop.
    pub fn close_order_subscription(&mut self, parent: &str) {
        self.watchers.retain(|key, w| {
            w.parents.remove(parent);
            if w.parents.is_empty() {
                debug!(sub_id = %Self::sub_id(key), "order: watcher stopped");
                return false;
            }
            true
        });
    }

    /// Batch entries some watcher tracks, grouped by the parents to reorder.
    pub fn changed_for_batch(&self, entries: &[Arc<Details>]) -> FxHashMap<String, Vec<Arc<Details>>> {
        let mut out: FxHashMap<String, Vec<Arc<Details>>> = FxHashMap::default();
        for (key, w) in &self.watchers {
            for d in entries.iter().filter(|d| w.tracks(key, d)) {
                for p in &w.parents {
                    let list = out.entry(p.clone()).or_default();
                    if !list.iter().any(|x| x.id() == d.id()) {
                        list.push(Arc::clone(d));
                    }
                }
            }
        }
        out
    }
}

fn references(key: &str, d: &Details) -> Vec<String> {
    if d.get_bool(keys::IS_DELETED) {
        return Vec::new();
    }
    let mut ids = d.get_string_list(key);
    ids.retain(|id| !id.is_empty() && id != d.id());
    ids.dedup();
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_store::MemStore;

    fn store() -> MemStore {
        let s = MemStore::new();
        s.set_relation_format("assignee", RelationFormat::Object);
        s.set_relation_format("tag", RelationFormat::Tag);
        s.put(Details::new().with("id", "t1").with("assignee", vec!["u1", "u2"]));
        s.put(Details::new().with("id", "t2").with("assignee", vec!["u2"]));
        s.put(Details::new().with("id", "u1").with("name", "Ann"));
        s
    }

    fn related(key: &str, f: RelationFormat) -> Vec<(RelationKey, RelationFormat)> { vec![(key.to_string(), f)] }

    #[test]
    fn object_watcher_follows_referenced_ids() {
        let s = store();
        let mut om = OrderManager::new();
        om.init_order_subscription(&s, "p1", &related("assignee", RelationFormat::Object)).expect("init");
        let u1 = Arc::new(Details::new().with("id", "u1").with("name", "Bob"));
        let u9 = Arc::new(Details::new().with("id", "u9").with("name", "Zed"));
        let got = om.changed_for_batch(&[u1.clone(), u9.clone()]);
        assert_eq!(got.get("p1").map(|v| v.len()), Some(1));
        om.track_references(&[Arc::new(Details::new().with("id", "t3").with("assignee", "u9"))]);
        assert_eq!(om.changed_for_batch(&[u1, u9]).get("p1").map(|v| v.len()), Some(2));
    }

    #[test]
    fn ids_nobody_references_are_released() {
        let s = store();
        let mut om = OrderManager::new();
        om.init_order_subscription(&s, "p1", &related("assignee", RelationFormat::Object)).expect("init");
        assert_eq!(om.watched_ids("assignee"), 2);

        // t1 was the only object referencing u1.
        let t1 = Arc::new(Details::new().with("id", "t1").with("assignee", vec!["u2"]));
        om.track_references(&[t1]);
        assert_eq!(om.watched_ids("assignee"), 1);
        let u1 = Arc::new(Details::new().with("id", "u1").with("name", "Bob"));
        assert!(om.changed_for_batch(&[u1]).is_empty());

        let gone = Arc::new(Details::new().with("id", "t2").with("isDeleted", true).with("assignee", vec!["u2"]));
        om.track_references(&[gone]);
        assert_eq!(om.watched_ids("assignee"), 1);
        let t1 = Arc::new(Details::new().with("id", "t1"));
        om.track_references(&[t1]);
        assert_eq!(om.watched_ids("assignee"), 0);
    }

    #[test]
    fn option_watcher_matches_options_of_its_key() {
        let s = store();
        let mut om = OrderManager::new();
        om.init_order_subscription(&s, "p1", &related("tag", RelationFormat::Tag)).expect("init");
        let opt = |id: &str, key: &str| Arc::new(Details::new().with("id", id).with("layout", "relationOption").with("relationKey", key));
        let got = om.changed_for_batch(&[opt("o1", "tag"), opt("o2", "status")]);
        assert_eq!(got.get("p1").map(|v| v[0].id().to_string()), Some("o1".to_string()));
        assert_eq!(got.get("p1").map(Vec::len), Some(1));
    }

    #[test]
    fn watchers_are_shared_and_refcounted() {
        let s = store();
        let mut om = OrderManager::new();
        om.init_order_subscription(&s, "p1", &related("assignee", RelationFormat::Object)).expect("init");
        om.init_order_subscription(&s, "p2", &related("assignee", RelationFormat::Object)).expect("init");
        assert_eq!(om.len(), 1);
        om.close_order_subscription("p1");
        assert!(om.is_watching("assignee"));
        om.close_order_subscription("p2");
        assert!(om.is_empty());
        assert_eq!(OrderManager::sub_id("assignee"), "assignee-order-sub");
    }
}
