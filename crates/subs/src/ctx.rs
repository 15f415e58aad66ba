//! Per-batch operation buffer and the dispatcher turning it into events.

use std::sync::Arc;

use quarry_core::{Counters, Details, EventMessage, Group, KeyValue, Record, RelationKey, SubIds};
use quarry_query::ObjectStore;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::dep::DependencyService;
use crate::entry::Cache;
use crate::order_mgr::OrderManager;

pub type Keys = Arc<Vec<RelationKey>>;

#[derive(Debug, Clone)]
struct AddOp {
    sub_id: String,
    id: String,
    after_id: String,
    keys: Keys,
}

#[derive(Debug, Clone)]
struct PositionOp {
    sub_id: String,
    id: String,
    after_id: String,
}

#[derive(Debug, Clone)]
struct ChangeOp {
    sub_id: String,
    id: String,
    keys: Keys,
}

/// Operations collected while subscriptions process one batch.
#[derive(Debug, Default)]
pub struct OpCtx {
    entries: Vec<Arc<Details>>,
    index: FxHashMap<String, usize>,
    removes: Vec<(String, String)>,
    adds: Vec<AddOp>,
    positions: Vec<PositionOp>,
    changes: Vec<ChangeOp>,
    counters: Vec<(String, Counters)>,
    groups: Vec<(String, Group, bool)>,
}

impl OpCtx {
    /// Starts a batch; records are deduplicated by id, last write wins.
    pub fn reset(&mut self, records: impl IntoIterator<Item = Record>) {
        self.clear();
        for r in records {
            self.push_entry(r.details);
        }
    }

    pub fn push_entry(&mut self, d: Arc<Details>) {
        match self.index.get(d.id()) {
            Some(i) => self.entries[*i] = d,
            None => {
                self.index.insert(d.id().to_string(), self.entries.len());
                self.entries.push(d);
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
        self.removes.clear();
        self.adds.clear();
        self.positions.clear();
        self.changes.clear();
        self.counters.clear();
        self.groups.clear();
    }

    /// New details of the batch entries.
    pub fn entries(&self) -> &[Arc<Details>] { &self.entries }
    pub fn get(&self, id: &str) -> Option<&Arc<Details>> { self.index.get(id).map(|i| &self.entries[*i]) }
    pub fn contains(&self, id: &str) -> bool { self.index.contains_key(id) }

    pub fn remove(&mut self, sub_id: &str, id: &str) { self.removes.push((sub_id.to_string(), id.to_string())); }

    pub fn add(&mut self, sub_id: &str, id: &str, after_id: &str, keys: &Keys) {
        self.adds.push(AddOp { sub_id: sub_id.to_string(), id: id.to_string(), after_id: after_id.to_string(), keys: Arc::clone(keys) });
    }

    /// A position with `is_add` delivers the object as a fresh add.
    pub fn position(&mut self, sub_id: &str, id: &str, after_id: &str, is_add: bool, keys: &Keys) {
        if is_add {
            self.add(sub_id, id, after_id, keys);
        } else {
            self.positions.push(PositionOp { sub_id: sub_id.to_string(), id: id.to_string(), after_id: after_id.to_string() });
        }
    }

    pub fn change(&mut self, sub_id: &str, id: &str, keys: &Keys) {
        self.changes.push(ChangeOp { sub_id: sub_id.to_string(), id: id.to_string(), keys: Arc::clone(keys) });
    }

    pub fn counters(&mut self, sub_id: &str, c: Counters) { self.counters.push((sub_id.to_string(), c)); }

    pub fn group(&mut self, sub_id: &str, group: Group, remove: bool) { self.groups.push((sub_id.to_string(), group, remove)); }

    pub fn has_ops(&self) -> bool {
        !(self.removes.is_empty()
            && self.adds.is_empty()
            && self.positions.is_empty()
            && self.changes.is_empty()
            && self.counters.is_empty()
            && self.groups.is_empty())
    }

    /// Emits events in phase order (removes, details, adds, positions,
    /// counters, groups), then stores the batch's new details in the cache
    /// and clears the buffer.
    pub fn apply(&mut self, cache: &mut Cache) -> Vec<EventMessage> {
        let mut out = Vec::new();
        for (sub_id, id) in &self.removes {
            out.push(EventMessage::SubscriptionRemove { sub_id: sub_id.clone(), id: id.clone() });
        }
        self.emit_details(cache, &mut out);
        for a in &self.adds {
            out.push(EventMessage::SubscriptionAdd { sub_id: a.sub_id.clone(), id: a.id.clone(), after_id: a.after_id.clone() });
        }
        for p in &self.positions {
            out.push(EventMessage::SubscriptionPosition { sub_id: p.sub_id.clone(), id: p.id.clone(), after_id: p.after_id.clone() });
        }
        for (sub_id, c) in &self.counters {
            out.push(EventMessage::SubscriptionCounters { sub_id: sub_id.clone(), total: c.total, prev_count: c.prev_count, next_count: c.next_count });
        }
        for (sub_id, group, remove) in &self.groups {
            out.push(EventMessage::SubscriptionGroups { sub_id: sub_id.clone(), group: group.clone(), remove: *remove });
        }
        for d in &self.entries {
            cache.set(Arc::clone(d));
        }
        self.clear();
        out
    }

    fn emit_details(&self, cache: &mut Cache, out: &mut Vec<EventMessage>) {
        #[derive(Default)]
        struct PerObject<'a> {
            set: Vec<(&'a str, &'a Keys)>,
            amend: Vec<(&'a str, &'a Keys)>,
        }
        let mut order: Vec<&str> = Vec::new();
        let mut objs: FxHashMap<&str, PerObject<'_>> = FxHashMap::default();
        let mut seen: FxHashSet<(&str, &str)> = FxHashSet::default();

        for a in &self.adds {
            if !seen.insert((a.sub_id.as_str(), a.id.as_str())) {
                continue;
            }
            let o = objs.entry(a.id.as_str()).or_insert_with(|| {
                order.push(a.id.as_str());
                PerObject::default()
            });
            o.set.push((a.sub_id.as_str(), &a.keys));
        }
        for c in &self.changes {
            if !seen.insert((c.sub_id.as_str(), c.id.as_str())) {
                continue;
            }
            let Some(m) = cache.get(&c.id).and_then(|e| e.membership(&c.sub_id)) else { continue };
            let o = objs.entry(c.id.as_str()).or_insert_with(|| {
                order.push(c.id.as_str());
                PerObject::default()
            });
            if m.full_sent {
                o.amend.push((c.sub_id.as_str(), &c.keys));
            } else {
                o.set.push((c.sub_id.as_str(), &c.keys));
            }
        }

        for id in order {
            let Some(o) = objs.get(id) else { continue };
            let old = cache.get(id).map(|e| Arc::clone(&e.data));
            let Some(new) = self.get(id).cloned().or_else(|| old.clone()) else { continue };

            if !o.set.is_empty() {
                let keys = union_keys(o.set.iter().map(|(_, k)| *k));
                let sub_ids: SubIds = o.set.iter().map(|(s, _)| s.to_string()).collect();
                out.push(EventMessage::ObjectDetailsSet { id: id.to_string(), sub_ids, details: new.project(&keys) });
                if let Some(e) = cache.get_mut(id) {
                    for (s, _) in &o.set {
                        e.mark_full_sent(s);
                    }
                }
            }

            let Some(old) = old else { continue };
            let mut amends: Vec<(Vec<KeyValue>, Vec<RelationKey>, SubIds)> = Vec::new();
            for (s, keys) in &o.amend {
                let (changed, removed) = old.diff(&new, keys);
                if changed.is_empty() && removed.is_empty() {
                    continue;
                }
                match amends.iter_mut().find(|(c, r, _)| *c == changed && *r == removed) {
                    Some((_, _, subs)) => subs.push(s.to_string()),
                    None => amends.push((changed, removed, smallvec::smallvec![s.to_string()])),
                }
            }
            for (changed, removed, sub_ids) in amends {
                if !changed.is_empty() {
                    out.push(EventMessage::ObjectDetailsAmend { id: id.to_string(), sub_ids: sub_ids.clone(), details: changed });
                }
                if !removed.is_empty() {
                    out.push(EventMessage::ObjectDetailsUnset { id: id.to_string(), sub_ids, keys: removed });
                }
            }
        }
    }
}

/// Union of projections; any unrestricted projection means all keys.
fn union_keys<'a>(sets: impl Iterator<Item = &'a Keys>) -> Vec<RelationKey> {
    let mut out: Vec<RelationKey> = Vec::new();
    for ks in sets {
        if ks.is_empty() {
            return Vec::new();
        }
        for k in ks.iter() {
            if !out.contains(k) {
                out.push(k.clone());
            }
        }
    }
    out
}

/// Everything a subscription touches while handling a batch.
pub struct Env<'a> {
    pub cache: &'a mut Cache,
    pub ctx: &'a mut OpCtx,
    pub store: &'a dyn ObjectStore,
    pub deps: &'a mut DependencyService,
    pub orders: &'a mut OrderManager,
}

impl Env<'_> {
    /// Newest known details: the batch first, then the cache.
    pub fn latest(&self, id: &str) -> Option<Arc<Details>> {
        self.ctx.get(id).cloned().or_else(|| self.cache.get(id).map(|e| Arc::clone(&e.data)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(id: &str, name: &str) -> Arc<Details> { Arc::new(Details::new().with("id", id).with("name", name).with("n", 1)) }
    fn keys(v: &[&str]) -> Keys { Arc::new(v.iter().map(|s| s.to_string()).collect()) }

    #[test]
    fn phases_are_ordered_and_sets_are_shared() {
        let mut cache = Cache::new();
        cache.get_or_set(&d("a", "x")).set_sub("s1", false, false);
        cache.get_or_set(&d("a", "x")).set_sub("s2", false, false);
        let mut ctx = OpCtx::default();
        ctx.reset(vec![Record { details: d("a", "y") }]);
        let k = keys(&["id", "name"]);
        ctx.counters("s1", Counters { total: 1, prev_count: 0, next_count: 0 });
        ctx.position("s1", "a", "", false, &k);
        ctx.add("s1", "a", "", &k);
        ctx.add("s2", "a", "", &keys(&["id"]));
        ctx.remove("s3", "b");
        let msgs = ctx.apply(&mut cache);
        let kinds: Vec<&str> = msgs.iter().map(|m| m.kind()).collect();
        assert_eq!(kinds, vec!["subscriptionRemove", "objectDetailsSet", "subscriptionAdd", "subscriptionAdd", "subscriptionPosition", "subscriptionCounters"]);
        match &msgs[1] {
            EventMessage::ObjectDetailsSet { sub_ids, details, .. } => {
                assert_eq!(sub_ids.as_slice(), &["s1".to_string(), "s2".to_string()]);
                assert_eq!(details.get_str("name"), "y");
                assert!(!details.has("n"));
            }
            other => panic!("unexpected {:?}", other),
        }
        let e = cache.get("a").expect("entry");
        assert!(e.is_full_sent("s1") && e.is_full_sent("s2"));
        assert_eq!(e.data.get_str("name"), "y");
        assert!(!ctx.has_ops());
    }

    #[test]
    fn changes_amend_after_full_details() {
        let mut cache = Cache::new();
        cache.get_or_set(&d("a", "x")).set_sub("s1", true, true);
        cache.get_or_set(&d("a", "x")).set_sub("s2", true, true);
        let mut ctx = OpCtx::default();
        let new = Arc::new(Details::new().with("id", "a").with("name", "y"));
        ctx.reset(vec![Record { details: new }]);
        let k = keys(&["name", "n"]);
        ctx.change("s1", "a", &k);
        ctx.change("s1", "a", &k);
        ctx.change("s2", "a", &k);
        ctx.change("gone", "a", &k);
        let msgs = ctx.apply(&mut cache);
        assert_eq!(msgs.len(), 2);
        match (&msgs[0], &msgs[1]) {
            (EventMessage::ObjectDetailsAmend { sub_ids, details, .. }, EventMessage::ObjectDetailsUnset { keys, .. }) => {
                assert_eq!(sub_ids.len(), 2);
                assert_eq!(details, &vec![KeyValue { key: "name".into(), value: "y".into() }]);
                assert_eq!(keys, &vec!["n".to_string()]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn first_change_without_full_details_is_a_set() {
        let mut cache = Cache::new();
        cache.get_or_set(&d("a", "x")).set_sub("s1", true, false);
        let mut ctx = OpCtx::default();
        ctx.reset(vec![Record { details: d("a", "x") }]);
        ctx.change("s1", "a", &keys(&[]));
        let msgs = ctx.apply(&mut cache);
        assert!(matches!(&msgs[0], EventMessage::ObjectDetailsSet { .. }));
        assert!(cache.get("a").map_or(false, |e| e.is_full_sent("s1")));
    }

    #[test]
    fn reset_deduplicates_last_wins() {
        let mut ctx = OpCtx::default();
        ctx.reset(vec![Record { details: d("a", "1") }, Record { details: d("b", "1") }, Record { details: d("a", "2") }]);
        assert_eq!(ctx.entries().len(), 2);
        assert_eq!(ctx.get("a").map(|x| x.get_str("name")), Some("2"));
        assert_eq!(ctx.entries()[0].id(), "a");
    }
}
