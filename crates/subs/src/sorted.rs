//! Windowed ordered subscription.
//!
//! Every object admitted by the filter lives in a skiplist ordered by the
//! subscription's order with an id tiebreak. The delivered window is a slice
//! of that list, pinned by an anchor element (`afterId`, `beforeId` or the
//! element before `offset`) and cut at `limit`. After a batch the window is
//! recomputed and diffed against the previous one.

use std::cmp::Ordering;
use std::mem;
use std::sync::Arc;

use quarry_core::{Counters, Details, RelationFormat, RelationKey, Result, SubError};
use quarry_query::{Filter, ObjectStore, Order, Query, SlicePatch};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, error, warn};

use crate::collection::CollectionObserver;
use crate::ctx::{Env, Keys};
use crate::dep::{DepChild, DependencyService};
use crate::entry::Cache;
use crate::listdiff::ListDiff;
use crate::order_mgr::OrderManager;
use crate::skiplist::SkipList;

#[derive(Debug, Clone)]
struct Node {
    id: String,
    data: Arc<Details>,
}

impl Node {
    fn of(d: &Arc<Details>) -> Self { Self { id: d.id().to_string(), data: Arc::clone(d) } }
}

fn compare(order: Option<&dyn Order>, observer: Option<&CollectionObserver>, a: &Node, b: &Node) -> Ordering {
    let c = match (order, observer) {
        (Some(o), _) => o.compare(&a.data, &b.data),
        (None, Some(obs)) => obs.compare(&a.data, &b.data),
        (None, None) => Ordering::Equal,
    };
    c.then_with(|| a.id.cmp(&b.id))
}

/// Paging of a sorted subscription; `limit = 0` means no limit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Window {
    pub limit: usize,
    pub offset: usize,
    pub after_id: String,
    pub before_id: String,
}

impl Window {
    pub fn anchored(&self) -> bool { !self.after_id.is_empty() || !self.before_id.is_empty() }
    fn backward(&self) -> bool { self.after_id.is_empty() && !self.before_id.is_empty() }
}

/// Live inner set of a nested `a.b` filter.
#[derive(Debug)]
struct NestedWatcher {
    inner: Filter,
    ids: FxHashSet<String>,
}

#[derive(Debug)]
pub struct SortedSub {
    pub id: String,
    pub keys: Keys,
    filter: Filter,
    order: Option<Box<dyn Order>>,
    observer: Option<CollectionObserver>,
    related: Vec<(RelationKey, RelationFormat)>,
    skl: SkipList<Node>,
    members: FxHashMap<String, Arc<Details>>,
    window: Window,
    anchor: Option<Node>,
    active: ListDiff,
    counters: Counters,
    pub dep: Option<DepChild>,
    nested: Vec<NestedWatcher>,
    needs_rebuild: bool,
    changed: FxHashSet<String>,
    resorted: FxHashSet<String>,
}

impl SortedSub {
    pub fn new(id: String, keys: Keys, filter: Filter, order: Option<Box<dyn Order>>, window: Window) -> Self {
        let related = order.as_ref().map(|o| o.related_keys()).unwrap_or_default();
        Self {
            id,
            keys,
            filter,
            order,
            observer: None,
            related,
            skl: SkipList::new(),
            members: FxHashMap::default(),
            window,
            anchor: None,
            active: ListDiff::default(),
            counters: Counters::default(),
            dep: None,
            nested: Vec::new(),
            needs_rebuild: false,
            changed: FxHashSet::default(),
            resorted: FxHashSet::default(),
        }
    }

    pub fn with_observer(mut self, observer: CollectionObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn observer(&self) -> Option<&CollectionObserver> { self.observer.as_ref() }
    pub fn observer_mut(&mut self) -> Option<&mut CollectionObserver> { self.observer.as_mut() }
    pub fn related_keys(&self) -> &[(RelationKey, RelationFormat)] { &self.related }
    pub fn counters(&self) -> Counters { self.counters }
    pub fn len(&self) -> usize { self.skl.len() }
    pub fn is_empty(&self) -> bool { self.skl.is_empty() }
    pub fn active_ids(&self) -> &[String] { self.active.ids() }

    /// Details of the delivered window, in order.
    pub fn active_records(&self) -> Vec<Arc<Details>> {
        self.active.ids().iter().filter_map(|id| self.members.get(id).cloned()).collect()
    }

    /// Ids in full sort order.
    pub fn ordered_ids(&self) -> Vec<String> { self.skl.iter().map(|n| n.id.clone()).collect() }

    /// Keeps the nested `a.b` sets of the filter in sync with the inner objects.
    pub fn enable_live_nested(&mut self) {
        let inners: Vec<Filter> = self.filter.nested_inners().into_iter().cloned().collect();
        let ids: Vec<FxHashSet<String>> = self.filter.nested_ids_mut().into_iter().map(|s| s.clone()).collect();
        self.nested = inners.into_iter().zip(ids).map(|(inner, ids)| NestedWatcher { inner, ids }).collect();
    }

    fn admits(&self, d: &Details) -> bool {
        self.filter.matches(d) && self.observer.as_ref().map_or(true, |o| o.contains(d.id()))
    }

    fn insert_node(&mut self, d: Arc<Details>) {
        let node = Node::of(&d);
        let (order, observer) = (self.order.as_deref(), self.observer.as_ref());
        let cmp = |a: &Node, b: &Node| compare(order, observer, a, b);
        self.skl.insert(node, &cmp);
        self.members.insert(d.id().to_string(), d);
    }

    fn remove_node(&mut self, id: &str) {
        let Some(old) = self.members.remove(id) else { return };
        let node = Node { id: id.to_string(), data: old };
        let removed = {
            let (order, observer) = (self.order.as_deref(), self.observer.as_ref());
            let cmp = |a: &Node, b: &Node| compare(order, observer, a, b);
            self.skl.remove(&node, &cmp).is_some()
        };
        if !removed {
            error!(sub_id = %self.id, id, "subs: sorted index out of sync, rebuilding");
            metrics::counter!("subs_index_rebuild_total", 1u64);
            self.rebuild();
        }
    }

    fn rebuild(&mut self) {
        self.skl.clear();
        let (order, observer) = (self.order.as_deref(), self.observer.as_ref());
        let cmp = |a: &Node, b: &Node| compare(order, observer, a, b);
        for d in self.members.values() {
            self.skl.insert(Node::of(d), &cmp);
        }
        self.needs_rebuild = false;
    }

    fn ensure_related(&mut self, store: &dyn ObjectStore, orders: Option<&mut OrderManager>, d: &Details) {
        if let Some(o) = self.order.as_mut() {
            if let Err(e) = o.ensure_related(store, d) {
                warn!(sub_id = %self.id, id = d.id(), error = %e, "subs: related order lookup failed");
            }
        }
        // Object-order ids are tracked by `OrderManager::track_references` per batch.
        let _ = orders;
    }

    fn resolve_anchor(&self) -> Result<Option<Node>> {
        let w = &self.window;
        if w.anchored() {
            let id = if w.after_id.is_empty() { &w.before_id } else { &w.after_id };
            let d = self.members.get(id).ok_or_else(|| SubError::UnknownAnchor(id.clone()))?;
            return Ok(Some(Node::of(d)));
        }
        if w.offset > 0 {
            let total = self.skl.len();
            if w.offset > total {
                return Err(SubError::OffsetOutOfRange { offset: w.offset, total });
            }
            return Ok(self.skl.get(w.offset - 1).cloned());
        }
        Ok(None)
    }

    /// `[start, end)` of the window in the full order.
    fn bounds(&self) -> (usize, usize) {
        let total = self.skl.len();
        let limit = if self.window.limit == 0 { total } else { self.window.limit };
        let (order, observer) = (self.order.as_deref(), self.observer.as_ref());
        let cmp = |a: &Node, b: &Node| compare(order, observer, a, b);
        match &self.anchor {
            Some(a) if self.window.backward() => {
                let end = self.skl.count_less(a, &cmp);
                (end.saturating_sub(limit), end)
            }
            Some(a) => {
                let start = match self.skl.rank(a, &cmp) {
                    Some(r) => r + 1,
                    None => self.skl.count_less(a, &cmp),
                };
                (start, (start + limit).min(total))
            }
            None => (0, limit.min(total)),
        }
    }

    fn window_ids(&self) -> ListDiff {
        let (start, end) = self.bounds();
        if self.window.backward() {
            ListDiff::fill_reversed(self.skl.range_rev(end, end - start).into_iter().map(|n| n.id.clone()).collect())
        } else {
            ListDiff::fill(self.skl.range(start, end - start).into_iter().map(|n| n.id.clone()).collect())
        }
    }

    fn compute_counters(&self) -> Counters {
        let (start, end) = self.bounds();
        let total = self.skl.len();
        Counters { total, prev_count: if self.window.anchored() { start } else { 0 }, next_count: total - end }
    }

    /// Loads the initial set and resolves the window. The cache is untouched:
    /// follow with [`SortedSub::attach`] or [`SortedSub::emit_initial`].
    pub fn init(&mut self, store: &dyn ObjectStore, records: Vec<Arc<Details>>) -> Result<()> {
        for d in records {
            if !self.admits(&d) || self.members.contains_key(d.id()) {
                continue;
            }
            self.ensure_related(store, None, &d);
            self.insert_node(d);
        }
        self.anchor = self.resolve_anchor()?;
        self.active = self.window_ids();
        self.counters = self.compute_counters();
        debug!(sub_id = %self.id, total = self.counters.total, active = self.active.len(), "subs: sorted init");
        Ok(())
    }

    /// Registers memberships for a window delivered in the response.
    pub fn attach(&self, cache: &mut Cache) {
        for (id, d) in &self.members {
            let in_window = self.active.contains(id);
            cache.get_or_set(d).set_sub(&self.id, in_window, in_window);
        }
    }

    /// Delivers the initial window as events instead of a response.
    pub fn emit_initial(&mut self, env: &mut Env<'_>) {
        for (id, d) in &self.members {
            env.cache.get_or_set(d).set_sub(&self.id, self.active.contains(id), false);
        }
        let mut after = "";
        for id in self.active.ids() {
            env.ctx.add(&self.id, id, after, &self.keys);
            after = id.as_str();
        }
        env.ctx.counters(&self.id, self.counters);
        if let Some(dep) = self.dep.as_mut() {
            let active: Vec<Arc<Details>> = self.active.ids().iter().filter_map(|id| self.members.get(id).cloned()).collect();
            DependencyService::refill(env, dep, &active);
        }
    }

    /// Refreshes order strings from changed related objects; members
    /// referencing them are re-sorted by the next batch.
    pub fn reorder(&mut self, details: &[Arc<Details>]) {
        let Some(order) = self.order.as_mut() else { return };
        if !order.update_order_map(details) {
            return;
        }
        self.needs_rebuild = true;
        let ids: FxHashSet<&str> = details.iter().map(|d| d.id()).collect();
        for (id, d) in &self.members {
            let refs = self.related.iter().any(|(k, _)| d.get_string_list(k).iter().any(|v| ids.contains(v.as_str())));
            if refs {
                self.resorted.insert(id.clone());
            }
        }
    }

    /// Applies collection patches; returns the ids to feed back as a batch.
    pub fn apply_collection(&mut self, patches: &[SlicePatch]) -> Vec<String> {
        let Some(obs) = self.observer.as_mut() else { return Vec::new() };
        let (dirty, moved) = obs.apply(patches);
        if moved {
            self.needs_rebuild = true;
            self.resorted.extend(self.members.keys().cloned());
        }
        dirty
    }

    pub fn on_change(&mut self, env: &mut Env<'_>) {
        if self.needs_rebuild {
            self.rebuild();
        }
        let mut batch: Vec<Arc<Details>> = env.ctx.entries().to_vec();
        if self.refresh_nested(env) {
            batch.extend(self.requery(env));
        }
        for d in &batch {
            self.apply_entry(env, d);
        }
        self.refresh_window(env);
    }

    fn apply_entry(&mut self, env: &mut Env<'_>, d: &Arc<Details>) {
        let id = d.id();
        let was_in = self.members.contains_key(id);
        let now_in = self.admits(d);
        match (was_in, now_in) {
            (false, false) => return,
            (true, false) => {
                self.remove_node(id);
                env.cache.remove_sub_id(id, &self.id);
            }
            (false, true) => {
                self.ensure_related(env.store, Some(&mut *env.orders), d);
                self.insert_node(Arc::clone(d));
                env.cache.get_or_set(d).set_sub(&self.id, false, false);
            }
            (true, true) => {
                self.remove_node(id);
                self.ensure_related(env.store, Some(&mut *env.orders), d);
                self.insert_node(Arc::clone(d));
                self.changed.insert(id.to_string());
            }
        }
        if now_in && self.anchor.as_ref().map_or(false, |a| a.id == id) {
            self.anchor = Some(Node::of(d));
        }
    }

    /// Tracks inner objects of nested filters; `true` when a nested set changed.
    fn refresh_nested(&mut self, env: &Env<'_>) -> bool {
        let mut changed = false;
        for w in &mut self.nested {
            for d in env.ctx.entries() {
                if w.inner.matches(d) {
                    changed |= w.ids.insert(d.id().to_string());
                } else {
                    changed |= w.ids.remove(d.id());
                }
            }
        }
        if changed {
            for (target, w) in self.filter.nested_ids_mut().into_iter().zip(&self.nested) {
                *target = w.ids.clone();
            }
        }
        changed
    }

    /// Objects whose membership may have flipped after a nested set changed.
    fn requery(&self, env: &Env<'_>) -> Vec<Arc<Details>> {
        let found = match env.store.query(&Query::new(&self.filter)) {
            Ok(f) => f,
            Err(e) => {
                warn!(sub_id = %self.id, error = %e, "subs: nested requery failed");
                return Vec::new();
            }
        };
        let fresh: FxHashSet<&str> = found.iter().map(|d| d.id()).collect();
        let mut out: Vec<Arc<Details>> =
            found.iter().filter(|d| !self.members.contains_key(d.id()) && !env.ctx.contains(d.id())).cloned().collect();
        out.extend(
            self.members
                .iter()
                .filter(|(id, _)| !fresh.contains(id.as_str()) && !env.ctx.contains(id))
                .map(|(_, d)| Arc::clone(d)),
        );
        out
    }

    fn refresh_window(&mut self, env: &mut Env<'_>) {
        let next = self.window_ids();
        let changed = mem::take(&mut self.changed);
        let resorted = mem::take(&mut self.resorted);
        let ops = self.active.diff(&next, &|id| !changed.contains(id) && !resorted.contains(id));

        for id in &ops.removed {
            env.ctx.remove(&self.id, id);
            if let Some(e) = env.cache.get_mut(id) {
                if e.is_in_sub(&self.id) {
                    e.set_sub(&self.id, false, false);
                }
            }
        }
        for (id, after) in &ops.added {
            if let Some(d) = self.members.get(id) {
                env.cache.get_or_set(d).set_sub(&self.id, true, false);
            }
            env.ctx.add(&self.id, id, after, &self.keys);
        }
        for (id, after) in &ops.moved {
            env.ctx.position(&self.id, id, after, false, &self.keys);
        }
        let added: FxHashSet<&str> = ops.added.iter().map(|(id, _)| id.as_str()).collect();
        let mut windowed_change = false;
        for id in next.ids() {
            if changed.contains(id) {
                windowed_change = true;
                if !added.contains(id.as_str()) {
                    env.ctx.change(&self.id, id, &self.keys);
                }
            }
        }
        let window_changed = !ops.is_empty();
        self.active = next;

        let c = self.compute_counters();
        if c != self.counters {
            self.counters = c;
            env.ctx.counters(&self.id, c);
        }

        if let Some(dep) = self.dep.as_mut() {
            if window_changed || windowed_change {
                let active: Vec<Arc<Details>> = self.active.ids().iter().filter_map(|id| self.members.get(id).cloned()).collect();
                DependencyService::refill(env, dep, &active);
            }
            dep.sub.on_change(env);
        }
    }

    pub fn close(&mut self, cache: &mut Cache) {
        for id in self.members.keys() {
            cache.remove_sub_id(id, &self.id);
        }
        self.members.clear();
        self.skl.clear();
        if let Some(dep) = self.dep.as_mut() {
            dep.close(cache);
        }
        if let Some(obs) = self.observer.as_mut() {
            obs.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctx::OpCtx;
    use quarry_core::{EventMessage, Record, RelationFormat};
    use quarry_query::{EqCond, KeyOrder};
    use quarry_store::MemStore;

    fn obj(id: &str, n: i64) -> Arc<Details> { Arc::new(Details::new().with("id", id).with("n", n)) }
    fn strs(v: &[&str]) -> Vec<String> { v.iter().map(|s| s.to_string()).collect() }

    fn by_n(window: Window) -> SortedSub {
        let order: Box<dyn Order> = Box::new(KeyOrder::new("n", false, RelationFormat::Number));
        let filter = Filter::Eq { key: "n".into(), cond: EqCond::Less, value: 100.into() };
        SortedSub::new("s".into(), Arc::new(strs(&["id", "n"])), filter, Some(order), window)
    }

    fn ten() -> Vec<Arc<Details>> { (1..=10).map(|i| obj(&format!("id{}", i), i)).collect() }

    fn run(sub: &mut SortedSub, cache: &mut Cache, store: &MemStore, batch: Vec<Arc<Details>>) -> Vec<EventMessage> {
        let mut ctx = OpCtx::default();
        ctx.reset(batch.into_iter().map(|details| Record { details }));
        let (mut deps, mut orders) = (DependencyService::new(), OrderManager::new());
        let mut env = Env { cache: &mut *cache, ctx: &mut ctx, store, deps: &mut deps, orders: &mut orders };
        sub.on_change(&mut env);
        ctx.apply(cache)
    }

    #[test]
    fn offset_and_limit_pick_the_window() {
        let store = MemStore::new();
        let mut sub = by_n(Window { limit: 3, offset: 2, ..Default::default() });
        sub.init(&store, ten()).expect("init");
        assert_eq!(sub.active_ids(), strs(&["id3", "id4", "id5"]).as_slice());
        assert_eq!(sub.counters(), Counters { total: 10, prev_count: 0, next_count: 5 });

        let mut bad = by_n(Window { offset: 11, ..Default::default() });
        assert_eq!(bad.init(&store, ten()), Err(SubError::OffsetOutOfRange { offset: 11, total: 10 }));
        let mut bad = by_n(Window { after_id: "nope".into(), ..Default::default() });
        assert_eq!(bad.init(&store, ten()), Err(SubError::UnknownAnchor("nope".into())));
    }

    #[test]
    fn before_anchor_walks_backward() {
        let store = MemStore::new();
        let mut sub = by_n(Window { limit: 3, before_id: "id5".into(), ..Default::default() });
        sub.init(&store, ten()).expect("init");
        assert_eq!(sub.active_ids(), strs(&["id2", "id3", "id4"]).as_slice());
        assert_eq!(sub.counters(), Counters { total: 10, prev_count: 1, next_count: 6 });
    }

    #[test]
    fn leaving_the_filter_shifts_the_window() {
        let store = MemStore::new();
        let mut cache = Cache::new();
        let mut sub = by_n(Window { limit: 2, ..Default::default() });
        sub.init(&store, ten()).expect("init");
        sub.attach(&mut cache);
        assert_eq!(cache.len(), 10);

        let msgs = run(&mut sub, &mut cache, &store, vec![obj("id1", 500)]);
        assert_eq!(msgs[0], EventMessage::SubscriptionRemove { sub_id: "s".into(), id: "id1".into() });
        assert!(matches!(&msgs[1], EventMessage::ObjectDetailsSet { id, .. } if id == "id3"));
        assert_eq!(msgs[2], EventMessage::SubscriptionAdd { sub_id: "s".into(), id: "id3".into(), after_id: "id2".into() });
        assert_eq!(msgs[3], EventMessage::SubscriptionCounters { sub_id: "s".into(), total: 9, prev_count: 0, next_count: 7 });
        assert_eq!(msgs.len(), 4);
        assert!(!cache.contains("id1"));
        assert!(cache.get("id3").map_or(false, |e| e.is_active("s") && e.is_full_sent("s")));
    }

    #[test]
    fn value_change_inside_window_is_an_amend() {
        let store = MemStore::new();
        let mut cache = Cache::new();
        let mut sub = by_n(Window { limit: 3, ..Default::default() });
        sub.init(&store, ten()).expect("init");
        sub.attach(&mut cache);
        let msgs = run(&mut sub, &mut cache, &store, vec![Arc::new(Details::new().with("id", "id2").with("n", 2).with("x", 1))]);
        assert!(msgs.is_empty());
        let msgs = run(&mut sub, &mut cache, &store, vec![obj("id2", 0)]);
        assert_eq!(msgs.len(), 2);
        assert!(matches!(&msgs[0], EventMessage::ObjectDetailsAmend { id, .. } if id == "id2"));
        assert_eq!(msgs[1], EventMessage::SubscriptionPosition { sub_id: "s".into(), id: "id2".into(), after_id: String::new() });
    }

    #[test]
    fn incremental_window_matches_recomputation() {
        let store = MemStore::new();
        let mut cache = Cache::new();
        let mut sub = by_n(Window { limit: 4, after_id: "id2".into(), ..Default::default() });
        sub.init(&store, ten()).expect("init");
        sub.attach(&mut cache);
        let batches = vec![
            vec![obj("id5", 1), obj("id11", 4)],
            vec![obj("id3", 200), obj("id7", 3)],
            vec![obj("id2", 9), obj("id9", 0)],
        ];
        let mut client: Vec<String> = sub.active_ids().to_vec();
        for b in batches {
            for m in run(&mut sub, &mut cache, &store, b) {
                match m {
                    EventMessage::SubscriptionRemove { id, .. } => client.retain(|x| *x != id),
                    EventMessage::SubscriptionAdd { id, after_id, .. } | EventMessage::SubscriptionPosition { id, after_id, .. } => {
                        client.retain(|x| *x != id);
                        let at = if after_id.is_empty() { 0 } else { client.iter().position(|x| *x == after_id).map_or(client.len(), |i| i + 1) };
                        client.insert(at, id);
                    }
                    _ => {}
                }
            }
            assert_eq!(client, sub.active_ids().to_vec());
            let all = sub.ordered_ids();
            let start = all.iter().position(|x| x == "id2").map_or(0, |i| i + 1);
            let expect: Vec<String> = all.iter().skip(start).take(4).cloned().collect();
            assert_eq!(client, expect);
        }
    }
}
