//! Dependency children: objects referenced from a subscription's window.

use std::sync::Arc;

use quarry_core::{keys, Details, RelationKey, Result, DEP_SUFFIX};
use quarry_query::{Condition, FilterRequest, ObjectStore, SortRequest};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, warn};

use crate::ctx::{Env, Keys};
use crate::entry::Cache;
use crate::simple::SimpleSub;

/// A dependency-typed sort of a parent subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub key: RelationKey,
    pub is_option: bool,
}

impl SortKey {
    /// Field of the referenced object the parent effectively sorts by.
    pub fn order_key(&self) -> &'static str { if self.is_option { keys::ORDER_ID } else { keys::NAME } }
}

/// The dep child of one parent subscription.
#[derive(Debug)]
pub struct DepChild {
    pub parent_id: String,
    pub sub: SimpleSub,
    pub dep_keys: Vec<RelationKey>,
    pub force_ids: Vec<String>,
}

impl DepChild {
    pub fn close(&mut self, cache: &mut Cache) { self.sub.close(cache) }
}

/// Per-space bookkeeping for dependency children and dependency-typed sorts.
#[derive(Debug, Default)]
pub struct DependencyService {
    is_relation_obj: FxHashMap<RelationKey, bool>,
    sorts: FxHashMap<String, Vec<SortKey>>,
    /// Referenced id -> parents sorting by a key that references it.
    dep_order_objects: FxHashMap<String, FxHashSet<String>>,
    /// Parent -> referenced ids it currently holds in `dep_order_objects`.
    order_refs: FxHashMap<String, FxHashSet<String>>,
}

impl DependencyService {
    pub fn new() -> Self { Self::default() }

    fn is_relation_object(&mut self, store: &dyn ObjectStore, key: &str) -> bool {
        if let Some(v) = self.is_relation_obj.get(key) {
            return *v;
        }
        let v = match store.relation_format(key) {
            Ok(f) => f.is_dependency(),
            Err(e) => {
                debug!(key, error = %e, "deps: relation format unknown");
                false
            }
        };
        self.is_relation_obj.insert(key.to_string(), v);
        v
    }

    /// Remembers the dependency-typed sorts of `sub_id`; other sorts are ignored.
    pub fn register_sorts(&mut self, store: &dyn ObjectStore, sub_id: &str, sorts: &[SortRequest]) {
        let mut out = Vec::new();
        for s in sorts {
            let format = match s.format {
                Some(f) => f,
                None => store.relation_format(&s.relation_key).unwrap_or_default(),
            };
            if format.is_dependency() {
                out.push(SortKey { key: s.relation_key.clone(), is_option: format.is_option() });
            }
        }
        if !out.is_empty() {
            self.sorts.insert(sub_id.to_string(), out);
        }
    }

    pub fn sorts(&self, sub_id: &str) -> &[SortKey] { self.sorts.get(sub_id).map_or(&[], Vec::as_slice) }

    /// Keys of `wanted` whose values reference other objects.
    pub fn dep_keys(&mut self, store: &dyn ObjectStore, wanted: &[RelationKey]) -> Vec<RelationKey> {
        wanted.iter()
            .filter(|k| {
                let k = k.as_str();
                k != keys::ID && k != keys::SPACE_ID && k != keys::FEATURED_RELATIONS && !k.contains('.')
            })
            .filter(|k| self.is_relation_object(store, k))
            .cloned()
            .collect()
    }

    /// `force_ids` followed by every id referenced through `dep_keys`, without
    /// duplicates or self references. Ids referenced through a sort key of
    /// `parent_id` replace whatever was indexed for it before.
    pub fn dep_ids_by_entries(&mut self, parent_id: &str, entries: &[Arc<Details>], dep_keys: &[RelationKey], force_ids: &[String]) -> Vec<String> {
        let mut seen: FxHashSet<String> = FxHashSet::default();
        let mut out: Vec<String> = Vec::new();
        for id in force_ids {
            if !id.is_empty() && seen.insert(id.clone()) {
                out.push(id.clone());
            }
        }
        let sort_keys: Vec<RelationKey> = self.sorts(parent_id).iter().map(|s| s.key.clone()).collect();
        let mut sorted: FxHashSet<String> = FxHashSet::default();
        for d in entries {
            for k in dep_keys {
                let is_sort = sort_keys.contains(k);
                for v in d.get_string_list(k) {
                    if v.is_empty() || v == d.id() {
                        continue;
                    }
                    if is_sort {
                        sorted.insert(v.clone());
                    }
                    if seen.insert(v.clone()) {
                        out.push(v);
                    }
                }
            }
        }
        self.index_order_refs(parent_id, sorted);
        out
    }

    fn index_order_refs(&mut self, parent_id: &str, now: FxHashSet<String>) {
        let before = if now.is_empty() { self.order_refs.remove(parent_id) } else { self.order_refs.insert(parent_id.to_string(), now.clone()) };
        for id in before.unwrap_or_default().difference(&now) {
            self.release_order_ref(id, parent_id);
        }
        for id in now {
            self.dep_order_objects.entry(id).or_default().insert(parent_id.to_string());
        }
    }

    fn release_order_ref(&mut self, id: &str, parent_id: &str) {
        if let Some(parents) = self.dep_order_objects.get_mut(id) {
            parents.remove(parent_id);
            if parents.is_empty() {
                self.dep_order_objects.remove(id);
            }
        }
    }

    /// Referenced ids indexed for reordering, across all parents.
    pub fn order_object_count(&self) -> usize { self.dep_order_objects.len() }

    /// Builds the `/dep` child of `parent_id` over the objects referenced by
    /// `active`; returns it with its initial records.
    #[allow(clippy::too_many_arguments)]
    pub fn make_subscription_by_entries(
        &mut self,
        cache: &mut Cache,
        store: &dyn ObjectStore,
        parent_id: &str,
        active: &[Arc<Details>],
        parent_keys: &Keys,
        dep_keys: Vec<RelationKey>,
        force_ids: Vec<String>,
    ) -> Result<(DepChild, Vec<Arc<Details>>)> {
        let ids = self.dep_ids_by_entries(parent_id, active, &dep_keys, &force_ids);
        let records = fetch(cache, store, &ids, &|_| None)?;
        let mut child = self.child(parent_id, parent_keys, dep_keys, force_ids);
        child.sub.init(cache, &records);
        debug!(parent = parent_id, deps = records.len(), "deps: child created");
        Ok((child, records))
    }

    /// An empty `/dep` child, filled later by [`DependencyService::refill`].
    pub fn child(&self, parent_id: &str, parent_keys: &Keys, dep_keys: Vec<RelationKey>, force_ids: Vec<String>) -> DepChild {
        let sub = SimpleSub::new(format!("{}{}", parent_id, DEP_SUFFIX), self.child_keys(parent_id, parent_keys));
        DepChild { parent_id: parent_id.to_string(), sub, dep_keys, force_ids }
    }

    /// Projection of a dep child: the parent's keys plus what dependency sorts read.
    fn child_keys(&self, parent_id: &str, parent_keys: &Keys) -> Keys {
        if parent_keys.is_empty() {
            return Arc::clone(parent_keys);
        }
        let mut out: Vec<RelationKey> = parent_keys.as_ref().clone();
        for s in self.sorts(parent_id) {
            for k in [keys::NAME, s.order_key()] {
                if !out.iter().any(|x| x == k) {
                    out.push(k.to_string());
                }
            }
        }
        Arc::new(out)
    }

    /// Recomputes the child's id set from the parent's current window and
    /// emits the difference into the batch.
    pub fn refill(env: &mut Env<'_>, child: &mut DepChild, active: &[Arc<Details>]) {
        let ids = env.deps.dep_ids_by_entries(&child.parent_id, active, &child.dep_keys, &child.force_ids);
        let unchanged = ids.len() == child.sub.len() && ids.iter().all(|id| child.sub.contains(id));
        if unchanged {
            return;
        }
        let records = {
            let ctx = &*env.ctx;
            match fetch(env.cache, env.store, &ids, &|id| ctx.get(id).cloned()) {
                Ok(r) => r,
                Err(e) => {
                    warn!(parent = %child.parent_id, error = %e, "deps: refill skipped");
                    return;
                }
            }
        };
        child.sub.refill(env, &records);
    }

    /// Batch entries that some parent sorts by, grouped by parent id.
    pub fn reorder_parents(&self, entries: &[Arc<Details>]) -> FxHashMap<String, Vec<Arc<Details>>> {
        let mut out: FxHashMap<String, Vec<Arc<Details>>> = FxHashMap::default();
        for d in entries {
            if let Some(parents) = self.dep_order_objects.get(d.id()) {
                for p in parents {
                    out.entry(p.clone()).or_default().push(Arc::clone(d));
                }
            }
        }
        out
    }

    /// Ids a search pins into its dependency child: values of top-level
    /// filters on object-typed relations.
    pub fn force_ids(&mut self, store: &dyn ObjectStore, filters: &[FilterRequest]) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for f in filters {
            let pins = matches!(f.condition, Condition::Equal | Condition::In | Condition::AllIn | Condition::ExactIn);
            if !pins || f.relation_key.is_empty() || !self.is_relation_object(store, &f.relation_key) {
                continue;
            }
            for id in f.value.string_list() {
                if !id.is_empty() && !out.contains(&id) {
                    out.push(id);
                }
            }
        }
        out
    }

    /// Drops everything recorded for `parent_id`.
    pub fn forget(&mut self, parent_id: &str) {
        self.sorts.remove(parent_id);
        for id in self.order_refs.remove(parent_id).unwrap_or_default() {
            self.release_order_ref(&id, parent_id);
        }
    }
}

/// Details for `ids` in order: `newer` first, then the cache, then one store call.
fn fetch(cache: &Cache, store: &dyn ObjectStore, ids: &[String], newer: &dyn Fn(&str) -> Option<Arc<Details>>) -> Result<Vec<Arc<Details>>> {
    let mut found: FxHashMap<&str, Arc<Details>> = FxHashMap::default();
    let mut missing: Vec<String> = Vec::new();
    for id in ids {
        match newer(id).or_else(|| cache.get(id).map(|e| Arc::clone(&e.data))) {
            Some(d) => {
                found.insert(id.as_str(), d);
            }
            None => missing.push(id.clone()),
        }
    }
    let fetched = if missing.is_empty() { Vec::new() } else { store.query_by_ids(&missing)? };
    let fetched: FxHashMap<String, Arc<Details>> = fetched.into_iter().map(|d| (d.id().to_string(), d)).collect();
    Ok(ids
        .iter()
        .filter_map(|id| found.get(id.as_str()).cloned().or_else(|| fetched.get(id).cloned()))
        .filter(|d| !d.get_bool(keys::IS_DELETED))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::{RelationFormat, Value};
    use quarry_query::{Filter, Query, RecordSink};

    /// Format lookups only.
    struct Formats(FxHashMap<String, RelationFormat>);

    impl ObjectStore for Formats {
        fn query(&self, _q: &Query<'_>) -> Result<Vec<Arc<Details>>> { Ok(Vec::new()) }
        fn query_iterate(&self, _f: &Filter, _cb: &mut dyn FnMut(&Arc<Details>) -> bool) -> Result<()> { Ok(()) }
        fn query_by_ids(&self, _ids: &[String]) -> Result<Vec<Arc<Details>>> { Ok(Vec::new()) }
        fn relation_format(&self, key: &str) -> Result<RelationFormat> {
            self.0.get(key).copied().ok_or_else(|| quarry_core::SubError::NotFound(key.to_string()))
        }
        fn list_relation_options(&self, _key: &str) -> Result<Vec<Arc<Details>>> { Ok(Vec::new()) }
        fn subscribe_for_all(&self, _sink: RecordSink) {}
    }

    fn formats() -> Formats {
        let mut m = FxHashMap::default();
        m.insert("name".to_string(), RelationFormat::ShortText);
        m.insert("assignee".to_string(), RelationFormat::Object);
        m.insert("status".to_string(), RelationFormat::Status);
        m.insert("tag".to_string(), RelationFormat::Tag);
        m.insert("cover".to_string(), RelationFormat::File);
        Formats(m)
    }

    fn obj(id: &str, pairs: &[(&str, Value)]) -> Arc<Details> {
        let mut d = Details::new().with("id", id);
        for (k, v) in pairs {
            d.set(k, v.clone());
        }
        Arc::new(d)
    }

    fn strs(v: &[&str]) -> Vec<String> { v.iter().map(|s| s.to_string()).collect() }

    #[test]
    fn registers_only_dependency_sorts() {
        let store = formats();
        let mut ds = DependencyService::new();
        ds.register_sorts(&store, "s", &[SortRequest::asc("name"), SortRequest::asc("status"), SortRequest::asc("tag"), SortRequest::asc("assignee")]);
        assert_eq!(ds.sorts("s"), &[
            SortKey { key: "status".into(), is_option: true },
            SortKey { key: "tag".into(), is_option: true },
            SortKey { key: "assignee".into(), is_option: false },
        ]);
        assert_eq!(ds.sorts("s")[2].order_key(), "name");
        ds.register_sorts(&store, "plain", &[SortRequest::asc("name")]);
        assert!(ds.sorts("plain").is_empty());
    }

    #[test]
    fn dep_keys_skip_builtin_and_nested() {
        let store = formats();
        let mut ds = DependencyService::new();
        let got = ds.dep_keys(&store, &strs(&["id", "name", "assignee", "assignee.name", "spaceId", "cover", "unknown"]));
        assert_eq!(got, strs(&["assignee", "cover"]));
    }

    #[test]
    fn dep_ids_are_unique_and_index_sort_keys() {
        let store = formats();
        let mut ds = DependencyService::new();
        ds.register_sorts(&store, "s", &[SortRequest::asc("assignee"), SortRequest::asc("status")]);
        let entries = vec![
            obj("task1", &[("assignee", vec!["user1", "user2"].into()), ("status", "status1".into()), ("tag", vec!["tag1"].into())]),
            obj("task2", &[("assignee", vec!["user2", "user3", "", "task2"].into())]),
        ];
        let keys = strs(&["assignee", "status", "tag"]);
        let ids = ds.dep_ids_by_entries("s", &entries, &keys, &strs(&["forced"]));
        assert_eq!(ids, strs(&["forced", "user1", "user2", "status1", "tag1", "user3"]));

        let renamed = vec![obj("user2", &[]), obj("tag1", &[]), obj("status1", &[])];
        let parents = ds.reorder_parents(&renamed);
        assert_eq!(parents.get("s").map(Vec::len), Some(2));

        ds.forget("s");
        assert!(ds.reorder_parents(&renamed).is_empty());
        assert_eq!(ds.dep_ids_by_entries("s", &[], &keys, &strs(&["forced"])), strs(&["forced"]));
    }

    #[test]
    fn sort_index_follows_the_current_window() {
        let store = formats();
        let mut ds = DependencyService::new();
        ds.register_sorts(&store, "s", &[SortRequest::asc("assignee")]);
        ds.register_sorts(&store, "t", &[SortRequest::asc("assignee")]);
        let keys = strs(&["assignee"]);
        ds.dep_ids_by_entries("s", &[obj("task1", &[("assignee", vec!["u1", "u2"].into())])], &keys, &[]);
        ds.dep_ids_by_entries("t", &[obj("task9", &[("assignee", "u2".into())])], &keys, &[]);
        assert_eq!(ds.order_object_count(), 2);

        ds.dep_ids_by_entries("s", &[obj("task1", &[("assignee", "u3".into())])], &keys, &[]);
        let users = vec![obj("u1", &[]), obj("u2", &[]), obj("u3", &[])];
        let parents = ds.reorder_parents(&users);
        assert_eq!(parents.get("s").map(|v| v.iter().map(|d| d.id().to_string()).collect::<Vec<_>>()), Some(strs(&["u3"])));
        assert_eq!(parents.get("t").map(Vec::len), Some(1));
        assert_eq!(ds.order_object_count(), 2);

        ds.dep_ids_by_entries("s", &[], &keys, &[]);
        ds.forget("t");
        assert_eq!(ds.order_object_count(), 0);
    }

    #[test]
    fn child_keys_extend_the_projection_for_sorts() {
        let store = formats();
        let mut ds = DependencyService::new();
        ds.register_sorts(&store, "s", &[SortRequest::asc("tag")]);
        let keys = ds.child_keys("s", &Arc::new(strs(&["id", "tag"])));
        assert_eq!(keys.as_ref(), &strs(&["id", "tag", "name", "orderId"]));
        assert!(ds.child_keys("s", &Arc::new(Vec::new())).is_empty());
    }

    #[test]
    fn force_ids_come_from_object_filters() {
        let store = formats();
        let mut ds = DependencyService::new();
        let filters = vec![
            FilterRequest::new("assignee", Condition::In, vec!["u1", "u2", "u1"]),
            FilterRequest::new("name", Condition::Equal, "u3"),
            FilterRequest::new("assignee", Condition::NotIn, vec!["u9"]),
        ];
        assert_eq!(ds.force_ids(&store, &filters), strs(&["u1", "u2"]));
    }
}
