//! Kanban grouping: which combinations of option ids objects carry.

use std::collections::BTreeMap;
use std::sync::Arc;

use quarry_core::{keys, layout, Details, Group, RelationFormat, RelationKey, Result, SubError};
use quarry_query::{Filter, ObjectStore};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::collection::CollectionObserver;
use crate::ctx::Env;

pub const EMPTY_GROUP: &str = "empty";

/// More than one option: a group that exists only while objects carry it.
fn is_combination(values: &[String]) -> bool { values.len() > 1 }

pub fn group_of(values: Vec<String>) -> Group {
    let id = if values.is_empty() { EMPTY_GROUP.to_string() } else { values.join(",") };
    Group { id, values }
}

/// Groups of a non-tag relation; these never change with the data.
pub fn static_groups(store: &dyn ObjectStore, key: &str, format: RelationFormat) -> Result<Vec<Group>> {
    match format {
        RelationFormat::Status => {
            let mut out = vec![group_of(Vec::new())];
            out.extend(store.list_relation_options(key)?.iter().map(|o| group_of(vec![o.id().to_string()])));
            Ok(out)
        }
        RelationFormat::Checkbox => Ok(vec![
            Group { id: "true".into(), values: vec!["true".into()] },
            Group { id: "false".into(), values: vec!["false".into()] },
        ]),
        other => Err(SubError::InvalidFilter(format!("relation {} of format {:?} cannot be grouped", key, other))),
    }
}

/// Live groups of a tag relation: the empty group and one per option are
/// always present; combinations come and go with the objects carrying them.
#[derive(Debug)]
pub struct GroupSub {
    pub id: String,
    relation_key: RelationKey,
    filter: Filter,
    observer: Option<CollectionObserver>,
    options: FxHashSet<String>,
    base: Vec<Group>,
    members: FxHashMap<String, Vec<String>>,
    counts: BTreeMap<Vec<String>, usize>,
}

impl GroupSub {
    pub fn new(id: String, relation_key: &str, filter: Filter, observer: Option<CollectionObserver>) -> Self {
        Self {
            id,
            relation_key: relation_key.to_string(),
            filter,
            observer,
            options: FxHashSet::default(),
            base: vec![group_of(Vec::new())],
            members: FxHashMap::default(),
            counts: BTreeMap::new(),
        }
    }

    pub fn observer(&self) -> Option<&CollectionObserver> { self.observer.as_ref() }
    pub fn observer_mut(&mut self) -> Option<&mut CollectionObserver> { self.observer.as_mut() }

    fn admits(&self, d: &Details) -> bool {
        self.filter.matches(d) && self.observer.as_ref().map_or(true, |o| o.contains(d.id()))
    }

    fn combo(&self, d: &Details) -> Vec<String> {
        let mut v: Vec<String> = d.get_string_list(&self.relation_key).into_iter().filter(|id| self.options.contains(id)).collect();
        v.sort();
        v.dedup();
        v
    }

    fn is_option(&self, d: &Details) -> bool {
        d.get_str(keys::LAYOUT) == layout::RELATION_OPTION && d.get_str(keys::RELATION_KEY) == self.relation_key
    }

    pub fn init(&mut self, store: &dyn ObjectStore) -> Result<()> {
        for o in store.list_relation_options(&self.relation_key)? {
            self.options.insert(o.id().to_string());
            self.base.push(group_of(vec![o.id().to_string()]));
        }
        let mut found: Vec<Arc<Details>> = Vec::new();
        store.query_iterate(&self.filter, &mut |d| {
            found.push(Arc::clone(d));
            true
        })?;
        found.retain(|d| self.admits(d));
        for d in &found {
            let c = self.combo(d);
            *self.counts.entry(c.clone()).or_default() += 1;
            self.members.insert(d.id().to_string(), c);
        }
        debug!(sub_id = %self.id, objects = self.members.len(), "groups: init");
        Ok(())
    }

    /// Base groups followed by every combination currently carried.
    pub fn groups(&self) -> Vec<Group> {
        let mut out = self.base.clone();
        out.extend(self.counts.keys().filter(|c| is_combination(c)).map(|c| group_of(c.clone())));
        out
    }

    pub fn on_change(&mut self, env: &mut Env<'_>) {
        let entries: Vec<Arc<Details>> = env.ctx.entries().to_vec();
        for d in &entries {
            if self.is_option(d) {
                if d.get_bool(keys::IS_DELETED) {
                    self.options.remove(d.id());
                } else if self.options.insert(d.id().to_string()) {
                    let g = group_of(vec![d.id().to_string()]);
                    self.base.push(g.clone());
                    env.ctx.group(&self.id, g, false);
                }
            }
        }
        for d in &entries {
            let next = if self.admits(d) { Some(self.combo(d)) } else { None };
            let prev = match &next {
                Some(c) => self.members.insert(d.id().to_string(), c.clone()),
                None => self.members.remove(d.id()),
            };
            if prev == next {
                continue;
            }
            if let Some(p) = prev {
                self.release(env, p);
            }
            if let Some(n) = next {
                let count = self.counts.entry(n.clone()).or_default();
                *count += 1;
                if *count == 1 && is_combination(&n) {
                    env.ctx.group(&self.id, group_of(n), false);
                }
            }
        }
    }

    fn release(&mut self, env: &mut Env<'_>, combo: Vec<String>) {
        let Some(count) = self.counts.get_mut(&combo) else { return };
        *count -= 1;
        if *count == 0 {
            self.counts.remove(&combo);
            if is_combination(&combo) {
                env.ctx.group(&self.id, group_of(combo), true);
            }
        }
    }

    pub fn close(&mut self) {
        self.members.clear();
        self.counts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctx::OpCtx;
    use crate::dep::DependencyService;
    use crate::entry::Cache;
    use crate::order_mgr::OrderManager;
    use quarry_core::{EventMessage, Record};
    use quarry_store::MemStore;

    fn opt(id: &str) -> Details { Details::new().with("id", id).with("layout", "relationOption").with("relationKey", "tag").with("name", id) }
    fn task(id: &str, tags: Vec<&str>) -> Details { Details::new().with("id", id).with("type", "task").with("tag", tags) }

    fn task_filter() -> Filter {
        Filter::Eq { key: "type".into(), cond: quarry_query::EqCond::Equal, value: "task".into() }
    }

    #[test]
    fn combinations_come_and_go() {
        let store = MemStore::new();
        store.put_many(vec![opt("t1"), opt("t2"), task("a", vec!["t1", "t2"]), task("b", vec!["t2"])]);
        let mut sub = GroupSub::new("g".into(), "tag", task_filter(), None);
        sub.init(&store).expect("init");
        let ids: Vec<String> = sub.groups().into_iter().map(|g| g.id).collect();
        assert_eq!(ids, vec!["empty", "t1", "t2", "t1,t2"]);

        let mut cache = Cache::new();
        let mut ctx = OpCtx::default();
        ctx.reset(vec![Record::new(task("a", vec!["t1"])), Record::new(opt("t3")), Record::new(task("c", vec!["t3", "t2"]))]);
        let (mut deps, mut orders) = (DependencyService::new(), OrderManager::new());
        let mut env = Env { cache: &mut cache, ctx: &mut ctx, store: &store, deps: &mut deps, orders: &mut orders };
        sub.on_change(&mut env);
        let msgs = ctx.apply(&mut cache);
        let groups: Vec<(String, bool)> = msgs
            .iter()
            .filter_map(|m| match m {
                EventMessage::SubscriptionGroups { group, remove, .. } => Some((group.id.clone(), *remove)),
                _ => None,
            })
            .collect();
        assert_eq!(groups, vec![("t3".to_string(), false), ("t1,t2".to_string(), true), ("t2,t3".to_string(), false)]);
        assert!(cache.is_empty());
    }

    #[test]
    fn checkbox_groups_are_static() {
        let store = MemStore::new();
        let g = static_groups(&store, "done", RelationFormat::Checkbox).expect("groups");
        assert_eq!(g.len(), 2);
        assert!(static_groups(&store, "name", RelationFormat::ShortText).is_err());
    }
}
