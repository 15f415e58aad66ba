use std::sync::Arc;

use quarry_core::{keys, Details, Result};
use quarry_query::ObjectStore;
use rustc_hash::FxHashSet;

use crate::ctx::{Env, Keys};
use crate::dep::{DepChild, DependencyService};
use crate::entry::Cache;

/// Subscription over a client-provided id list, delivered in request order.
/// Ids whose object does not exist yet keep a reserved slot until it appears.
#[derive(Debug)]
pub struct IdsSub {
    pub id: String,
    pub keys: Keys,
    slots: Vec<String>,
    present: FxHashSet<String>,
    pub dep: Option<DepChild>,
}

impl IdsSub {
    pub fn new(id: String, keys: Keys) -> Self {
        Self { id, keys, slots: Vec::new(), present: FxHashSet::default(), dep: None }
    }

    pub fn slots(&self) -> &[String] { &self.slots }
    pub fn is_present(&self, id: &str) -> bool { self.present.contains(id) }

    /// Present ids in slot order.
    pub fn active_ids(&self) -> Vec<String> { self.slots.iter().filter(|id| self.present.contains(id.as_str())).cloned().collect() }

    /// Reserves slots for unseen ids and attaches the objects that exist;
    /// returns their details for the response.
    pub fn add_ids(&mut self, cache: &mut Cache, store: &dyn ObjectStore, ids: &[String]) -> Result<Vec<Arc<Details>>> {
        let mut fresh: Vec<String> = Vec::new();
        for id in ids {
            if !id.is_empty() && !self.slots.contains(id) {
                self.slots.push(id.clone());
                fresh.push(id.clone());
            }
        }
        if fresh.is_empty() {
            return Ok(Vec::new());
        }
        let found = store.query_by_ids(&fresh)?;
        let mut out = Vec::with_capacity(found.len());
        for d in found {
            if d.get_bool(keys::IS_DELETED) {
                continue;
            }
            cache.get_or_set(&d).set_sub(&self.id, true, true);
            self.present.insert(d.id().to_string());
            out.push(d);
        }
        Ok(out)
    }

    /// Predecessor of `id` among present slots; `""` at the head.
    fn after_present(&self, id: &str) -> String {
        let mut after = "";
        for s in &self.slots {
            if s == id {
                break;
            }
            if self.present.contains(s.as_str()) {
                after = s.as_str();
            }
        }
        after.to_string()
    }

    pub fn on_change(&mut self, env: &mut Env<'_>) {
        let mut arrived: Vec<(usize, Arc<Details>)> = Vec::new();
        let mut changed: Vec<String> = Vec::new();
        for d in env.ctx.entries() {
            let Some(pos) = self.slots.iter().position(|s| s == d.id()) else { continue };
            if self.present.contains(d.id()) {
                changed.push(d.id().to_string());
            } else if !d.get_bool(keys::IS_DELETED) {
                arrived.push((pos, Arc::clone(d)));
            }
        }
        for id in &changed {
            env.ctx.change(&self.id, id, &self.keys);
        }

        arrived.sort_by_key(|(pos, _)| *pos);
        for (_, d) in &arrived {
            self.present.insert(d.id().to_string());
            env.cache.get_or_set(d).set_sub(&self.id, true, false);
            let after = self.after_present(d.id());
            env.ctx.position(&self.id, d.id(), &after, true, &self.keys);
            env.ctx.change(&self.id, d.id(), &self.keys);
        }

        if let Some(dep) = self.dep.as_mut() {
            if !changed.is_empty() || !arrived.is_empty() {
                let active: Vec<Arc<Details>> = self
                    .slots
                    .iter()
                    .filter(|id| self.present.contains(id.as_str()))
                    .filter_map(|id| env.latest(id))
                    .collect();
                DependencyService::refill(env, dep, &active);
            }
            dep.sub.on_change(env);
        }
    }

    pub fn close(&mut self, cache: &mut Cache) {
        for id in self.present.drain() {
            cache.remove_sub_id(&id, &self.id);
        }
        if let Some(dep) = self.dep.as_mut() {
            dep.close(cache);
        }
    }
}
