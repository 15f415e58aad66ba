use std::sync::Arc;

use quarry_core::Details;
use rustc_hash::FxHashSet;

use crate::ctx::{Env, Keys};
use crate::entry::Cache;

/// Unordered membership subscription; only used as a dependency child.
#[derive(Debug)]
pub struct SimpleSub {
    pub id: String,
    pub keys: Keys,
    set: FxHashSet<String>,
}

impl SimpleSub {
    pub fn new(id: String, keys: Keys) -> Self { Self { id, keys, set: FxHashSet::default() } }

    pub fn len(&self) -> usize { self.set.len() }
    pub fn is_empty(&self) -> bool { self.set.is_empty() }
    pub fn contains(&self, id: &str) -> bool { self.set.contains(id) }
    pub fn ids(&self) -> impl Iterator<Item = &String> { self.set.iter() }

    /// Initial members are delivered with the search response.
    pub fn init(&mut self, cache: &mut Cache, entries: &[Arc<Details>]) {
        for d in entries {
            cache.get_or_set(d).set_sub(&self.id, true, true);
            self.set.insert(d.id().to_string());
        }
    }

    /// Replaces the member set with `entries`, emitting adds and removes.
    pub fn refill(&mut self, env: &mut Env<'_>, entries: &[Arc<Details>]) {
        let next: FxHashSet<&str> = entries.iter().map(|d| d.id()).collect();
        let gone: Vec<String> = self.set.iter().filter(|id| !next.contains(id.as_str())).cloned().collect();
        for id in gone {
            self.set.remove(&id);
            env.ctx.remove(&self.id, &id);
            env.cache.remove_sub_id(&id, &self.id);
        }
        for d in entries {
            if self.set.insert(d.id().to_string()) {
                env.cache.get_or_set(d).set_sub(&self.id, true, false);
                env.ctx.add(&self.id, d.id(), "", &self.keys);
            }
        }
    }

    /// Members touched by the batch get a change op; membership is untouched.
    pub fn on_change(&mut self, env: &mut Env<'_>) {
        let touched: Vec<String> = env.ctx.entries().iter().filter(|d| self.set.contains(d.id())).map(|d| d.id().to_string()).collect();
        for id in touched {
            env.ctx.change(&self.id, &id, &self.keys);
        }
    }

    pub fn close(&mut self, cache: &mut Cache) {
        for id in self.set.drain() {
            cache.remove_sub_id(&id, &self.id);
        }
    }
}
