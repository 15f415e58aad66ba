//! Order strings for relations whose values are ids of other objects.

use std::sync::Arc;

use quarry_core::{keys, layout, Details, RelationFormat, Result};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::{collate, Filter, ObjectStore};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct OrderKeys {
    order_id: String,
    name: String,
}

impl OrderKeys {
    fn of(d: &Details) -> Self {
        let name = if !d.has(keys::NAME) && d.get_str(keys::LAYOUT) == layout::NOTE {
            d.get_str(keys::SNIPPET)
        } else {
            d.get_str(keys::NAME)
        };
        Self { order_id: d.get_str(keys::ORDER_ID).to_string(), name: collate::key(name) }
    }
}

/// `id -> (orderId, collated name)` for the objects referenced by one relation.
#[derive(Debug, Clone, Default)]
pub struct OrderMap {
    data: FxHashMap<String, OrderKeys>,
}

impl OrderMap {
    /// Option list for tag/status relations; every object referenced through
    /// `key` for object/file relations.
    pub fn build(store: &dyn ObjectStore, key: &str, format: RelationFormat) -> Result<Self> {
        let mut om = OrderMap::default();
        if format.is_option() {
            for opt in store.list_relation_options(key)? {
                om.data.insert(opt.id().to_string(), OrderKeys::of(&opt));
            }
            return Ok(om);
        }
        let mut ids: FxHashSet<String> = FxHashSet::default();
        let referencing = Filter::Not(Box::new(Filter::Empty { key: key.to_string() }));
        store.query_iterate(&referencing, &mut |d| {
            ids.extend(d.get_string_list(key));
            true
        })?;
        let ids: Vec<String> = ids.into_iter().collect();
        om.set_orders(store, &ids)?;
        Ok(om)
    }

    pub fn len(&self) -> usize { self.data.len() }
    pub fn is_empty(&self) -> bool { self.data.is_empty() }
    pub fn contains(&self, id: &str) -> bool { self.data.contains_key(id) }

    /// Refreshes entries already present; returns whether anything changed.
    pub fn update(&mut self, details: &[Arc<Details>]) -> bool {
        let mut updated = false;
        for d in details {
            if let Some(cur) = self.data.get_mut(d.id()) {
                let next = OrderKeys::of(d);
                if *cur != next {
                    *cur = next;
                    updated = true;
                }
            }
        }
        updated
    }

    /// Fetches and inserts ids not yet known; existing entries are left untouched.
    pub fn set_orders(&mut self, store: &dyn ObjectStore, ids: &[String]) -> Result<()> {
        let missing: Vec<String> = ids.iter().filter(|id| !self.data.contains_key(id.as_str())).cloned().collect();
        if missing.is_empty() {
            return Ok(());
        }
        for d in store.query_by_ids(&missing)? {
            self.data.insert(d.id().to_string(), OrderKeys::of(&d));
        }
        Ok(())
    }

    /// Concatenated order ids followed by concatenated names.
    pub fn build_order(&self, ids: &[String]) -> String {
        let mut order_ids = String::new();
        let mut names = String::new();
        for id in ids {
            if let Some(k) = self.data.get(id) {
                order_ids.push_str(&k.order_id);
                names.push_str(&k.name);
            }
        }
        order_ids + &names
    }

    #[cfg(test)]
    pub(crate) fn insert_raw(&mut self, id: &str, order_id: &str, name: &str) {
        self.data.insert(id.to_string(), OrderKeys { order_id: order_id.to_string(), name: name.to_string() });
    }
}
