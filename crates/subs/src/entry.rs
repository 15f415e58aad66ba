//! Shared per-object state and the per-space entry cache.

use std::sync::Arc;

use quarry_core::Details;
use rustc_hash::FxHashMap;

/// Per-subscription membership bits of one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Membership {
    /// The object is inside the subscription's delivered window.
    pub active: bool,
    /// Full projected details were delivered to the subscription.
    pub full_sent: bool,
}

/// One object observed by at least one subscription.
///
/// Membership is a single map, so an `active` bit can only exist for a
/// subscription the entry belongs to.
#[derive(Debug, Clone)]
pub struct Entry {
    pub id: String,
    pub data: Arc<Details>,
    subs: FxHashMap<String, Membership>,
}

impl Entry {
    pub fn new(data: Arc<Details>) -> Self {
        Self { id: data.id().to_string(), data, subs: FxHashMap::default() }
    }

    /// Adds or updates membership; `active` is overwritten, `full_sent` is OR-ed.
    pub fn set_sub(&mut self, sub: &str, active: bool, full_sent: bool) {
        let m = self.subs.entry(sub.to_string()).or_default();
        m.active = active;
        m.full_sent |= full_sent;
    }

    /// Records that full details went out; no-op for non-members.
    pub fn mark_full_sent(&mut self, sub: &str) {
        if let Some(m) = self.subs.get_mut(sub) {
            m.full_sent = true;
        }
    }

    pub fn remove_sub(&mut self, sub: &str) -> bool { self.subs.remove(sub).is_some() }
    pub fn is_in_sub(&self, sub: &str) -> bool { self.subs.contains_key(sub) }
    pub fn is_active(&self, sub: &str) -> bool { self.subs.get(sub).map_or(false, |m| m.active) }
    pub fn is_full_sent(&self, sub: &str) -> bool { self.subs.get(sub).map_or(false, |m| m.full_sent) }
    pub fn membership(&self, sub: &str) -> Option<Membership> { self.subs.get(sub).copied() }
    pub fn sub_count(&self) -> usize { self.subs.len() }
    pub fn sub_ids(&self) -> impl Iterator<Item = &String> { self.subs.keys() }
}

/// `id -> Entry` for one space; evicts an entry when its last subscription leaves.
#[derive(Debug, Default)]
pub struct Cache {
    entries: FxHashMap<String, Entry>,
}

impl Cache {
    pub fn new() -> Self { Self::default() }

    pub fn get(&self, id: &str) -> Option<&Entry> { self.entries.get(id) }
    pub fn get_mut(&mut self, id: &str) -> Option<&mut Entry> { self.entries.get_mut(id) }
    pub fn contains(&self, id: &str) -> bool { self.entries.contains_key(id) }
    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// Canonical entry for `data`'s id, inserting it when absent.
    pub fn get_or_set(&mut self, data: &Arc<Details>) -> &mut Entry {
        self.entries.entry(data.id().to_string()).or_insert_with(|| Entry::new(Arc::clone(data)))
    }

    /// Replaces the details of a cached entry, keeping its memberships.
    pub fn set(&mut self, data: Arc<Details>) {
        if let Some(e) = self.entries.get_mut(data.id()) {
            e.data = data;
        }
    }

    /// Drops `sub`'s membership; the entry goes away with its last subscription.
    pub fn remove_sub_id(&mut self, id: &str, sub: &str) {
        if let Some(e) = self.entries.get_mut(id) {
            e.remove_sub(sub);
            if e.sub_count() == 0 {
                self.entries.remove(id);
            }
        }
    }

    pub fn ids(&self) -> impl Iterator<Item = &String> { self.entries.keys() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(id: &str) -> Arc<Details> { Arc::new(Details::new().with("id", id)) }

    #[test]
    fn full_sent_is_monotonic() {
        let mut e = Entry::new(data("a"));
        e.set_sub("s", true, true);
        e.set_sub("s", false, false);
        assert!(!e.is_active("s"));
        assert!(e.is_full_sent("s"));
        assert!(e.remove_sub("s"));
        assert!(!e.is_in_sub("s"));
        assert!(!e.is_full_sent("s"));
    }

    #[test]
    fn cache_evicts_with_last_membership() {
        let mut c = Cache::new();
        c.get_or_set(&data("a")).set_sub("s1", true, false);
        c.get_or_set(&data("a")).set_sub("s2", false, false);
        assert_eq!(c.len(), 1);
        c.remove_sub_id("a", "s1");
        assert!(c.contains("a"));
        c.remove_sub_id("a", "s2");
        assert!(c.is_empty());
        c.remove_sub_id("missing", "s1");
    }

    #[test]
    fn set_keeps_memberships() {
        let mut c = Cache::new();
        c.get_or_set(&data("a")).set_sub("s", true, true);
        c.set(Arc::new(Details::new().with("id", "a").with("name", "n")));
        let e = c.get("a").expect("entry");
        assert_eq!(e.data.get_str("name"), "n");
        assert!(e.is_active("s"));
    }
}
