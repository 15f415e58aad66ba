use std::cmp::Ordering;

use quarry_core::Details;
use quarry_query::{apply_patches, SlicePatch};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::task::JoinHandle;

/// Local mirror of an external ordered collection. Admits only its members
/// and, without a user sort, orders them by collection position.
#[derive(Debug)]
pub struct CollectionObserver {
    pub collection_id: String,
    ids: Vec<String>,
    pos: FxHashMap<String, usize>,
    pump: Option<JoinHandle<()>>,
}

impl CollectionObserver {
    pub fn new(collection_id: &str, ids: Vec<String>) -> Self {
        let mut o = Self { collection_id: collection_id.to_string(), ids: Vec::new(), pos: FxHashMap::default(), pump: None };
        o.reindex(ids);
        o
    }

    fn reindex(&mut self, ids: Vec<String>) {
        self.pos = ids.iter().enumerate().map(|(i, id)| (id.clone(), i)).collect();
        self.ids = ids;
    }

    pub fn ids(&self) -> &[String] { &self.ids }
    pub fn contains(&self, id: &str) -> bool { self.pos.contains_key(id) }
    pub fn position(&self, id: &str) -> Option<usize> { self.pos.get(id).copied() }

    /// Task forwarding collection patches; aborted on close.
    pub fn set_pump(&mut self, h: JoinHandle<()>) { self.pump = Some(h); }

    /// Applies `patches` and returns the ids to re-evaluate and whether the
    /// order changed. A move makes every id, old or new, dirty.
    pub fn apply(&mut self, patches: &[SlicePatch]) -> (Vec<String>, bool) {
        let before: FxHashSet<String> = self.ids.iter().cloned().collect();
        let mut next = self.ids.clone();
        apply_patches(&mut next, patches);
        let moved = patches.iter().any(|p| matches!(p, SlicePatch::Move { .. }));
        let after: FxHashSet<&String> = next.iter().collect();
        let dirty: Vec<String> = if moved {
            let mut all: Vec<String> = next.clone();
            all.extend(before.iter().filter(|id| !after.contains(id)).cloned());
            all
        } else {
            let mut d: Vec<String> = next.iter().filter(|id| !before.contains(id.as_str())).cloned().collect();
            d.extend(self.ids.iter().filter(|id| !after.contains(id)).cloned());
            d
        };
        self.reindex(next);
        (dirty, moved)
    }

    /// Collection position order; ids outside the collection sort last.
    pub fn compare(&self, a: &Details, b: &Details) -> Ordering {
        match (self.position(a.id()), self.position(b.id())) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    }

    pub fn close(&mut self) {
        if let Some(h) = self.pump.take() {
            h.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strs(v: &[&str]) -> Vec<String> { v.iter().map(|s| s.to_string()).collect() }

    #[test]
    fn moves_dirty_everything() {
        let mut o = CollectionObserver::new("c", strs(&["x", "y", "z"]));
        let (dirty, moved) = o.apply(&[SlicePatch::Move { after_id: String::new(), ids: strs(&["z"]) }]);
        assert!(moved);
        assert_eq!(dirty, strs(&["z", "x", "y"]));
        assert_eq!(o.position("z"), Some(0));
        let a = Details::new().with("id", "z");
        let b = Details::new().with("id", "x");
        assert_eq!(o.compare(&a, &b), Ordering::Less);
    }

    #[test]
    fn adds_and_removes_dirty_only_themselves() {
        let mut o = CollectionObserver::new("c", strs(&["x", "y"]));
        let (dirty, moved) = o.apply(&[
            SlicePatch::Add { after_id: "x".into(), ids: strs(&["n"]) },
            SlicePatch::Remove { ids: strs(&["y"]) },
        ]);
        assert!(!moved);
        assert_eq!(dirty, strs(&["n", "y"]));
        assert!(!o.contains("y"));
        assert_eq!(o.ids(), strs(&["x", "n"]).as_slice());
    }
}
