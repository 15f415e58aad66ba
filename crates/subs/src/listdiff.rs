//! Diff between two ordered id windows.

use rustc_hash::{FxHashMap, FxHashSet};

/// Snapshot of an ordered id window with an id -> position index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListDiff {
    ids: Vec<String>,
    pos: FxHashMap<String, usize>,
}

/// Ops turning one window into the next. Applied as: removes, then adds in
/// order, then moves in order; every `after_id` is the final predecessor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffOps {
    pub removed: Vec<String>,
    pub added: Vec<(String, String)>,
    pub moved: Vec<(String, String)>,
}

impl DiffOps {
    pub fn is_empty(&self) -> bool { self.removed.is_empty() && self.added.is_empty() && self.moved.is_empty() }
}

impl ListDiff {
    pub fn fill(ids: Vec<String>) -> Self {
        let pos = ids.iter().enumerate().map(|(i, id)| (id.clone(), i)).collect();
        Self { ids, pos }
    }

    /// Ids collected while walking backward; stored in forward order.
    pub fn fill_reversed(mut ids: Vec<String>) -> Self {
        ids.reverse();
        Self::fill(ids)
    }

    pub fn ids(&self) -> &[String] { &self.ids }
    pub fn len(&self) -> usize { self.ids.len() }
    pub fn is_empty(&self) -> bool { self.ids.is_empty() }
    pub fn contains(&self, id: &str) -> bool { self.pos.contains_key(id) }

    /// Forward predecessor of `id`; `""` for the head.
    pub fn after_id(&self, id: &str) -> Option<&str> {
        let i = *self.pos.get(id)?;
        Some(if i == 0 { "" } else { self.ids[i - 1].as_str() })
    }

    /// Ops from `self` to `next`.
    ///
    /// Ids kept in place form a maximum-weight increasing run of old
    /// positions; `stable` ids outweigh any number of others, so ids changed
    /// in the batch are the ones chosen to move.
    pub fn diff(&self, next: &ListDiff, stable: &dyn Fn(&str) -> bool) -> DiffOps {
        let mut ops = DiffOps { removed: self.ids.iter().filter(|id| !next.contains(id)).cloned().collect(), ..Default::default() };

        let common: Vec<(&str, usize)> = next.ids.iter().filter_map(|id| self.pos.get(id).map(|o| (id.as_str(), *o))).collect();
        let keep = kept_in_place(&common, self.ids.len(), stable);

        let mut floating: FxHashSet<&str> = FxHashSet::default();
        for (i, id) in next.ids.iter().enumerate() {
            let after = if i == 0 { "" } else { next.ids[i - 1].as_str() };
            if !self.contains(id) {
                ops.added.push((id.clone(), after.to_string()));
                // placed next to an element that moves later: follow it
                if floating.contains(after) {
                    floating.insert(id.as_str());
                    ops.moved.push((id.clone(), after.to_string()));
                }
            } else if !keep.contains(id.as_str()) {
                floating.insert(id.as_str());
                ops.moved.push((id.clone(), after.to_string()));
            }
        }
        ops
    }
}

/// Maximum-weight strictly increasing subsequence of old positions, via a
/// Fenwick tree of prefix maxima.
fn kept_in_place<'a>(common: &[(&'a str, usize)], old_len: usize, stable: &dyn Fn(&str) -> bool) -> FxHashSet<&'a str> {
    let heavy = common.len() as u64 + 1;
    let mut tree: Vec<(u64, Option<usize>)> = vec![(0, None); old_len + 1];
    let mut best: Vec<(u64, Option<usize>)> = Vec::with_capacity(common.len());
    for (k, (id, old)) in common.iter().enumerate() {
        let mut prefix = (0u64, None);
        let mut i = *old;
        while i > 0 {
            if tree[i].0 > prefix.0 {
                prefix = tree[i];
            }
            i &= i - 1;
        }
        let w = prefix.0 + if stable(id) { heavy } else { 1 };
        best.push((w, prefix.1));
        let mut i = old + 1;
        while i <= old_len {
            if w > tree[i].0 {
                tree[i] = (w, Some(k));
            }
            i += i & i.wrapping_neg();
        }
    }
    let mut keep = FxHashSet::default();
    let mut cur = best.iter().enumerate().max_by_key(|(k, (w, _))| (*w, std::cmp::Reverse(*k))).map(|(k, _)| k);
    while let Some(k) = cur {
        keep.insert(common[k].0);
        cur = best[k].1;
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ld(v: &[&str]) -> ListDiff { ListDiff::fill(v.iter().map(|s| s.to_string()).collect()) }
    fn pairs(v: &[(&str, &str)]) -> Vec<(String, String)> { v.iter().map(|(a, b)| (a.to_string(), b.to_string())).collect() }

    fn replay(old: &ListDiff, ops: &DiffOps) -> Vec<String> {
        let mut l: Vec<String> = old.ids().to_vec();
        l.retain(|x| !ops.removed.contains(x));
        let put = |l: &mut Vec<String>, id: &str, after: &str| {
            l.retain(|x| x != id);
            let at = if after.is_empty() { 0 } else { l.iter().position(|x| x == after).map_or(l.len(), |i| i + 1) };
            l.insert(at, id.to_string());
        };
        for (id, after) in ops.added.iter().chain(ops.moved.iter()) {
            put(&mut l, id, after);
        }
        l
    }

    #[test]
    fn window_shift_is_remove_plus_add() {
        let old = ld(&["id4", "id5", "id6"]);
        let new = ld(&["id5", "id6", "id7"]);
        let ops = old.diff(&new, &|_| true);
        assert_eq!(ops.removed, vec!["id4".to_string()]);
        assert_eq!(ops.added, pairs(&[("id7", "id6")]));
        assert!(ops.moved.is_empty());
    }

    #[test]
    fn changed_element_is_the_one_moved() {
        let old = ld(&["B", "A"]);
        let new = ld(&["A", "B"]);
        let ops = old.diff(&new, &|id| id != "A");
        assert_eq!(ops.moved, pairs(&[("A", "")]));
        let ops = old.diff(&new, &|id| id != "B");
        assert_eq!(ops.moved, pairs(&[("B", "A")]));
    }

    #[test]
    fn single_move_to_front_when_all_dirty() {
        let old = ld(&["x", "y", "z"]);
        let new = ld(&["z", "x", "y"]);
        let ops = old.diff(&new, &|_| false);
        assert_eq!(ops, DiffOps { moved: pairs(&[("z", "")]), ..Default::default() });
    }

    #[test]
    fn adds_after_moved_elements_follow_them() {
        let old = ld(&["A", "M", "B"]);
        let new = ld(&["M", "X", "A", "B"]);
        let ops = old.diff(&new, &|id| id != "M");
        assert_eq!(replay(&old, &ops), new.ids().to_vec());
        assert_eq!(ops.added, pairs(&[("X", "M")]));
    }

    #[test]
    fn replay_reaches_target_for_mixed_edits() {
        let old = ld(&["a", "b", "c", "d", "e", "f"]);
        let new = ld(&["f", "x", "c", "a", "y", "e", "b"]);
        let ops = old.diff(&new, &|id| id == "c" || id == "e");
        assert_eq!(replay(&old, &ops), new.ids().to_vec());
        assert_eq!(ops.removed, vec!["d".to_string()]);
        assert!(ops.moved.iter().all(|(id, _)| id != "c" && id != "e"));
    }

    #[test]
    fn identical_windows_produce_nothing() {
        let old = ld(&["a", "b"]);
        assert!(old.diff(&old.clone(), &|_| false).is_empty());
        assert_eq!(old.after_id("b"), Some("a"));
        assert_eq!(old.after_id("a"), Some(""));
        assert_eq!(ListDiff::fill_reversed(vec!["b".into(), "a".into()]), old);
    }
}
