//! Indexable skiplist over an arena.
//!
//! Links carry spans so rank and positional access are `O(log n)`. The
//! comparator is passed per call: callers own the ordering state, and every
//! element must be distinct under it.

use std::cmp::Ordering;

const MAX_LEVEL: usize = 24;
const HEAD: usize = 0;

#[derive(Debug, Clone, Copy, Default)]
struct Link {
    next: Option<usize>,
    span: usize,
}

pub type Cmp<'a, T> = &'a dyn Fn(&T, &T) -> Ordering;

#[derive(Debug)]
pub struct SkipList<T> {
    values: Vec<Option<T>>,
    links: Vec<Vec<Link>>,
    back: Vec<Option<usize>>,
    free: Vec<usize>,
    level: usize,
    len: usize,
    tail: Option<usize>,
    seed: u64,
}

impl<T> Default for SkipList<T> {
    fn default() -> Self { Self::new() }
}

impl<T> SkipList<T> {
    pub fn new() -> Self {
        Self {
            values: vec![None],
            links: vec![vec![Link::default(); MAX_LEVEL]],
            back: vec![None],
            free: Vec::new(),
            level: 1,
            len: 0,
            tail: None,
            seed: 0x9E37_79B9_7F4A_7C15,
        }
    }

    pub fn len(&self) -> usize { self.len }
    pub fn is_empty(&self) -> bool { self.len == 0 }

    pub fn clear(&mut self) {
        *self = Self { seed: self.seed, ..Self::new() };
    }

    // xorshift64, p = 1/4 per extra level
    fn random_level(&mut self) -> usize {
        let mut lvl = 1;
        while lvl < MAX_LEVEL {
            self.seed ^= self.seed << 13;
            self.seed ^= self.seed >> 7;
            self.seed ^= self.seed << 17;
            if self.seed & 3 != 0 {
                break;
            }
            lvl += 1;
        }
        lvl
    }

    fn cmp_at(&self, i: usize, v: &T, cmp: Cmp<'_, T>) -> Ordering {
        self.values[i].as_ref().map_or(Ordering::Greater, |x| cmp(x, v))
    }

    fn alloc(&mut self, value: T, lvl: usize) -> usize {
        let links = vec![Link::default(); lvl];
        match self.free.pop() {
            Some(i) => {
                self.values[i] = Some(value);
                self.links[i] = links;
                self.back[i] = None;
                i
            }
            None => {
                self.values.push(Some(value));
                self.links.push(links);
                self.back.push(None);
                self.values.len() - 1
            }
        }
    }

    pub fn insert(&mut self, value: T, cmp: Cmp<'_, T>) {
        let mut update = [HEAD; MAX_LEVEL];
        let mut rank = [0usize; MAX_LEVEL];
        let mut x = HEAD;
        for i in (0..self.level).rev() {
            rank[i] = if i == self.level - 1 { 0 } else { rank[i + 1] };
            while let Some(next) = self.links[x][i].next {
                if self.cmp_at(next, &value, cmp) != Ordering::Less {
                    break;
                }
                rank[i] += self.links[x][i].span;
                x = next;
            }
            update[i] = x;
        }
        let lvl = self.random_level();
        if lvl > self.level {
            for i in self.level..lvl {
                rank[i] = 0;
                update[i] = HEAD;
                self.links[HEAD][i].span = self.len;
            }
            self.level = lvl;
        }
        let n = self.alloc(value, lvl);
        for i in 0..lvl {
            let u = update[i];
            self.links[n][i].next = self.links[u][i].next;
            self.links[u][i].next = Some(n);
            self.links[n][i].span = self.links[u][i].span - (rank[0] - rank[i]);
            self.links[u][i].span = rank[0] - rank[i] + 1;
        }
        for i in lvl..self.level {
            self.links[update[i]][i].span += 1;
        }
        self.back[n] = if update[0] == HEAD { None } else { Some(update[0]) };
        match self.links[n][0].next {
            Some(next) => self.back[next] = Some(n),
            None => self.tail = Some(n),
        }
        self.len += 1;
    }

    /// Removes the element equal to `value` under `cmp`.
    pub fn remove(&mut self, value: &T, cmp: Cmp<'_, T>) -> Option<T> {
        let mut update = [HEAD; MAX_LEVEL];
        let mut x = HEAD;
        for i in (0..self.level).rev() {
            while let Some(next) = self.links[x][i].next {
                if self.cmp_at(next, value, cmp) != Ordering::Less {
                    break;
                }
                x = next;
            }
            update[i] = x;
        }
        let target = self.links[x][0].next?;
        if self.cmp_at(target, value, cmp) != Ordering::Equal {
            return None;
        }
        for i in 0..self.level {
            let u = update[i];
            if self.links[u][i].next == Some(target) {
                let span = self.links[u][i].span + self.links[target][i].span;
                self.links[u][i].span = span.saturating_sub(1);
                self.links[u][i].next = self.links[target][i].next;
            } else {
                self.links[u][i].span = self.links[u][i].span.saturating_sub(1);
            }
        }
        match self.links[target][0].next {
            Some(next) => self.back[next] = self.back[target],
            None => self.tail = self.back[target],
        }
        while self.level > 1 && self.links[HEAD][self.level - 1].next.is_none() {
            self.level -= 1;
        }
        self.len -= 1;
        self.links[target].clear();
        self.back[target] = None;
        self.free.push(target);
        self.values[target].take()
    }

    /// Zero-based position of the element equal to `value`.
    pub fn rank(&self, value: &T, cmp: Cmp<'_, T>) -> Option<usize> {
        let mut r = 0;
        let mut x = HEAD;
        for i in (0..self.level).rev() {
            while let Some(next) = self.links[x][i].next {
                if self.cmp_at(next, value, cmp) == Ordering::Greater {
                    break;
                }
                r += self.links[x][i].span;
                x = next;
            }
            if x != HEAD && self.cmp_at(x, value, cmp) == Ordering::Equal {
                return Some(r - 1);
            }
        }
        None
    }

    /// Number of elements strictly less than `value`; `value` need not be present.
    pub fn count_less(&self, value: &T, cmp: Cmp<'_, T>) -> usize {
        let mut r = 0;
        let mut x = HEAD;
        for i in (0..self.level).rev() {
            while let Some(next) = self.links[x][i].next {
                if self.cmp_at(next, value, cmp) != Ordering::Less {
                    break;
                }
                r += self.links[x][i].span;
                x = next;
            }
        }
        r
    }

    fn node_at(&self, index: usize) -> Option<usize> {
        if index >= self.len {
            return None;
        }
        let target = index + 1;
        let mut traversed = 0;
        let mut x = HEAD;
        for i in (0..self.level).rev() {
            while let Some(next) = self.links[x][i].next {
                if traversed + self.links[x][i].span > target {
                    break;
                }
                traversed += self.links[x][i].span;
                x = next;
            }
            if traversed == target {
                return Some(x);
            }
        }
        None
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.node_at(index).and_then(|n| self.values[n].as_ref())
    }

    pub fn first(&self) -> Option<&T> { self.links[HEAD][0].next.and_then(|n| self.values[n].as_ref()) }
    pub fn last(&self) -> Option<&T> { self.tail.and_then(|n| self.values[n].as_ref()) }

    /// Up to `count` elements starting at `start`, in order.
    pub fn range(&self, start: usize, count: usize) -> Vec<&T> {
        let mut out = Vec::new();
        let mut cur = self.node_at(start);
        while let Some(n) = cur {
            if out.len() >= count {
                break;
            }
            if let Some(v) = self.values[n].as_ref() {
                out.push(v);
            }
            cur = self.links[n][0].next;
        }
        out
    }

    /// Up to `count` elements walking backward from the one before `end`.
    pub fn range_rev(&self, end: usize, count: usize) -> Vec<&T> {
        let mut out = Vec::new();
        let mut cur = if end == 0 { None } else { self.node_at(end - 1) };
        while let Some(n) = cur {
            if out.len() >= count {
                break;
            }
            if let Some(v) = self.values[n].as_ref() {
                out.push(v);
            }
            cur = self.back[n];
        }
        out
    }

    pub fn iter(&self) -> Iter<'_, T> { Iter { list: self, cur: self.links[HEAD][0].next } }
}

pub struct Iter<'a, T> {
    list: &'a SkipList<T>,
    cur: Option<usize>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        let n = self.cur?;
        self.cur = self.list.links[n][0].next;
        self.list.values[n].as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmp(a: &i64, b: &i64) -> Ordering { a.cmp(b) }

    fn list(vals: &[i64]) -> SkipList<i64> {
        let mut s = SkipList::new();
        for v in vals {
            s.insert(*v, &cmp);
        }
        s
    }

    #[test]
    fn insert_keeps_order_and_ranks() {
        let s = list(&[5, 1, 9, 3, 7]);
        assert_eq!(s.iter().copied().collect::<Vec<_>>(), vec![1, 3, 5, 7, 9]);
        assert_eq!(s.rank(&7, &cmp), Some(3));
        assert_eq!(s.rank(&4, &cmp), None);
        assert_eq!(s.count_less(&4, &cmp), 2);
        assert_eq!(s.count_less(&100, &cmp), 5);
        assert_eq!(s.get(0), Some(&1));
        assert_eq!(s.get(4), Some(&9));
        assert_eq!(s.get(5), None);
        assert_eq!((s.first(), s.last()), (Some(&1), Some(&9)));
    }

    #[test]
    fn remove_relinks_and_reuses_slots() {
        let mut s = list(&[1, 2, 3, 4]);
        assert_eq!(s.remove(&3, &cmp), Some(3));
        assert_eq!(s.remove(&3, &cmp), None);
        assert_eq!(s.remove(&4, &cmp), Some(4));
        assert_eq!(s.last(), Some(&2));
        s.insert(10, &cmp);
        assert_eq!(s.iter().copied().collect::<Vec<_>>(), vec![1, 2, 10]);
        assert_eq!(s.rank(&10, &cmp), Some(2));
        assert_eq!(s.range_rev(3, 10).into_iter().copied().collect::<Vec<_>>(), vec![10, 2, 1]);
    }

    #[test]
    fn ranges_and_spans_stay_consistent_at_scale() {
        let mut s = SkipList::new();
        let mut expect: Vec<i64> = Vec::new();
        for i in 0..500i64 {
            let v = (i * 7919) % 1000;
            s.insert(v, &cmp);
            expect.push(v);
        }
        for v in (0..1000i64).step_by(3) {
            if let Some(pos) = expect.iter().position(|x| *x == v) {
                expect.remove(pos);
                assert_eq!(s.remove(&v, &cmp), Some(v));
            }
        }
        expect.sort();
        assert_eq!(s.len(), expect.len());
        for (i, v) in expect.iter().enumerate() {
            assert_eq!(s.get(i), Some(v));
            assert_eq!(s.rank(v, &cmp), Some(i));
        }
        assert_eq!(s.range(10, 3).into_iter().copied().collect::<Vec<_>>(), expect[10..13].to_vec());
        assert_eq!(s.range_rev(13, 3).into_iter().copied().collect::<Vec<_>>(), vec![expect[12], expect[11], expect[10]]);
        s.clear();
        assert!(s.is_empty());
        assert_eq!(s.iter().count(), 0);
    }
}
