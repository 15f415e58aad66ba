use std::collections::VecDeque;

use quarry_core::Record;
use rustc_hash::FxHashMap;

/// Coalescing queue keyed by object id: FIFO by first arrival, last write wins.
///
/// `cap` bounds the number of distinct ids held; `push` reports when the
/// queue is full so the consumer can flush early instead of dropping.
pub struct Coalescer {
    map: FxHashMap<String, Record>,
    order: VecDeque<String>,
    cap: usize,
}

impl Coalescer {
    pub fn with_capacity(cap: usize) -> Self {
        Self { map: FxHashMap::default(), order: VecDeque::new(), cap: cap.max(1) }
    }

    pub fn len(&self) -> usize { self.map.len() }
    pub fn is_empty(&self) -> bool { self.map.is_empty() }
    pub fn is_full(&self) -> bool { self.map.len() >= self.cap }

    /// Returns `true` once the queue holds `cap` distinct ids.
    pub fn push(&mut self, r: Record) -> bool {
        let id = r.id().to_string();
        if !self.map.contains_key(&id) {
            self.order.push_back(id.clone());
        }
        self.map.insert(id, r);
        self.is_full()
    }

    /// Drain all currently coalesced records in arrival order.
    pub fn drain_ready(&mut self) -> Vec<Record> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(id) = self.order.pop_front() {
            if let Some(r) = self.map.remove(&id) {
                out.push(r);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::Details;

    fn rec(id: &str, name: &str) -> Record { Record::new(Details::new().with("id", id).with("name", name)) }

    #[test]
    fn last_write_wins_in_first_arrival_order() {
        let mut c = Coalescer::with_capacity(8);
        c.push(rec("a", "1"));
        c.push(rec("b", "1"));
        c.push(rec("a", "2"));
        let out = c.drain_ready();
        assert_eq!(out.iter().map(|r| r.id()).collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(out[0].details.get_str("name"), "2");
        assert!(c.is_empty());
    }

    #[test]
    fn reports_full_without_dropping() {
        let mut c = Coalescer::with_capacity(2);
        assert!(!c.push(rec("a", "1")));
        assert!(c.push(rec("b", "1")));
        assert!(c.push(rec("c", "1")));
        assert_eq!(c.drain_ready().len(), 3);
    }
}
