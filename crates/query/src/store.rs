//! Contracts the subscription engine needs from its collaborators.

use std::sync::Arc;

use quarry_core::{Details, Record, RelationFormat, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{Filter, Order};

/// Firehose callback installed with [`ObjectStore::subscribe_for_all`].
pub type RecordSink = Arc<dyn Fn(Record) + Send + Sync>;

/// One store query: filter, optional order and paging (`limit = 0` means all).
pub struct Query<'a> {
    pub filter: &'a Filter,
    pub order: Option<&'a dyn Order>,
    pub limit: usize,
    pub offset: usize,
}

impl<'a> Query<'a> {
    pub fn new(filter: &'a Filter) -> Self { Self { filter, order: None, limit: 0, offset: 0 } }
    pub fn ordered(filter: &'a Filter, order: &'a dyn Order) -> Self { Self { filter, order: Some(order), limit: 0, offset: 0 } }
}

/// Per-space object store.
pub trait ObjectStore: Send + Sync {
    /// Records matching the filter, ordered and paged when requested.
    fn query(&self, q: &Query<'_>) -> Result<Vec<Arc<Details>>>;
    /// Streaming variant; stops early when `f` returns `false`.
    fn query_iterate(&self, filter: &Filter, f: &mut dyn FnMut(&Arc<Details>) -> bool) -> Result<()>;
    /// Records for the given ids in request order; unknown ids are skipped.
    fn query_by_ids(&self, ids: &[String]) -> Result<Vec<Arc<Details>>>;
    fn relation_format(&self, key: &str) -> Result<RelationFormat>;
    /// Live (not deleted) options of a tag/status relation.
    fn list_relation_options(&self, key: &str) -> Result<Vec<Arc<Details>>>;
    fn subscribe_for_all(&self, sink: RecordSink);
}

/// Edit of an ordered id list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlicePatch {
    /// Insert `ids` after `after_id` (`""` is the head).
    Add { after_id: String, ids: Vec<String> },
    Remove { ids: Vec<String> },
    /// Move `ids` to follow `after_id`.
    Move { after_id: String, ids: Vec<String> },
}

/// Applies patches in order; unknown `after_id`s append to the tail.
pub fn apply_patches(list: &mut Vec<String>, patches: &[SlicePatch]) {
    let insert_at = |list: &Vec<String>, after: &str| -> usize {
        if after.is_empty() { 0 } else { list.iter().position(|x| x == after).map(|i| i + 1).unwrap_or(list.len()) }
    };
    for p in patches {
        match p {
            SlicePatch::Add { after_id, ids } => {
                let at = insert_at(list, after_id);
                for (n, id) in ids.iter().enumerate() { list.insert(at + n, id.clone()); }
            }
            SlicePatch::Remove { ids } => list.retain(|x| !ids.contains(x)),
            SlicePatch::Move { after_id, ids } => {
                list.retain(|x| !ids.contains(x));
                let at = insert_at(list, after_id);
                for (n, id) in ids.iter().enumerate() { list.insert(at + n, id.clone()); }
            }
        }
    }
}

/// Externally maintained ordered collections.
pub trait CollectionService: Send + Sync {
    fn subscribe_for_collection(&self, collection_id: &str, sub_id: &str) -> Result<(Vec<String>, mpsc::Receiver<Vec<SlicePatch>>)>;
    fn unsubscribe_from_collection(&self, collection_id: &str, sub_id: &str);
}
