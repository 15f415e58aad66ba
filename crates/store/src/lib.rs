//! Quarry store: the in-RAM reference object store, ordered collections and
//! the coalescing upstream batcher feeding subscription batches.

#![forbid(unsafe_code)]

mod batch;
mod coalesce;
mod collections;
mod mem;

pub use batch::spawn_batcher;
pub use coalesce::Coalescer;
pub use collections::MemCollections;
pub use mem::MemStore;
