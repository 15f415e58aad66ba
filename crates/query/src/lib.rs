//! Quarry query layer: filter requests and their compiled tree, quick date
//! options, comparators and order maps, and the store/collection contracts
//! the subscription engine is written against.

#![forbid(unsafe_code)]

mod build;
pub mod collate;
mod filter;
mod order;
mod order_map;
pub mod quick;
mod request;
mod store;

pub use build::{make_filter, make_filters, resolve_ids, BuildCtx};
pub use filter::{EqCond, Filter};
pub use order::{make_order, CustomOrder, KeyOrder, Order, SetOrder};
pub use order_map::OrderMap;
pub use request::{Condition, EmptyPlacement, FilterOperator, FilterRequest, QuickOption, SortRequest, SortType};
pub use store::{apply_patches, CollectionService, ObjectStore, Query, RecordSink, SlicePatch};
