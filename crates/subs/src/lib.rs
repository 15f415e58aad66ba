//! Quarry subscription engine.
//!
//! Clients open live queries (sorted windows, id lists, kanban groups) over
//! a space's object store. Store changes arrive through a coalescing batcher;
//! each batch is run through every subscription, the collected operations are
//! turned into ordered event messages and delivered to the space sender or to
//! a subscription's own queue.

#![forbid(unsafe_code)]

mod collection;
pub mod config;
mod ctx;
mod dep;
mod entry;
mod group;
mod ids;
mod listdiff;
mod order_mgr;
mod output;
mod request;
mod service;
mod simple;
mod skiplist;
mod sorted;
mod space;

pub use config::SubsConfig;
pub use group::EMPTY_GROUP;
pub use output::{ChannelSender, EventSender, NullSender};
pub use request::{
    SearchRequest, SearchResponse, SubscribeGroupsRequest, SubscribeGroupsResponse, SubscribeIdsRequest, SubscribeIdsResponse,
};
pub use service::{Service, SpaceIndex, StaticSpaces};
pub use space::SpaceSubscriptions;
