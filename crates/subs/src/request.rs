//! Request and response shapes of the subscription API.

use std::sync::Arc;

use quarry_core::{Counters, Details, EventMessage, Group, RelationKey};
use quarry_query::{FilterRequest, SortRequest};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SearchRequest {
    /// Generated when empty; an existing subscription with this id is replaced.
    pub sub_id: String,
    pub space_id: String,
    pub filters: Vec<FilterRequest>,
    pub sorts: Vec<SortRequest>,
    /// Projection; empty means every key.
    pub keys: Vec<RelationKey>,
    /// Negative values are treated as zero; zero limit means unbounded.
    pub limit: i64,
    pub offset: i64,
    pub after_id: String,
    pub before_id: String,
    /// Restricts the set to an external ordered collection.
    pub collection_id: String,
    /// Deliver events on a dedicated queue instead of the space sender.
    pub internal: bool,
    /// Return counters only and deliver the initial window as events.
    pub async_init: bool,
    pub no_dep_subscription: bool,
    /// Keep nested filters live instead of resolving them once.
    pub live_nested: bool,
}

#[derive(Debug)]
pub struct SearchResponse {
    pub sub_id: String,
    pub records: Vec<Arc<Details>>,
    pub dependencies: Vec<Arc<Details>>,
    pub counters: Counters,
    /// Present for internal subscriptions; closes on unsubscribe.
    pub output: Option<mpsc::Receiver<EventMessage>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SubscribeIdsRequest {
    pub sub_id: String,
    pub space_id: String,
    pub ids: Vec<String>,
    pub keys: Vec<RelationKey>,
    pub no_dep_subscription: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeIdsResponse {
    pub sub_id: String,
    pub records: Vec<Arc<Details>>,
    pub dependencies: Vec<Arc<Details>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SubscribeGroupsRequest {
    pub sub_id: String,
    pub space_id: String,
    pub relation_key: RelationKey,
    pub filters: Vec<FilterRequest>,
    pub collection_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeGroupsResponse {
    /// Empty when the relation's groups are static and nothing was subscribed.
    pub sub_id: String,
    pub groups: Vec<Group>,
}
