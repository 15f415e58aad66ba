//! Outbound event messages.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{Details, KeyValue, RelationKey};

pub type SubIds = SmallVec<[String; 2]>;

/// Subscription counters: total matching set size and the number of elements
/// before and after the active window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Counters {
    pub total: usize,
    pub prev_count: usize,
    pub next_count: usize,
}

/// A kanban group: the set of option ids an object carries under the group relation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventMessage {
    ObjectDetailsSet { id: String, sub_ids: SubIds, details: Details },
    ObjectDetailsAmend { id: String, sub_ids: SubIds, details: Vec<KeyValue> },
    ObjectDetailsUnset { id: String, sub_ids: SubIds, keys: Vec<RelationKey> },
    SubscriptionAdd { sub_id: String, id: String, after_id: String },
    SubscriptionRemove { sub_id: String, id: String },
    SubscriptionPosition { sub_id: String, id: String, after_id: String },
    SubscriptionCounters { sub_id: String, total: usize, prev_count: usize, next_count: usize },
    SubscriptionGroups { sub_id: String, group: Group, remove: bool },
}

impl EventMessage {
    /// Subscriptions a message is addressed to.
    pub fn sub_ids(&self) -> SubIds {
        match self {
            EventMessage::ObjectDetailsSet { sub_ids, .. }
            | EventMessage::ObjectDetailsAmend { sub_ids, .. }
            | EventMessage::ObjectDetailsUnset { sub_ids, .. } => sub_ids.clone(),
            EventMessage::SubscriptionAdd { sub_id, .. }
            | EventMessage::SubscriptionRemove { sub_id, .. }
            | EventMessage::SubscriptionPosition { sub_id, .. }
            | EventMessage::SubscriptionCounters { sub_id, .. }
            | EventMessage::SubscriptionGroups { sub_id, .. } => smallvec::smallvec![sub_id.clone()],
        }
    }

    /// Copy of a details message narrowed to `keep`; `None` if nothing is left.
    /// Single-subscription messages pass through when their sub is kept.
    pub fn narrowed(&self, keep: &dyn Fn(&str) -> bool) -> Option<EventMessage> {
        let narrow = |ids: &SubIds| -> SubIds { ids.iter().filter(|s| keep(s.as_str())).cloned().collect() };
        let out = match self {
            EventMessage::ObjectDetailsSet { id, sub_ids, details } => {
                EventMessage::ObjectDetailsSet { id: id.clone(), sub_ids: narrow(sub_ids), details: details.clone() }
            }
            EventMessage::ObjectDetailsAmend { id, sub_ids, details } => {
                EventMessage::ObjectDetailsAmend { id: id.clone(), sub_ids: narrow(sub_ids), details: details.clone() }
            }
            EventMessage::ObjectDetailsUnset { id, sub_ids, keys } => {
                EventMessage::ObjectDetailsUnset { id: id.clone(), sub_ids: narrow(sub_ids), keys: keys.clone() }
            }
            other => return other.sub_ids().iter().any(|s| keep(s.as_str())).then(|| other.clone()),
        };
        if out.sub_ids().is_empty() { None } else { Some(out) }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EventMessage::ObjectDetailsSet { .. } => "objectDetailsSet",
            EventMessage::ObjectDetailsAmend { .. } => "objectDetailsAmend",
            EventMessage::ObjectDetailsUnset { .. } => "objectDetailsUnset",
            EventMessage::SubscriptionAdd { .. } => "subscriptionAdd",
            EventMessage::SubscriptionRemove { .. } => "subscriptionRemove",
            EventMessage::SubscriptionPosition { .. } => "subscriptionPosition",
            EventMessage::SubscriptionCounters { .. } => "subscriptionCounters",
            EventMessage::SubscriptionGroups { .. } => "subscriptionGroups",
        }
    }
}

/// A batch of messages for one space, delivered in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub space_id: String,
    pub messages: Vec<EventMessage>,
}
