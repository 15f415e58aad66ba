//! Event delivery: the space-wide sender and per-subscription queues.

use async_trait::async_trait;
use quarry_core::{Event, EventMessage, DEP_SUFFIX};
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::debug;

/// Destination of every event not claimed by an internal subscription.
#[async_trait]
pub trait EventSender: Send + Sync {
    async fn broadcast(&self, event: Event);
}

/// Bounded channel sender; a slow consumer backpressures the space.
#[derive(Debug, Clone)]
pub struct ChannelSender {
    tx: mpsc::Sender<Event>,
}

impl ChannelSender {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventSender for ChannelSender {
    async fn broadcast(&self, event: Event) {
        if self.tx.send(event).await.is_err() {
            debug!("output: event receiver dropped");
        }
    }
}

/// Sender dropping everything; for spaces nobody listens to.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSender;

#[async_trait]
impl EventSender for NullSender {
    async fn broadcast(&self, _event: Event) {}
}

/// Subscription owning `sub_id`: a dependency child belongs to its parent.
pub(crate) fn owner(sub_id: &str) -> &str { sub_id.strip_suffix(DEP_SUFFIX).unwrap_or(sub_id) }

/// Messages of one batch split between the space sender and internal queues.
#[derive(Debug, Default)]
pub(crate) struct Outbound {
    space_id: String,
    shared: Vec<EventMessage>,
    queued: Vec<(mpsc::Sender<EventMessage>, Vec<EventMessage>)>,
}

impl Outbound {
    pub fn route(space_id: &str, msgs: Vec<EventMessage>, queues: &FxHashMap<String, mpsc::Sender<EventMessage>>) -> Self {
        let mut out = Self { space_id: space_id.to_string(), ..Default::default() };
        if queues.is_empty() {
            out.shared = msgs;
            return out;
        }
        let mut per_queue: FxHashMap<&str, Vec<EventMessage>> = FxHashMap::default();
        for m in &msgs {
            if let Some(n) = m.narrowed(&|s| !queues.contains_key(owner(s))) {
                out.shared.push(n);
            }
            let mut owners: Vec<&String> = Vec::new();
            for sub_id in m.sub_ids() {
                if let Some((key, _)) = queues.get_key_value(owner(&sub_id)) {
                    if !owners.contains(&key) {
                        owners.push(key);
                    }
                }
            }
            for key in owners {
                if let Some(n) = m.narrowed(&|s| owner(s) == key.as_str()) {
                    per_queue.entry(key.as_str()).or_default().push(n);
                }
            }
        }
        for (key, list) in per_queue {
            if let Some(tx) = queues.get(key) {
                out.queued.push((tx.clone(), list));
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool { self.shared.is_empty() && self.queued.is_empty() }

    pub fn len(&self) -> usize { self.shared.len() + self.queued.iter().map(|(_, l)| l.len()).sum::<usize>() }

    pub async fn deliver(self, sender: &dyn EventSender) {
        for (tx, list) in self.queued {
            for m in list {
                if tx.send(m).await.is_err() {
                    debug!(space_id = %self.space_id, "output: internal queue closed");
                    break;
                }
            }
        }
        if !self.shared.is_empty() {
            sender.broadcast(Event { space_id: self.space_id, messages: self.shared }).await;
        }
    }
}
