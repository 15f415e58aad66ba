//! Multi-space front: routes requests to the engine of their space,
//! starting engines on first use.

use std::sync::{Arc, Mutex};

use quarry_core::{Result, SubError};
use quarry_query::{CollectionService, ObjectStore};
use rustc_hash::FxHashMap;
use tracing::info;

use crate::config::SubsConfig;
use crate::output::EventSender;
use crate::request::{
    SearchRequest, SearchResponse, SubscribeGroupsRequest, SubscribeGroupsResponse, SubscribeIdsRequest, SubscribeIdsResponse,
};
use crate::space::SpaceSubscriptions;

/// Resolves the object store (and collection service) of a space.
pub trait SpaceIndex: Send + Sync {
    fn store(&self, space_id: &str) -> Result<Arc<dyn ObjectStore>>;
    fn collections(&self, _space_id: &str) -> Option<Arc<dyn CollectionService>> { None }
}

type SpaceBackends = (Arc<dyn ObjectStore>, Option<Arc<dyn CollectionService>>);

/// Fixed set of spaces known up front.
#[derive(Default)]
pub struct StaticSpaces {
    spaces: FxHashMap<String, SpaceBackends>,
}

impl StaticSpaces {
    pub fn new() -> Self { Self::default() }

    pub fn with_space(mut self, space_id: &str, store: Arc<dyn ObjectStore>, collections: Option<Arc<dyn CollectionService>>) -> Self {
        self.spaces.insert(space_id.to_string(), (store, collections));
        self
    }
}

impl SpaceIndex for StaticSpaces {
    fn store(&self, space_id: &str) -> Result<Arc<dyn ObjectStore>> {
        self.spaces.get(space_id).map(|(s, _)| Arc::clone(s)).ok_or_else(|| SubError::NotFound(format!("space {}", space_id)))
    }

    fn collections(&self, space_id: &str) -> Option<Arc<dyn CollectionService>> { self.spaces.get(space_id).and_then(|(_, c)| c.clone()) }
}

#[derive(Default)]
struct Spaces {
    started: FxHashMap<String, SpaceSubscriptions>,
    closed: bool,
}

pub struct Service {
    index: Arc<dyn SpaceIndex>,
    sender: Arc<dyn EventSender>,
    config: SubsConfig,
    spaces: Mutex<Spaces>,
}

impl Service {
    pub fn new(index: Arc<dyn SpaceIndex>, sender: Arc<dyn EventSender>, config: SubsConfig) -> Self {
        Self { index, sender, config, spaces: Mutex::new(Spaces::default()) }
    }

    /// Engine of `space_id`, started on first use. Must run inside a tokio runtime.
    pub fn space(&self, space_id: &str) -> Result<SpaceSubscriptions> {
        if space_id.is_empty() {
            return Err(SubError::NotFound("space id is required".into()));
        }
        let mut spaces = self.spaces.lock().map_err(|_| SubError::InternalInvariant("space registry poisoned".into()))?;
        if spaces.closed {
            return Err(SubError::Closed);
        }
        if let Some(s) = spaces.started.get(space_id) {
            return Ok(s.clone());
        }
        let store = self.index.store(space_id)?;
        let space = SpaceSubscriptions::start(space_id, store, self.index.collections(space_id), Arc::clone(&self.sender), self.config.clone());
        spaces.started.insert(space_id.to_string(), space.clone());
        Ok(space)
    }

    fn started(&self) -> Vec<SpaceSubscriptions> {
        self.spaces.lock().map(|s| s.started.values().cloned().collect()).unwrap_or_default()
    }

    pub async fn search(&self, req: SearchRequest) -> Result<SearchResponse> { self.space(&req.space_id)?.search(req).await }

    pub async fn subscribe_ids(&self, req: SubscribeIdsRequest) -> Result<SubscribeIdsResponse> {
        self.space(&req.space_id)?.subscribe_ids(req).await
    }

    pub async fn subscribe_groups(&self, req: SubscribeGroupsRequest) -> Result<SubscribeGroupsResponse> {
        self.space(&req.space_id)?.subscribe_groups(req).await
    }

    /// Closes the given subscriptions in whichever space holds them.
    pub async fn unsubscribe(&self, sub_ids: &[String]) -> Result<()> {
        for space in self.started() {
            space.unsubscribe(sub_ids).await?;
        }
        Ok(())
    }

    pub async fn unsubscribe_all(&self) -> Result<()> {
        for space in self.started() {
            space.unsubscribe_all().await?;
        }
        Ok(())
    }

    pub async fn unsubscribe_and_return_ids(&self, space_id: &str, sub_id: &str) -> Result<Vec<String>> {
        self.space(space_id)?.unsubscribe_and_return_ids(sub_id).await
    }

    pub fn subscription_ids(&self, space_id: &str) -> Result<Vec<String>> { self.space(space_id)?.subscription_ids() }

    /// Closes every started space; the service refuses new requests afterwards.
    pub async fn close(&self) {
        let spaces: Vec<SpaceSubscriptions> = match self.spaces.lock() {
            Ok(mut s) => {
                s.closed = true;
                s.started.drain().map(|(_, v)| v).collect()
            }
            Err(_) => Vec::new(),
        };
        for space in &spaces {
            space.close().await;
        }
        info!(spaces = spaces.len(), "service: closed");
    }
}
