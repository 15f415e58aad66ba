//! Subscriptions of one space: registry, batch loop and delivery.
//!
//! All subscription state sits behind one mutex. Requests and batches run
//! their synchronous part under it and deliver the resulting messages after
//! releasing it, so events of a batch reach the sender in batch order.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use quarry_core::{Details, EventMessage, Record, RelationFormat, Result, SubError};
use quarry_query::{make_filters, make_order, BuildCtx, CollectionService, ObjectStore, Order, Query, SlicePatch};
use quarry_store::spawn_batcher;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::collection::CollectionObserver;
use crate::config::SubsConfig;
use crate::ctx::{Env, Keys, OpCtx};
use crate::dep::DependencyService;
use crate::entry::Cache;
use crate::group::{static_groups, GroupSub};
use crate::ids::IdsSub;
use crate::order_mgr::OrderManager;
use crate::output::{EventSender, Outbound};
use crate::request::{
    SearchRequest, SearchResponse, SubscribeGroupsRequest, SubscribeGroupsResponse, SubscribeIdsRequest, SubscribeIdsResponse,
};
use crate::sorted::{SortedSub, Window};

enum Sub {
    Sorted(Box<SortedSub>),
    Ids(IdsSub),
    Group(GroupSub),
}

impl Sub {
    fn on_change(&mut self, env: &mut Env<'_>) {
        match self {
            Sub::Sorted(s) => s.on_change(env),
            Sub::Ids(s) => s.on_change(env),
            Sub::Group(s) => s.on_change(env),
        }
    }

    fn active_ids(&self) -> Vec<String> {
        match self {
            Sub::Sorted(s) => s.active_ids().to_vec(),
            Sub::Ids(s) => s.active_ids(),
            Sub::Group(_) => Vec::new(),
        }
    }

    fn collection_id(&self) -> Option<String> {
        match self {
            Sub::Sorted(s) => s.observer().map(|o| o.collection_id.clone()),
            Sub::Group(s) => s.observer().map(|o| o.collection_id.clone()),
            Sub::Ids(_) => None,
        }
    }

    fn close(&mut self, cache: &mut Cache) {
        match self {
            Sub::Sorted(s) => s.close(cache),
            Sub::Ids(s) => s.close(cache),
            Sub::Group(s) => {
                if let Some(o) = s.observer_mut() {
                    o.close();
                }
                s.close();
            }
        }
    }
}

#[derive(Default)]
struct State {
    cache: Cache,
    ctx: OpCtx,
    deps: DependencyService,
    orders: OrderManager,
    subs: FxHashMap<String, Sub>,
    /// Registration order; batches visit subscriptions in it.
    order: Vec<String>,
    queues: FxHashMap<String, mpsc::Sender<EventMessage>>,
    closed: bool,
}

impl State {
    fn insert(&mut self, id: String, sub: Sub) {
        if self.subs.insert(id.clone(), sub).is_none() {
            self.order.push(id);
        }
        metrics::gauge!("subs_live", self.subs.len() as f64);
    }

    /// Closes `id` and releases everything it holds; returns its active ids.
    fn take(&mut self, collections: Option<&dyn CollectionService>, id: &str) -> Option<Vec<String>> {
        let mut sub = self.subs.remove(id)?;
        self.order.retain(|s| s != id);
        self.queues.remove(id);
        let active = sub.active_ids();
        if let (Some(svc), Some(cid)) = (collections, sub.collection_id()) {
            svc.unsubscribe_from_collection(&cid, id);
        }
        sub.close(&mut self.cache);
        self.deps.forget(id);
        self.orders.close_order_subscription(id);
        metrics::gauge!("subs_live", self.subs.len() as f64);
        debug!(sub_id = id, cached = self.cache.len(), "space: subscription closed");
        Some(active)
    }

    /// Runs one batch through the subscriptions (all, or just `only`).
    fn run(&mut self, store: &dyn ObjectStore, records: Vec<Record>, only: Option<&str>) -> Vec<EventMessage> {
        let State { cache, ctx, deps, orders, subs, order, .. } = self;
        ctx.reset(records);
        orders.track_references(ctx.entries());
        let mut reorder = orders.changed_for_batch(ctx.entries());
        for (parent, list) in deps.reorder_parents(ctx.entries()) {
            reorder.entry(parent).or_default().extend(list);
        }
        for (parent, list) in &reorder {
            if let Some(Sub::Sorted(s)) = subs.get_mut(parent) {
                s.reorder(list);
            }
        }
        {
            let mut env = Env { cache: &mut *cache, ctx: &mut *ctx, store, deps: &mut *deps, orders: &mut *orders };
            for id in order.iter().filter(|id| only.map_or(true, |o| o == id.as_str())) {
                if let Some(sub) = subs.get_mut(id) {
                    sub.on_change(&mut env);
                }
            }
        }
        let msgs = ctx.apply(cache);
        ctx.clear();
        msgs
    }

    /// Current details for `ids`: cached copies first, the rest from the store.
    fn latest(&self, store: &dyn ObjectStore, ids: &[String]) -> Result<Vec<Record>> {
        let mut out: Vec<Record> = Vec::with_capacity(ids.len());
        let mut missing: Vec<String> = Vec::new();
        for id in ids {
            match self.cache.get(id) {
                Some(e) => out.push(Record { details: Arc::clone(&e.data) }),
                None => missing.push(id.clone()),
            }
        }
        if !missing.is_empty() {
            out.extend(store.query_by_ids(&missing)?.into_iter().map(|details| Record { details }));
        }
        Ok(out)
    }
}

struct Inner {
    space_id: String,
    store: Arc<dyn ObjectStore>,
    collections: Option<Arc<dyn CollectionService>>,
    sender: Arc<dyn EventSender>,
    config: SubsConfig,
    state: Mutex<State>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to the subscription engine of one space. Cheap to clone.
#[derive(Clone)]
pub struct SpaceSubscriptions {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SpaceSubscriptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpaceSubscriptions").field("space_id", &self.inner.space_id).finish()
    }
}

fn sub_id_or_new(id: &str) -> String { if id.is_empty() { Uuid::new_v4().to_string() } else { id.to_string() } }

impl SpaceSubscriptions {
    /// Starts the engine: hooks the store's change feed into the batcher and
    /// spawns the task applying its batches. Must run inside a tokio runtime.
    pub fn start(
        space_id: &str,
        store: Arc<dyn ObjectStore>,
        collections: Option<Arc<dyn CollectionService>>,
        sender: Arc<dyn EventSender>,
        config: SubsConfig,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (batch_tx, mut batch_rx) = mpsc::channel::<Vec<Record>>(16);
        let (sink, batcher) = spawn_batcher(config.batch_window, config.batch_cap, config.feed_cap, batch_tx, shutdown_rx);
        store.subscribe_for_all(sink);
        let inner = Arc::new(Inner {
            space_id: space_id.to_string(),
            store,
            collections,
            sender,
            config,
            state: Mutex::new(State::default()),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        });
        let weak = Arc::downgrade(&inner);
        let drain_space = space_id.to_string();
        let drain = tokio::spawn(async move {
            while let Some(records) = batch_rx.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                match (SpaceSubscriptions { inner }).apply_batch(records).await {
                    Ok(()) | Err(SubError::Closed) => {}
                    Err(e) => {
                        warn!(space_id = %drain_space, error = %e, "space: batch failed");
                        metrics::counter!("subs_batch_errors_total", 1u64);
                    }
                }
            }
            debug!(space_id = %drain_space, "space: drain stopped");
        });
        if let Ok(mut t) = inner.tasks.lock() {
            t.push(batcher);
            t.push(drain);
        }
        info!(space_id, batch_ms = inner.config.batch_window.as_millis() as u64, "space: started");
        Self { inner }
    }

    pub fn space_id(&self) -> &str { &self.inner.space_id }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        let st = self.inner.state.lock().map_err(|_| SubError::InternalInvariant("subscription state poisoned".into()))?;
        if st.closed {
            return Err(SubError::Closed);
        }
        Ok(st)
    }

    fn collections(&self) -> Option<&dyn CollectionService> { self.inner.collections.as_deref() }

    /// Applies one coalesced batch of changed objects and delivers the events.
    pub async fn apply_batch(&self, records: Vec<Record>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let started = Instant::now();
        let count = records.len();
        let out = {
            let mut guard = self.lock()?;
            let st = &mut *guard;
            let msgs = st.run(&*self.inner.store, records, None);
            Outbound::route(&self.inner.space_id, msgs, &st.queues)
        };
        metrics::counter!("subs_batches_total", 1u64);
        metrics::counter!("subs_batch_records_total", count as u64);
        metrics::counter!("subs_events_total", out.len() as u64);
        metrics::histogram!("subs_batch_apply_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(space_id = %self.inner.space_id, records = count, messages = out.len(), "space: batch applied");
        out.deliver(&*self.inner.sender).await;
        Ok(())
    }

    /// Feeds collection patches to the subscription observing the collection.
    pub async fn apply_collection_patches(&self, sub_id: &str, patches: &[SlicePatch]) -> Result<()> {
        let out = {
            let mut guard = self.lock()?;
            let st = &mut *guard;
            let dirty = match st.subs.get_mut(sub_id) {
                Some(Sub::Sorted(s)) => s.apply_collection(patches),
                Some(Sub::Group(g)) => g.observer_mut().map(|o| o.apply(patches).0).unwrap_or_default(),
                _ => return Err(SubError::NotFound(format!("subscription {}", sub_id))),
            };
            let records = st.latest(&*self.inner.store, &dirty)?;
            let msgs = st.run(&*self.inner.store, records, Some(sub_id));
            Outbound::route(&self.inner.space_id, msgs, &st.queues)
        };
        debug!(space_id = %self.inner.space_id, sub_id, messages = out.len(), "space: collection patched");
        out.deliver(&*self.inner.sender).await;
        Ok(())
    }

    fn spawn_pump(&self, sub_id: String, mut rx: mpsc::Receiver<Vec<SlicePatch>>) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(patches) = rx.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                if let Err(e) = (SpaceSubscriptions { inner }).apply_collection_patches(&sub_id, &patches).await {
                    debug!(sub_id = %sub_id, error = %e, "space: collection pump stopped");
                    break;
                }
            }
        })
    }

    /// Opens a sorted subscription; replaces any subscription with the same id.
    pub async fn search(&self, req: SearchRequest) -> Result<SearchResponse> {
        let started = Instant::now();
        let sub_id = sub_id_or_new(&req.sub_id);
        let (resp, out) = {
            let mut guard = self.lock()?;
            let st = &mut *guard;
            let (resp, msgs) = self.search_locked(st, &req, &sub_id)?;
            (resp, Outbound::route(&self.inner.space_id, msgs, &st.queues))
        };
        metrics::counter!("subs_search_total", 1u64);
        metrics::histogram!("subs_search_ms", started.elapsed().as_secs_f64() * 1000.0);
        info!(
            space_id = %self.inner.space_id,
            sub_id = %sub_id,
            total = resp.counters.total,
            records = resp.records.len(),
            deps = resp.dependencies.len(),
            async_init = req.async_init,
            "space: search"
        );
        out.deliver(&*self.inner.sender).await;
        Ok(resp)
    }

    fn search_locked(&self, st: &mut State, req: &SearchRequest, sub_id: &str) -> Result<(SearchResponse, Vec<EventMessage>)> {
        let store = &*self.inner.store;
        st.take(self.collections(), sub_id);

        let filter = make_filters(&BuildCtx::new(store, self.inner.config.tz_offset_secs), &req.filters)?;
        let order: Option<Box<dyn Order>> = make_order(store, &req.sorts)?.map(|o| Box::new(o) as Box<dyn Order>);
        let window = Window {
            limit: req.limit.max(0) as usize,
            offset: req.offset.max(0) as usize,
            after_id: req.after_id.clone(),
            before_id: req.before_id.clone(),
        };
        let keys: Keys = Arc::new(req.keys.clone());

        let mut observer = None;
        let mut patches = None;
        let records = if req.collection_id.is_empty() {
            store.query(&Query::new(&filter))?
        } else {
            let svc = self.collections().ok_or_else(|| SubError::NotFound(format!("collection {}", req.collection_id)))?;
            let (ids, rx) = svc.subscribe_for_collection(&req.collection_id, sub_id)?;
            patches = Some(rx);
            match store.query_by_ids(&ids) {
                Ok(r) => {
                    observer = Some(CollectionObserver::new(&req.collection_id, ids));
                    r
                }
                Err(e) => {
                    svc.unsubscribe_from_collection(&req.collection_id, sub_id);
                    return Err(e);
                }
            }
        };

        let mut sub = SortedSub::new(sub_id.to_string(), Arc::clone(&keys), filter, order, window);
        if let Some(o) = observer {
            sub = sub.with_observer(o);
        }
        if req.live_nested {
            sub.enable_live_nested();
        }
        if let Err(e) = sub.init(store, records) {
            self.abandon(st, sub_id, &req.collection_id);
            return Err(e);
        }

        st.deps.register_sorts(store, sub_id, &req.sorts);
        if !sub.related_keys().is_empty() {
            if let Err(e) = st.orders.init_order_subscription(store, sub_id, sub.related_keys()) {
                warn!(sub_id, error = %e, "space: order subscription failed");
            }
        }

        let dep = if req.no_dep_subscription {
            None
        } else {
            let dep_keys = st.deps.dep_keys(store, &req.keys);
            let force_ids = st.deps.force_ids(store, &req.filters);
            (!dep_keys.is_empty() || !force_ids.is_empty()).then_some((dep_keys, force_ids))
        };

        let output = if req.internal {
            let (tx, rx) = mpsc::channel(self.inner.config.queue_cap.max(1));
            st.queues.insert(sub_id.to_string(), tx);
            Some(rx)
        } else {
            None
        };

        let mut msgs = Vec::new();
        let (records, dependencies) = if req.async_init {
            if let Some((dep_keys, force_ids)) = dep {
                sub.dep = Some(st.deps.child(sub_id, &keys, dep_keys, force_ids));
            }
            let State { cache, ctx, deps, orders, .. } = &mut *st;
            ctx.clear();
            {
                let mut env = Env { cache: &mut *cache, ctx: &mut *ctx, store, deps: &mut *deps, orders: &mut *orders };
                sub.emit_initial(&mut env);
            }
            msgs = ctx.apply(cache);
            ctx.clear();
            (Vec::new(), Vec::new())
        } else {
            let mut dependencies = Vec::new();
            if let Some((dep_keys, force_ids)) = dep {
                match st.deps.make_subscription_by_entries(&mut st.cache, store, sub_id, &sub.active_records(), &keys, dep_keys, force_ids) {
                    Ok((child, recs)) => {
                        sub.dep = Some(child);
                        dependencies = recs;
                    }
                    Err(e) => {
                        st.queues.remove(sub_id);
                        self.abandon(st, sub_id, &req.collection_id);
                        return Err(e);
                    }
                }
            }
            sub.attach(&mut st.cache);
            (sub.active_records(), dependencies)
        };

        if let Some(rx) = patches {
            let pump = self.spawn_pump(sub_id.to_string(), rx);
            if let Some(o) = sub.observer_mut() {
                o.set_pump(pump);
            }
        }
        let counters = sub.counters();
        st.insert(sub_id.to_string(), Sub::Sorted(Box::new(sub)));
        Ok((SearchResponse { sub_id: sub_id.to_string(), records, dependencies, counters, output }, msgs))
    }

    /// Undoes registrations of a search that failed after they were made.
    fn abandon(&self, st: &mut State, sub_id: &str, collection_id: &str) {
        if let (Some(svc), false) = (self.collections(), collection_id.is_empty()) {
            svc.unsubscribe_from_collection(collection_id, sub_id);
        }
        st.deps.forget(sub_id);
        st.orders.close_order_subscription(sub_id);
    }

    /// Subscribes to a fixed id list delivered in request order.
    pub async fn subscribe_ids(&self, req: SubscribeIdsRequest) -> Result<SubscribeIdsResponse> {
        let sub_id = sub_id_or_new(&req.sub_id);
        let store = &*self.inner.store;
        let mut guard = self.lock()?;
        let st = &mut *guard;
        st.take(self.collections(), &sub_id);

        let keys: Keys = Arc::new(req.keys.clone());
        let mut sub = IdsSub::new(sub_id.clone(), Arc::clone(&keys));
        let records = sub.add_ids(&mut st.cache, store, &req.ids)?;
        let mut dependencies = Vec::new();
        if !req.no_dep_subscription {
            let dep_keys = st.deps.dep_keys(store, &req.keys);
            if !dep_keys.is_empty() {
                match st.deps.make_subscription_by_entries(&mut st.cache, store, &sub_id, &records, &keys, dep_keys, Vec::new()) {
                    Ok((child, recs)) => {
                        sub.dep = Some(child);
                        dependencies = recs;
                    }
                    Err(e) => {
                        sub.close(&mut st.cache);
                        st.deps.forget(&sub_id);
                        return Err(e);
                    }
                }
            }
        }
        debug!(space_id = %self.inner.space_id, sub_id = %sub_id, found = records.len(), wanted = req.ids.len(), "space: subscribe ids");
        st.insert(sub_id.clone(), Sub::Ids(sub));
        metrics::counter!("subs_subscribe_ids_total", 1u64);
        Ok(SubscribeIdsResponse { sub_id, records, dependencies })
    }

    /// Admits more ids into an id subscription; returns the objects that exist.
    pub async fn add_ids(&self, sub_id: &str, ids: &[String]) -> Result<Vec<Arc<Details>>> {
        let mut guard = self.lock()?;
        let st = &mut *guard;
        match st.subs.get_mut(sub_id) {
            Some(Sub::Ids(s)) => s.add_ids(&mut st.cache, &*self.inner.store, ids),
            _ => Err(SubError::NotFound(format!("subscription {}", sub_id))),
        }
    }

    /// Lists the groups of a relation. Tag relations get a live subscription
    /// reporting combinations as they appear and disappear.
    pub async fn subscribe_groups(&self, req: SubscribeGroupsRequest) -> Result<SubscribeGroupsResponse> {
        let store = &*self.inner.store;
        let format = store.relation_format(&req.relation_key)?;
        if !matches!(format, RelationFormat::Tag) {
            let groups = static_groups(store, &req.relation_key, format)?;
            return Ok(SubscribeGroupsResponse { sub_id: String::new(), groups });
        }

        let sub_id = sub_id_or_new(&req.sub_id);
        let mut guard = self.lock()?;
        let st = &mut *guard;
        st.take(self.collections(), &sub_id);

        let filter = make_filters(&BuildCtx::new(store, self.inner.config.tz_offset_secs), &req.filters)?;
        let mut patches = None;
        let observer = if req.collection_id.is_empty() {
            None
        } else {
            let svc = self.collections().ok_or_else(|| SubError::NotFound(format!("collection {}", req.collection_id)))?;
            let (ids, rx) = svc.subscribe_for_collection(&req.collection_id, &sub_id)?;
            patches = Some(rx);
            Some(CollectionObserver::new(&req.collection_id, ids))
        };
        let mut sub = GroupSub::new(sub_id.clone(), &req.relation_key, filter, observer);
        if let Err(e) = sub.init(store) {
            self.abandon(st, &sub_id, &req.collection_id);
            return Err(e);
        }
        if let Some(rx) = patches {
            let pump = self.spawn_pump(sub_id.clone(), rx);
            if let Some(o) = sub.observer_mut() {
                o.set_pump(pump);
            }
        }
        let groups = sub.groups();
        debug!(space_id = %self.inner.space_id, sub_id = %sub_id, groups = groups.len(), "space: subscribe groups");
        st.insert(sub_id.clone(), Sub::Group(sub));
        Ok(SubscribeGroupsResponse { sub_id, groups })
    }

    /// Closes the given subscriptions; unknown ids are ignored.
    pub async fn unsubscribe(&self, sub_ids: &[String]) -> Result<()> {
        let mut guard = self.lock()?;
        let st = &mut *guard;
        for id in sub_ids {
            if st.take(self.collections(), id).is_some() {
                metrics::counter!("subs_unsubscribe_total", 1u64);
            }
        }
        Ok(())
    }

    pub async fn unsubscribe_all(&self) -> Result<()> {
        let mut guard = self.lock()?;
        let st = &mut *guard;
        for id in st.order.clone() {
            st.take(self.collections(), &id);
        }
        info!(space_id = %self.inner.space_id, cached = st.cache.len(), "space: all subscriptions closed");
        Ok(())
    }

    /// Closes `sub_id` and returns the ids it was delivering.
    pub async fn unsubscribe_and_return_ids(&self, sub_id: &str) -> Result<Vec<String>> {
        let mut guard = self.lock()?;
        guard.take(self.collections(), sub_id).ok_or_else(|| SubError::NotFound("subscription not found".into()))
    }

    /// Live subscription ids in registration order.
    pub fn subscription_ids(&self) -> Result<Vec<String>> { Ok(self.lock()?.order.clone()) }

    /// Objects currently held by the shared cache.
    pub fn cached_objects(&self) -> Result<usize> { Ok(self.lock()?.cache.len()) }

    /// Closes every subscription and stops the batch loop. Later calls fail with `Closed`.
    pub async fn close(&self) {
        match self.inner.state.lock() {
            Ok(mut guard) => {
                let st = &mut *guard;
                if st.closed {
                    return;
                }
                for id in st.order.clone() {
                    st.take(self.collections(), &id);
                }
                st.closed = true;
            }
            Err(_) => warn!(space_id = %self.inner.space_id, "space: closing with poisoned state"),
        }
        let _ = self.inner.shutdown.send(true);
        let tasks = match self.inner.tasks.lock() {
            Ok(mut t) => std::mem::take(&mut *t),
            Err(_) => Vec::new(),
        };
        for t in tasks {
            if let Err(e) = t.await {
                debug!(space_id = %self.inner.space_id, error = %e, "space: task ended abnormally");
            }
        }
        info!(space_id = %self.inner.space_id, "space: closed");
    }
}
