//! Entity manager: message routing and actor residency
//!
//! ```text
//!   send_msg ──► inbound (mpsc, bounded) ──► dispatch loop ──► pending queue
//!                                                                  │
//!                               resident? ──no──► rebalance (placement, factory)
//!                                   │                    │
//!                                   └──────yes───────────┴──► actor.deliver()
//!                                                                  │ attached
//!                                                                  ▼
//!                                                   worker pool (semaphore) ──► actor.run()
//! ```
//!
//! `send_msg` is fire-and-forget: it only waits for inbound capacity and
//! never reports what happens to the message afterwards. The dispatch loop
//! never runs actor code itself, so a slow actor cannot stall routing.
//!
//! Locking is two-level: the resident table lock is never held while an
//! actor's own lock is taken.

mod placement;

pub use placement::{LocalPlacement, Placement, PlacementStrategy};

use crate::actor::{
    Actor, ActorEnv, ActorFactory, Dispatcher, LocalFactory, LogPublisher, Publisher,
};
use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::mapper::{Mapper, MapperExecutor, MapperGraph, NoopExecutor};
use crate::message::{MapperMsg, MapperOp, MessageContext, STATE_TYPE_ENTITY};
use crate::store::{EntityStore, NoopStore};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Cloneable submission handle, also the dispatcher actors propagate through
#[derive(Clone)]
pub struct ManagerHandle {
    sender: mpsc::Sender<MessageContext>,
}

impl ManagerHandle {
    /// Enqueue a message, stamping a request id if it has none
    pub async fn send_msg(&self, mut ctx: MessageContext) {
        let request_id = ctx.ensure_request_id().clone();
        if let Err(err) = self.sender.send(ctx).await {
            tracing::warn!(
                request_id = %request_id,
                target_id = %err.0.target_id(),
                "manager queue closed, dropping message"
            );
        }
    }
}

#[async_trait]
impl Dispatcher for ManagerHandle {
    async fn send_msg(&self, ctx: MessageContext) {
        ManagerHandle::send_msg(self, ctx).await
    }
}

/// Point-in-time counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ManagerStats {
    /// Actors in the resident table
    pub resident: usize,
    /// Messages handed to an actor
    pub dispatched: u64,
    /// Messages dropped because no actor could be resolved
    pub dropped: u64,
}

#[derive(Default)]
struct Counters {
    dispatched: AtomicU64,
    dropped: AtomicU64,
}

struct Shared {
    actors: RwLock<HashMap<String, Arc<dyn Actor>>>,
    factory: Arc<dyn ActorFactory>,
    placement: Arc<dyn PlacementStrategy>,
    env: ActorEnv,
    workers: Arc<Semaphore>,
    counters: Counters,
    cancel: CancellationToken,
}

impl Shared {
    fn resident(&self, id: &str) -> Option<Arc<dyn Actor>> {
        self.actors.read().get(id).cloned()
    }

    async fn dispatch(&self, ctx: MessageContext) {
        let actor = match self.resident(ctx.target_id()) {
            Some(actor) => actor,
            None => match self.rebalance(&ctx).await {
                Ok(actor) => actor,
                Err(err) => {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        target_id = %ctx.target_id(),
                        kind = ctx.message.kind(),
                        error = %err,
                        "rebalance failed, dropping message"
                    );
                    return;
                }
            },
        };

        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        if actor.deliver(ctx) {
            self.schedule(actor);
        }
    }

    /// Resolve a non-resident actor: place it, build it, register it
    async fn rebalance(&self, ctx: &MessageContext) -> Result<Arc<dyn Actor>> {
        let id = ctx.target_id();
        match self.placement.place(ctx) {
            Placement::Local => {}
            remote @ Placement::Remote { .. } => {
                return Err(RuntimeError::Manager(format!(
                    "entity {id} placed at {remote}, only local placement is served"
                )));
            }
        }

        let actor = self.factory.create(ctx, &self.env).await?;
        tracing::info!(entity_id = %id, "actor created");

        let resident = self
            .actors
            .write()
            .entry(id.to_string())
            .or_insert(actor)
            .clone();
        Ok(resident)
    }

    fn schedule(&self, actor: Arc<dyn Actor>) {
        let workers = self.workers.clone();
        tokio::spawn(async move {
            let Ok(_permit) = workers.acquire_owned().await else {
                tracing::warn!(entity_id = %actor.id(), "worker pool closed");
                return;
            };
            actor.run().await;
        });
    }
}

/// Routes messages to actors, creating them on demand
pub struct EntityManager {
    shared: Arc<Shared>,
    handle: ManagerHandle,
    config: RuntimeConfig,
    inbound: Mutex<Option<mpsc::Receiver<MessageContext>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    graph: Mutex<MapperGraph>,
}

impl EntityManager {
    /// Manager with default collaborators
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        EntityManagerBuilder::new().config(config).build()
    }

    pub fn builder() -> EntityManagerBuilder {
        EntityManagerBuilder::new()
    }

    /// Spawn the dispatch loop. Fails if it was already started.
    pub fn start(&self) -> Result<()> {
        let inbound = self
            .inbound
            .lock()
            .take()
            .ok_or_else(|| RuntimeError::Manager("manager already started".to_string()))?;

        let shared = self.shared.clone();
        let task = tokio::spawn(dispatch_loop(shared, inbound));
        *self.task.lock() = Some(task);
        tracing::info!(
            queue_capacity = self.config.queue_capacity,
            worker_pool_size = self.config.worker_pool_size,
            "entity manager started"
        );
        Ok(())
    }

    /// Stop the dispatch loop and wait for it to exit.
    ///
    /// Workers already running finish on their own.
    pub async fn shutdown(&self) {
        self.shared.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                tracing::error!(error = %err, "dispatch loop panicked");
            }
        }
    }

    /// Fire-and-forget submission
    pub async fn send_msg(&self, ctx: MessageContext) {
        self.handle.send_msg(ctx).await
    }

    pub fn handle(&self) -> ManagerHandle {
        self.handle.clone()
    }

    /// Validate a mapper against the dependency graph and install it on its
    /// target entity
    pub async fn append_mapper(&self, mapper: Mapper) -> Result<()> {
        self.graph.lock().insert(&mapper)?;
        tracing::info!(
            mapper_id = %mapper.id,
            target_id = %mapper.target_entity,
            "appending mapper"
        );

        let ctx = MessageContext::new(
            mapper.target_entity.clone(),
            MapperMsg {
                op: MapperOp::Append,
                mapper,
            },
        )
        .with_state_type(STATE_TYPE_ENTITY);
        self.send_msg(ctx).await;
        Ok(())
    }

    /// Uninstall a mapper from `target`. Returns whether it was registered.
    pub async fn remove_mapper(&self, target: &str, mapper_id: &str) -> bool {
        let known = self.graph.lock().remove(target, mapper_id);
        if !known {
            tracing::debug!(mapper_id, target_id = target, "removing unregistered mapper");
        }

        let ctx = MessageContext::new(
            target,
            MapperMsg {
                op: MapperOp::Remove,
                mapper: Mapper::new(mapper_id, target),
            },
        );
        self.send_msg(ctx).await;
        known
    }

    /// Resident actor for `id`
    pub fn entity(&self, id: &str) -> Option<Arc<dyn Actor>> {
        self.shared.resident(id)
    }

    /// Ids of resident actors, sorted
    pub fn entity_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.shared.actors.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            resident: self.shared.actors.read().len(),
            dispatched: self.shared.counters.dispatched.load(Ordering::Relaxed),
            dropped: self.shared.counters.dropped.load(Ordering::Relaxed),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }
}

async fn dispatch_loop(shared: Arc<Shared>, mut inbound: mpsc::Receiver<MessageContext>) {
    let mut pending: VecDeque<MessageContext> = VecDeque::new();

    loop {
        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            received = inbound.recv() => match received {
                Some(ctx) => {
                    pending.push_back(ctx);
                    while let Ok(ctx) = inbound.try_recv() {
                        pending.push_back(ctx);
                    }
                }
                None => break,
            },
        }

        while let Some(ctx) = pending.pop_front() {
            shared.dispatch(ctx).await;
        }
    }

    tracing::info!(pending = pending.len(), "dispatch loop stopped");
}

/// Builder wiring collaborators into an [`EntityManager`]
pub struct EntityManagerBuilder {
    config: RuntimeConfig,
    store: Arc<dyn EntityStore>,
    executor: Arc<dyn MapperExecutor>,
    publisher: Arc<dyn Publisher>,
    factory: Option<Arc<dyn ActorFactory>>,
    placement: Arc<dyn PlacementStrategy>,
}

impl Default for EntityManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityManagerBuilder {
    pub fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
            store: Arc::new(NoopStore),
            executor: Arc::new(NoopExecutor),
            publisher: Arc::new(LogPublisher),
            factory: None,
            placement: Arc::new(LocalPlacement),
        }
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Store consulted by the default factory
    pub fn store(mut self, store: Arc<dyn EntityStore>) -> Self {
        self.store = store;
        self
    }

    pub fn executor(mut self, executor: Arc<dyn MapperExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = publisher;
        self
    }

    /// Replace the default [`LocalFactory`]
    pub fn factory(mut self, factory: Arc<dyn ActorFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn placement(mut self, placement: Arc<dyn PlacementStrategy>) -> Self {
        self.placement = placement;
        self
    }

    pub fn build(self) -> Result<EntityManager> {
        self.config.validate()?;

        let (sender, inbound) = mpsc::channel(self.config.queue_capacity);
        let handle = ManagerHandle { sender };
        let factory: Arc<dyn ActorFactory> = match self.factory {
            Some(factory) => factory,
            None => Arc::new(LocalFactory::new(self.store)),
        };

        let env = ActorEnv {
            dispatcher: Arc::new(handle.clone()),
            executor: self.executor,
            publisher: self.publisher,
            config: self.config.clone(),
        };

        let shared = Arc::new(Shared {
            actors: RwLock::new(HashMap::new()),
            factory,
            placement: self.placement,
            env,
            workers: Arc::new(Semaphore::new(self.config.worker_pool_size)),
            counters: Counters::default(),
            cancel: CancellationToken::new(),
        });

        Ok(EntityManager {
            shared,
            handle,
            config: self.config,
            inbound: Mutex::new(Some(inbound)),
            task: Mutex::new(None),
            graph: Mutex::new(MapperGraph::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::EntityMsg;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::time::Duration;

    async fn eventually<F: Fn() -> bool>(check: F) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    fn update(target: &str, key: &str, value: serde_json::Value) -> MessageContext {
        MessageContext::new(
            target,
            EntityMsg {
                source_id: String::new(),
                values: [(key.to_string(), value)].into_iter().collect(),
            },
        )
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let manager = EntityManager::new(RuntimeConfig::default()).unwrap();
        manager.start().unwrap();
        assert!(matches!(manager.start(), Err(RuntimeError::Manager(_))));
        manager.shutdown().await;
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = RuntimeConfig {
            worker_pool_size: 0,
            ..RuntimeConfig::default()
        };
        assert!(matches!(
            EntityManager::new(config),
            Err(RuntimeError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_lazy_creation() {
        let manager = EntityManager::new(RuntimeConfig::default()).unwrap();
        manager.start().unwrap();
        manager.send_msg(update("device1", "temp", json!(20))).await;

        assert!(
            eventually(|| {
                manager
                    .entity("device1")
                    .and_then(|a| a.entity().get_property("temp"))
                    == Some(json!(20))
            })
            .await
        );
        assert_eq!(manager.entity_ids(), vec!["device1"]);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_construction_failure_drops_message() {
        let store = Arc::new(MemoryStore::new());
        store.mark_unavailable("broken");
        let manager = EntityManager::builder().store(store).build().unwrap();
        manager.start().unwrap();

        manager.send_msg(update("broken", "temp", json!(1))).await;
        manager.send_msg(update("device1", "temp", json!(2))).await;

        assert!(eventually(|| manager.entity("device1").is_some()).await);
        assert!(manager.entity("broken").is_none());
        let stats = manager.stats();
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.resident, 1);
        manager.shutdown().await;
    }

    struct RemotePlacement;

    impl PlacementStrategy for RemotePlacement {
        fn place(&self, _ctx: &MessageContext) -> Placement {
            Placement::Remote { node: "n2".into() }
        }
    }

    #[tokio::test]
    async fn test_remote_placement_is_dropped() {
        let manager = EntityManager::builder()
            .placement(Arc::new(RemotePlacement))
            .build()
            .unwrap();
        manager.start().unwrap();
        manager.send_msg(update("device1", "temp", json!(1))).await;

        assert!(eventually(|| manager.stats().dropped == 1).await);
        assert!(manager.entity_ids().is_empty());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_routing() {
        let manager = EntityManager::new(RuntimeConfig::default()).unwrap();
        manager.start().unwrap();
        manager.shutdown().await;

        manager.send_msg(update("device1", "temp", json!(1))).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(manager.entity("device1").is_none());
    }

    #[tokio::test]
    async fn test_cyclic_mapper_rejected_before_delivery() {
        let manager = EntityManager::new(RuntimeConfig::default()).unwrap();
        manager
            .append_mapper(Mapper::new("m1", "b").with_source("a", ["x"]))
            .await
            .unwrap();
        let err = manager
            .append_mapper(Mapper::new("m2", "a").with_source("b", ["y"]))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Mapper(_)));
    }
}
