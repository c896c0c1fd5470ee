//! Entity actor: one digital twin
//!
//! An entity keeps property namespaces keyed by entity id. Its own
//! namespace holds its own properties; the others cache values of remote
//! entities its mappers watch. Every change is turned into active
//! [`WatchKey`]s and looked up in the flat tentacle index:
//!
//! ```text
//!   EntityMsg ──► apply to namespace ──► active keys ──┬─► ToEntity  ─► EntityMsg to target
//!                                                      └─► ToMapper  ─► executor ─► own namespace
//!                                                                                     │
//!                                                          (re-enters, same request) ◄┘
//! ```
//!
//! The flat index is derived data, rebuilt from `index_tentacles` whenever an
//! edge changes. Mapper-derived edges are keyed by mapper id, edges installed
//! by a [`TentacleMsg`] are keyed by the remote entity id.

use super::{Actor, ActorEnv};
use crate::error::{LockError, MapperError, Result};
use crate::lock::ReEntryLock;
use crate::mailbox::Mailbox;
use crate::mapper::{merge_tentacles, Mapper, MapperInput, Tentacle, TentacleKind};
use crate::message::{EntityMsg, MapperMsg, MapperOp, Message, MessageContext, TentacleMsg};
use crate::store::EntityRecord;
use crate::types::{unix_millis, PropertyMap, RequestId, Value, WatchKey};
use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
struct EntityState {
    kind: String,
    owner: String,
    source: String,
    version: i64,
    last_time: i64,
    properties: HashMap<String, PropertyMap>,
    mappers: BTreeMap<String, Mapper>,
    index_tentacles: HashMap<String, Vec<Tentacle>>,
    tentacles: HashMap<WatchKey, Vec<Tentacle>>,
}

/// Mappers to run after a change, with their inputs
type Triggered = Vec<(Mapper, MapperInput)>;

impl EntityState {
    /// Write `values` into `namespace` and return the active keys
    fn apply(&mut self, self_id: &str, namespace: &str, values: PropertyMap) -> Vec<WatchKey> {
        let props = self.properties.entry(namespace.to_string()).or_default();
        let mut actives = Vec::with_capacity(values.len());
        for (key, value) in values {
            actives.push(WatchKey::new(namespace, key.as_str()));
            props.insert(key, value);
        }

        if namespace == self_id && !actives.is_empty() {
            self.touch();
        }
        actives.sort();
        actives
    }

    fn touch(&mut self) {
        self.version += 1;
        self.last_time = unix_millis();
    }

    fn collect_active(
        &self,
        self_id: &str,
        actives: &[WatchKey],
    ) -> (BTreeMap<String, PropertyMap>, Triggered) {
        let mut outbound: BTreeMap<String, PropertyMap> = BTreeMap::new();
        let mut mapper_ids = BTreeSet::new();
        let own = self.properties.get(self_id);

        for active in actives {
            let Some(tentacles) = self.tentacles.get(active) else {
                continue;
            };
            for tentacle in tentacles {
                match tentacle.kind() {
                    TentacleKind::ToMapper => {
                        mapper_ids.insert(tentacle.target_id());
                    }
                    TentacleKind::ToEntity => {
                        match own.and_then(|props| props.get(&active.property_key)) {
                            Some(value) => {
                                outbound
                                    .entry(tentacle.target_id().to_string())
                                    .or_default()
                                    .insert(active.property_key.clone(), value.clone());
                            }
                            None => tracing::warn!(
                                entity_id = %self_id,
                                property_key = %active.property_key,
                                "watched property has no value"
                            ),
                        }
                    }
                }
            }
        }

        let triggered = mapper_ids
            .into_iter()
            .filter_map(|id| self.mappers.get(id))
            .map(|mapper| (mapper.clone(), self.mapper_input(mapper)))
            .collect();
        (outbound, triggered)
    }

    fn mapper_input(&self, mapper: &Mapper) -> MapperInput {
        mapper
            .watch_keys()
            .into_iter()
            .filter_map(|key| {
                let value = self
                    .properties
                    .get(&key.entity_id)?
                    .get(&key.property_key)?
                    .clone();
                Some((key.to_string(), value))
            })
            .collect()
    }

    /// Replace the entity-bound edge toward `counterpart`; empty items remove it
    fn install_remote(&mut self, self_id: &str, counterpart: &str, items: &[String]) {
        let entry = self.index_tentacles.entry(counterpart.to_string()).or_default();
        let previous = entry
            .iter()
            .filter(|t| t.kind() == TentacleKind::ToEntity)
            .map(Tentacle::version)
            .max()
            .unwrap_or(0);
        entry.retain(|t| t.kind() != TentacleKind::ToEntity);

        if !items.is_empty() {
            let watched = items.iter().map(|key| WatchKey::new(self_id, key.as_str())).collect();
            let tentacle = Tentacle::to_entity(counterpart, watched).with_version(previous);
            entry.extend(merge_tentacles([&tentacle]));
        }
        if entry.is_empty() {
            self.index_tentacles.remove(counterpart);
        }
        self.rebuild_tentacles();
    }

    /// Recompute every mapper-bound edge from the registered mappers
    fn rebuild_mapper_index(&mut self) {
        for tentacles in self.index_tentacles.values_mut() {
            tentacles.retain(|t| t.kind() != TentacleKind::ToMapper);
        }
        for mapper in self.mappers.values() {
            self.index_tentacles
                .entry(mapper.id.clone())
                .or_default()
                .push(mapper.tentacle());
        }
        self.index_tentacles.retain(|_, tentacles| !tentacles.is_empty());
        self.rebuild_tentacles();
    }

    fn rebuild_tentacles(&mut self) {
        self.tentacles.clear();
        for tentacles in self.index_tentacles.values() {
            for tentacle in tentacles {
                for item in tentacle.items() {
                    self.tentacles
                        .entry(item.clone())
                        .or_default()
                        .push(tentacle.clone());
                }
            }
        }
    }

    /// Keys of `source` that this entity's mappers watch, merged and sorted
    fn watched_on(&self, self_id: &str, source: &str) -> Vec<String> {
        let requests: Vec<Tentacle> = self
            .mappers
            .values()
            .map(|mapper| {
                let keys = mapper
                    .keys_for(source)
                    .iter()
                    .map(|key| WatchKey::new(source, key.as_str()))
                    .collect();
                Tentacle::to_entity(self_id, keys).with_version(mapper.version)
            })
            .collect();

        merge_tentacles(&requests)
            .map(|merged| merged.property_keys())
            .unwrap_or_default()
    }
}

/// Serializable view of an entity
#[derive(Debug, Clone, Serialize)]
pub struct EntitySnapshot {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub owner: String,
    pub source: String,
    pub version: i64,
    pub last_time: i64,
    pub properties: BTreeMap<String, BTreeMap<String, Value>>,
    pub mappers: Vec<String>,
}

/// Actor holding one twin's state
pub struct Entity {
    id: String,
    lock: ReEntryLock,
    state: Mutex<EntityState>,
    mailbox: Mailbox<MessageContext>,
    attached: AtomicBool,
    env: ActorEnv,
}

impl Entity {
    /// Build an entity from a record. Only base fields are taken from it;
    /// the own namespace always starts empty.
    pub fn new(record: &EntityRecord, env: ActorEnv) -> Self {
        let mut properties = HashMap::new();
        properties.insert(record.id.clone(), PropertyMap::new());

        let state = EntityState {
            kind: record.kind.clone(),
            owner: record.owner.clone(),
            source: record.source.clone(),
            version: record.version,
            last_time: record.last_time,
            properties,
            ..EntityState::default()
        };

        Self {
            id: record.id.clone(),
            lock: ReEntryLock::new(env.config.max_stack_depth),
            state: Mutex::new(state),
            mailbox: Mailbox::new(env.config.mailbox_capacity.max(1)),
            attached: AtomicBool::new(false),
            env,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> String {
        self.state.lock().kind.clone()
    }

    pub fn owner(&self) -> String {
        self.state.lock().owner.clone()
    }

    pub fn source(&self) -> String {
        self.state.lock().source.clone()
    }

    pub fn version(&self) -> i64 {
        self.state.lock().version
    }

    /// Unix millis of the last own-property change
    pub fn last_time(&self) -> i64 {
        self.state.lock().last_time
    }

    pub fn get_property(&self, key: &str) -> Option<Value> {
        self.state
            .lock()
            .properties
            .get(&self.id)
            .and_then(|props| props.get(key))
            .cloned()
    }

    /// Copy of the own namespace
    pub fn get_all_properties(&self) -> PropertyMap {
        self.state
            .lock()
            .properties
            .get(&self.id)
            .cloned()
            .unwrap_or_default()
    }

    /// Copy of a cached namespace, own or remote
    pub fn namespace(&self, id: &str) -> Option<PropertyMap> {
        self.state.lock().properties.get(id).cloned()
    }

    pub async fn set_property(&self, key: impl Into<String>, value: Value) -> Result<()> {
        self.set_properties(PropertyMap::from([(key.into(), value)]))
            .await
    }

    /// Write own properties without propagating them
    pub async fn set_properties(&self, values: PropertyMap) -> Result<()> {
        let _guard = self.lock.lock(&RequestId::new()).await?;
        self.state.lock().apply(&self.id, &self.id, values);
        Ok(())
    }

    pub async fn delete_property(&self, key: &str) -> Result<Option<Value>> {
        let _guard = self.lock.lock(&RequestId::new()).await?;
        let mut state = self.state.lock();
        let removed = state
            .properties
            .get_mut(&self.id)
            .and_then(|props| props.remove(key));
        if removed.is_some() {
            state.touch();
        }
        Ok(removed)
    }

    pub fn get_mapper(&self, id: &str) -> Option<Mapper> {
        self.state.lock().mappers.get(id).cloned()
    }

    /// Registered mappers, ordered by id
    pub fn get_mappers(&self) -> Vec<Mapper> {
        self.state.lock().mappers.values().cloned().collect()
    }

    /// Tentacles fired by a change of `key`
    pub fn tentacles_for(&self, key: &WatchKey) -> Vec<Tentacle> {
        self.state
            .lock()
            .tentacles
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// Counterparts (entity or mapper ids) with an installed edge, sorted
    pub fn counterparts(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.lock().index_tentacles.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Register a mapper targeting this entity and announce the watched
    /// keys to each of its sources
    pub async fn set_mapper(&self, mapper: Mapper) -> Result<()> {
        let request = RequestId::new();
        let _guard = self.lock.lock(&request).await?;
        self.install_mapper(&request, mapper).await
    }

    /// Unregister a mapper and re-announce the remaining watched keys to its
    /// former sources
    pub async fn remove_mapper(&self, mapper_id: &str) -> Result<Option<Mapper>> {
        let request = RequestId::new();
        let _guard = self.lock.lock(&request).await?;
        self.uninstall_mapper(&request, mapper_id).await
    }

    /// Process one message under the reentrant lock of its request
    pub async fn invoke_msg(&self, ctx: MessageContext) -> Result<()> {
        let request = ctx.headers.request_id.clone().unwrap_or_default();
        let hops = ctx.headers.hops;
        let _guard = self.lock.lock(&request).await?;

        match ctx.message {
            Message::Entity(msg) => self.invoke_entity_msg(&request, hops, msg).await,
            Message::Tentacle(msg) => {
                self.invoke_tentacle_msg(msg);
                Ok(())
            }
            Message::Mapper(msg) => self.invoke_mapper_msg(&request, msg).await,
        }
    }

    pub fn snapshot(&self) -> EntitySnapshot {
        let state = self.state.lock();
        EntitySnapshot {
            id: self.id.clone(),
            kind: state.kind.clone(),
            owner: state.owner.clone(),
            source: state.source.clone(),
            version: state.version,
            last_time: state.last_time,
            properties: state
                .properties
                .iter()
                .map(|(ns, props)| {
                    let sorted: BTreeMap<String, Value> =
                        props.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                    (ns.clone(), sorted)
                })
                .collect(),
            mappers: state.mappers.keys().cloned().collect(),
        }
    }

    pub(crate) fn reentry_lock(&self) -> &ReEntryLock {
        &self.lock
    }

    pub(crate) fn env(&self) -> &ActorEnv {
        &self.env
    }

    /// Cache `values` under `namespace` without touching tentacles
    pub(crate) fn cache(&self, namespace: &str, values: PropertyMap) {
        self.state.lock().apply(&self.id, namespace, values);
    }

    /// Replace the entity-bound edge toward `counterpart`
    pub(crate) fn install_tentacle(&self, counterpart: &str, items: &[String]) {
        self.state.lock().install_remote(&self.id, counterpart, items);
    }

    /// Queue a message, growing the mailbox up to its configured bound.
    /// Returns `true` when this call attached the actor.
    pub(crate) fn enqueue(&self, ctx: MessageContext) -> bool {
        let capacity = self.mailbox.capacity();
        if self.mailbox.size() >= capacity {
            let max = self.env.config.mailbox_max_capacity;
            if capacity >= max {
                tracing::warn!(
                    entity_id = %self.id,
                    capacity,
                    kind = ctx.message.kind(),
                    "mailbox full, dropping message"
                );
                return false;
            }
            let grown = capacity.saturating_mul(2).min(max);
            if let Err(err) = self.mailbox.resize(grown) {
                tracing::warn!(entity_id = %self.id, error = %err, "mailbox resize failed");
                return false;
            }
            tracing::debug!(entity_id = %self.id, capacity = grown, "mailbox grown");
        }

        if let Err(err) = self.mailbox.put(ctx) {
            tracing::warn!(entity_id = %self.id, error = %err, "dropping message");
            return false;
        }

        self.attached
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Next queued message, detaching when the mailbox is empty
    pub(crate) fn next_message(&self) -> Option<MessageContext> {
        loop {
            if let Some(ctx) = self.mailbox.get() {
                return Some(ctx);
            }

            self.attached.store(false, Ordering::Release);
            if self.mailbox.is_empty() {
                return None;
            }
            // A late arrival saw us attached; take it back unless a new
            // worker was already scheduled.
            if self
                .attached
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return None;
            }
        }
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    async fn invoke_entity_msg(&self, request: &RequestId, hops: usize, msg: EntityMsg) -> Result<()> {
        let namespace = if msg.source_id.is_empty() {
            self.id.clone()
        } else {
            msg.source_id
        };

        let actives = self.state.lock().apply(&self.id, &namespace, msg.values);
        tracing::debug!(
            entity_id = %self.id,
            request_id = %request,
            namespace = %namespace,
            changed = actives.len(),
            "applied entity message"
        );
        self.activate(request, hops, actives).await
    }

    fn invoke_tentacle_msg(&self, msg: TentacleMsg) {
        if msg.target_id.is_empty() {
            tracing::warn!(entity_id = %self.id, "ignoring tentacle with empty target");
            return;
        }
        if msg.target_id == self.id {
            return;
        }
        tracing::debug!(
            entity_id = %self.id,
            target_id = %msg.target_id,
            items = msg.items.len(),
            "installing tentacle"
        );
        self.install_tentacle(&msg.target_id, &msg.items);
    }

    async fn invoke_mapper_msg(&self, request: &RequestId, msg: MapperMsg) -> Result<()> {
        match msg.op {
            MapperOp::Append => self.install_mapper(request, msg.mapper).await,
            MapperOp::Remove => self
                .uninstall_mapper(request, &msg.mapper.id)
                .await
                .map(|_| ()),
        }
    }

    async fn install_mapper(&self, request: &RequestId, mapper: Mapper) -> Result<()> {
        mapper.validate()?;
        if mapper.target_entity != self.id {
            return Err(MapperError::Invalid(format!(
                "mapper {} targets {}, not {}",
                mapper.id, mapper.target_entity, self.id
            ))
            .into());
        }

        let mut sources: BTreeSet<String> = mapper.source_entities().into_iter().collect();
        {
            let mut state = self.state.lock();
            if let Some(previous) = state.mappers.get(&mapper.id) {
                sources.extend(previous.source_entities());
            }
            tracing::info!(entity_id = %self.id, mapper_id = %mapper.id, "mapper installed");
            state.mappers.insert(mapper.id.clone(), mapper);
            state.rebuild_mapper_index();
        }

        self.announce(request, sources).await;
        Ok(())
    }

    async fn uninstall_mapper(&self, request: &RequestId, mapper_id: &str) -> Result<Option<Mapper>> {
        let removed = {
            let mut state = self.state.lock();
            let removed = state.mappers.remove(mapper_id);
            if removed.is_some() {
                state.rebuild_mapper_index();
            }
            removed
        };

        match &removed {
            Some(mapper) => {
                tracing::info!(entity_id = %self.id, mapper_id = %mapper_id, "mapper removed");
                self.announce(request, mapper.source_entities()).await;
            }
            None => tracing::debug!(entity_id = %self.id, mapper_id = %mapper_id, "no such mapper"),
        }
        Ok(removed)
    }

    /// Send each source the merged keys this entity needs from it
    async fn announce(&self, request: &RequestId, sources: impl IntoIterator<Item = String>) {
        let announcements: Vec<(String, Vec<String>)> = {
            let state = self.state.lock();
            sources
                .into_iter()
                .map(|source| {
                    let items = state.watched_on(&self.id, &source);
                    (source, items)
                })
                .collect()
        };

        for (source, items) in announcements {
            let msg = TentacleMsg {
                target_id: self.id.clone(),
                items,
            };
            let ctx = MessageContext::new(source, msg)
                .with_source(self.id.clone())
                .with_request(request.clone());
            self.env.dispatcher.send_msg(ctx).await;
        }
    }

    /// Fire the tentacles of `actives`. Mapper outputs land in the own
    /// namespace and are activated again one lock level deeper.
    ///
    /// `hops` counts the entity-to-entity forwards that led here. Forwarding
    /// past the stack depth cap is dropped, which bounds cycles that span
    /// several entities and so never nest a single lock.
    fn activate<'a>(
        &'a self,
        request: &'a RequestId,
        hops: usize,
        actives: Vec<WatchKey>,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            if actives.is_empty() {
                return Ok(());
            }
            let (mut outbound, triggered) = self.state.lock().collect_active(&self.id, &actives);

            let max = self.lock.max_stack_depth();
            if hops + 1 > max && !outbound.is_empty() {
                tracing::warn!(
                    entity_id = %self.id,
                    request_id = %request,
                    hops,
                    error = %LockError::MaxStackDepthExceeded { max },
                    "dropping propagation"
                );
                outbound.clear();
            }

            for (target_id, values) in outbound {
                if target_id == self.id {
                    tracing::warn!(entity_id = %self.id, "skipping propagation addressed to self");
                    continue;
                }
                let msg = EntityMsg {
                    source_id: self.id.clone(),
                    values,
                };
                let ctx = MessageContext::new(target_id, msg)
                    .with_source(self.id.clone())
                    .with_request(request.clone())
                    .with_hops(hops + 1);
                self.env.dispatcher.send_msg(ctx).await;
            }

            for (mapper, input) in triggered {
                let output = match self.env.executor.execute(&mapper, &input) {
                    Ok(output) => output,
                    Err(err) => {
                        tracing::warn!(
                            entity_id = %self.id,
                            mapper_id = %mapper.id,
                            error = %err,
                            "mapper execution failed"
                        );
                        continue;
                    }
                };
                if output.is_empty() {
                    continue;
                }

                let Some(_nested) = self.lock.try_reenter(request)? else {
                    tracing::warn!(
                        entity_id = %self.id,
                        mapper_id = %mapper.id,
                        "mapper activated outside its request"
                    );
                    continue;
                };
                let next = self.state.lock().apply(&self.id, &self.id, output);
                self.activate(request, hops, next).await?;
            }
            Ok(())
        }
        .boxed()
    }
}

#[async_trait]
impl Actor for Entity {
    fn id(&self) -> &str {
        &self.id
    }

    fn deliver(&self, ctx: MessageContext) -> bool {
        self.enqueue(ctx)
    }

    async fn run(&self) {
        while let Some(ctx) = self.next_message() {
            let kind = ctx.message.kind();
            let request_id = ctx.headers.request_id.clone().unwrap_or_default();
            if let Err(err) = self.invoke_msg(ctx).await {
                tracing::error!(
                    entity_id = %self.id,
                    request_id = %request_id,
                    kind,
                    error = %err,
                    "message processing failed"
                );
            }
        }
        tracing::trace!(entity_id = %self.id, "entity detached");
    }

    fn entity(&self) -> &Entity {
        self
    }
}
