//! Subscription actor
//!
//! A subscription is an entity that watches a set of keys on one source
//! entity and republishes every update it receives to a pub/sub topic. It
//! installs its edge on the source by announcing a [`TentacleMsg`] the first
//! time it runs. Settings come from the construction record's properties.

use super::{Actor, ActorEnv, Entity};
use crate::error::{Result, RuntimeError};
use crate::message::{Message, MessageContext, TentacleMsg};
use crate::store::EntityRecord;
use crate::types::{PropertyMap, RequestId, Value};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Delivery mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionMode {
    #[default]
    Undefined,
    /// Forward every update
    Realtime,
    /// Forward every update; batching happens downstream
    Period,
    /// Forward only values that differ from the last one seen
    Changed,
}

/// Subscription parameters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionSettings {
    pub mode: SubscriptionMode,
    /// Entity being watched
    pub source: String,
    /// Consumer the published events are meant for
    pub target: String,
    /// Watched property keys on `source`
    pub filter: Vec<String>,
    pub topic: String,
    pub pubsub_name: String,
}

impl SubscriptionSettings {
    pub fn from_properties(props: &PropertyMap) -> std::result::Result<Self, serde_json::Error> {
        let object: serde_json::Map<String, Value> =
            props.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        serde_json::from_value(Value::Object(object))
    }

    /// Active only when every field is set
    pub fn is_active(&self) -> bool {
        self.mode != SubscriptionMode::Undefined
            && !self.source.is_empty()
            && !self.target.is_empty()
            && !self.filter.is_empty()
            && !self.topic.is_empty()
            && !self.pubsub_name.is_empty()
    }
}

/// Pub/sub sink for subscription events
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, pubsub_name: &str, topic: &str, payload: Vec<u8>) -> Result<()>;
}

/// Publisher that only logs
#[derive(Debug, Clone, Copy, Default)]
pub struct LogPublisher;

#[async_trait]
impl Publisher for LogPublisher {
    async fn publish(&self, pubsub_name: &str, topic: &str, payload: Vec<u8>) -> Result<()> {
        tracing::info!(
            pubsub_name,
            topic,
            payload = %String::from_utf8_lossy(&payload),
            "publish"
        );
        Ok(())
    }
}

pub struct Subscription {
    entity: Entity,
    settings: SubscriptionSettings,
    announced: AtomicBool,
    last_seen: Mutex<PropertyMap>,
}

impl Subscription {
    pub fn new(record: &EntityRecord, env: ActorEnv) -> Self {
        let settings = match SubscriptionSettings::from_properties(&record.properties) {
            Ok(settings) => settings,
            Err(err) => {
                tracing::warn!(entity_id = %record.id, error = %err, "invalid subscription settings");
                SubscriptionSettings::default()
            }
        };
        if !settings.is_active() {
            tracing::warn!(entity_id = %record.id, "subscription inactive");
        }

        Self {
            entity: Entity::new(record, env),
            settings,
            announced: AtomicBool::new(false),
            last_seen: Mutex::new(PropertyMap::new()),
        }
    }

    pub fn settings(&self) -> &SubscriptionSettings {
        &self.settings
    }

    pub fn is_active(&self) -> bool {
        self.settings.is_active()
    }

    /// Ask the source to forward the watched keys
    async fn setup(&self) {
        if !self.is_active() || self.announced.swap(true, Ordering::AcqRel) {
            return;
        }

        let msg = TentacleMsg {
            target_id: self.entity.id().to_string(),
            items: self.settings.filter.clone(),
        };
        let ctx = MessageContext::new(self.settings.source.clone(), msg)
            .with_source(self.entity.id().to_string());
        self.entity.env().dispatcher.send_msg(ctx).await;
    }

    async fn invoke_msg(&self, ctx: MessageContext) -> Result<()> {
        let request = ctx.headers.request_id.clone().unwrap_or_default();
        let _guard = self.entity.reentry_lock().lock(&request).await?;

        match ctx.message {
            Message::Entity(msg) => {
                let namespace = if msg.source_id.is_empty() {
                    self.entity.id().to_string()
                } else {
                    msg.source_id
                };
                self.entity.cache(&namespace, msg.values.clone());
                if self.is_active() {
                    self.forward(&request, msg.values).await?;
                }
                Ok(())
            }
            Message::Tentacle(_) => Ok(()),
            other => Err(RuntimeError::UnknownMessage {
                id: self.entity.id().to_string(),
                kind: other.kind(),
            }),
        }
    }

    async fn forward(&self, request: &RequestId, values: PropertyMap) -> Result<()> {
        let mut selected: BTreeMap<String, Value> = values
            .into_iter()
            .filter(|(key, _)| self.settings.filter.contains(key))
            .collect();

        if self.settings.mode == SubscriptionMode::Changed {
            let mut last_seen = self.last_seen.lock();
            selected.retain(|key, value| last_seen.get(key) != Some(&*value));
            for (key, value) in &selected {
                last_seen.insert(key.clone(), value.clone());
            }
        }
        if selected.is_empty() {
            return Ok(());
        }

        let payload = serde_json::to_vec(&selected).map_err(|err| RuntimeError::Publish {
            topic: self.settings.topic.clone(),
            reason: err.to_string(),
        })?;
        tracing::debug!(
            entity_id = %self.entity.id(),
            request_id = %request,
            topic = %self.settings.topic,
            keys = selected.len(),
            "publishing subscription event"
        );
        self.entity
            .env()
            .publisher
            .publish(&self.settings.pubsub_name, &self.settings.topic, payload)
            .await
    }
}

#[async_trait]
impl Actor for Subscription {
    fn id(&self) -> &str {
        self.entity.id()
    }

    fn deliver(&self, ctx: MessageContext) -> bool {
        self.entity.enqueue(ctx)
    }

    async fn run(&self) {
        self.setup().await;
        while let Some(ctx) = self.entity.next_message() {
            let kind = ctx.message.kind();
            if let Err(err) = self.invoke_msg(ctx).await {
                tracing::error!(
                    entity_id = %self.entity.id(),
                    kind,
                    error = %err,
                    "subscription message failed"
                );
            }
        }
    }

    fn entity(&self) -> &Entity {
        &self.entity
    }
}
