//! Actor abstractions
//!
//! - [`Actor`]: an addressable unit the manager routes messages to
//! - [`Entity`]: the digital-twin state machine every actor is built on
//! - [`Subscription`]: an entity variant forwarding observed updates to a
//!   [`Publisher`]
//! - [`Dispatcher`]: the path propagated messages take back to the manager
//! - [`ActorFactory`]: constructs actors during rebalance

mod entity;
mod subscription;

pub use entity::{Entity, EntitySnapshot};
pub use subscription::{
    LogPublisher, Publisher, Subscription, SubscriptionMode, SubscriptionSettings,
};

use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::mapper::MapperExecutor;
use crate::message::{MessageContext, STATE_TYPE_ENTITY, STATE_TYPE_SUBSCRIPTION};
use crate::store::{EntityRecord, EntityStore};
use async_trait::async_trait;
use std::sync::Arc;

/// An actor resident in the manager
///
/// Delivery and processing are split: [`Actor::deliver`] only queues, and
/// returns `true` when the caller must schedule [`Actor::run`] on a worker.
/// At most one `run` is scheduled per actor at a time.
#[async_trait]
pub trait Actor: Send + Sync {
    fn id(&self) -> &str;

    /// Queue a message. Returns `true` when the actor just became attached.
    fn deliver(&self, ctx: MessageContext) -> bool;

    /// Drain the mailbox until it is empty, then detach
    async fn run(&self);

    /// The entity state backing this actor
    fn entity(&self) -> &Entity;
}

/// Sink for messages emitted while processing
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Fire-and-forget submission
    async fn send_msg(&self, ctx: MessageContext);
}

/// Collaborators shared by every actor of one manager
#[derive(Clone)]
pub struct ActorEnv {
    pub dispatcher: Arc<dyn Dispatcher>,
    pub executor: Arc<dyn MapperExecutor>,
    pub publisher: Arc<dyn Publisher>,
    pub config: RuntimeConfig,
}

/// Builds actors for ids that are not resident yet
#[async_trait]
pub trait ActorFactory: Send + Sync {
    async fn create(&self, ctx: &MessageContext, env: &ActorEnv) -> Result<Arc<dyn Actor>>;
}

/// Factory that builds actors in this process, hydrating base fields from a store
pub struct LocalFactory {
    store: Arc<dyn EntityStore>,
}

impl LocalFactory {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ActorFactory for LocalFactory {
    async fn create(&self, ctx: &MessageContext, env: &ActorEnv) -> Result<Arc<dyn Actor>> {
        let id = ctx.target_id();
        if id.is_empty() {
            return Err(RuntimeError::Construction {
                id: String::new(),
                reason: "empty target id".to_string(),
            });
        }

        let mut record = self
            .store
            .load(id)
            .await?
            .unwrap_or_else(|| EntityRecord::new(id, ctx.headers.state_type.clone()));
        if record.kind.is_empty() {
            record.kind = if ctx.headers.state_type.is_empty() {
                STATE_TYPE_ENTITY.to_string()
            } else {
                ctx.headers.state_type.clone()
            };
        }
        if record.owner.is_empty() {
            record.owner = ctx.headers.owner_id.clone();
        }

        match record.kind.as_str() {
            STATE_TYPE_ENTITY => Ok(Arc::new(Entity::new(&record, env.clone()))),
            STATE_TYPE_SUBSCRIPTION => Ok(Arc::new(Subscription::new(&record, env.clone()))),
            other => Err(RuntimeError::Construction {
                id: id.to_string(),
                reason: format!("unknown state type {other:?}"),
            }),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording collaborators for actor tests

    use super::*;
    use crate::mapper::NoopExecutor;
    use parking_lot::Mutex;

    #[derive(Default)]
    pub struct RecordingDispatcher {
        pub sent: Mutex<Vec<MessageContext>>,
    }

    impl RecordingDispatcher {
        pub fn take(&self) -> Vec<MessageContext> {
            std::mem::take(&mut *self.sent.lock())
        }
    }

    #[async_trait]
    impl Dispatcher for RecordingDispatcher {
        async fn send_msg(&self, ctx: MessageContext) {
            self.sent.lock().push(ctx);
        }
    }

    pub fn env(dispatcher: Arc<RecordingDispatcher>) -> ActorEnv {
        ActorEnv {
            dispatcher,
            executor: Arc::new(NoopExecutor),
            publisher: Arc::new(LogPublisher),
            config: RuntimeConfig::default(),
        }
    }
}
