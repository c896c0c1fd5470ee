//! twinrt - digital-twin entity runtime
//!
//! Each real-world thing is an addressable actor holding versioned
//! properties. Mappers declare that properties of one entity are computed
//! from properties of others; the runtime propagates changes along the
//! resulting dependency edges (tentacles), including cyclic and
//! self-referential ones, without deadlocking.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        EntityManager                         │
//! │  send_msg ─► inbound queue ─► dispatch loop ─► rebalance     │
//! │                                    │        (placement,      │
//! │                                    │         factory, store) │
//! │                                    ▼                         │
//! │            ┌──────────────────────────────────────┐          │
//! │            │ worker pool                          │          │
//! │            │  ┌────────────┐    ┌────────────┐    │          │
//! │            │  │  Entity    │    │Subscription│ ...│          │
//! │            │  │ ┌────────┐ │    │ ┌────────┐ │    │          │
//! │            │  │ │Mailbox │ │    │ │Mailbox │ │    │          │
//! │            │  │ │ReEntry │ │    │ │ReEntry │ │    │          │
//! │            │  │ │ Lock   │ │    │ │ Lock   │ │    │          │
//! │            │  │ └────────┘ │    │ └────────┘ │    │          │
//! │            │  └─────┬──────┘    └─────┬──────┘    │          │
//! │            └────────┼─────────────────┼───────────┘          │
//! │                     │  propagated     │ Publisher            │
//! │                     └─ EntityMsg ─────┘                      │
//! │                        back to send_msg                      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Core Concepts
//!
//! ## Namespaces
//!
//! An entity stores properties per namespace. Its own namespace (keyed by
//! its own id) holds its properties; other namespaces cache values of the
//! entities its mappers watch.
//!
//! ## Tentacles
//!
//! A tentacle fires when a watched `entity#key` changes. A `ToEntity`
//! tentacle forwards the value to another entity; a `ToMapper` tentacle
//! runs the mapper through the configured [`MapperExecutor`].
//!
//! ## Causal chains
//!
//! Every message carries a [`RequestId`]. Messages emitted while processing
//! inherit it, and an actor's [`ReEntryLock`] lets the same chain nest
//! without blocking, up to a depth cap.
//!
//! # Example
//!
//! ```rust,no_run
//! use twinrt_core::{EntityManager, EntityMsg, Mapper, MessageContext, RuntimeConfig};
//!
//! # async fn demo() -> twinrt_core::Result<()> {
//! let manager = EntityManager::new(RuntimeConfig::default())?;
//! manager.start()?;
//!
//! manager
//!     .append_mapper(Mapper::new("calc1-m1", "calc1").with_source("device2", ["temp"]))
//!     .await?;
//!
//! let values = [("temp".to_string(), serde_json::json!(25))].into_iter().collect();
//! manager
//!     .send_msg(MessageContext::new("device2", EntityMsg { source_id: String::new(), values }))
//!     .await;
//! # Ok(())
//! # }
//! ```

pub mod actor;
pub mod config;
pub mod error;
pub mod lock;
pub mod mailbox;
pub mod manager;
pub mod mapper;
pub mod message;
pub mod store;
pub mod types;

pub use actor::{
    Actor, ActorEnv, ActorFactory, Dispatcher, Entity, EntitySnapshot, LocalFactory, LogPublisher,
    Publisher, Subscription, SubscriptionMode, SubscriptionSettings,
};
pub use config::{ConfigError, RuntimeConfig};
pub use error::{LockError, MailboxError, MapperError, Result, RuntimeError, StoreError};
pub use lock::{ReEntryGuard, ReEntryLock};
pub use mailbox::Mailbox;
pub use manager::{
    EntityManager, EntityManagerBuilder, LocalPlacement, ManagerHandle, ManagerStats, Placement,
    PlacementStrategy,
};
pub use mapper::{
    merge_tentacles, FnExecutor, Mapper, MapperExecutor, MapperGraph, MapperInput, NoopExecutor,
    Tentacle, TentacleKind,
};
pub use message::{
    EntityMsg, Headers, MapperMsg, MapperOp, Message, MessageContext, TentacleMsg,
    STATE_TYPE_ENTITY, STATE_TYPE_SUBSCRIPTION,
};
pub use store::{EntityRecord, EntityStore, MemoryStore, NoopStore};
pub use types::{PropertyMap, RequestId, Value, WatchKey};
