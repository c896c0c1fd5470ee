//! Messages exchanged between the manager and actors
//!
//! Everything that reaches an actor is a [`MessageContext`]: routing headers
//! plus one [`Message`]. Propagated property updates re-enter the manager as
//! ordinary messages, so there is no separate intra-runtime wire format.

use crate::mapper::Mapper;
use crate::types::{PropertyMap, RequestId};
use serde::{Deserialize, Serialize};

/// State type of a plain entity actor
pub const STATE_TYPE_ENTITY: &str = "entity";
/// State type of a subscription actor
pub const STATE_TYPE_SUBSCRIPTION: &str = "subscription";

/// Routing headers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Headers {
    /// Actor the message is addressed to
    pub target_id: String,
    #[serde(default)]
    pub owner_id: String,
    /// Actor variant to construct if the target is not resident
    #[serde(default)]
    pub state_type: String,
    /// Actor that emitted the message (empty for external callers)
    #[serde(default)]
    pub source_id: String,
    /// Causal-chain token; stamped by the manager when absent
    #[serde(default)]
    pub request_id: Option<RequestId>,
    /// Entity-to-entity propagations this chain has taken to get here
    #[serde(default)]
    pub hops: usize,
}

/// Property update applied to `source_id`'s namespace of the receiver
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityMsg {
    /// Namespace to write; empty means the receiver's own namespace
    #[serde(default)]
    pub source_id: String,
    pub values: PropertyMap,
}

/// Declares that `target_id` needs to observe `items` of the receiver
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TentacleMsg {
    pub target_id: String,
    /// Property keys of the receiver; empty withdraws the edge
    #[serde(default)]
    pub items: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapperOp {
    Append,
    Remove,
}

/// Installs or uninstalls a mapper on its target entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapperMsg {
    pub op: MapperOp,
    pub mapper: Mapper,
}

/// Message payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Entity(EntityMsg),
    Tentacle(TentacleMsg),
    Mapper(MapperMsg),
}

impl Message {
    /// Short name used in logs and errors
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Entity(_) => "entity",
            Message::Tentacle(_) => "tentacle",
            Message::Mapper(_) => "mapper",
        }
    }
}

impl From<EntityMsg> for Message {
    fn from(msg: EntityMsg) -> Self {
        Message::Entity(msg)
    }
}

impl From<TentacleMsg> for Message {
    fn from(msg: TentacleMsg) -> Self {
        Message::Tentacle(msg)
    }
}

impl From<MapperMsg> for Message {
    fn from(msg: MapperMsg) -> Self {
        Message::Mapper(msg)
    }
}

/// Headers plus message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageContext {
    pub headers: Headers,
    pub message: Message,
}

impl MessageContext {
    /// Address `message` to `target_id`
    pub fn new(target_id: impl Into<String>, message: impl Into<Message>) -> Self {
        Self {
            headers: Headers {
                target_id: target_id.into(),
                ..Headers::default()
            },
            message: message.into(),
        }
    }

    pub fn with_source(mut self, source_id: impl Into<String>) -> Self {
        self.headers.source_id = source_id.into();
        self
    }

    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.headers.owner_id = owner_id.into();
        self
    }

    pub fn with_state_type(mut self, state_type: impl Into<String>) -> Self {
        self.headers.state_type = state_type.into();
        self
    }

    pub fn with_request(mut self, request_id: RequestId) -> Self {
        self.headers.request_id = Some(request_id);
        self
    }

    pub fn with_hops(mut self, hops: usize) -> Self {
        self.headers.hops = hops;
        self
    }

    pub fn target_id(&self) -> &str {
        &self.headers.target_id
    }

    /// The causal-chain token, stamping a fresh one if none was set
    pub fn ensure_request_id(&mut self) -> &RequestId {
        self.headers.request_id.get_or_insert_with(RequestId::new)
    }
}
