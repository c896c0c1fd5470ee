//! Replay a scenario through an in-process entity manager.
//!
//! A scenario seeds the store with records, installs mappers, then sends
//! property updates. Mapper outputs are declared per mapper as `copy`
//! rules (`output_key: entity#key`), which is enough to exercise
//! propagation without an expression engine.

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use twinrt_core::{
    EntityManager, EntityMsg, EntityRecord, EntitySnapshot, ManagerStats, Mapper, MapperError,
    MapperExecutor, MapperInput, MemoryStore, MessageContext, PropertyMap, Publisher,
    RuntimeConfig, Value,
};

fn default_settle_ms() -> u64 {
    100
}

#[derive(Debug, Deserialize)]
struct Scenario {
    /// Overrides the configuration given on the command line
    #[serde(default)]
    config: Option<RuntimeConfig>,
    #[serde(default)]
    records: Vec<EntityRecord>,
    #[serde(default)]
    mappers: Vec<ScenarioMapper>,
    #[serde(default)]
    messages: Vec<ScenarioMessage>,
    /// Pause after the mapper phase and after the message phase
    #[serde(default = "default_settle_ms")]
    settle_ms: u64,
}

#[derive(Debug, Deserialize)]
struct ScenarioMapper {
    #[serde(flatten)]
    mapper: Mapper,
    #[serde(default)]
    copy: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct ScenarioMessage {
    target: String,
    #[serde(default)]
    source: String,
    #[serde(default)]
    owner: String,
    #[serde(default)]
    values: PropertyMap,
}

/// Executor that copies watched values to output keys
struct CopyExecutor {
    rules: HashMap<String, BTreeMap<String, String>>,
}

impl MapperExecutor for CopyExecutor {
    fn execute(&self, mapper: &Mapper, input: &MapperInput) -> Result<PropertyMap, MapperError> {
        let Some(rules) = self.rules.get(&mapper.id) else {
            return Ok(PropertyMap::new());
        };
        Ok(rules
            .iter()
            .filter_map(|(output, watched)| {
                input
                    .get(watched)
                    .map(|value| (output.clone(), value.clone()))
            })
            .collect())
    }
}

#[derive(Debug, Clone, Serialize)]
struct PublishedEvent {
    pubsub_name: String,
    topic: String,
    payload: Value,
}

#[derive(Default)]
struct CollectingPublisher {
    events: Mutex<Vec<PublishedEvent>>,
}

#[async_trait]
impl Publisher for CollectingPublisher {
    async fn publish(
        &self,
        pubsub_name: &str,
        topic: &str,
        payload: Vec<u8>,
    ) -> twinrt_core::Result<()> {
        let payload = serde_json::from_slice(&payload)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&payload).into_owned()));
        tracing::debug!(pubsub_name, topic, "collected event");
        self.events.lock().push(PublishedEvent {
            pubsub_name: pubsub_name.to_string(),
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }
}

#[derive(Serialize)]
struct ReplayReport {
    entities: Vec<EntitySnapshot>,
    stats: ManagerStats,
    published: Vec<PublishedEvent>,
}

pub struct ReplayOptions {
    pub settle_ms: Option<u64>,
    pub compact: bool,
}

/// Run the scenario at `path` and print the resulting entity state as JSON.
pub async fn replay_scenario(path: &Path, config: RuntimeConfig, opts: ReplayOptions) -> Result<()> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read scenario {}", path.display()))?;
    let scenario: Scenario = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse scenario {}", path.display()))?;

    let report = run(scenario, config, opts.settle_ms).await?;
    let payload = if opts.compact {
        serde_json::to_string(&report)?
    } else {
        serde_json::to_string_pretty(&report)?
    };
    println!("{}", payload);
    Ok(())
}

async fn run(scenario: Scenario, config: RuntimeConfig, settle_ms: Option<u64>) -> Result<ReplayReport> {
    let config = scenario.config.unwrap_or(config);
    let settle = Duration::from_millis(settle_ms.unwrap_or(scenario.settle_ms));

    let store = Arc::new(MemoryStore::new());
    for record in &scenario.records {
        store
            .insert(record)
            .with_context(|| format!("Failed to seed record {}", record.id))?;
    }

    let rules = scenario
        .mappers
        .iter()
        .map(|m| (m.mapper.id.clone(), m.copy.clone()))
        .collect();
    let publisher = Arc::new(CollectingPublisher::default());
    let manager = EntityManager::builder()
        .config(config)
        .store(store)
        .executor(Arc::new(CopyExecutor { rules }))
        .publisher(publisher.clone())
        .build()
        .context("Failed to build entity manager")?;
    manager.start()?;

    // Wake seeded records so subscriptions announce their edges
    for record in &scenario.records {
        let ctx = MessageContext::new(record.id.clone(), EntityMsg::default())
            .with_state_type(record.kind.clone());
        manager.send_msg(ctx).await;
    }

    for entry in scenario.mappers {
        let id = entry.mapper.id.clone();
        manager
            .append_mapper(entry.mapper)
            .await
            .with_context(|| format!("Failed to append mapper {}", id))?;
    }
    tokio::time::sleep(settle).await;

    for message in scenario.messages {
        let msg = EntityMsg {
            source_id: message.source,
            values: message.values,
        };
        let ctx = MessageContext::new(message.target, msg).with_owner(message.owner);
        manager.send_msg(ctx).await;
    }
    tokio::time::sleep(settle).await;

    let entities = manager
        .entity_ids()
        .iter()
        .filter_map(|id| manager.entity(id))
        .map(|actor| actor.entity().snapshot())
        .collect();
    let stats = manager.stats();
    manager.shutdown().await;

    let published = publisher.events.lock().clone();
    Ok(ReplayReport {
        entities,
        stats,
        published,
    })
}
