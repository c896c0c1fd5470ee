//! End-to-end propagation through the entity manager

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use twinrt_core::{
    EntityManager, EntityMsg, EntityRecord, FnExecutor, Mapper, MapperError, MapperInput,
    MapperMsg, MapperOp, MemoryStore, MessageContext, PropertyMap, Publisher, RuntimeConfig,
    RuntimeError, TentacleKind, TentacleMsg, Value, WatchKey, STATE_TYPE_SUBSCRIPTION,
};

async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..400 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

fn update(target: &str, values: Value) -> MessageContext {
    MessageContext::new(
        target,
        EntityMsg {
            source_id: String::new(),
            values: serde_json::from_value(values).unwrap(),
        },
    )
}

fn property(manager: &EntityManager, id: &str, key: &str) -> Option<Value> {
    manager.entity(id)?.entity().get_property(key)
}

fn cached(manager: &EntityManager, id: &str, namespace: &str, key: &str) -> Option<Value> {
    manager.entity(id)?.entity().namespace(namespace)?.get(key).cloned()
}

fn watchers(manager: &EntityManager, id: &str) -> Vec<String> {
    manager
        .entity(id)
        .map(|actor| actor.entity().counterparts())
        .unwrap_or_default()
}

#[tokio::test]
async fn test_mapper_source_forwards_to_target() {
    let manager = EntityManager::new(RuntimeConfig::default()).unwrap();
    manager.start().unwrap();

    manager
        .append_mapper(Mapper::new("calc1-m1", "calc1").with_source("device2", ["temp"]))
        .await
        .unwrap();
    assert!(eventually(|| watchers(&manager, "device2") == vec!["calc1"]).await);

    let device2 = manager.entity("device2").unwrap();
    let tentacles = device2.entity().tentacles_for(&WatchKey::new("device2", "temp"));
    assert_eq!(tentacles.len(), 1);
    assert_eq!(tentacles[0].kind(), TentacleKind::ToEntity);
    assert_eq!(tentacles[0].target_id(), "calc1");

    manager.send_msg(update("device2", json!({"temp": 25}))).await;
    assert!(eventually(|| cached(&manager, "calc1", "device2", "temp") == Some(json!(25))).await);

    // The forwarded value lands in calc1's cache of device2, not its own namespace.
    assert_eq!(property(&manager, "calc1", "temp"), None);
    assert_eq!(property(&manager, "device2", "temp"), Some(json!(25)));
    manager.shutdown().await;
}

#[tokio::test]
async fn test_multi_hop_mapper_chain() {
    let executor = FnExecutor(
        |mapper: &Mapper, input: &MapperInput| -> Result<PropertyMap, MapperError> {
            let mut out = PropertyMap::new();
            match mapper.id.as_str() {
                "to-fahrenheit" => {
                    if let Some(c) = input.get("device2#temp").and_then(Value::as_f64) {
                        out.insert("temp_f".into(), json!(c * 9.0 / 5.0 + 32.0));
                    }
                }
                "alarm" => {
                    if let Some(f) = input.get("calc1#temp_f").and_then(Value::as_f64) {
                        out.insert("hot".into(), json!(f > 100.0));
                    }
                }
                _ => {}
            }
            Ok(out)
        },
    );
    let manager = EntityManager::builder()
        .executor(Arc::new(executor))
        .build()
        .unwrap();
    manager.start().unwrap();

    manager
        .append_mapper(Mapper::new("to-fahrenheit", "calc1").with_source("device2", ["temp"]))
        .await
        .unwrap();
    manager
        .append_mapper(Mapper::new("alarm", "calc2").with_source("calc1", ["temp_f"]))
        .await
        .unwrap();
    assert!(eventually(|| watchers(&manager, "device2").contains(&"calc1".to_string())).await);
    assert!(eventually(|| watchers(&manager, "calc1").contains(&"calc2".to_string())).await);

    manager.send_msg(update("device2", json!({"temp": 40.0}))).await;

    assert!(eventually(|| property(&manager, "calc2", "hot") == Some(json!(true))).await);
    assert_eq!(property(&manager, "calc1", "temp_f"), Some(json!(104.0)));
    manager.shutdown().await;
}

#[tokio::test]
async fn test_repeated_and_overlapping_mappers_do_not_duplicate_items() {
    let manager = EntityManager::new(RuntimeConfig::default()).unwrap();
    manager.start().unwrap();

    let m1 = Mapper::new("m1", "calc1").with_source("device2", ["temp", "hum"]);
    let m2 = Mapper::new("m2", "calc1").with_source("device2", ["temp", "light"]);
    manager.append_mapper(m1.clone()).await.unwrap();
    manager.append_mapper(m1).await.unwrap();
    manager.append_mapper(m2).await.unwrap();

    let merged = |manager: &EntityManager| {
        manager
            .entity("device2")
            .map(|a| a.entity().tentacles_for(&WatchKey::new("device2", "light")))
            .unwrap_or_default()
    };
    assert!(eventually(|| merged(&manager).len() == 1).await);

    let tentacle = &merged(&manager)[0];
    assert_eq!(tentacle.target_id(), "calc1");
    assert_eq!(tentacle.property_keys(), vec!["hum", "light", "temp"]);
    assert_eq!(
        device2_tentacle_count(&manager, "temp"),
        1,
        "one edge per counterpart"
    );
    manager.shutdown().await;
}

fn device2_tentacle_count(manager: &EntityManager, key: &str) -> usize {
    manager
        .entity("device2")
        .map(|a| a.entity().tentacles_for(&WatchKey::new("device2", key)).len())
        .unwrap_or(0)
}

#[tokio::test]
async fn test_fresh_entity_has_empty_own_namespace() {
    let manager = EntityManager::new(RuntimeConfig::default()).unwrap();
    manager.start().unwrap();

    manager.send_msg(update("device1", json!({}))).await;
    assert!(eventually(|| manager.entity("device1").is_some()).await);

    let device1 = manager.entity("device1").unwrap();
    assert_eq!(device1.entity().namespace("device1"), Some(PropertyMap::new()));
    assert!(device1.entity().get_all_properties().is_empty());
    manager.shutdown().await;
}

#[tokio::test]
async fn test_failed_construction_keeps_manager_running() {
    let store = Arc::new(MemoryStore::new());
    store.mark_unavailable("ghost");
    let manager = EntityManager::builder().store(store).build().unwrap();
    manager.start().unwrap();

    for _ in 0..3 {
        manager.send_msg(update("ghost", json!({"x": 1}))).await;
    }
    manager.send_msg(update("device1", json!({"x": 1}))).await;

    assert!(eventually(|| property(&manager, "device1", "x") == Some(json!(1))).await);
    assert!(manager.entity("ghost").is_none());
    assert!(!manager.entity_ids().contains(&"ghost".to_string()));
    assert_eq!(manager.stats().dropped, 3);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_remove_mapper_withdraws_source_edge() {
    let manager = EntityManager::new(RuntimeConfig::default()).unwrap();
    manager.start().unwrap();

    manager
        .append_mapper(Mapper::new("m1", "calc1").with_source("device2", ["temp"]))
        .await
        .unwrap();
    assert!(eventually(|| watchers(&manager, "device2") == vec!["calc1"]).await);

    assert!(manager.remove_mapper("calc1", "m1").await);
    assert!(eventually(|| watchers(&manager, "device2").is_empty()).await);
    assert!(eventually(|| {
        manager
            .entity("calc1")
            .map(|a| a.entity().get_mappers().is_empty())
            .unwrap_or(false)
    })
    .await);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_cycle_rejected_self_reference_accepted() {
    let manager = EntityManager::new(RuntimeConfig::default()).unwrap();
    manager.start().unwrap();

    manager
        .append_mapper(Mapper::new("self", "calc1").with_source("calc1", ["a"]))
        .await
        .unwrap();
    manager
        .append_mapper(Mapper::new("fwd", "calc2").with_source("calc1", ["a"]))
        .await
        .unwrap();

    let err = manager
        .append_mapper(Mapper::new("back", "calc1").with_source("calc2", ["b"]))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Mapper(MapperError::Cycle { ref mapper_id, .. }) if mapper_id == "back"
    ));
    manager.shutdown().await;
}

#[tokio::test]
async fn test_remove_on_wrong_target_keeps_cycle_guard() {
    let manager = EntityManager::new(RuntimeConfig::default()).unwrap();
    manager.start().unwrap();

    manager
        .append_mapper(Mapper::new("m1", "b").with_source("a", ["x"]))
        .await
        .unwrap();
    assert!(!manager.remove_mapper("not-b", "m1").await);

    let err = manager
        .append_mapper(Mapper::new("m2", "a").with_source("b", ["x"]))
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Mapper(MapperError::Cycle { .. })));
    manager.shutdown().await;
}

#[tokio::test]
async fn test_same_mapper_id_on_two_targets_keeps_cycle_guard() {
    let manager = EntityManager::new(RuntimeConfig::default()).unwrap();
    manager.start().unwrap();

    manager
        .append_mapper(Mapper::new("m1", "b").with_source("a", ["x"]))
        .await
        .unwrap();
    manager
        .append_mapper(Mapper::new("m1", "c").with_source("a", ["x"]))
        .await
        .unwrap();
    assert!(eventually(|| {
        ["b", "c"].iter().all(|id| {
            manager
                .entity(id)
                .map(|a| a.entity().get_mapper("m1").is_some())
                .unwrap_or(false)
        })
    })
    .await);

    // b still holds m1, so b -> a closes a loop
    assert!(manager
        .append_mapper(Mapper::new("m2", "a").with_source("b", ["x"]))
        .await
        .is_err());

    assert!(manager.remove_mapper("b", "m1").await);
    assert!(manager
        .append_mapper(Mapper::new("m2", "a").with_source("b", ["x"]))
        .await
        .is_ok());
    manager.shutdown().await;
}

#[tokio::test]
async fn test_cross_entity_cycle_bounded_at_runtime() {
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = runs.clone();
    let executor = FnExecutor(move |_: &Mapper, input: &MapperInput| -> Result<PropertyMap, MapperError> {
        counter.fetch_add(1, Ordering::SeqCst);
        let x = input.values().next().and_then(Value::as_i64).unwrap_or(0);
        Ok(PropertyMap::from([("x".to_string(), json!(x + 1))]))
    });
    let config = RuntimeConfig {
        max_stack_depth: 4,
        ..RuntimeConfig::default()
    };
    let manager = EntityManager::builder()
        .config(config)
        .executor(Arc::new(executor))
        .build()
        .unwrap();
    manager.start().unwrap();

    // Installed directly on the entities, so registration never sees the loop.
    for (target, source) in [("b", "a"), ("a", "b")] {
        let mapper = Mapper::new(format!("{target}-from-{source}"), target).with_source(source, ["x"]);
        manager
            .send_msg(MessageContext::new(
                target,
                MapperMsg {
                    op: MapperOp::Append,
                    mapper,
                },
            ))
            .await;
    }
    assert!(eventually(|| watchers(&manager, "a").contains(&"b".to_string())).await);
    assert!(eventually(|| watchers(&manager, "b").contains(&"a".to_string())).await);

    manager.send_msg(update("a", json!({"x": 0}))).await;
    assert!(eventually(|| runs.load(Ordering::SeqCst) >= 2).await);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let settled = runs.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(runs.load(Ordering::SeqCst), settled, "propagation kept running");
    assert!(settled <= 4, "ran {settled} times past the hop cap");

    // Both entities keep serving later messages.
    manager.send_msg(update("b", json!({"y": true}))).await;
    assert!(eventually(|| property(&manager, "b", "y") == Some(json!(true))).await);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_self_referential_mapper_bounded_by_depth_cap() {
    let executor = FnExecutor(|_: &Mapper, input: &MapperInput| -> Result<PropertyMap, MapperError> {
        let n = input.get("calc1#n").and_then(Value::as_i64).unwrap_or(0);
        Ok(PropertyMap::from([("n".to_string(), json!(n + 1))]))
    });
    let config = RuntimeConfig {
        max_stack_depth: 5,
        ..RuntimeConfig::default()
    };
    let manager = EntityManager::builder()
        .config(config)
        .executor(Arc::new(executor))
        .build()
        .unwrap();
    manager.start().unwrap();

    manager
        .append_mapper(Mapper::new("inc", "calc1").with_source("calc1", ["n"]))
        .await
        .unwrap();
    assert!(eventually(|| {
        manager
            .entity("calc1")
            .map(|a| a.entity().get_mapper("inc").is_some())
            .unwrap_or(false)
    })
    .await);

    manager.send_msg(update("calc1", json!({"n": 0}))).await;
    assert!(eventually(|| property(&manager, "calc1", "n") == Some(json!(4))).await);

    // The aborted chain released the lock; later messages still apply.
    manager.send_msg(update("calc1", json!({"other": true}))).await;
    assert!(eventually(|| property(&manager, "calc1", "other") == Some(json!(true))).await);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_chains_all_apply() {
    let manager = EntityManager::new(RuntimeConfig::default()).unwrap();
    manager.start().unwrap();

    let mut tasks = Vec::new();
    for i in 0..50 {
        let handle = manager.handle();
        tasks.push(tokio::spawn(async move {
            let mut values = serde_json::Map::new();
            values.insert(format!("k{i}"), json!(i));
            handle.send_msg(update("device1", Value::Object(values))).await;
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert!(eventually(|| {
        manager
            .entity("device1")
            .map(|a| a.entity().get_all_properties().len() == 50)
            .unwrap_or(false)
    })
    .await);
    assert_eq!(manager.entity("device1").unwrap().entity().version(), 50);
    manager.shutdown().await;
}

#[derive(Default)]
struct RecordingPublisher {
    events: Mutex<Vec<Value>>,
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, _pubsub_name: &str, _topic: &str, payload: Vec<u8>) -> twinrt_core::Result<()> {
        self.events.lock().push(serde_json::from_slice(&payload).unwrap());
        Ok(())
    }
}

#[tokio::test]
async fn test_changed_subscription_publishes_only_differences() {
    let store = Arc::new(MemoryStore::new());
    let mut record = EntityRecord::new("sub1", STATE_TYPE_SUBSCRIPTION);
    record.properties = serde_json::from_value(json!({
        "mode": "changed",
        "source": "device2",
        "target": "dashboard",
        "filter": ["temp"],
        "topic": "telemetry",
        "pubsub_name": "bus"
    }))
    .unwrap();
    store.insert(&record).unwrap();

    let publisher = Arc::new(RecordingPublisher::default());
    let manager = EntityManager::builder()
        .store(store)
        .publisher(publisher.clone())
        .build()
        .unwrap();
    manager.start().unwrap();

    // Any message creates the subscription, which then announces its edge.
    manager
        .send_msg(MessageContext::new(
            "sub1",
            TentacleMsg {
                target_id: "nobody".into(),
                items: vec![],
            },
        ))
        .await;
    assert!(eventually(|| watchers(&manager, "device2") == vec!["sub1"]).await);

    for temp in [20, 20, 21] {
        manager.send_msg(update("device2", json!({ "temp": temp }))).await;
    }

    assert!(eventually(|| publisher.events.lock().len() == 2).await);
    tokio::time::sleep(Duration::from_millis(30)).await;
    let events = publisher.events.lock().clone();
    assert_eq!(events, vec![json!({"temp": 20}), json!({"temp": 21})]);
    manager.shutdown().await;
}
