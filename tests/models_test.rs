// Model manager integration: budget invariants under concurrency

mod common;

use common::{small_catalog, test_model, MockRuntime};
use orchard::models::GIB;
use orchard::{ModelManager, ModelManagerConfig, ModelPriority, ModelTier};
use orchard::ModelCatalog;
use std::sync::Arc;
use std::time::Duration;

// Property 7: no interleaving of concurrent loads exceeds the budget, and
// the accounting stays exact (property 1).
#[tokio::test]
async fn concurrent_loads_never_exceed_the_budget() {
    let runtime = Arc::new(MockRuntime::new().with_load_delay(Duration::from_millis(5)));
    let catalog = ModelCatalog::from_configs(vec![
        test_model("m1", 3 * GIB, ModelTier::Frequent, ModelPriority::Medium),
        test_model("m2", 4 * GIB, ModelTier::Frequent, ModelPriority::Medium),
        test_model("m3", 5 * GIB, ModelTier::Frequent, ModelPriority::Low),
        test_model("m4", 6 * GIB, ModelTier::OnDemand, ModelPriority::High),
    ]);
    let manager = Arc::new(ModelManager::new(
        catalog,
        runtime,
        ModelManagerConfig {
            max_memory_bytes: 10 * GIB,
            ..Default::default()
        },
    ));

    let mut tasks = Vec::new();
    for round in 0..3 {
        for name in ["m1", "m2", "m3", "m4"] {
            let manager = manager.clone();
            tasks.push(tokio::spawn(async move {
                if round % 2 == 0 {
                    manager.load(name).await;
                } else {
                    manager.evict(name).await;
                }
            }));
        }
    }
    for task in tasks {
        task.await.unwrap();
    }

    let snapshot = manager.snapshot().await;
    assert!(snapshot.used_bytes <= snapshot.max_bytes);
    let accounted: u64 = snapshot.models.iter().map(|m| m.ram_bytes).sum();
    assert_eq!(accounted, snapshot.used_bytes);
}

// Property 1 over a scripted load/evict sequence.
#[tokio::test]
async fn accounting_matches_loaded_set_through_load_evict_sequences() {
    let runtime = Arc::new(MockRuntime::new());
    let manager = ModelManager::new(
        small_catalog(),
        runtime,
        ModelManagerConfig {
            max_memory_bytes: 12 * GIB,
            ..Default::default()
        },
    );

    assert!(manager.load("tiny").await);
    assert!(manager.load("mid").await);
    assert!(manager.load("big").await);
    assert!(manager.evict("mid").await);
    assert!(manager.load("mid").await);
    assert!(manager.evict("big").await);

    let snapshot = manager.snapshot().await;
    let accounted: u64 = snapshot.models.iter().map(|m| m.ram_bytes).sum();
    assert_eq!(accounted, snapshot.used_bytes);
    assert_eq!(snapshot.used_bytes, GIB / 2 + 3 * GIB);
}

// Bootstrap loads every always-on model and survives a failing one.
#[tokio::test]
async fn bootstrap_continues_past_always_on_failures() {
    let runtime = Arc::new(MockRuntime::new());
    runtime.fail_loading("test/broken");
    let catalog = ModelCatalog::from_configs(vec![
        test_model("broken", GIB / 4, ModelTier::AlwaysOn, ModelPriority::Critical),
        test_model("healthy", GIB / 2, ModelTier::AlwaysOn, ModelPriority::Critical),
    ]);
    let manager = ModelManager::new(catalog, runtime, ModelManagerConfig::default());

    manager.bootstrap().await;

    let snapshot = manager.snapshot().await;
    assert_eq!(snapshot.models.len(), 1);
    assert_eq!(snapshot.models[0].name, "healthy");
    assert_eq!(snapshot.load_failures, 1);
}

// Snapshot exposes usage bookkeeping that moves with access.
#[tokio::test]
async fn snapshot_reports_usage_counters() {
    let runtime = Arc::new(MockRuntime::new());
    let manager = ModelManager::new(small_catalog(), runtime, ModelManagerConfig::default());

    assert!(manager.load("tiny").await);
    assert!(manager.get("tiny").await.is_some());
    assert!(manager.get("tiny").await.is_some());

    let snapshot = manager.snapshot().await;
    let tiny = snapshot.models.iter().find(|m| m.name == "tiny").unwrap();
    assert_eq!(tiny.use_count, 2);
    assert_eq!(tiny.tier, ModelTier::AlwaysOn);
    assert!(snapshot.memory_pressure > 0.0);
}
