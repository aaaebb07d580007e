// Thermal integration: emergency degradation through the whole stack

mod common;

use common::{small_catalog, AdjustableProbe, MockRuntime};
use orchard::thermal::{ThermalGuard, ThermalGuardConfig, ThermalProbe};
use orchard::{
    ErrorKind, InferenceRequest, Orchestrator, OrchestratorConfig, Priority, ThermalState,
};
use std::sync::Arc;

fn emergency_config(cache_root: &std::path::Path) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.thermal.warning_c = 85.0;
    config.thermal.critical_c = 90.0;
    config.thermal.sample_interval_s = 1;
    config.cache.root_dir = cache_root.to_path_buf();
    config
}

// S3: a 95C reading with critical_c=90 degrades the whole stack within one
// sample interval, while an always-on CRITICAL request still succeeds.
#[tokio::test]
async fn thermal_emergency_degrades_and_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(MockRuntime::new());
    let (probe, temperature) = AdjustableProbe::new(Some(95.0));

    let orchestrator = Orchestrator::new(
        emergency_config(dir.path()),
        small_catalog(),
        runtime,
        vec![Box::new(probe)],
    )
    .unwrap();
    orchestrator.start().await;

    // One synchronous sample pins the classification without waiting out
    // the periodic cadence.
    orchestrator.thermal().sample_now().await;
    assert_eq!(orchestrator.thermal_status().state, ThermalState::Emergency);
    let recommendation = orchestrator.thermal().recommendation();
    assert_eq!(recommendation.batch_size_hint, 1);
    assert_eq!(recommendation.post_inference_delay_ms, 2000);
    assert!(!recommendation.can_load_large);

    // A large (on-demand) load is refused under emergency.
    assert!(!orchestrator.models().load("big").await);

    // A CRITICAL request needing only an always-on model still succeeds.
    let response = orchestrator
        .submit(
            InferenceRequest::new("status check")
                .with_model("tiny")
                .with_priority(Priority::Critical),
        )
        .await
        .wait()
        .await;
    assert!(response.is_ok(), "unexpected error: {:?}", response.error);

    // A CRITICAL request needing the large model is rejected pre-dispatch.
    let response = orchestrator
        .submit(
            InferenceRequest::new("heavy job")
                .with_model("big")
                .with_priority(Priority::Critical),
        )
        .await
        .wait()
        .await;
    assert_eq!(response.error_kind(), Some(ErrorKind::ThermalEmergency));

    // Cooling below the warning threshold restores large loads.
    *temperature.lock().unwrap() = Some(60.0);
    orchestrator.thermal().sample_now().await;
    assert_eq!(orchestrator.thermal_status().state, ThermalState::Normal);
    assert!(orchestrator.models().load("big").await);

    orchestrator.stop().await;
}

// Boundary: a reading exactly at warning_c classifies THROTTLED, exactly at
// critical_c EMERGENCY.
#[tokio::test]
async fn threshold_boundaries_are_inclusive() {
    let (probe, temperature) = AdjustableProbe::new(Some(85.0));
    let guard = ThermalGuard::new(
        ThermalGuardConfig::default(),
        vec![Box::new(probe) as Box<dyn ThermalProbe>],
    );

    guard.sample_now().await;
    assert_eq!(guard.current().state, ThermalState::Throttled);

    *temperature.lock().unwrap() = Some(90.0);
    guard.sample_now().await;
    assert_eq!(guard.current().state, ThermalState::Emergency);

    *temperature.lock().unwrap() = None;
    guard.sample_now().await;
    assert_eq!(guard.current().state, ThermalState::Unknown);
}

// State transitions reach event-bus subscribers as envelopes.
#[tokio::test]
async fn thermal_transitions_are_published_to_the_bus() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(MockRuntime::new());
    let (probe, _temperature) = AdjustableProbe::new(Some(95.0));

    let orchestrator = Orchestrator::new(
        emergency_config(dir.path()),
        small_catalog(),
        runtime,
        vec![Box::new(probe)],
    )
    .unwrap();
    let mut events = orchestrator.events().subscribe();

    orchestrator.start().await;

    // Scan the stream for the thermal transition; model bootstrap events
    // share the same bus.
    let mut saw_thermal_critical = false;
    for _ in 0..10 {
        match tokio::time::timeout(std::time::Duration::from_millis(500), events.recv()).await {
            Ok(Ok(envelope)) => {
                if envelope.event_type == "orchard.thermal.critical" {
                    assert_eq!(envelope.data["state"], "emergency");
                    saw_thermal_critical = true;
                    break;
                }
            }
            _ => break,
        }
    }
    assert!(saw_thermal_critical);

    orchestrator.stop().await;
}
