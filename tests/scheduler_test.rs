// Scheduler integration: batching, priorities, rejection, cancellation

mod common;

use common::{small_catalog, MockRuntime};
use orchard::{
    ErrorKind, InferenceRequest, InferenceScheduler, ModelManager, ModelManagerConfig, Priority,
    SchedulerConfig,
};
use std::sync::Arc;
use std::time::Duration;

fn scheduler_with(
    runtime: Arc<MockRuntime>,
    config: SchedulerConfig,
) -> (InferenceScheduler, Arc<ModelManager>) {
    let manager = Arc::new(ModelManager::new(
        small_catalog(),
        runtime.clone(),
        ModelManagerConfig::default(),
    ));
    let scheduler = InferenceScheduler::new(config, manager.clone(), runtime);
    (scheduler, manager)
}

// S1: 8 NORMAL requests with batch_size=4 form exactly two batches of 4.
#[tokio::test]
async fn basic_batching_forms_two_full_batches() {
    let runtime = Arc::new(MockRuntime::new().with_generate_delay(Duration::from_millis(10)));
    let (scheduler, _) = scheduler_with(
        runtime,
        SchedulerConfig {
            batch_size: 4,
            timeout_ms: 50,
            ..Default::default()
        },
    );

    let mut handles = Vec::new();
    for i in 0..8 {
        let request = InferenceRequest::new(format!("request {i}")).with_model("tiny");
        handles.push(scheduler.submit(request).await);
    }
    scheduler.start();

    for handle in handles {
        let response = handle.wait().await;
        assert!(response.is_ok(), "unexpected error: {:?}", response.error);
        assert_eq!(response.model_used, "tiny");
        assert_eq!(response.batch_size, 4);
        assert_eq!(
            response.total_time,
            response.queue_time + response.inference_time
        );
    }

    let stats = scheduler.perf_stats();
    assert_eq!(stats.total_requests, 8);
    assert_eq!(stats.total_batches, 2);
    assert_eq!(stats.avg_batch_size, 4.0);
    assert_eq!(stats.failed_requests, 0);

    scheduler.stop().await;
}

// S2: a HIGH request submitted after 10 LOW requests is served sooner.
#[tokio::test]
async fn high_priority_preempts_queued_low_requests() {
    let runtime = Arc::new(MockRuntime::new().with_generate_delay(Duration::from_millis(15)));
    let (scheduler, _) = scheduler_with(
        runtime,
        SchedulerConfig {
            batch_size: 1,
            timeout_ms: 10,
            ..Default::default()
        },
    );

    let mut low_handles = Vec::new();
    for i in 0..10 {
        let request = InferenceRequest::new(format!("low {i}"))
            .with_model("tiny")
            .with_priority(Priority::Low);
        low_handles.push(scheduler.submit(request).await);
    }
    let high_handle = scheduler
        .submit(
            InferenceRequest::new("high")
                .with_model("tiny")
                .with_priority(Priority::High),
        )
        .await;

    scheduler.start();

    let high = high_handle.wait().await;
    assert!(high.is_ok());

    let mut last_low_queue_time = Duration::ZERO;
    for handle in low_handles {
        let response = handle.wait().await;
        assert!(response.is_ok());
        last_low_queue_time = last_low_queue_time.max(response.queue_time);
    }

    assert!(
        high.queue_time < last_low_queue_time,
        "high queued {:?}, slowest low queued {:?}",
        high.queue_time,
        last_low_queue_time
    );

    scheduler.stop().await;
}

// Boundary: submitting beyond a level's bound yields exactly one QUEUE_FULL
// per excess submission, without blocking.
#[tokio::test]
async fn full_queue_rejects_excess_submissions_immediately() {
    let runtime = Arc::new(MockRuntime::new());
    // max_queue_size 8 -> 2 slots per priority level.
    let (scheduler, _) = scheduler_with(
        runtime,
        SchedulerConfig {
            max_queue_size: 8,
            ..Default::default()
        },
    );

    let mut handles = Vec::new();
    for i in 0..3 {
        let request = InferenceRequest::new(format!("r{i}")).with_model("tiny");
        handles.push(scheduler.submit(request).await);
    }

    // The dispatcher never started, so the first two stay queued and the
    // third must have been rejected without enqueue.
    let stats = scheduler.queue_stats();
    assert_eq!(stats.per_priority.get("normal"), Some(&2));

    let third = handles.pop().unwrap().wait().await;
    assert_eq!(third.error_kind(), Some(ErrorKind::QueueFull));

    // Shutdown fails the still-queued requests with SHUTTING_DOWN.
    scheduler.stop().await;
    for handle in handles {
        let response = handle.wait().await;
        assert_eq!(response.error_kind(), Some(ErrorKind::ShuttingDown));
    }

    let stats = scheduler.queue_stats();
    assert_eq!(stats.pending, 0);
}

// S6: a saturated scheduler, a tight caller timeout -> TIMEOUT, counted, and
// no orphaned handle remains.
#[tokio::test]
async fn caller_timeout_cancels_and_leaves_no_orphans() {
    let runtime = Arc::new(MockRuntime::new().with_generate_delay(Duration::from_millis(200)));
    let (scheduler, _) = scheduler_with(
        runtime,
        SchedulerConfig {
            batch_size: 1,
            timeout_ms: 10,
            ..Default::default()
        },
    );

    // Saturate the dispatcher with a slow request.
    let busy = scheduler
        .submit(InferenceRequest::new("busy").with_model("tiny"))
        .await;
    scheduler.start();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let doomed = scheduler
        .submit(InferenceRequest::new("doomed").with_model("tiny"))
        .await
        .with_timeout(Duration::from_millis(10));
    let response = doomed.wait().await;
    assert_eq!(response.error_kind(), Some(ErrorKind::Timeout));

    let stats = scheduler.perf_stats();
    assert_eq!(stats.timed_out_requests, 1);

    assert!(busy.wait().await.is_ok());

    // The cancelled request is discarded at the next dequeue.
    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(scheduler.queue_stats().pending, 0);

    scheduler.stop().await;
}

// Property 2: every accepted, uncancelled request gets exactly one response.
#[tokio::test]
async fn every_submitted_request_receives_a_response() {
    let runtime = Arc::new(MockRuntime::new().with_generate_delay(Duration::from_millis(2)));
    let (scheduler, _) = scheduler_with(runtime, SchedulerConfig::default());
    scheduler.start();

    let mut handles = Vec::new();
    for i in 0..40 {
        let priority = match i % 4 {
            0 => Priority::Low,
            1 => Priority::Normal,
            2 => Priority::High,
            _ => Priority::Critical,
        };
        let request = InferenceRequest::new(format!("req {i}"))
            .with_model("tiny")
            .with_priority(priority);
        handles.push(scheduler.submit(request).await);
    }

    let mut ok = 0;
    for handle in handles {
        if handle.wait().await.is_ok() {
            ok += 1;
        }
    }
    assert_eq!(ok, 40);

    scheduler.stop().await;
}

// A runtime error fails the whole model group with one kind and message,
// without poisoning other groups in the same batch.
#[tokio::test]
async fn group_failure_is_isolated_from_other_groups() {
    let runtime = Arc::new(MockRuntime::new());
    runtime.fail_generating("test/mid");
    let (scheduler, _) = scheduler_with(
        runtime,
        SchedulerConfig {
            batch_size: 4,
            timeout_ms: 50,
            ..Default::default()
        },
    );

    let ok_a = scheduler
        .submit(InferenceRequest::new("a").with_model("tiny"))
        .await;
    let bad_b = scheduler
        .submit(InferenceRequest::new("b").with_model("mid"))
        .await;
    let bad_c = scheduler
        .submit(InferenceRequest::new("c").with_model("mid"))
        .await;
    let ok_d = scheduler
        .submit(InferenceRequest::new("d").with_model("tiny"))
        .await;
    scheduler.start();

    assert!(ok_a.wait().await.is_ok());
    assert!(ok_d.wait().await.is_ok());

    let b = bad_b.wait().await;
    let c = bad_c.wait().await;
    assert_eq!(b.error_kind(), Some(ErrorKind::InferenceFailed));
    assert_eq!(c.error_kind(), Some(ErrorKind::InferenceFailed));
    assert_eq!(
        b.error.as_ref().unwrap().message,
        c.error.as_ref().unwrap().message
    );

    scheduler.stop().await;
}

// An unresolvable model name fails with NO_MODEL_AVAILABLE.
#[tokio::test]
async fn unknown_model_fails_with_no_model_available() {
    let runtime = Arc::new(MockRuntime::new());
    let (scheduler, _) = scheduler_with(runtime, SchedulerConfig::default());
    scheduler.start();

    let handle = scheduler
        .submit(InferenceRequest::new("hello").with_model("ghost"))
        .await;
    let response = handle.wait().await;
    assert_eq!(response.error_kind(), Some(ErrorKind::NoModelAvailable));

    scheduler.stop().await;
}

// Requests without a target model are resolved through the manager.
#[tokio::test]
async fn model_resolution_serves_requests_without_a_target() {
    let runtime = Arc::new(MockRuntime::new());
    let (scheduler, _) = scheduler_with(runtime, SchedulerConfig::default());
    scheduler.start();

    let request = InferenceRequest::new("a simple greeting please");
    let response = scheduler.submit(request).await.wait().await;
    assert!(response.is_ok(), "unexpected error: {:?}", response.error);
    assert_eq!(response.model_used, "tiny");

    scheduler.stop().await;
}

// CRITICAL requests bypass the queues even when the dispatcher is stopped.
#[tokio::test]
async fn critical_requests_bypass_batch_formation() {
    let runtime = Arc::new(MockRuntime::new());
    let (scheduler, _) = scheduler_with(runtime, SchedulerConfig::default());
    // Note: never started.

    let response = scheduler
        .submit(
            InferenceRequest::new("now")
                .with_model("tiny")
                .with_priority(Priority::Critical),
        )
        .await
        .wait()
        .await;
    assert!(response.is_ok());
    assert_eq!(response.batch_size, 1);
}
