// Batched inference scheduler: submission, batch formation, dispatch

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use uuid::Uuid;

use crate::cache::PromptCache;
use crate::error::ErrorKind;
use crate::events::{event_types, EventBus};
use crate::models::{ModelLease, ModelManager, ModelTier};
use crate::runtime::{GenerateParams, Runtime};
use crate::scheduler::metrics::{PerfStats, QueueStats, SchedulerMetrics};
use crate::scheduler::queues::PriorityQueues;
use crate::scheduler::types::{
    InferenceRequest, InferenceResponse, PendingGuard, Priority, QueuedRequest, ResponseHandle,
    META_CACHE_KEY, META_TASK,
};
use crate::thermal::{Recommendation, ThermalGuard};

const STOP_GRACE: Duration = Duration::from_secs(5);
/// Rotating KV cache bound passed to the runtime on every generate call.
const ROTATING_KV_SIZE: u32 = 4096;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Bounded wait during batch formation.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Caller-side wait bound on the completion handle.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_max_queue_size() -> usize {
    1000
}

fn default_batch_size() -> usize {
    4
}

fn default_timeout_ms() -> u64 {
    100
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            batch_size: default_batch_size(),
            timeout_ms: default_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl SchedulerConfig {
    /// Clamp values to their documented ranges.
    pub fn normalized(mut self) -> Self {
        self.batch_size = self.batch_size.clamp(1, 32);
        self.timeout_ms = self.timeout_ms.clamp(10, 10_000);
        self
    }
}

struct SchedulerCore {
    config: SchedulerConfig,
    batch_size: AtomicUsize,
    batch_timeout_ms: AtomicU64,
    queues: PriorityQueues,
    metrics: Arc<SchedulerMetrics>,
    manager: Arc<ModelManager>,
    runtime: Arc<dyn Runtime>,
    thermal: RwLock<Option<Arc<ThermalGuard>>>,
    cache: RwLock<Option<Arc<PromptCache>>>,
    events: Option<EventBus>,
    pending: Arc<AtomicUsize>,
    in_flight: AtomicUsize,
    accepting: AtomicBool,
    stop: AtomicBool,
}

/// Priority-aware batching scheduler in front of the model manager and the
/// runtime. Never loses a request: every accepted submission resolves its
/// completion handle exactly once.
pub struct InferenceScheduler {
    core: Arc<SchedulerCore>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl InferenceScheduler {
    pub fn new(
        config: SchedulerConfig,
        manager: Arc<ModelManager>,
        runtime: Arc<dyn Runtime>,
    ) -> Self {
        Self::build(config, manager, runtime, None)
    }

    pub fn with_events(
        config: SchedulerConfig,
        manager: Arc<ModelManager>,
        runtime: Arc<dyn Runtime>,
        events: EventBus,
    ) -> Self {
        Self::build(config, manager, runtime, Some(events))
    }

    fn build(
        config: SchedulerConfig,
        manager: Arc<ModelManager>,
        runtime: Arc<dyn Runtime>,
        events: Option<EventBus>,
    ) -> Self {
        let config = config.normalized();
        info!(
            "scheduler initialized (batch_size={}, timeout={}ms, queue bound={})",
            config.batch_size, config.timeout_ms, config.max_queue_size
        );
        Self {
            core: Arc::new(SchedulerCore {
                batch_size: AtomicUsize::new(config.batch_size),
                batch_timeout_ms: AtomicU64::new(config.timeout_ms),
                queues: PriorityQueues::new(config.max_queue_size),
                metrics: Arc::new(SchedulerMetrics::default()),
                manager,
                runtime,
                thermal: RwLock::new(None),
                cache: RwLock::new(None),
                events,
                pending: Arc::new(AtomicUsize::new(0)),
                in_flight: AtomicUsize::new(0),
                accepting: AtomicBool::new(true),
                stop: AtomicBool::new(false),
                config,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Enable adaptive batching driven by the thermal guard.
    pub fn set_thermal_guard(&self, guard: Arc<ThermalGuard>) {
        *self.core.thermal.write().unwrap() = Some(guard);
    }

    /// Enable prompt-prefix reuse for requests carrying a cache key.
    pub fn set_prompt_cache(&self, cache: Arc<PromptCache>) {
        *self.core.cache.write().unwrap() = Some(cache);
    }

    /// Start the dispatcher. Idempotent.
    pub fn start(&self) {
        let mut worker = self.worker.lock().unwrap();
        if worker.as_ref().map_or(false, |h| !h.is_finished()) {
            warn!("scheduler dispatcher already running");
            return;
        }
        self.core.stop.store(false, Ordering::Relaxed);
        self.core.accepting.store(true, Ordering::Relaxed);
        let core = self.core.clone();
        *worker = Some(tokio::spawn(async move {
            SchedulerCore::run(core).await;
        }));
        info!("scheduler dispatcher started");
    }

    /// Close submissions, finish the current batch, fail stragglers with
    /// SHUTTING_DOWN, and join the dispatcher within a bounded grace.
    pub async fn stop(&self) {
        self.core.accepting.store(false, Ordering::Relaxed);
        self.core.stop.store(true, Ordering::Relaxed);
        self.core.queues.wake();

        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            if timeout(STOP_GRACE, handle).await.is_err() {
                warn!("scheduler dispatcher did not stop gracefully; aborting");
                abort.abort();
            }
        }

        for queued in self.core.queues.drain_all() {
            let queue_time = queued.enqueued_at.elapsed();
            self.core.metrics.record_failure(ErrorKind::ShuttingDown);
            let id = queued.request.id.clone();
            let model = queued.request.model.clone().unwrap_or_default();
            queued.complete(InferenceResponse::failure(
                id,
                model,
                ErrorKind::ShuttingDown,
                "scheduler stopped before the request was dispatched",
                queue_time,
            ));
        }
        info!("scheduler stopped");
    }

    /// Submit a request. CRITICAL requests bypass the queues and are served
    /// in the submitter's context; everything else is enqueued for batch
    /// formation. The returned handle resolves exactly once.
    pub async fn submit(&self, mut request: InferenceRequest) -> ResponseHandle {
        if request.id.is_empty() {
            request.id = Uuid::new_v4().to_string();
        }

        let (tx, rx) = oneshot::channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        let handle = ResponseHandle {
            rx,
            cancelled: cancelled.clone(),
            request_id: request.id.clone(),
            model_hint: request.model.clone().unwrap_or_default(),
            submitted_at: Instant::now(),
            timeout: Duration::from_millis(self.core.config.request_timeout_ms),
            metrics: self.core.metrics.clone(),
        };

        self.core.metrics.record_submission(request.priority);

        if !self.core.accepting.load(Ordering::Relaxed) {
            self.core.metrics.record_failure(ErrorKind::ShuttingDown);
            let _ = tx.send(InferenceResponse::failure(
                request.id,
                request.model.unwrap_or_default(),
                ErrorKind::ShuttingDown,
                "scheduler is not accepting submissions",
                Duration::ZERO,
            ));
            return handle;
        }

        if request.priority == Priority::Critical {
            let response = self.core.process_critical(request).await;
            let _ = tx.send(response);
            return handle;
        }

        let queued = QueuedRequest {
            enqueued_at: Instant::now(),
            request,
            tx,
            cancelled,
            _pending: PendingGuard::new(&self.core.pending),
        };
        if let Err(queued) = self.core.queues.push(queued) {
            self.core.metrics.record_failure(ErrorKind::QueueFull);
            debug!(
                "rejecting request {}: {} queue full",
                queued.request.id,
                queued.request.priority.name()
            );
            let id = queued.request.id.clone();
            let model = queued.request.model.clone().unwrap_or_default();
            queued.complete(InferenceResponse::failure(
                id,
                model,
                ErrorKind::QueueFull,
                "priority queue is full",
                Duration::ZERO,
            ));
        }
        handle
    }

    pub fn queue_stats(&self) -> QueueStats {
        let sizes = self.core.queues.sizes();
        let per_priority = Priority::HIGHEST_FIRST
            .iter()
            .map(|p| (p.name().to_string(), sizes[p.index()]))
            .collect();
        QueueStats {
            per_priority,
            pending: self.core.pending.load(Ordering::Relaxed),
            in_flight_batch: self.core.in_flight.load(Ordering::Relaxed),
            capacity_per_level: self.core.queues.capacity_per_level(),
        }
    }

    pub fn perf_stats(&self) -> PerfStats {
        self.core.metrics.perf_stats()
    }

    /// Adjust the configured batch size (clamped 1..=32) while running.
    pub fn set_batch_size(&self, batch_size: usize) {
        let clamped = batch_size.clamp(1, 32);
        let old = self.core.batch_size.swap(clamped, Ordering::Relaxed);
        info!("batch size updated: {old} -> {clamped}");
    }

    /// Adjust the batch-formation wait (clamped 10..=10_000 ms).
    pub fn set_batch_timeout(&self, timeout_ms: u64) {
        let clamped = timeout_ms.clamp(10, 10_000);
        let old = self.core.batch_timeout_ms.swap(clamped, Ordering::Relaxed);
        info!("batch timeout updated: {old}ms -> {clamped}ms");
    }
}

impl SchedulerCore {
    fn recommendation(&self) -> Recommendation {
        let guard = self.thermal.read().unwrap().clone();
        match guard {
            Some(guard) => guard.recommendation(),
            None => Recommendation {
                can_load_large: true,
                batch_size_hint: self.batch_size.load(Ordering::Relaxed),
                post_inference_delay_ms: 0,
                reason: "no thermal guard attached".to_string(),
            },
        }
    }

    async fn run(core: Arc<SchedulerCore>) {
        loop {
            if core.stop.load(Ordering::Relaxed) {
                break;
            }

            let recommendation = core.recommendation();
            let configured = core.batch_size.load(Ordering::Relaxed);
            let target = recommendation.batch_size_hint.max(1).min(configured);
            let wait = Duration::from_millis(core.batch_timeout_ms.load(Ordering::Relaxed));

            let mut batch = Vec::with_capacity(target);
            let has_urgent = core.queues.sweep(target, &mut batch);

            if batch.is_empty() {
                core.queues.wait_for_work(wait).await;
                if core.stop.load(Ordering::Relaxed) {
                    break;
                }
                core.queues.sweep(target, &mut batch);
                if batch.is_empty() {
                    continue;
                }
            } else if !has_urgent && batch.len() < target {
                // Bounded wait for a fuller batch; urgent work skips it.
                core.queues.wait_for_work(wait).await;
                core.queues.sweep(target, &mut batch);
            }

            let batch_size = batch.len();
            core.in_flight.store(batch_size, Ordering::Relaxed);
            let batch_start = Instant::now();
            debug!("dispatching batch of {batch_size} (thermal: {})", recommendation.reason);

            let groups = core.group_by_model(batch).await;
            let mut tasks = JoinSet::new();
            for (model, requests) in groups {
                let core = core.clone();
                tasks.spawn(async move {
                    core.process_group(model, requests, batch_size).await;
                });
            }
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    error!("inference group task failed: {e}");
                }
            }

            core.in_flight.store(0, Ordering::Relaxed);
            let elapsed = batch_start.elapsed();
            core.metrics.record_batch(batch_size, elapsed);
            if let Some(events) = &core.events {
                events.emit(
                    event_types::BATCH_COMPLETED,
                    "urn:orchard:scheduler",
                    serde_json::json!({
                        "batch_size": batch_size,
                        "processing_ms": elapsed.as_millis() as u64,
                    }),
                );
            }

            // Thermal cool-down between batches.
            if recommendation.post_inference_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(recommendation.post_inference_delay_ms))
                    .await;
            }
        }
        debug!("scheduler dispatch loop exited");
    }

    /// Resolve each request to a model name and bucket the batch by model.
    /// Requests that cannot be resolved fail here with NO_MODEL_AVAILABLE.
    async fn group_by_model(
        &self,
        batch: Vec<QueuedRequest>,
    ) -> HashMap<String, Vec<QueuedRequest>> {
        let mut groups: HashMap<String, Vec<QueuedRequest>> = HashMap::new();
        for queued in batch {
            if queued.is_cancelled() {
                continue;
            }
            let model = match &queued.request.model {
                Some(model) => Some(model.clone()),
                None => {
                    let task = queued
                        .request
                        .metadata
                        .get(META_TASK)
                        .and_then(|v| v.as_str())
                        .unwrap_or(&queued.request.prompt)
                        .to_string();
                    self.manager
                        .resolve(&task, queued.request.prompt.len() as u32)
                        .await
                }
            };
            match model {
                Some(model) => groups.entry(model).or_default().push(queued),
                None => self.fail_request(
                    queued,
                    ErrorKind::NoModelAvailable,
                    "no model could be resolved for the request",
                    String::new(),
                ),
            }
        }
        groups
    }

    /// Serve one per-model group. A runtime error fails the erroring request
    /// and every not-yet-completed request in the group with the identical
    /// kind and message; other groups are unaffected.
    async fn process_group(&self, model: String, requests: Vec<QueuedRequest>, batch_size: usize) {
        let dispatch_start = Instant::now();

        if !self.manager.load(&model).await {
            let (kind, message) = self.load_failure(&model);
            for queued in requests {
                self.fail_request(queued, kind, &message, model.clone());
            }
            return;
        }
        let Some(lease) = self.manager.get(&model).await else {
            for queued in requests {
                self.fail_request(
                    queued,
                    ErrorKind::Internal,
                    "model disappeared between load and checkout",
                    model.clone(),
                );
            }
            return;
        };

        let mut remaining = requests.into_iter();
        while let Some(queued) = remaining.next() {
            if queued.is_cancelled() {
                continue;
            }

            let queue_time = dispatch_start.saturating_duration_since(queued.enqueued_at);
            let (prompt, params) = self.prepare_generation(&queued.request).await;

            let inference_start = Instant::now();
            match self
                .runtime
                .generate(&lease.handles.model, &lease.handles.tokenizer, &prompt, &params)
                .await
            {
                Ok(generation) => {
                    let response = InferenceResponse::success(
                        queued.request.id.clone(),
                        generation.text,
                        generation.tokens,
                        queue_time,
                        inference_start.elapsed(),
                        model.clone(),
                        batch_size,
                    );
                    queued.complete(response);
                }
                Err(e) => {
                    let message = format!("runtime error for model {model}: {e}");
                    warn!("{message}");
                    self.fail_request(queued, ErrorKind::InferenceFailed, &message, model.clone());
                    for rest in remaining {
                        self.fail_request(
                            rest,
                            ErrorKind::InferenceFailed,
                            &message,
                            model.clone(),
                        );
                    }
                    return;
                }
            }
        }
    }

    /// CRITICAL short-circuit: serve immediately in the submitter's context,
    /// still subject to thermal ceiling and model availability.
    async fn process_critical(&self, request: InferenceRequest) -> InferenceResponse {
        let accepted_at = Instant::now();

        let model = match &request.model {
            Some(model) => Some(model.clone()),
            None => {
                let task = request
                    .metadata
                    .get(META_TASK)
                    .and_then(|v| v.as_str())
                    .unwrap_or(&request.prompt)
                    .to_string();
                self.manager.resolve(&task, request.prompt.len() as u32).await
            }
        };
        let Some(model) = model else {
            self.metrics.record_failure(ErrorKind::NoModelAvailable);
            return InferenceResponse::failure(
                request.id,
                String::new(),
                ErrorKind::NoModelAvailable,
                "no model could be resolved for the request",
                accepted_at.elapsed(),
            );
        };

        let is_large = self
            .manager
            .catalog()
            .get(&model)
            .map_or(false, |c| c.tier == ModelTier::OnDemand);
        if is_large && !self.recommendation().can_load_large {
            self.metrics.record_failure(ErrorKind::ThermalEmergency);
            return InferenceResponse::failure(
                request.id,
                model,
                ErrorKind::ThermalEmergency,
                "large model load refused during thermal emergency",
                accepted_at.elapsed(),
            );
        }

        if !self.manager.load(&model).await {
            let (kind, message) = self.load_failure(&model);
            self.metrics.record_failure(kind);
            return InferenceResponse::failure(
                request.id,
                model,
                kind,
                message,
                accepted_at.elapsed(),
            );
        }
        let Some(lease) = self.manager.get(&model).await else {
            self.metrics.record_failure(ErrorKind::Internal);
            return InferenceResponse::failure(
                request.id,
                model,
                ErrorKind::Internal,
                "model disappeared between load and checkout",
                accepted_at.elapsed(),
            );
        };

        self.generate_single(request, lease, model, accepted_at).await
    }

    async fn generate_single(
        &self,
        request: InferenceRequest,
        lease: ModelLease,
        model: String,
        accepted_at: Instant,
    ) -> InferenceResponse {
        let queue_time = accepted_at.elapsed();
        let (prompt, params) = self.prepare_generation(&request).await;
        let inference_start = Instant::now();
        match self
            .runtime
            .generate(&lease.handles.model, &lease.handles.tokenizer, &prompt, &params)
            .await
        {
            Ok(generation) => InferenceResponse::success(
                request.id,
                generation.text,
                generation.tokens,
                queue_time,
                inference_start.elapsed(),
                model,
                1,
            ),
            Err(e) => {
                let message = format!("runtime error for model {model}: {e}");
                warn!("{message}");
                self.metrics.record_failure(ErrorKind::InferenceFailed);
                let mut response = InferenceResponse::failure(
                    request.id,
                    model,
                    ErrorKind::InferenceFailed,
                    message,
                    queue_time,
                );
                response.inference_time = inference_start.elapsed();
                response.total_time = response.queue_time + response.inference_time;
                response
            }
        }
    }

    /// Build the effective prompt and generation parameters, folding in a
    /// cached prefix when the request names one.
    async fn prepare_generation(&self, request: &InferenceRequest) -> (String, GenerateParams) {
        let mut params = GenerateParams {
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            max_kv_size: Some(ROTATING_KV_SIZE),
            prompt_cache: None,
        };

        let cache_key = request
            .metadata
            .get(META_CACHE_KEY)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        if let Some(key) = cache_key {
            let cache = self.cache.read().unwrap().clone();
            if let Some(cache) = cache {
                if let Some(hit) = cache.get(&key).await {
                    params.prompt_cache = Some(hit.artifact_path);
                    let prompt = format!("{}\n{}", hit.prompt, request.prompt);
                    return (prompt, params);
                }
            }
        }

        (request.prompt.clone(), params)
    }

    fn load_failure(&self, model: &str) -> (ErrorKind, String) {
        let is_large = self
            .manager
            .catalog()
            .get(model)
            .map_or(false, |c| c.tier == ModelTier::OnDemand);
        if is_large && !self.recommendation().can_load_large {
            (
                ErrorKind::ThermalEmergency,
                format!("large model {model} refused during thermal emergency"),
            )
        } else {
            (
                ErrorKind::NoModelAvailable,
                format!("model {model} could not be loaded"),
            )
        }
    }

    fn fail_request(
        &self,
        queued: QueuedRequest,
        kind: ErrorKind,
        message: &str,
        model_used: String,
    ) {
        self.metrics.record_failure(kind);
        let queue_time = queued.enqueued_at.elapsed();
        let id = queued.request.id.clone();
        queued.complete(InferenceResponse::failure(
            id, model_used, kind, message, queue_time,
        ));
    }
}
