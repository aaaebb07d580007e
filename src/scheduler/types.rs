// Request/response types and the completion handle

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::{ErrorKind, RequestError};
use crate::scheduler::metrics::SchedulerMetrics;

/// Metadata key holding a task description used for model resolution.
pub const META_TASK: &str = "task";
/// Metadata key naming a prompt-cache entry to prepend at dispatch.
pub const META_CACHE_KEY: &str = "cache_key";

/// Request priority levels, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Priority {
    pub const COUNT: usize = 4;
    pub const HIGHEST_FIRST: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    pub fn index(&self) -> usize {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
            Priority::Critical => 3,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

/// A single inference request.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    /// Unique id; assigned on submit when empty.
    pub id: String,
    pub prompt: String,
    /// Target model; resolved by the scheduler when absent.
    pub model: Option<String>,
    pub priority: Priority,
    pub max_tokens: u32,
    pub temperature: f32,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl InferenceRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            prompt: prompt.into(),
            model: None,
            priority: Priority::Normal,
            max_tokens: 512,
            temperature: 0.7,
            metadata: HashMap::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Per-request result. `total_time` is constructed as
/// `queue_time + inference_time`, so the equality always holds.
#[derive(Debug, Clone)]
pub struct InferenceResponse {
    pub request_id: String,
    pub text: String,
    pub tokens_generated: u32,
    pub inference_time: Duration,
    pub queue_time: Duration,
    pub total_time: Duration,
    pub model_used: String,
    pub batch_size: usize,
    pub error: Option<RequestError>,
}

impl InferenceResponse {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    pub(crate) fn success(
        request_id: String,
        text: String,
        tokens_generated: u32,
        queue_time: Duration,
        inference_time: Duration,
        model_used: String,
        batch_size: usize,
    ) -> Self {
        Self {
            request_id,
            text,
            tokens_generated,
            inference_time,
            queue_time,
            total_time: queue_time + inference_time,
            model_used,
            batch_size,
            error: None,
        }
    }

    pub(crate) fn failure(
        request_id: String,
        model_used: String,
        kind: ErrorKind,
        message: impl Into<String>,
        queue_time: Duration,
    ) -> Self {
        Self {
            request_id,
            text: String::new(),
            tokens_generated: 0,
            inference_time: Duration::ZERO,
            queue_time,
            total_time: queue_time,
            model_used,
            batch_size: 0,
            error: Some(RequestError::new(kind, message)),
        }
    }
}

/// Decrements the scheduler's pending counter when the owning queued
/// request is consumed or discarded, whichever comes first.
pub(crate) struct PendingGuard(Arc<AtomicUsize>);

impl PendingGuard {
    pub(crate) fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter.clone())
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A request owned by the scheduler between submission and completion.
pub(crate) struct QueuedRequest {
    pub request: InferenceRequest,
    pub enqueued_at: Instant,
    pub tx: oneshot::Sender<InferenceResponse>,
    pub cancelled: Arc<AtomicBool>,
    pub _pending: PendingGuard,
}

impl QueuedRequest {
    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Deliver the response. Cancelled requests discard the result.
    pub(crate) fn complete(self, response: InferenceResponse) {
        if self.is_cancelled() {
            return;
        }
        let _ = self.tx.send(response);
    }
}

/// One-shot rendezvous handed back to the submitter.
pub struct ResponseHandle {
    pub(crate) rx: oneshot::Receiver<InferenceResponse>,
    pub(crate) cancelled: Arc<AtomicBool>,
    pub(crate) request_id: String,
    pub(crate) model_hint: String,
    pub(crate) submitted_at: Instant,
    pub(crate) timeout: Duration,
    pub(crate) metrics: Arc<SchedulerMetrics>,
}

impl ResponseHandle {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Override the caller-side wait bound for this request.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Await the response, bounded by the request timeout. On expiry the
    /// request is marked cancelled (the scheduler discards it at the next
    /// boundary) and a TIMEOUT response is returned.
    pub async fn wait(self) -> InferenceResponse {
        match tokio::time::timeout(self.timeout, self.rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                self.metrics.record_failure(ErrorKind::Internal);
                InferenceResponse::failure(
                    self.request_id,
                    self.model_hint,
                    ErrorKind::Internal,
                    "completion handle dropped without a response",
                    self.submitted_at.elapsed(),
                )
            }
            Err(_) => {
                self.cancelled.store(true, Ordering::Relaxed);
                self.metrics.record_timeout();
                InferenceResponse::failure(
                    self.request_id,
                    self.model_hint,
                    ErrorKind::Timeout,
                    format!("request timed out after {:?}", self.timeout),
                    self.submitted_at.elapsed(),
                )
            }
        }
    }
}
