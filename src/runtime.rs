// Runtime trait: the seam between the orchestrator and the model backend

use async_trait::async_trait;
use std::any::Any;
use std::path::Path;
use std::sync::Arc;

/// Opaque handle to a backend-loaded model. The orchestrator never looks
/// inside; implementations downcast to their own type.
pub type ModelHandle = Arc<dyn Any + Send + Sync>;

/// Opaque handle to the tokenizer paired with a model.
pub type TokenizerHandle = Arc<dyn Any + Send + Sync>;

/// Model + tokenizer pair returned by a successful load.
#[derive(Clone)]
pub struct LoadedHandles {
    pub model: ModelHandle,
    pub tokenizer: TokenizerHandle,
}

/// Per-call generation parameters.
#[derive(Debug, Clone)]
pub struct GenerateParams {
    pub max_tokens: u32,
    pub temperature: f32,
    /// Rotating KV cache bound, when the backend supports one.
    pub max_kv_size: Option<u32>,
    /// Precomputed prompt-prefix artifact to resume from, when available.
    pub prompt_cache: Option<std::path::PathBuf>,
}

impl Default for GenerateParams {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            temperature: 0.7,
            max_kv_size: None,
            prompt_cache: None,
        }
    }
}

/// Output of a single generation call.
#[derive(Debug, Clone)]
pub struct Generation {
    pub text: String,
    pub tokens: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("model load failed: {0}")]
    Load(String),
    #[error("generation failed: {0}")]
    Generate(String),
    #[error("prompt caching failed: {0}")]
    CachePrompt(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Model backend consumed by the orchestrator.
///
/// Implementations wrap an actual inference stack (llama.cpp, MLX, ...).
/// All methods must be safe to call from concurrent tasks; CPU-bound
/// implementations should move work onto a blocking thread internally.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Load the model identified by `model_id` and return its handles.
    async fn load(&self, model_id: &str) -> Result<LoadedHandles, RuntimeError>;

    /// Generate a completion for `prompt` on a previously loaded model.
    async fn generate(
        &self,
        model: &ModelHandle,
        tokenizer: &TokenizerHandle,
        prompt: &str,
        params: &GenerateParams,
    ) -> Result<Generation, RuntimeError>;

    /// Precompute the prefix state for `prompt` and persist it at `path`.
    async fn cache_prompt(
        &self,
        model: &ModelHandle,
        tokenizer: &TokenizerHandle,
        prompt: &str,
        path: &Path,
    ) -> Result<(), RuntimeError>;

    /// Hint that backend-internal scratch memory may be released.
    fn clear_cache(&self) {}
}
