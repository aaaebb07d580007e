// Shared test doubles: scripted runtime and probes

#![allow(dead_code)]

use async_trait::async_trait;
use orchard::models::GIB;
use orchard::thermal::{ProbeError, ThermalProbe, ThermalReading};
use orchard::{
    GenerateParams, Generation, LoadedHandles, ModelCatalog, ModelConfig, ModelHandle,
    ModelPriority, ModelTier, Runtime, RuntimeError, TokenizerHandle,
};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Runtime double with scripted delays and failure injection.
pub struct MockRuntime {
    load_delay: Duration,
    generate_delay: Duration,
    cache_delay: Duration,
    fail_loads: Mutex<HashSet<String>>,
    fail_generates: Mutex<HashSet<String>>,
    pub loads: AtomicU64,
    pub generations: AtomicU64,
    pub prompts_cached: AtomicU64,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            load_delay: Duration::ZERO,
            generate_delay: Duration::from_millis(5),
            cache_delay: Duration::ZERO,
            fail_loads: Mutex::new(HashSet::new()),
            fail_generates: Mutex::new(HashSet::new()),
            loads: AtomicU64::new(0),
            generations: AtomicU64::new(0),
            prompts_cached: AtomicU64::new(0),
        }
    }

    pub fn with_generate_delay(mut self, delay: Duration) -> Self {
        self.generate_delay = delay;
        self
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    pub fn with_cache_delay(mut self, delay: Duration) -> Self {
        self.cache_delay = delay;
        self
    }

    pub fn fail_loading(&self, model_id: &str) {
        self.fail_loads.lock().unwrap().insert(model_id.to_string());
    }

    pub fn fail_generating(&self, model_id: &str) {
        self.fail_generates.lock().unwrap().insert(model_id.to_string());
    }
}

#[async_trait]
impl Runtime for MockRuntime {
    async fn load(&self, model_id: &str) -> Result<LoadedHandles, RuntimeError> {
        if !self.load_delay.is_zero() {
            tokio::time::sleep(self.load_delay).await;
        }
        if self.fail_loads.lock().unwrap().contains(model_id) {
            return Err(RuntimeError::Load(format!("injected load failure: {model_id}")));
        }
        self.loads.fetch_add(1, Ordering::Relaxed);
        Ok(LoadedHandles {
            model: Arc::new(model_id.to_string()),
            tokenizer: Arc::new(()),
        })
    }

    async fn generate(
        &self,
        model: &ModelHandle,
        _tokenizer: &TokenizerHandle,
        prompt: &str,
        params: &GenerateParams,
    ) -> Result<Generation, RuntimeError> {
        if !self.generate_delay.is_zero() {
            tokio::time::sleep(self.generate_delay).await;
        }
        let model_id = model
            .downcast_ref::<String>()
            .cloned()
            .unwrap_or_else(|| "unknown".to_string());
        if self.fail_generates.lock().unwrap().contains(&model_id) {
            return Err(RuntimeError::Generate(format!(
                "injected generate failure: {model_id}"
            )));
        }
        self.generations.fetch_add(1, Ordering::Relaxed);
        let head: String = prompt.chars().take(48).collect();
        let text = format!("[{model_id}] {head}");
        Ok(Generation {
            tokens: params.max_tokens.min(text.split_whitespace().count() as u32),
            text,
        })
    }

    async fn cache_prompt(
        &self,
        _model: &ModelHandle,
        _tokenizer: &TokenizerHandle,
        prompt: &str,
        path: &Path,
    ) -> Result<(), RuntimeError> {
        if !self.cache_delay.is_zero() {
            tokio::time::sleep(self.cache_delay).await;
        }
        std::fs::write(path, prompt.as_bytes())?;
        self.prompts_cached.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Probe returning a controllable temperature.
pub struct AdjustableProbe {
    temperature: Arc<Mutex<Option<f64>>>,
}

impl AdjustableProbe {
    pub fn new(initial: Option<f64>) -> (Self, Arc<Mutex<Option<f64>>>) {
        let temperature = Arc::new(Mutex::new(initial));
        (
            Self {
                temperature: temperature.clone(),
            },
            temperature,
        )
    }
}

#[async_trait]
impl ThermalProbe for AdjustableProbe {
    fn name(&self) -> &str {
        "test:adjustable"
    }

    async fn sample(&self) -> Result<ThermalReading, ProbeError> {
        Ok(ThermalReading {
            temperature_c: *self.temperature.lock().unwrap(),
            warning_c: None,
            critical_c: None,
            source: self.name().to_string(),
            details: HashMap::new(),
        })
    }
}

pub fn test_model(
    name: &str,
    ram_bytes: u64,
    tier: ModelTier,
    priority: ModelPriority,
) -> ModelConfig {
    ModelConfig {
        id: format!("test/{name}"),
        name: name.to_string(),
        ram_bytes,
        tier,
        use_cases: vec!["general_chat".to_string()],
        priority,
        tokens_per_second: 100,
        context_length: 8192,
        specializations: vec![],
    }
}

/// Three-tier catalog sized for tests: tiny always-on, mid frequent, big
/// on-demand.
pub fn small_catalog() -> ModelCatalog {
    ModelCatalog::from_configs(vec![
        test_model("tiny", GIB / 2, ModelTier::AlwaysOn, ModelPriority::Critical),
        test_model("mid", 3 * GIB, ModelTier::Frequent, ModelPriority::Medium),
        test_model("big", 8 * GIB, ModelTier::OnDemand, ModelPriority::High),
    ])
}
