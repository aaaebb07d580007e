// Model catalog: static per-model metadata and residency tiers

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const GIB: u64 = 1024 * 1024 * 1024;
pub const MIB: u64 = 1024 * 1024;

/// Model residency tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    /// Loaded at startup; evicted only under critical memory pressure.
    AlwaysOn,
    /// Loaded when needed, kept while space allows.
    Frequent,
    /// Loaded only when requested.
    OnDemand,
}

/// Priority tag used for eviction ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelPriority {
    Critical,
    High,
    Medium,
    Low,
}

impl ModelPriority {
    /// Numeric rank for eviction ordering; lower ranks are evicted first.
    pub fn rank(&self) -> u8 {
        match self {
            ModelPriority::Critical => 4,
            ModelPriority::High => 3,
            ModelPriority::Medium => 2,
            ModelPriority::Low => 1,
        }
    }
}

/// Static model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Backend identifier passed to the runtime's load call.
    pub id: String,
    /// Short name used everywhere else.
    pub name: String,
    pub ram_bytes: u64,
    pub tier: ModelTier,
    #[serde(default)]
    pub use_cases: Vec<String>,
    pub priority: ModelPriority,
    #[serde(default = "default_tokens_per_second")]
    pub tokens_per_second: u32,
    #[serde(default = "default_context_length")]
    pub context_length: u32,
    #[serde(default)]
    pub specializations: Vec<String>,
}

fn default_tokens_per_second() -> u32 {
    80
}

fn default_context_length() -> u32 {
    4096
}

impl ModelConfig {
    /// Whether any of the model's use-case or specialization tags appears in
    /// the task text.
    pub fn suits_task(&self, task_lower: &str) -> bool {
        self.use_cases
            .iter()
            .chain(self.specializations.iter())
            .any(|tag| task_lower.contains(&tag.replace('_', " ")))
    }
}

fn model(
    id: &str,
    name: &str,
    ram_bytes: u64,
    tier: ModelTier,
    use_cases: &[&str],
    priority: ModelPriority,
    tokens_per_second: u32,
    context_length: u32,
    specializations: &[&str],
) -> ModelConfig {
    ModelConfig {
        id: id.to_string(),
        name: name.to_string(),
        ram_bytes,
        tier,
        use_cases: use_cases.iter().map(|s| s.to_string()).collect(),
        priority,
        tokens_per_second,
        context_length,
        specializations: specializations.iter().map(|s| s.to_string()).collect(),
    }
}

lazy_static! {
    static ref BUILTIN_MODELS: Vec<ModelConfig> = vec![
        model(
            "lmstudio-community/gemma-2-2b-it-4bit",
            "gemma-3-270m",
            300 * MIB,
            ModelTier::AlwaysOn,
            &["instant_response", "always_on", "coordination"],
            ModelPriority::Critical,
            150,
            8192,
            &["speed_optimized", "low_latency"],
        ),
        model(
            "mlx-community/Phi-3-mini-4k-instruct-4bit",
            "phi3-mini",
            2 * GIB,
            ModelTier::AlwaysOn,
            &["utility", "simple_task", "always_on"],
            ModelPriority::Critical,
            120,
            4096,
            &["utility_tasks"],
        ),
        model(
            "mlx-community/Mixtral-8x7B-v0.1-hf-4bit-mlx",
            "mixtral",
            12 * GIB,
            ModelTier::Frequent,
            &["fast_response", "multilingual"],
            ModelPriority::Medium,
            90,
            32_768,
            &[],
        ),
        model(
            "mlx-community/Qwen2.5-VL-3B-Instruct-6bit",
            "qwen2.5-vl",
            3 * GIB,
            ModelTier::Frequent,
            &["image_analysis", "vision_tasks"],
            ModelPriority::Medium,
            100,
            4096,
            &["vision", "multimodal"],
        ),
        model(
            "mlx-community/Qwen3-Coder-30B-A3B-Instruct-4bit",
            "qwen3-coder",
            17 * GIB,
            ModelTier::OnDemand,
            &["code_generation", "code_review", "debugging"],
            ModelPriority::Critical,
            80,
            256_000,
            &["function_calling", "repository_understanding", "fill_in_middle"],
        ),
        model(
            "mlx-community/Qwen3-30B-A3B-Instruct-4bit",
            "qwen3-instruct",
            22 * GIB,
            ModelTier::OnDemand,
            &["general_chat", "complex_reasoning"],
            ModelPriority::High,
            75,
            128_000,
            &[],
        ),
        model(
            "mlx-community/GLM-4.5-4bit",
            "glm-4.5",
            22 * GIB,
            ModelTier::OnDemand,
            &["document_analysis", "long_context"],
            ModelPriority::High,
            70,
            128_000,
            &[],
        ),
    ];
}

/// Set of models the manager may load, keyed by short name.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    configs: HashMap<String, ModelConfig>,
}

impl ModelCatalog {
    /// The built-in tiered catalog.
    pub fn builtin() -> Self {
        Self::from_configs(BUILTIN_MODELS.clone())
    }

    pub fn from_configs(configs: Vec<ModelConfig>) -> Self {
        Self {
            configs: configs.into_iter().map(|c| (c.name.clone(), c)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelConfig> {
        self.configs.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.configs.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModelConfig> {
        self.configs.values()
    }

    /// Models in `tier`, smallest RAM footprint first.
    pub fn tier_members(&self, tier: ModelTier) -> Vec<&ModelConfig> {
        let mut members: Vec<_> = self.configs.values().filter(|c| c.tier == tier).collect();
        members.sort_by_key(|c| c.ram_bytes);
        members
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_catalog_spans_all_tiers() {
        let catalog = ModelCatalog::builtin();
        assert!(!catalog.tier_members(ModelTier::AlwaysOn).is_empty());
        assert!(!catalog.tier_members(ModelTier::Frequent).is_empty());
        assert!(!catalog.tier_members(ModelTier::OnDemand).is_empty());
    }

    #[test]
    fn tier_members_ordered_by_footprint() {
        let catalog = ModelCatalog::builtin();
        let always_on = catalog.tier_members(ModelTier::AlwaysOn);
        assert_eq!(always_on[0].name, "gemma-3-270m");
        assert!(always_on.windows(2).all(|w| w[0].ram_bytes <= w[1].ram_bytes));
    }

    #[test]
    fn priority_ranks_map_for_eviction() {
        assert_eq!(ModelPriority::Critical.rank(), 4);
        assert_eq!(ModelPriority::High.rank(), 3);
        assert_eq!(ModelPriority::Medium.rank(), 2);
        assert_eq!(ModelPriority::Low.rank(), 1);
    }

    #[test]
    fn suits_task_matches_tag_words() {
        let catalog = ModelCatalog::builtin();
        let coder = catalog.get("qwen3-coder").unwrap();
        assert!(coder.suits_task("please run a code review on this diff"));
        assert!(!coder.suits_task("write a poem about autumn"));
    }
}
