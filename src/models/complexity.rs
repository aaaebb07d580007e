// Task complexity scoring and tier-bucketed candidate selection

use crate::models::catalog::{ModelCatalog, ModelConfig, ModelTier};

const SIMPLE_KEYWORDS: &[&str] = &["simple", "quick", "basic", "utility"];
const MODERATE_KEYWORDS: &[&str] = &["moderate", "standard", "normal"];
const COMPLEX_KEYWORDS: &[&str] = &["complex", "advanced", "sophisticated"];
const EXPERT_KEYWORDS: &[&str] = &["expert", "research", "analysis"];

const CODE_KEYWORDS: &[&str] = &["code", "programming", "debug", "refactor"];
const VISION_KEYWORDS: &[&str] = &["image", "vision", "visual", "photo"];
const REASONING_KEYWORDS: &[&str] = &["reasoning", "logic", "math", "calculation"];
const CREATIVE_KEYWORDS: &[&str] = &["creative", "story", "writing", "content"];

const LONG_CONTEXT: u32 = 50_000;
const MEDIUM_CONTEXT: u32 = 10_000;

fn contains_any(text: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|k| text.contains(k))
}

/// Score task complexity between 0.0 and 1.0.
///
/// The context-length adders are mutually exclusive: above 50k characters
/// +0.4 applies, otherwise above 10k +0.2.
pub fn task_complexity(task_description: &str, context_length: u32) -> f64 {
    let description = task_description.to_lowercase();
    let mut complexity: f64 = 0.0;

    complexity += if contains_any(&description, SIMPLE_KEYWORDS) {
        0.1
    } else if contains_any(&description, MODERATE_KEYWORDS) {
        0.3
    } else if contains_any(&description, COMPLEX_KEYWORDS) {
        0.6
    } else if contains_any(&description, EXPERT_KEYWORDS) {
        0.8
    } else {
        0.5
    };

    if contains_any(&description, CODE_KEYWORDS) {
        complexity += 0.2;
    }
    if contains_any(&description, VISION_KEYWORDS) {
        complexity += 0.1;
    }
    if contains_any(&description, REASONING_KEYWORDS) {
        complexity += 0.2;
    }
    if contains_any(&description, CREATIVE_KEYWORDS) {
        complexity += 0.1;
    }

    if context_length > LONG_CONTEXT {
        complexity += 0.4;
    } else if context_length > MEDIUM_CONTEXT {
        complexity += 0.2;
    }

    complexity.min(1.0)
}

fn is_vision_model(config: &ModelConfig) -> bool {
    config
        .specializations
        .iter()
        .chain(config.use_cases.iter())
        .any(|tag| tag.contains("vision") || tag.contains("image") || tag.contains("multimodal"))
}

fn is_code_model(config: &ModelConfig) -> bool {
    config
        .specializations
        .iter()
        .chain(config.use_cases.iter())
        .any(|tag| tag.contains("code") || tag.contains("debug"))
}

/// Candidate model names for the task, in attempt order.
pub fn select_candidates(
    catalog: &ModelCatalog,
    task_description: &str,
    context_length: u32,
) -> Vec<String> {
    let complexity = task_complexity(task_description, context_length);
    let description = task_description.to_lowercase();

    let names = |configs: Vec<&ModelConfig>| -> Vec<String> {
        configs.into_iter().map(|c| c.name.clone()).collect()
    };

    if complexity < 0.3 {
        return names(catalog.tier_members(ModelTier::AlwaysOn));
    }

    if complexity < 0.6 {
        let mut members = catalog.tier_members(ModelTier::Frequent);
        if contains_any(&description, VISION_KEYWORDS) {
            members.sort_by_key(|c| if is_vision_model(c) { 0 } else { 1 });
        }
        return names(members);
    }

    let mut members = catalog.tier_members(ModelTier::OnDemand);
    if contains_any(&description, CODE_KEYWORDS) {
        members.sort_by_key(|c| if is_code_model(c) { 0 } else { 1 });
    } else if context_length > LONG_CONTEXT {
        members.sort_by(|a, b| b.context_length.cmp(&a.context_length));
    }
    names(members)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_keyword_classes_score_as_specified() {
        assert_eq!(task_complexity("a simple lookup", 0), 0.1);
        assert_eq!(task_complexity("standard summarization", 0), 0.3);
        assert_eq!(task_complexity("an advanced pipeline", 0), 0.6);
        assert_eq!(task_complexity("research synthesis", 0), 0.8);
        assert_eq!(task_complexity("translate this sentence", 0), 0.5);
    }

    #[test]
    fn domain_adders_stack() {
        // 0.5 default + 0.2 code + 0.2 reasoning
        let score = task_complexity("debug this logic error", 0);
        assert!((score - 0.9).abs() < 1e-9);
    }

    #[test]
    fn score_is_capped_at_one() {
        let score = task_complexity("expert research: debug math reasoning in images", 100_000);
        assert_eq!(score, 1.0);
    }

    #[test]
    fn context_adders_are_mutually_exclusive() {
        let base = task_complexity("translate this", 0);
        assert_eq!(task_complexity("translate this", 20_000), base + 0.2);
        assert_eq!(task_complexity("translate this", 80_000), base + 0.4);
    }

    #[test]
    fn simple_tasks_pick_always_on_models() {
        let catalog = ModelCatalog::builtin();
        let candidates = select_candidates(&catalog, "quick utility check", 0);
        assert_eq!(candidates[0], "gemma-3-270m");
        assert!(candidates.contains(&"phi3-mini".to_string()));
    }

    #[test]
    fn vision_tasks_prefer_vision_models_in_frequent_tier() {
        let catalog = ModelCatalog::builtin();
        // 0.3 moderate + 0.1 vision = 0.4 -> frequent bucket
        let candidates = select_candidates(&catalog, "standard image captioning", 0);
        assert_eq!(candidates[0], "qwen2.5-vl");
    }

    #[test]
    fn coding_tasks_prefer_code_models_in_on_demand_tier() {
        let catalog = ModelCatalog::builtin();
        let candidates = select_candidates(&catalog, "complex refactor of the programming project", 0);
        assert_eq!(candidates[0], "qwen3-coder");
    }

    #[test]
    fn long_context_prefers_long_context_models() {
        let catalog = ModelCatalog::builtin();
        let candidates = select_candidates(&catalog, "sophisticated document analysis", 120_000);
        let first = catalog.get(&candidates[0]).unwrap();
        assert!(first.context_length >= 128_000);
    }
}
