use parking_lot::RwLock;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    Chat,
    Embedding,
    Completion,
    Image,
    Audio,
    Multimodal,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ModelPricing {
    pub input: f64,
    pub output: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ModelInfo {
    pub provider: String,
    pub id: String,
    pub name: String,
    pub model_type: ModelType,
    pub context_window: u32,
    pub max_output_tokens: u32,
    pub supports_vision: bool,
    pub supports_tools: bool,
    pub supports_streaming: bool,
    pub supports_json_mode: bool,
    pub supports_reasoning: bool,
    pub pricing: ModelPricing,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deprecation_date: Option<chrono::NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_date: Option<chrono::NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Default)]
pub struct ModelRequirements {
    pub model_type: Option<ModelType>,
    pub min_context_window: Option<u32>,
    pub supports_vision: Option<bool>,
    pub supports_tools: Option<bool>,
}

/// Static `(provider, model)` metadata lookup. Seeded once at construction
/// from a small built-in table (not a live network fetch — this crate
/// treats provider/model metadata as static, unlike a models.dev-style
/// disk cache). Behind a process-wide singleton with an explicit test
/// reset hook.
pub struct ModelRegistry {
    models: RwLock<HashMap<(String, String), ModelInfo>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self {
            models: RwLock::new(seed_models()),
        }
    }

    #[cfg(test)]
    pub fn new_for_test() -> Self {
        Self::new()
    }

    pub fn global() -> &'static ModelRegistry {
        static INSTANCE: once_cell::sync::Lazy<ModelRegistry> =
            once_cell::sync::Lazy::new(ModelRegistry::new);
        &INSTANCE
    }

    pub fn reset_for_test(&self) {
        *self.models.write() = seed_models();
    }

    pub fn get_model(&self, provider: &str, model: &str) -> Option<ModelInfo> {
        self.models
            .read()
            .get(&(provider.to_string(), model.to_string()))
            .cloned()
    }

    pub fn get_all_models(&self) -> Vec<ModelInfo> {
        self.models.read().values().cloned().collect()
    }

    pub fn get_models_for_provider(&self, provider: &str) -> Vec<ModelInfo> {
        self.models
            .read()
            .values()
            .filter(|m| m.provider == provider)
            .cloned()
            .collect()
    }

    pub fn get_chat_models(&self) -> Vec<ModelInfo> {
        self.by_type(ModelType::Chat)
    }

    pub fn get_embedding_models(&self) -> Vec<ModelInfo> {
        self.by_type(ModelType::Embedding)
    }

    fn by_type(&self, model_type: ModelType) -> Vec<ModelInfo> {
        self.models
            .read()
            .values()
            .filter(|m| m.model_type == model_type)
            .cloned()
            .collect()
    }

    pub fn get_models_with_feature(&self, feature: &str) -> Vec<ModelInfo> {
        self.models
            .read()
            .values()
            .filter(|m| match feature {
                "vision" => m.supports_vision,
                "tools" => m.supports_tools,
                "streaming" => m.supports_streaming,
                "json_mode" => m.supports_json_mode,
                "reasoning" => m.supports_reasoning,
                _ => false,
            })
            .cloned()
            .collect()
    }

    pub fn get_active_models(&self) -> Vec<ModelInfo> {
        self.models
            .read()
            .values()
            .filter(|m| m.deprecation_date.is_none())
            .cloned()
            .collect()
    }

    pub fn get_context_window(&self, provider: &str, model: &str) -> Option<u32> {
        self.get_model(provider, model).map(|m| m.context_window)
    }

    pub fn get_model_pricing(&self, provider: &str, model: &str) -> Option<ModelPricing> {
        self.get_model(provider, model).map(|m| m.pricing)
    }

    pub fn find_model(&self, reqs: &ModelRequirements) -> Vec<ModelInfo> {
        self.models
            .read()
            .values()
            .filter(|m| {
                reqs.model_type.map(|t| t == m.model_type).unwrap_or(true)
                    && reqs
                        .min_context_window
                        .map(|w| m.context_window >= w)
                        .unwrap_or(true)
                    && reqs.supports_vision.map(|v| v == m.supports_vision).unwrap_or(true)
                    && reqs.supports_tools.map(|v| v == m.supports_tools).unwrap_or(true)
            })
            .cloned()
            .collect()
    }

    pub fn register_model(&self, model: ModelInfo) {
        self.models
            .write()
            .insert((model.provider.clone(), model.id.clone()), model);
    }

    pub fn unregister_model(&self, provider: &str, model: &str) -> bool {
        self.models
            .write()
            .remove(&(provider.to_string(), model.to_string()))
            .is_some()
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn seed_models() -> HashMap<(String, String), ModelInfo> {
    let mut map = HashMap::new();
    let mut insert = |m: ModelInfo| {
        map.insert((m.provider.clone(), m.id.clone()), m);
    };

    insert(ModelInfo {
        provider: "openai".into(),
        id: "gpt-4-turbo".into(),
        name: "GPT-4 Turbo".into(),
        model_type: ModelType::Chat,
        context_window: 128_000,
        max_output_tokens: 4096,
        supports_vision: true,
        supports_tools: true,
        supports_streaming: true,
        supports_json_mode: true,
        supports_reasoning: false,
        pricing: ModelPricing { input: 10.0, output: 30.0, cached: None },
        aliases: vec![],
        deprecation_date: None,
        successor: None,
        release_date: None,
        description: None,
    });
    insert(ModelInfo {
        provider: "openai".into(),
        id: "text-embedding-3-small".into(),
        name: "Text Embedding 3 Small".into(),
        model_type: ModelType::Embedding,
        context_window: 8191,
        max_output_tokens: 0,
        supports_vision: false,
        supports_tools: false,
        supports_streaming: false,
        supports_json_mode: false,
        supports_reasoning: false,
        pricing: ModelPricing { input: 0.02, output: 0.0, cached: None },
        aliases: vec![],
        deprecation_date: None,
        successor: None,
        release_date: None,
        description: None,
    });
    insert(ModelInfo {
        provider: "anthropic".into(),
        id: "claude-3-opus-20240229".into(),
        name: "Claude 3 Opus".into(),
        model_type: ModelType::Chat,
        context_window: 200_000,
        max_output_tokens: 4096,
        supports_vision: true,
        supports_tools: true,
        supports_streaming: true,
        supports_json_mode: false,
        supports_reasoning: false,
        pricing: ModelPricing { input: 15.0, output: 75.0, cached: None },
        aliases: vec![],
        deprecation_date: None,
        successor: None,
        release_date: None,
        description: None,
    });
    insert(ModelInfo {
        provider: "google".into(),
        id: "gemini-1.5-pro".into(),
        name: "Gemini 1.5 Pro".into(),
        model_type: ModelType::Multimodal,
        context_window: 1_000_000,
        max_output_tokens: 8192,
        supports_vision: true,
        supports_tools: true,
        supports_streaming: true,
        supports_json_mode: true,
        supports_reasoning: false,
        pricing: ModelPricing { input: 3.5, output: 10.5, cached: None },
        aliases: vec![],
        deprecation_date: None,
        successor: None,
        release_date: None,
        description: None,
    });
    insert(ModelInfo {
        provider: "ollama".into(),
        id: "llama3".into(),
        name: "Llama 3".into(),
        model_type: ModelType::Chat,
        context_window: 8192,
        max_output_tokens: 4096,
        supports_vision: false,
        supports_tools: false,
        supports_streaming: true,
        supports_json_mode: false,
        supports_reasoning: false,
        pricing: ModelPricing { input: 0.0, output: 0.0, cached: None },
        aliases: vec![],
        deprecation_date: None,
        successor: None,
        release_date: None,
        description: None,
    });

    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_model_is_queryable() {
        let registry = ModelRegistry::new_for_test();
        let model = registry.get_model("openai", "gpt-4-turbo").unwrap();
        assert_eq!(model.context_window, 128_000);
    }

    #[test]
    fn register_then_unregister_roundtrips() {
        let registry = ModelRegistry::new_for_test();
        registry.register_model(ModelInfo {
            provider: "test".into(),
            id: "custom".into(),
            name: "Custom".into(),
            model_type: ModelType::Chat,
            context_window: 1000,
            max_output_tokens: 100,
            supports_vision: false,
            supports_tools: false,
            supports_streaming: false,
            supports_json_mode: false,
            supports_reasoning: false,
            pricing: ModelPricing::default(),
            aliases: vec![],
            deprecation_date: None,
            successor: None,
            release_date: None,
            description: None,
        });
        assert!(registry.get_model("test", "custom").is_some());
        assert!(registry.unregister_model("test", "custom"));
        assert!(registry.get_model("test", "custom").is_none());
    }

    #[test]
    fn reset_restores_the_seed_table() {
        let registry = ModelRegistry::new_for_test();
        registry.unregister_model("openai", "gpt-4-turbo");
        assert!(registry.get_model("openai", "gpt-4-turbo").is_none());
        registry.reset_for_test();
        assert!(registry.get_model("openai", "gpt-4-turbo").is_some());
    }

    #[test]
    fn find_model_filters_by_requirements() {
        let registry = ModelRegistry::new_for_test();
        let found = registry.find_model(&ModelRequirements {
            model_type: Some(ModelType::Chat),
            min_context_window: Some(150_000),
            ..ModelRequirements::default()
        });
        assert!(found.iter().all(|m| m.context_window >= 150_000));
        assert!(found.iter().any(|m| m.id == "claude-3-opus-20240229"));
    }
}
