use super::openai::OpenAiAdapter;
use super::{ChatDeltaStream, ProviderAdapter, ProviderCapabilities};
use crate::chat::{ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse};
use crate::error::LlmError;
use async_trait::async_trait;
use futures::StreamExt;

/// Configuration for an OpenAI-compatible surrogate provider (Groq,
/// Together, Fireworks, Perplexity, DeepSeek, and similar chat-completions
/// lookalikes): same wire schema as OpenAI, different base URL and a
/// provider-specific name used for error attribution and event tagging.
pub struct OpenAiCompatibleConfig {
    pub provider_name: String,
    pub base_url: String,
    pub supports_embeddings: bool,
}

pub struct CompatibleAdapter {
    config: OpenAiCompatibleConfig,
    inner: OpenAiAdapter,
}

impl CompatibleAdapter {
    pub fn new(config: OpenAiCompatibleConfig) -> Self {
        let inner = OpenAiAdapter {
            base_url: config.base_url.clone(),
        };
        Self { config, inner }
    }
}

#[async_trait]
impl ProviderAdapter for CompatibleAdapter {
    fn name(&self) -> &str {
        &self.config.provider_name
    }

    fn supports(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            streaming: true,
            embeddings: self.config.supports_embeddings,
            vision: false,
            tools: true,
        }
    }

    async fn chat(&self, req: &ChatRequest, api_key: &str) -> Result<ChatResponse, LlmError> {
        let mut resp = self.inner.chat(req, api_key).await?;
        resp.provider = self.config.provider_name.clone();
        Ok(resp)
    }

    async fn chat_stream(&self, req: &ChatRequest, api_key: &str) -> Result<ChatDeltaStream, LlmError> {
        let inner_stream = self.inner.chat_stream(req, api_key).await?;
        let provider_name = self.config.provider_name.clone();
        let stream = inner_stream.map(move |delta| {
            delta.map(|mut d| {
                d.provider = provider_name.clone();
                d
            })
        });
        Ok(Box::pin(stream))
    }

    async fn embed(&self, req: &EmbeddingRequest, api_key: &str) -> Result<EmbeddingResponse, LlmError> {
        if !self.config.supports_embeddings {
            return Err(LlmError::new(
                crate::error::ErrorKind::RequestFailed,
                format!("{} does not support embeddings", self.config.provider_name),
            ));
        }
        let mut resp = self.inner.embed(req, api_key).await?;
        resp.provider = self.config.provider_name.clone();
        Ok(resp)
    }
}

/// Built-in configs for the OpenAI-shape surrogate providers the library
/// ships out of the box.
pub fn known_surrogates() -> Vec<OpenAiCompatibleConfig> {
    vec![
        OpenAiCompatibleConfig {
            provider_name: "groq".to_string(),
            base_url: "https://api.groq.com/openai/v1".to_string(),
            supports_embeddings: false,
        },
        OpenAiCompatibleConfig {
            provider_name: "together".to_string(),
            base_url: "https://api.together.xyz/v1".to_string(),
            supports_embeddings: true,
        },
        OpenAiCompatibleConfig {
            provider_name: "fireworks".to_string(),
            base_url: "https://api.fireworks.ai/inference/v1".to_string(),
            supports_embeddings: true,
        },
        OpenAiCompatibleConfig {
            provider_name: "perplexity".to_string(),
            base_url: "https://api.perplexity.ai".to_string(),
            supports_embeddings: false,
        },
        OpenAiCompatibleConfig {
            provider_name: "deepseek".to_string(),
            base_url: "https://api.deepseek.com/v1".to_string(),
            supports_embeddings: false,
        },
        OpenAiCompatibleConfig {
            provider_name: "mistral".to_string(),
            base_url: "https://api.mistral.ai/v1".to_string(),
            supports_embeddings: true,
        },
        OpenAiCompatibleConfig {
            provider_name: "openrouter".to_string(),
            base_url: "https://openrouter.ai/api/v1".to_string(),
            supports_embeddings: false,
        },
        OpenAiCompatibleConfig {
            provider_name: "alibaba".to_string(),
            base_url: "https://dashscope.aliyuncs.com/compatible-mode/v1".to_string(),
            supports_embeddings: true,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_surrogates_cover_eight_providers() {
        assert_eq!(known_surrogates().len(), 8);
    }

    #[test]
    fn adapter_name_matches_its_config() {
        let adapter = CompatibleAdapter::new(OpenAiCompatibleConfig {
            provider_name: "groq".to_string(),
            base_url: "https://api.groq.com/openai/v1".to_string(),
            supports_embeddings: false,
        });
        assert_eq!(adapter.name(), "groq");
        assert!(!adapter.supports().embeddings);
    }
}
