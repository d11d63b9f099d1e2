pub mod anthropic;
pub mod compatible;
pub mod google;
pub mod ollama;
pub mod openai;

use crate::chat::{ChatRequest, ChatResponse, ChatStreamDelta, EmbeddingRequest, EmbeddingResponse};
use crate::error::LlmError;
use crate::registry::ModelInfo;
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

pub type ChatDeltaStream = Pin<Box<dyn Stream<Item = Result<ChatStreamDelta, LlmError>> + Send>>;

#[derive(Debug, Clone, Copy, Default)]
pub struct ProviderCapabilities {
    pub streaming: bool,
    pub embeddings: bool,
    pub vision: bool,
    pub tools: bool,
}

/// Every concrete adapter fulfills this one capability interface; the
/// Orchestrator never branches on which provider it is talking to. A
/// `BaseProvider`-equivalent (auth header construction, request id
/// generation, JSON error parsing) lives in `http.rs` and is shared by every
/// adapter rather than duplicated.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn supports(&self) -> ProviderCapabilities;

    async fn chat(&self, req: &ChatRequest, api_key: &str) -> Result<ChatResponse, LlmError>;

    async fn chat_stream(&self, req: &ChatRequest, api_key: &str) -> Result<ChatDeltaStream, LlmError>;

    async fn embed(&self, req: &EmbeddingRequest, api_key: &str) -> Result<EmbeddingResponse, LlmError> {
        let _ = (req, api_key);
        Err(LlmError::new(
            crate::error::ErrorKind::RequestFailed,
            format!("{} does not support embeddings", self.name()),
        ))
    }

    async fn list_models(&self) -> Vec<ModelInfo> {
        Vec::new()
    }
}

pub(crate) mod http {
    use crate::error::LlmError;
    use uuid::Uuid;

    pub fn new_request_id() -> String {
        Uuid::new_v4().to_string()
    }

    pub fn parse_json_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, LlmError> {
        serde_json::from_slice(body).map_err(LlmError::from)
    }
}
