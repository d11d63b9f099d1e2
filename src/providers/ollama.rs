use super::http::new_request_id;
use super::{ChatDeltaStream, ProviderAdapter, ProviderCapabilities};
use crate::chat::{
    ChatRequest, ChatResponse, ChatStreamDelta, Choice, ChoiceDelta, EmbeddingRequest, EmbeddingResponse,
    FinishReason, Message, Role, Timing, Usage,
};
use crate::error::LlmError;
use crate::stream::NdjsonDecoder;
use crate::transport::{call_outbound, call_outbound_stream};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use http::Request;
use serde::{Deserialize, Serialize};

/// Local-inference adapter: no credential is required, the base URL is
/// overridden to point at a local daemon, and streaming replies arrive as
/// newline-delimited JSON rather than Server-Sent Events.
pub struct OllamaAdapter {
    pub base_url: String,
}

impl Default for OllamaAdapter {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
        }
    }
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    stream: bool,
}

#[derive(Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

fn build_wire_request(req: &ChatRequest, stream: bool) -> WireRequest<'_> {
    WireRequest {
        model: &req.model,
        messages: req
            .messages
            .iter()
            .map(|m| WireMessage {
                role: match m.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    Role::Tool => "tool",
                },
                content: m.text(),
            })
            .collect(),
        stream,
    }
}

#[derive(Deserialize)]
struct WireLine {
    model: String,
    message: WireLineMessage,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

#[derive(Deserialize)]
struct WireLineMessage {
    content: String,
}

impl OllamaAdapter {
    fn request(&self, path: &str, body: Vec<u8>) -> Result<Request<Vec<u8>>, LlmError> {
        Request::post(format!("{}{path}", self.base_url))
            .header("content-type", "application/json")
            .body(body)
            .map_err(LlmError::from)
    }
}

#[async_trait]
impl ProviderAdapter for OllamaAdapter {
    fn name(&self) -> &str {
        "ollama"
    }

    fn supports(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            streaming: true,
            embeddings: true,
            vision: false,
            tools: false,
        }
    }

    async fn chat(&self, req: &ChatRequest, _api_key: &str) -> Result<ChatResponse, LlmError> {
        let wire = build_wire_request(req, false);
        let body = serde_json::to_vec(&wire)?;
        let http_req = self.request("/api/chat", body)?;
        let http_resp = call_outbound(http_req).await?;

        if !http_resp.status().is_success() {
            let text = String::from_utf8_lossy(http_resp.body());
            return Err(LlmError::from_http_status(http_resp.status().as_u16(), &text, "ollama"));
        }

        let parsed: WireLine = super::http::parse_json_body(http_resp.body())?;
        Ok(ChatResponse {
            id: new_request_id(),
            created: Utc::now(),
            model: parsed.model,
            provider: "ollama".to_string(),
            choices: vec![Choice {
                index: 0,
                message: Message {
                    role: Role::Assistant,
                    content: Some(either::Either::Left(parsed.message.content)),
                    tool_calls: None,
                    tool_call_id: None,
                },
                finish_reason: if parsed.done { FinishReason::Stop } else { FinishReason::Null },
            }],
            usage: match (parsed.prompt_eval_count, parsed.eval_count) {
                (Some(p), Some(c)) => Some(Usage {
                    prompt_tokens: p,
                    completion_tokens: c,
                    total_tokens: p + c,
                    reasoning_tokens: None,
                    cached_tokens: None,
                }),
                _ => None,
            },
            timing: Some(Timing {
                start: Utc::now(),
                end: Some(Utc::now()),
                duration_ms: Some(0),
                time_to_first_token_ms: None,
            }),
        })
    }

    async fn chat_stream(&self, req: &ChatRequest, _api_key: &str) -> Result<ChatDeltaStream, LlmError> {
        let wire = build_wire_request(req, true);
        let body = serde_json::to_vec(&wire)?;
        let http_req = self.request("/api/chat", body)?;
        let bytes_stream = call_outbound_stream(http_req).await?;
        let decoder = NdjsonDecoder::new(bytes_stream);
        let id = new_request_id();

        let deltas = decoder.filter_map(move |line| {
            let id = id.clone();
            async move {
                let line = match line {
                    Ok(l) => l,
                    Err(e) => return Some(Err(e)),
                };
                let parsed: WireLine = match serde_json::from_value(line) {
                    Ok(p) => p,
                    Err(_) => return None,
                };
                Some(Ok(ChatStreamDelta {
                    id,
                    model: parsed.model,
                    provider: "ollama".to_string(),
                    choices: vec![ChoiceDelta {
                        index: 0,
                        content: Some(parsed.message.content),
                        tool_calls: None,
                        finish_reason: if parsed.done { Some(FinishReason::Stop) } else { None },
                    }],
                    usage: None,
                }))
            }
        });
        Ok(Box::pin(deltas))
    }

    async fn embed(&self, req: &EmbeddingRequest, _api_key: &str) -> Result<EmbeddingResponse, LlmError> {
        #[derive(Serialize)]
        struct EmbedWire<'a> {
            model: &'a str,
            prompt: &'a str,
        }
        #[derive(Deserialize)]
        struct EmbedResp {
            embedding: Vec<f32>,
        }

        let inputs: Vec<&str> = match &req.input {
            either::Either::Left(s) => vec![s.as_str()],
            either::Either::Right(many) => many.iter().map(String::as_str).collect(),
        };

        // Ollama's /api/embeddings endpoint takes exactly one prompt per
        // call; issue one request per input and preserve indices.
        let mut data = Vec::with_capacity(inputs.len());
        for (index, prompt) in inputs.into_iter().enumerate() {
            let body = serde_json::to_vec(&EmbedWire {
                model: &req.model,
                prompt,
            })?;
            let http_req = self.request("/api/embeddings", body)?;
            let http_resp = call_outbound(http_req).await?;
            if !http_resp.status().is_success() {
                let text = String::from_utf8_lossy(http_resp.body());
                return Err(LlmError::from_http_status(http_resp.status().as_u16(), &text, "ollama"));
            }
            let parsed: EmbedResp = super::http::parse_json_body(http_resp.body())?;
            data.push(crate::chat::EmbeddingDatum {
                index: index as u32,
                embedding: parsed.embedding,
            });
        }

        Ok(EmbeddingResponse {
            model: req.model.clone(),
            provider: "ollama".to_string(),
            data,
            usage: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::Message;

    #[test]
    fn wire_request_maps_roles() {
        let req = ChatRequest::new(
            "ollama",
            "llama3",
            vec![Message::system("sys"), Message::user("hi")],
        );
        let wire = build_wire_request(&req, true);
        assert_eq!(wire.messages[0].role, "system");
        assert_eq!(wire.messages[1].role, "user");
        assert!(wire.stream);
    }
}
