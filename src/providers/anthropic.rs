use super::http::new_request_id;
use super::{ChatDeltaStream, ProviderAdapter, ProviderCapabilities};
use crate::chat::{
    ChatRequest, ChatResponse, ChatStreamDelta, Choice, ChoiceDelta, ContentPart, EmbeddingRequest,
    EmbeddingResponse, FinishReason, Message, Role, Timing, Usage,
};
use crate::error::{ErrorKind, LlmError};
use crate::stream::SseDecoder;
use crate::transport::{call_outbound, call_outbound_stream};
use async_trait::async_trait;
use chrono::Utc;
use either::Either;
use futures::StreamExt;
use http::Request;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Anthropic-shape adapter: system messages are pulled out of the message
/// array into a top-level `system` string, base64 image parts become image
/// content blocks, tools become `{name, description, input_schema}`, `stop`
/// maps to `stop_sequences`, and a default `max_tokens` is enforced when the
/// caller omits one (Anthropic requires it).
pub struct AnthropicAdapter {
    pub base_url: String,
}

impl Default for AnthropicAdapter {
    fn default() -> Self {
        Self {
            base_url: "https://api.anthropic.com/v1".to_string(),
        }
    }
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
    stream: bool,
}

#[derive(Serialize)]
struct WireMessage {
    role: &'static str,
    content: Vec<WireBlock>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlock {
    Text { text: String },
    Image { source: WireImageSource },
}

#[derive(Serialize)]
struct WireImageSource {
    #[serde(rename = "type")]
    kind: &'static str,
    media_type: String,
    data: String,
}

#[derive(Serialize)]
struct WireTool {
    name: String,
    description: String,
    input_schema: Value,
}

fn to_blocks(message: &Message) -> Vec<WireBlock> {
    match &message.content {
        Some(Either::Left(text)) => vec![WireBlock::Text { text: text.clone() }],
        Some(Either::Right(parts)) => parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(WireBlock::Text { text: text.clone() }),
                ContentPart::ImageBase64 { media_type, data } => Some(WireBlock::Image {
                    source: WireImageSource {
                        kind: "base64",
                        media_type: media_type.clone(),
                        data: data.clone(),
                    },
                }),
                _ => None,
            })
            .collect(),
        None => vec![],
    }
}

fn build_wire_request(req: &ChatRequest) -> (WireRequest<'_>, bool) {
    let system = req
        .messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(Message::text)
        .collect::<Vec<_>>()
        .join("\n");
    let messages: Vec<WireMessage> = req
        .messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| WireMessage {
            role: if m.role == Role::Assistant { "assistant" } else { "user" },
            content: to_blocks(m),
        })
        .collect();

    let stop_sequences = req.stop.as_ref().map(|s| match s {
        Either::Left(single) => vec![single.clone()],
        Either::Right(many) => many.clone(),
    });

    let tools = req.tools.as_ref().map(|tools| {
        tools
            .iter()
            .map(|crate::chat::Tool::Function { function }| WireTool {
                name: function.name.clone(),
                description: function.description.clone().unwrap_or_default(),
                input_schema: function.parameters.clone().unwrap_or(Value::Object(Default::default())),
            })
            .collect()
    });

    (
        WireRequest {
            model: &req.model,
            max_tokens: req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            messages,
            system: if system.is_empty() { None } else { Some(system) },
            temperature: req.temperature,
            top_p: req.top_p,
            stop_sequences,
            tools,
            stream: false,
        },
        !system.is_empty(),
    )
}

#[derive(Deserialize)]
struct WireResponse {
    id: String,
    model: String,
    content: Vec<WireResponseBlock>,
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireResponseBlock {
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct WireUsage {
    input_tokens: u32,
    output_tokens: u32,
}

fn map_finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("end_turn") | Some("stop_sequence") => FinishReason::Stop,
        Some("max_tokens") => FinishReason::Length,
        Some("tool_use") => FinishReason::ToolCalls,
        _ => FinishReason::Null,
    }
}

impl AnthropicAdapter {
    fn auth_request(&self, body: Vec<u8>, api_key: &str) -> Result<Request<Vec<u8>>, LlmError> {
        Request::post(format!("{}/messages", self.base_url))
            .header("content-type", "application/json")
            .header("x-api-key", api_key)
            .header("anthropic-version", "2023-06-01")
            .body(body)
            .map_err(LlmError::from)
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn supports(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            streaming: true,
            embeddings: false,
            vision: true,
            tools: true,
        }
    }

    async fn chat(&self, req: &ChatRequest, api_key: &str) -> Result<ChatResponse, LlmError> {
        let (mut wire, _) = build_wire_request(req);
        wire.stream = false;
        let body = serde_json::to_vec(&wire)?;
        let http_req = self.auth_request(body, api_key)?;
        let http_resp = call_outbound(http_req).await?;

        if !http_resp.status().is_success() {
            let text = String::from_utf8_lossy(http_resp.body());
            return Err(LlmError::from_http_status(http_resp.status().as_u16(), &text, "anthropic"));
        }

        let parsed: WireResponse = super::http::parse_json_body(http_resp.body())?;
        let text = parsed
            .content
            .iter()
            .filter_map(|b| match b {
                WireResponseBlock::Text { text } => Some(text.as_str()),
                WireResponseBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("");

        Ok(ChatResponse {
            id: parsed.id,
            created: Utc::now(),
            model: parsed.model,
            provider: "anthropic".to_string(),
            choices: vec![Choice {
                index: 0,
                message: Message {
                    role: Role::Assistant,
                    content: Some(Either::Left(text)),
                    tool_calls: None,
                    tool_call_id: None,
                },
                finish_reason: map_finish_reason(parsed.stop_reason.as_deref()),
            }],
            usage: parsed.usage.map(|u| Usage {
                prompt_tokens: u.input_tokens,
                completion_tokens: u.output_tokens,
                total_tokens: u.input_tokens + u.output_tokens,
                reasoning_tokens: None,
                cached_tokens: None,
            }),
            timing: Some(Timing {
                start: Utc::now(),
                end: Some(Utc::now()),
                duration_ms: Some(0),
                time_to_first_token_ms: None,
            }),
        })
    }

    async fn chat_stream(&self, req: &ChatRequest, api_key: &str) -> Result<ChatDeltaStream, LlmError> {
        let (mut wire, _) = build_wire_request(req);
        wire.stream = true;
        let body = serde_json::to_vec(&wire)?;
        let http_req = self.auth_request(body, api_key)?;
        let bytes_stream = call_outbound_stream(http_req).await?;
        let model = req.model.clone();
        let id = new_request_id();

        let deltas = SseDecoder::new(bytes_stream).filter_map(move |event| {
            let model = model.clone();
            let id = id.clone();
            async move {
                let event = match event {
                    Ok(e) => e,
                    Err(e) => return Some(Err(e)),
                };
                let data = event.data.trim();
                if data.is_empty() {
                    return None;
                }
                let value: Value = match serde_json::from_str(data) {
                    Ok(v) => v,
                    Err(_) => return None,
                };

                match event.event.as_deref() {
                    Some("content_block_delta") => {
                        let text = value.pointer("/delta/text").and_then(Value::as_str)?;
                        Some(Ok(ChatStreamDelta {
                            id,
                            model,
                            provider: "anthropic".to_string(),
                            choices: vec![ChoiceDelta {
                                index: 0,
                                content: Some(text.to_string()),
                                tool_calls: None,
                                finish_reason: None,
                            }],
                            usage: None,
                        }))
                    }
                    Some("message_delta") => {
                        let stop_reason = value.pointer("/delta/stop_reason").and_then(Value::as_str);
                        let usage = value.get("usage").and_then(|u| {
                            let output_tokens = u.get("output_tokens").and_then(Value::as_u64)? as u32;
                            let input_tokens = u.get("input_tokens").and_then(Value::as_u64).unwrap_or(0) as u32;
                            Some(Usage {
                                prompt_tokens: input_tokens,
                                completion_tokens: output_tokens,
                                total_tokens: input_tokens + output_tokens,
                                reasoning_tokens: None,
                                cached_tokens: None,
                            })
                        });
                        Some(Ok(ChatStreamDelta {
                            id,
                            model,
                            provider: "anthropic".to_string(),
                            choices: vec![ChoiceDelta {
                                index: 0,
                                content: None,
                                tool_calls: None,
                                finish_reason: Some(map_finish_reason(stop_reason)),
                            }],
                            usage,
                        }))
                    }
                    Some("error") => {
                        let message = value
                            .pointer("/error/message")
                            .and_then(Value::as_str)
                            .unwrap_or("anthropic stream error")
                            .to_string();
                        Some(Err(LlmError::new(ErrorKind::StreamError, message).with_provider("anthropic")))
                    }
                    // message_start, content_block_start/stop, message_stop, ping carry no
                    // delta text or terminal info worth surfacing to the caller.
                    _ => None,
                }
            }
        });
        Ok(Box::pin(deltas))
    }

    async fn embed(&self, _req: &EmbeddingRequest, _api_key: &str) -> Result<EmbeddingResponse, LlmError> {
        Err(LlmError::new(
            crate::error::ErrorKind::RequestFailed,
            "anthropic does not support embeddings",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::Message;

    #[test]
    fn system_messages_are_extracted_to_top_level() {
        let req = ChatRequest::new(
            "anthropic",
            "claude-3-opus-20240229",
            vec![Message::system("be terse"), Message::user("hi")],
        );
        let (wire, had_system) = build_wire_request(&req);
        assert!(had_system);
        assert_eq!(wire.system.as_deref(), Some("be terse"));
        assert_eq!(wire.messages.len(), 1);
    }

    #[test]
    fn missing_max_tokens_gets_the_default() {
        let req = ChatRequest::new("anthropic", "claude-3-opus-20240229", vec![Message::user("hi")]);
        let (wire, _) = build_wire_request(&req);
        assert_eq!(wire.max_tokens, DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn stop_maps_to_stop_sequences() {
        let mut req = ChatRequest::new("anthropic", "claude-3-opus-20240229", vec![Message::user("hi")]);
        req.stop = Some(Either::Left("STOP".to_string()));
        let (wire, _) = build_wire_request(&req);
        assert_eq!(wire.stop_sequences, Some(vec!["STOP".to_string()]));
    }
}
