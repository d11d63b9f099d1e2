use super::http::new_request_id;
use super::{ChatDeltaStream, ProviderAdapter, ProviderCapabilities};
use crate::chat::{
    ChatRequest, ChatResponse, ChatStreamDelta, Choice, ChoiceDelta, EmbeddingRequest, EmbeddingResponse,
    FinishReason, Message, Timing, Usage,
};
use crate::error::{ErrorKind, LlmError};
use crate::stream::parse_json_sse_stream;
use crate::transport::{call_outbound, call_outbound_stream};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use http::Request;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// OpenAI-shape adapter: messages pass through largely verbatim, tools are
/// typed function schemas, `response_format`/`seed` forward directly.
pub struct OpenAiAdapter {
    pub base_url: String,
}

impl Default for OpenAiAdapter {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
        }
    }
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a either::Either<String, Vec<String>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a Vec<crate::chat::Tool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<&'a crate::chat::ResponseFormat>,
    stream: bool,
}

#[derive(Serialize)]
struct WireMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    function: WireFunctionCall,
}

#[derive(Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

fn to_wire_tool_calls(tool_calls: &Option<Vec<crate::chat::ToolCall>>) -> Option<Vec<WireToolCall>> {
    tool_calls.as_ref().map(|calls| {
        calls
            .iter()
            .map(|tc| WireToolCall {
                id: tc.id.clone(),
                kind: "function".to_string(),
                function: WireFunctionCall {
                    name: tc.name.clone(),
                    arguments: serde_json::to_string(&tc.arguments).unwrap_or_default(),
                },
            })
            .collect()
    })
}

fn from_wire_tool_calls(tool_calls: Option<Vec<WireToolCall>>) -> Option<Vec<crate::chat::ToolCall>> {
    tool_calls.map(|calls| {
        calls
            .into_iter()
            .map(|tc| crate::chat::ToolCall {
                id: tc.id,
                name: tc.function.name,
                arguments: serde_json::from_str(&tc.function.arguments).unwrap_or(Value::Null),
            })
            .collect()
    })
}

fn role_str(role: crate::chat::Role) -> &'static str {
    match role {
        crate::chat::Role::System => "system",
        crate::chat::Role::User => "user",
        crate::chat::Role::Assistant => "assistant",
        crate::chat::Role::Tool => "tool",
    }
}

fn build_wire_request<'a>(req: &'a ChatRequest, stream: bool) -> WireRequest<'a> {
    WireRequest {
        model: &req.model,
        messages: req
            .messages
            .iter()
            .map(|m| WireMessage {
                role: role_str(m.role),
                content: Some(m.text()),
                tool_call_id: m.tool_call_id.clone(),
                tool_calls: to_wire_tool_calls(&m.tool_calls),
            })
            .collect(),
        temperature: req.temperature,
        top_p: req.top_p,
        max_tokens: req.max_tokens,
        stop: req.stop.as_ref(),
        presence_penalty: req.presence_penalty,
        frequency_penalty: req.frequency_penalty,
        seed: req.seed,
        tools: req.tools.as_ref(),
        response_format: req.response_format.as_ref(),
        stream,
    }
}

#[derive(Deserialize)]
struct WireResponse {
    id: String,
    model: String,
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireChoice {
    index: u32,
    message: WireResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Deserialize)]
struct WireUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

fn map_finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("stop") => FinishReason::Stop,
        Some("length") => FinishReason::Length,
        Some("tool_calls") | Some("function_call") => FinishReason::ToolCalls,
        Some("content_filter") => FinishReason::ContentFilter,
        _ => FinishReason::Null,
    }
}

impl OpenAiAdapter {
    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn auth_request(&self, body: Vec<u8>, api_key: &str) -> Result<Request<Vec<u8>>, LlmError> {
        Request::post(self.endpoint())
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {api_key}"))
            .body(body)
            .map_err(LlmError::from)
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn name(&self) -> &str {
        "openai"
    }

    fn supports(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            streaming: true,
            embeddings: true,
            vision: true,
            tools: true,
        }
    }

    async fn chat(&self, req: &ChatRequest, api_key: &str) -> Result<ChatResponse, LlmError> {
        let wire = build_wire_request(req, false);
        let body = serde_json::to_vec(&wire)?;
        let http_req = self.auth_request(body, api_key)?;
        let http_resp = call_outbound(http_req).await?;

        if !http_resp.status().is_success() {
            let text = String::from_utf8_lossy(http_resp.body());
            return Err(LlmError::from_http_status(http_resp.status().as_u16(), &text, "openai"));
        }

        let parsed: WireResponse = super::http::parse_json_body(http_resp.body())?;
        Ok(ChatResponse {
            id: parsed.id,
            created: Utc::now(),
            model: parsed.model,
            provider: "openai".to_string(),
            choices: parsed
                .choices
                .into_iter()
                .map(|c| Choice {
                    index: c.index,
                    message: Message {
                        role: crate::chat::Role::Assistant,
                        content: c.message.content.map(either::Either::Left),
                        tool_calls: from_wire_tool_calls(c.message.tool_calls),
                        tool_call_id: None,
                    },
                    finish_reason: map_finish_reason(c.finish_reason.as_deref()),
                })
                .collect(),
            usage: parsed.usage.map(|u| Usage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
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
        let wire = build_wire_request(req, true);
        let body = serde_json::to_vec(&wire)?;
        let http_req = self.auth_request(body, api_key)?;
        let bytes_stream = call_outbound_stream(http_req).await?;
        let model = req.model.clone();
        let id = new_request_id();

        let deltas = parse_json_sse_stream(bytes_stream).map(move |value| -> Result<ChatStreamDelta, LlmError> {
            let value: Value = value?;
            let choices = value
                .get("choices")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let mapped = choices
                .into_iter()
                .map(|c| ChoiceDelta {
                    index: c.get("index").and_then(Value::as_u64).unwrap_or(0) as u32,
                    content: c
                        .pointer("/delta/content")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    tool_calls: None,
                    finish_reason: c
                        .get("finish_reason")
                        .and_then(Value::as_str)
                        .map(|r| map_finish_reason(Some(r))),
                })
                .collect();
            Ok(ChatStreamDelta {
                id: id.clone(),
                model: model.clone(),
                provider: "openai".to_string(),
                choices: mapped,
                usage: None,
            })
        });
        Ok(Box::pin(deltas))
    }

    async fn embed(&self, req: &EmbeddingRequest, api_key: &str) -> Result<EmbeddingResponse, LlmError> {
        #[derive(Serialize)]
        struct EmbedWire<'a> {
            model: &'a str,
            input: &'a either::Either<String, Vec<String>>,
        }
        #[derive(Deserialize)]
        struct EmbedDatum {
            index: u32,
            embedding: Vec<f32>,
        }
        #[derive(Deserialize)]
        struct EmbedResp {
            data: Vec<EmbedDatum>,
            #[serde(default)]
            usage: Option<WireUsage>,
        }

        let body = serde_json::to_vec(&EmbedWire {
            model: &req.model,
            input: &req.input,
        })?;
        let http_req = Request::post(format!("{}/embeddings", self.base_url))
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {api_key}"))
            .body(body)
            .map_err(LlmError::from)?;
        let http_resp = call_outbound(http_req).await?;
        if !http_resp.status().is_success() {
            let text = String::from_utf8_lossy(http_resp.body());
            return Err(LlmError::from_http_status(http_resp.status().as_u16(), &text, "openai"));
        }
        let parsed: EmbedResp = super::http::parse_json_body(http_resp.body())?;
        Ok(EmbeddingResponse {
            model: req.model.clone(),
            provider: "openai".to_string(),
            data: parsed
                .data
                .into_iter()
                .map(|d| crate::chat::EmbeddingDatum {
                    index: d.index,
                    embedding: d.embedding,
                })
                .collect(),
            usage: parsed.usage.map(|u| Usage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
                reasoning_tokens: None,
                cached_tokens: None,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::Message;

    #[test]
    fn wire_request_carries_model_and_messages() {
        let req = ChatRequest::new("openai", "gpt-4-turbo", vec![Message::user("hi")]);
        let wire = build_wire_request(&req, false);
        assert_eq!(wire.model, "gpt-4-turbo");
        assert_eq!(wire.messages.len(), 1);
        assert_eq!(wire.messages[0].role, "user");
        assert!(!wire.stream);
    }

    #[test]
    fn finish_reason_maps_tool_calls_and_length() {
        assert_eq!(map_finish_reason(Some("tool_calls")), FinishReason::ToolCalls);
        assert_eq!(map_finish_reason(Some("length")), FinishReason::Length);
        assert_eq!(map_finish_reason(None), FinishReason::Null);
    }

    #[tokio::test]
    async fn chat_surfaces_non_2xx_as_classified_error() {
        let adapter = OpenAiAdapter {
            base_url: "http://127.0.0.1:0".to_string(),
        };
        let req = ChatRequest::new("openai", "gpt-4-turbo", vec![Message::user("hi")]);
        let err = adapter.chat(&req, "sk-test").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NetworkError);
    }
}
