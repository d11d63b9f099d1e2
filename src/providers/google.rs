use super::http::new_request_id;
use super::{ChatDeltaStream, ProviderAdapter, ProviderCapabilities};
use crate::chat::{
    ChatRequest, ChatResponse, ChatStreamDelta, Choice, ChoiceDelta, EmbeddingRequest, EmbeddingResponse,
    FinishReason, Message, Role, Timing, Usage,
};
use crate::error::LlmError;
use crate::stream::parse_json_sse_stream;
use crate::transport::{call_outbound, call_outbound_stream};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use http::Request;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Gemini-shape adapter: messages become alternating-role `contents` with
/// `parts`, system content is fused into a top-level instruction, and tools
/// become `functionDeclarations`.
pub struct GoogleAdapter {
    pub base_url: String,
}

impl Default for GoogleAdapter {
    fn default() -> Self {
        Self {
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
        }
    }
}

#[derive(Serialize)]
struct WireRequest {
    contents: Vec<WireContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<WireContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<WireGenerationConfig>,
}

#[derive(Serialize)]
struct WireContent {
    role: &'static str,
    parts: Vec<WirePart>,
}

#[derive(Serialize)]
struct WirePart {
    text: String,
}

#[derive(Serialize, Default)]
struct WireGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

fn gemini_role(role: Role) -> &'static str {
    match role {
        Role::Assistant => "model",
        _ => "user",
    }
}

fn build_wire_request(req: &ChatRequest) -> WireRequest {
    let system_text = req
        .messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(Message::text)
        .collect::<Vec<_>>()
        .join("\n");

    let mut contents = Vec::new();
    for message in req.messages.iter().filter(|m| m.role != Role::System) {
        let role = gemini_role(message.role);
        // Gemini requires strictly alternating roles; merge consecutive
        // same-role messages into one content block rather than emitting
        // back-to-back entries of the same role.
        if let Some(last) = contents.last_mut() {
            let last: &mut WireContent = last;
            if last.role == role {
                last.parts.push(WirePart { text: message.text() });
                continue;
            }
        }
        contents.push(WireContent {
            role,
            parts: vec![WirePart { text: message.text() }],
        });
    }

    WireRequest {
        contents,
        system_instruction: if system_text.is_empty() {
            None
        } else {
            Some(WireContent {
                role: "user",
                parts: vec![WirePart { text: system_text }],
            })
        },
        generation_config: Some(WireGenerationConfig {
            temperature: req.temperature,
            top_p: req.top_p,
            max_output_tokens: req.max_tokens,
        }),
    }
}

#[derive(Deserialize)]
struct WireResponse {
    candidates: Vec<WireCandidate>,
    #[serde(rename = "usageMetadata", default)]
    usage_metadata: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireCandidate {
    content: WireResponseContent,
    #[serde(rename = "finishReason", default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireResponseContent {
    parts: Vec<WireResponsePart>,
}

#[derive(Deserialize)]
struct WireResponsePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(rename = "promptTokenCount")]
    prompt_token_count: u32,
    #[serde(rename = "candidatesTokenCount")]
    candidates_token_count: u32,
}

fn map_finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("STOP") => FinishReason::Stop,
        Some("MAX_TOKENS") => FinishReason::Length,
        Some("SAFETY") | Some("RECITATION") => FinishReason::ContentFilter,
        _ => FinishReason::Null,
    }
}

impl GoogleAdapter {
    fn endpoint(&self, model: &str, method: &str) -> String {
        format!("{}/models/{}:{}", self.base_url, model, method)
    }
}

#[async_trait]
impl ProviderAdapter for GoogleAdapter {
    fn name(&self) -> &str {
        "google"
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
        let wire = build_wire_request(req);
        let body = serde_json::to_vec(&wire)?;
        let http_req = Request::post(format!("{}?key={}", self.endpoint(&req.model, "generateContent"), api_key))
            .header("content-type", "application/json")
            .body(body)
            .map_err(LlmError::from)?;
        let http_resp = call_outbound(http_req).await?;

        if !http_resp.status().is_success() {
            let text = String::from_utf8_lossy(http_resp.body());
            return Err(LlmError::from_http_status(http_resp.status().as_u16(), &text, "google"));
        }

        let parsed: WireResponse = super::http::parse_json_body(http_resp.body())?;
        let candidate = parsed
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::new(crate::error::ErrorKind::RequestFailed, "no candidates returned"))?;
        let text = candidate
            .content
            .parts
            .iter()
            .filter_map(|p| p.text.as_deref())
            .collect::<Vec<_>>()
            .join("");

        Ok(ChatResponse {
            id: new_request_id(),
            created: Utc::now(),
            model: req.model.clone(),
            provider: "google".to_string(),
            choices: vec![Choice {
                index: 0,
                message: Message {
                    role: Role::Assistant,
                    content: Some(either::Either::Left(text)),
                    tool_calls: None,
                    tool_call_id: None,
                },
                finish_reason: map_finish_reason(candidate.finish_reason.as_deref()),
            }],
            usage: parsed.usage_metadata.map(|u| Usage {
                prompt_tokens: u.prompt_token_count,
                completion_tokens: u.candidates_token_count,
                total_tokens: u.prompt_token_count + u.candidates_token_count,
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
        let wire = build_wire_request(req);
        let body = serde_json::to_vec(&wire)?;
        let url = format!(
            "{}?key={}&alt=sse",
            self.endpoint(&req.model, "streamGenerateContent"),
            api_key
        );
        let http_req = Request::post(url)
            .header("content-type", "application/json")
            .body(body)
            .map_err(LlmError::from)?;
        let bytes_stream = call_outbound_stream(http_req).await?;
        let model = req.model.clone();
        let id = new_request_id();

        let deltas = parse_json_sse_stream(bytes_stream).map(move |value| -> Result<ChatStreamDelta, LlmError> {
            let value: Value = value?;
            let text = value
                .pointer("/candidates/0/content/parts/0/text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            Ok(ChatStreamDelta {
                id: id.clone(),
                model: model.clone(),
                provider: "google".to_string(),
                choices: vec![ChoiceDelta {
                    index: 0,
                    content: Some(text),
                    tool_calls: None,
                    finish_reason: None,
                }],
                usage: None,
            })
        });
        Ok(Box::pin(deltas))
    }

    async fn embed(&self, req: &EmbeddingRequest, api_key: &str) -> Result<EmbeddingResponse, LlmError> {
        #[derive(Deserialize)]
        struct EmbedValues {
            values: Vec<f32>,
        }

        let inputs: Vec<String> = match &req.input {
            either::Either::Left(s) => vec![s.clone()],
            either::Either::Right(many) => many.clone(),
        };

        if inputs.len() == 1 {
            #[derive(Serialize)]
            struct EmbedWire {
                content: WireContent,
            }
            #[derive(Deserialize)]
            struct EmbedResp {
                embedding: EmbedValues,
            }

            let body = serde_json::to_vec(&EmbedWire {
                content: WireContent {
                    role: "user",
                    parts: vec![WirePart { text: inputs[0].clone() }],
                },
            })?;
            let http_req = Request::post(format!("{}?key={}", self.endpoint(&req.model, "embedContent"), api_key))
                .header("content-type", "application/json")
                .body(body)
                .map_err(LlmError::from)?;
            let http_resp = call_outbound(http_req).await?;
            if !http_resp.status().is_success() {
                let text = String::from_utf8_lossy(http_resp.body());
                return Err(LlmError::from_http_status(http_resp.status().as_u16(), &text, "google"));
            }
            let parsed: EmbedResp = super::http::parse_json_body(http_resp.body())?;
            return Ok(EmbeddingResponse {
                model: req.model.clone(),
                provider: "google".to_string(),
                data: vec![crate::chat::EmbeddingDatum {
                    index: 0,
                    embedding: parsed.embedding.values,
                }],
                usage: None,
            });
        }

        // Gemini's batchEmbedContents takes one request per input and
        // returns one embedding per request, in order.
        #[derive(Serialize)]
        struct BatchEmbedRequest {
            model: String,
            content: WireContent,
        }
        #[derive(Serialize)]
        struct BatchEmbedWire {
            requests: Vec<BatchEmbedRequest>,
        }
        #[derive(Deserialize)]
        struct BatchEmbedResp {
            embeddings: Vec<EmbedValues>,
        }

        let model_path = format!("models/{}", req.model);
        let body = serde_json::to_vec(&BatchEmbedWire {
            requests: inputs
                .into_iter()
                .map(|text| BatchEmbedRequest {
                    model: model_path.clone(),
                    content: WireContent {
                        role: "user",
                        parts: vec![WirePart { text }],
                    },
                })
                .collect(),
        })?;
        let http_req = Request::post(format!(
            "{}?key={}",
            self.endpoint(&req.model, "batchEmbedContents"),
            api_key
        ))
        .header("content-type", "application/json")
        .body(body)
        .map_err(LlmError::from)?;
        let http_resp = call_outbound(http_req).await?;
        if !http_resp.status().is_success() {
            let text = String::from_utf8_lossy(http_resp.body());
            return Err(LlmError::from_http_status(http_resp.status().as_u16(), &text, "google"));
        }
        let parsed: BatchEmbedResp = super::http::parse_json_body(http_resp.body())?;
        Ok(EmbeddingResponse {
            model: req.model.clone(),
            provider: "google".to_string(),
            data: parsed
                .embeddings
                .into_iter()
                .enumerate()
                .map(|(index, e)| crate::chat::EmbeddingDatum {
                    index: index as u32,
                    embedding: e.values,
                })
                .collect(),
            usage: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::Message;

    #[test]
    fn system_message_becomes_system_instruction() {
        let req = ChatRequest::new(
            "google",
            "gemini-1.5-pro",
            vec![Message::system("be terse"), Message::user("hi")],
        );
        let wire = build_wire_request(&req);
        assert!(wire.system_instruction.is_some());
        assert_eq!(wire.contents.len(), 1);
        assert_eq!(wire.contents[0].role, "user");
    }

    #[test]
    fn consecutive_same_role_messages_merge_into_one_content() {
        let req = ChatRequest::new(
            "google",
            "gemini-1.5-pro",
            vec![Message::user("a"), Message::user("b")],
        );
        let wire = build_wire_request(&req);
        assert_eq!(wire.contents.len(), 1);
        assert_eq!(wire.contents[0].parts.len(), 2);
    }
}
