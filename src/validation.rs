use crate::chat::{ChatRequest, ContentPart, ResponseFormat, Role, Tool};
use crate::registry::ModelRegistry;
use either::Either;
use regex::Regex;
use std::sync::OnceLock;

#[derive(Debug, Clone)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
}

pub struct ValidationOptions {
    pub max_messages: usize,
    pub max_content_length: usize,
    pub allowed_providers: Option<Vec<String>>,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            max_messages: 1000,
            max_content_length: 1_000_000,
            allowed_providers: None,
        }
    }
}

fn tool_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_-]*$").expect("static regex is valid"))
}

fn model_name_forbidden_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[<>{}`]").expect("static regex is valid"))
}

/// Validates `req` against the range/shape rules; returns the full list of
/// violations rather than stopping at the first one, so a strict-mode
/// caller can report everything at once.
pub fn validate_request(
    req: &ChatRequest,
    opts: &ValidationOptions,
    registry: &ModelRegistry,
) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    let issue = |field: &str, message: String| ValidationIssue {
        field: field.to_string(),
        message,
    };

    if req.provider.is_empty() {
        issues.push(issue("provider", "provider must not be empty".into()));
    } else if let Some(allowed) = &opts.allowed_providers {
        if !allowed.iter().any(|p| p == &req.provider) {
            issues.push(issue(
                "provider",
                format!("provider '{}' is not in the allow-list", req.provider),
            ));
        }
    }

    if req.model.is_empty() || req.model.len() < 2 || req.model.len() > 256 {
        issues.push(issue("model", "model must be 2-256 characters".into()));
    } else if model_name_forbidden_chars().is_match(&req.model) {
        issues.push(issue("model", "model must not contain < > { } `".into()));
    }

    if req.messages.is_empty() {
        issues.push(issue("messages", "messages must not be empty".into()));
    }
    if req.messages.len() > opts.max_messages {
        issues.push(issue(
            "messages",
            format!("messages exceeds the maximum of {}", opts.max_messages),
        ));
    }
    for (i, message) in req.messages.iter().enumerate() {
        if message.content.is_none() && message.tool_calls.is_none() {
            issues.push(issue(
                &format!("messages[{i}].content"),
                "content is required unless tool_calls are present".into(),
            ));
        }
        if let Some(Either::Left(text)) = &message.content {
            if text.len() > opts.max_content_length {
                issues.push(issue(
                    &format!("messages[{i}].content"),
                    format!("content exceeds the maximum of {} characters", opts.max_content_length),
                ));
            }
        }
        if let Some(Either::Right(parts)) = &message.content {
            for (j, part) in parts.iter().enumerate() {
                if matches!(part, ContentPart::Text { text } if text.len() > opts.max_content_length) {
                    issues.push(issue(
                        &format!("messages[{i}].content[{j}]"),
                        "text part exceeds the maximum content length".into(),
                    ));
                }
            }
        }
        if message.role == Role::Tool && message.tool_call_id.is_none() {
            issues.push(issue(
                &format!("messages[{i}].tool_call_id"),
                "tool role requires tool_call_id".into(),
            ));
        }
    }

    if let Some(temperature) = req.temperature {
        if !(0.0..=2.0).contains(&temperature) {
            issues.push(issue("temperature", "temperature must be in [0, 2]".into()));
        }
    }
    if let Some(top_p) = req.top_p {
        if !(0.0..=1.0).contains(&top_p) {
            issues.push(issue("top_p", "top_p must be in [0, 1]".into()));
        }
    }
    if let Some(p) = req.presence_penalty {
        if !(-2.0..=2.0).contains(&p) {
            issues.push(issue("presence_penalty", "presence_penalty must be in [-2, 2]".into()));
        }
    }
    if let Some(p) = req.frequency_penalty {
        if !(-2.0..=2.0).contains(&p) {
            issues.push(issue("frequency_penalty", "frequency_penalty must be in [-2, 2]".into()));
        }
    }
    if let Some(max_tokens) = req.max_tokens {
        if max_tokens == 0 {
            issues.push(issue("max_tokens", "max_tokens must be positive".into()));
        } else if let Some(window) = registry.get_context_window(&req.provider, &req.model) {
            if max_tokens > window {
                issues.push(issue(
                    "max_tokens",
                    format!("max_tokens {max_tokens} exceeds the model's context window of {window}"),
                ));
            }
        }
    }

    if let Some(tools) = &req.tools {
        let mut seen = std::collections::HashSet::new();
        for (i, tool) in tools.iter().enumerate() {
            let Tool::Function { function } = tool;
            if !tool_name_regex().is_match(&function.name) {
                issues.push(issue(
                    &format!("tools[{i}].function.name"),
                    "tool name must match [A-Za-z_][A-Za-z0-9_-]*".into(),
                ));
            }
            if !seen.insert(function.name.clone()) {
                issues.push(issue(
                    &format!("tools[{i}].function.name"),
                    format!("duplicate tool name '{}'", function.name),
                ));
            }
        }
    }

    if let Some(ResponseFormat::JsonSchema { json_schema }) = &req.response_format {
        if json_schema.is_null() {
            issues.push(issue(
                "response_format.json_schema",
                "json_schema payload is required when type is json_schema".into(),
            ));
        }
    }

    issues
}

/// Non-throwing cleanup pass: clamps numeric params, floors `max_tokens`,
/// and trims leading/trailing whitespace from string content. Always
/// produces a request that passes the range checks in [`validate_request`]
/// (structural errors like an empty `messages` array cannot be fixed here).
pub fn sanitize_request(mut req: ChatRequest) -> ChatRequest {
    req.model = req.model.trim().to_string();
    if let Some(t) = req.temperature {
        req.temperature = Some(t.clamp(0.0, 2.0));
    }
    if let Some(p) = req.top_p {
        req.top_p = Some(p.clamp(0.0, 1.0));
    }
    if let Some(p) = req.presence_penalty {
        req.presence_penalty = Some(p.clamp(-2.0, 2.0));
    }
    if let Some(p) = req.frequency_penalty {
        req.frequency_penalty = Some(p.clamp(-2.0, 2.0));
    }
    if let Some(max_tokens) = req.max_tokens {
        req.max_tokens = Some(max_tokens.max(1));
    }
    for message in &mut req.messages {
        if let Some(Either::Left(text)) = &message.content {
            message.content = Some(Either::Left(text.trim().to_string()));
        }
    }
    req
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::Message;

    fn valid_request() -> ChatRequest {
        ChatRequest::new("openai", "gpt-4-turbo", vec![Message::user("hello")])
    }

    #[test]
    fn valid_request_has_no_issues() {
        let registry = ModelRegistry::new_for_test();
        let issues = validate_request(&valid_request(), &ValidationOptions::default(), &registry);
        assert!(issues.is_empty(), "{issues:?}");
    }

    #[test]
    fn empty_messages_is_flagged() {
        let mut req = valid_request();
        req.messages.clear();
        let registry = ModelRegistry::new_for_test();
        let issues = validate_request(&req, &ValidationOptions::default(), &registry);
        assert!(issues.iter().any(|i| i.field == "messages"));
    }

    #[test]
    fn out_of_range_temperature_is_flagged() {
        let mut req = valid_request();
        req.temperature = Some(5.0);
        let registry = ModelRegistry::new_for_test();
        let issues = validate_request(&req, &ValidationOptions::default(), &registry);
        assert!(issues.iter().any(|i| i.field == "temperature"));
    }

    #[test]
    fn tool_role_without_call_id_is_flagged() {
        let mut req = valid_request();
        req.messages.push(crate::chat::Message {
            role: Role::Tool,
            content: Some(Either::Left("result".into())),
            tool_calls: None,
            tool_call_id: None,
        });
        let registry = ModelRegistry::new_for_test();
        let issues = validate_request(&req, &ValidationOptions::default(), &registry);
        assert!(issues.iter().any(|i| i.field.contains("tool_call_id")));
    }

    #[test]
    fn sanitize_clamps_out_of_range_numbers() {
        let mut req = valid_request();
        req.temperature = Some(10.0);
        req.max_tokens = Some(0);
        let sanitized = sanitize_request(req);
        assert_eq!(sanitized.temperature, Some(2.0));
        assert_eq!(sanitized.max_tokens, Some(1));
    }

    #[test]
    fn sanitize_then_validate_has_no_numeric_range_issues() {
        let mut req = valid_request();
        req.temperature = Some(-99.0);
        req.top_p = Some(42.0);
        let sanitized = sanitize_request(req);
        let registry = ModelRegistry::new_for_test();
        let issues = validate_request(&sanitized, &ValidationOptions::default(), &registry);
        assert!(!issues.iter().any(|i| i.field == "temperature" || i.field == "top_p"));
    }
}
