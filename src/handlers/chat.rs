//! `POST /v1/chat/completions`: OpenAI-compatible chat.
//!
//! Provider selection follows the model prefix: `claude*` forces Anthropic,
//! `gpt*` forces OpenAI, anything else uses the configured default. The
//! last user message carries the turn; a system message in the request
//! overrides the configured default prompt.

use serde_json::Value;

use super::{typed_error, Outcome};
use crate::config::Provider;
use crate::gateway::AppContext;
use crate::http::ParsedRequest;
use crate::upstream::{JobSpec, ReplyShape};

pub fn handle(ctx: &AppContext, req: &ParsedRequest) -> Outcome {
    let Some(body) = req.body_str().filter(|b| !b.is_empty()) else {
        return typed_error(400, "Bad Request", "Empty body", "invalid_request_error");
    };

    let Ok(payload) = serde_json::from_str::<Value>(body) else {
        return typed_error(400, "Bad Request", "Invalid JSON", "invalid_request_error");
    };

    let Some(messages) = payload
        .get("messages")
        .and_then(Value::as_array)
        .filter(|m| !m.is_empty())
    else {
        return typed_error(
            400,
            "Bad Request",
            "Missing messages array",
            "invalid_request_error",
        );
    };

    let mut user_msg: Option<&str> = None;
    let mut system_msg: Option<&str> = None;
    for msg in messages {
        let role = msg.get("role").and_then(Value::as_str);
        let content = msg.get("content").and_then(Value::as_str);
        match (role, content) {
            (Some("user"), Some(content)) => user_msg = Some(content),
            (Some("system"), Some(content)) => {
                if system_msg.is_none() {
                    system_msg = Some(content);
                }
            }
            _ => {}
        }
    }

    let Some(user_msg) = user_msg else {
        return typed_error(
            400,
            "Bad Request",
            "No user message found",
            "invalid_request_error",
        );
    };

    let mut provider = ctx.config.default_provider();
    let model = match payload.get("model").and_then(Value::as_str) {
        Some(m) if m.starts_with("claude") => {
            provider = Provider::Anthropic;
            m.to_string()
        }
        Some(m) if m.starts_with("gpt") => {
            provider = Provider::OpenAi;
            m.to_string()
        }
        Some(m) => m.to_string(),
        None => ctx.config.model(provider).to_string(),
    };

    if ctx.config.api_key(provider).is_none() {
        return typed_error(
            500,
            "Internal Server Error",
            "No API key configured",
            "server_error",
        );
    }

    let max_tokens = payload
        .get("max_tokens")
        .and_then(Value::as_u64)
        .map(|v| v as u32)
        .unwrap_or(ctx.config.max_tokens);
    let temperature = payload
        .get("temperature")
        .and_then(Value::as_f64)
        .unwrap_or(ctx.config.temperature);

    let system = system_msg
        .map(str::to_string)
        .unwrap_or_else(|| ctx.config.system_prompt.clone());

    Outcome::Dispatch(JobSpec {
        provider,
        model,
        system: Some(system),
        messages: vec![serde_json::json!({"role": "user", "content": user_msg})],
        max_tokens,
        temperature,
        reply: ReplyShape::OpenAiCompletion,
    })
}
