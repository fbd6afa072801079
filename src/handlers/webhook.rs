//! `POST /hooks/webchat`: one-shot chat with optional session continuity.

use serde_json::{json, Value};
use tracing::warn;

use super::{plain_error, Outcome};
use crate::gateway::AppContext;
use crate::http::ParsedRequest;
use crate::upstream::{JobSpec, ReplyShape};

pub fn handle(ctx: &AppContext, req: &ParsedRequest) -> Outcome {
    let Some(body) = req.body_str().filter(|b| !b.is_empty()) else {
        return plain_error(400, "Bad Request", "Empty body");
    };

    let Ok(payload) = serde_json::from_str::<Value>(body) else {
        return plain_error(400, "Bad Request", "Invalid JSON");
    };

    let Some(message) = payload
        .get("message")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
    else {
        return plain_error(400, "Bad Request", "Missing 'message' field");
    };

    let session_id = payload
        .get("session_id")
        .and_then(Value::as_str)
        .map(str::to_string);

    let provider = ctx.config.default_provider();
    if ctx.config.api_key(provider).is_none() {
        return plain_error(500, "Internal Server Error", "No API key configured");
    }

    // Session continuity: restore prior turns (oldest first) so the model
    // sees the conversation, then append the new user message.
    let mut messages = Vec::new();
    if let Some(sid) = &session_id {
        if let Err(e) = ctx.store.ensure_session(sid, "webchat") {
            warn!(session_id = %sid, error = %e, "failed to ensure session");
        }
        match ctx.store.history(sid, ctx.config.history_limit) {
            Ok(rows) => {
                for (role, content) in rows.into_iter().rev() {
                    if role == "user" || role == "assistant" {
                        messages.push(json!({"role": role, "content": content}));
                    }
                }
            }
            Err(e) => warn!(session_id = %sid, error = %e, "failed to load history"),
        }
    }
    messages.push(json!({"role": "user", "content": message}));

    Outcome::Dispatch(JobSpec {
        provider,
        model: ctx.config.model(provider).to_string(),
        system: Some(ctx.config.system_prompt.clone()),
        messages,
        max_tokens: ctx.config.max_tokens,
        temperature: ctx.config.temperature,
        reply: ReplyShape::Webchat {
            session_id,
            user_message: message.to_string(),
        },
    })
}
