//! Route handlers and the worker-side execution of upstream chat turns.
//!
//! Handlers run on the reactor thread and must not block: anything that
//! talks to an upstream provider returns `Outcome::Dispatch` and finishes
//! on a pool worker via `run_upstream_job`.

pub mod chat;
pub mod health;
pub mod webhook;

use serde_json::json;
use tracing::{debug, warn};

use crate::config::Provider;
use crate::error::{GatewayError, Result};
use crate::gateway::AppContext;
use crate::http::{ParsedRequest, Response};
use crate::session::Role;
use crate::sse::StreamContext;
use crate::upstream::{JobSpec, ReplyShape, UpstreamClient, UpstreamRequest};
use crate::ws;

/// Cap on model→tool→model round trips within one chat turn.
const MAX_TOOL_ROUNDS: usize = 8;

/// What a handler wants done with the connection.
pub enum Outcome {
    /// Write this response (keep-alive rules apply afterwards).
    Respond(Response),
    /// Park the connection and run the chat turn on the worker pool.
    Dispatch(JobSpec),
    /// Perform the WebSocket handshake and switch protocols.
    UpgradeWebSocket,
}

/// `GET /ws`: the upgrade itself happens in the reactor, which owns the
/// connection state.
pub fn ws_upgrade(_ctx: &AppContext, req: &ParsedRequest) -> Outcome {
    if ws::is_upgrade_request(req) {
        Outcome::UpgradeWebSocket
    } else {
        Outcome::Respond(Response::json(
            400,
            "Bad Request",
            &json!({"error": "WebSocket upgrade required"}),
        ))
    }
}

struct TurnResult {
    text: String,
    input_tokens: u32,
    output_tokens: u32,
}

/// Worker entry point: run the upstream turn described by `spec` and shape
/// the client response. Never panics back into the pool; every failure
/// becomes an error envelope.
pub fn run_upstream_job(ctx: &AppContext, client: &UpstreamClient, spec: JobSpec) -> Response {
    let turn = match spec.provider {
        Provider::Anthropic => run_anthropic_turn(ctx, client, &spec),
        Provider::OpenAi => run_openai_turn(ctx, client, &spec),
    };

    match turn {
        Ok(turn) => match &spec.reply {
            ReplyShape::OpenAiCompletion => openai_envelope(&spec, &turn),
            ReplyShape::Webchat {
                session_id,
                user_message,
            } => webchat_envelope(ctx, &spec, session_id.as_deref(), user_message, &turn),
        },
        Err(e) => {
            warn!(provider = spec.provider.name(), error = %e, "upstream turn failed");
            match &spec.reply {
                ReplyShape::OpenAiCompletion => Response::json(
                    502,
                    "Bad Gateway",
                    &json!({"error": {"message": "AI API request failed", "type": "server_error"}}),
                ),
                ReplyShape::Webchat { .. } => Response::json(
                    502,
                    "Bad Gateway",
                    &json!({"error": "AI API request failed"}),
                ),
            }
        }
    }
}

/// Anthropic dialect, with the tool loop: when the model stops for tool
/// use, execute the calls through the dispatcher, append the tool results
/// to the conversation, and go around again.
fn run_anthropic_turn(
    ctx: &AppContext,
    client: &UpstreamClient,
    spec: &JobSpec,
) -> Result<TurnResult> {
    let api_key = ctx
        .config
        .api_key(Provider::Anthropic)
        .ok_or_else(|| GatewayError::Auth("no Anthropic API key configured".into()))?
        .to_string();

    let catalog = if ctx.tools.has_tools() {
        Some(ctx.tools.catalog())
    } else {
        None
    };

    let mut messages = spec.messages.clone();
    let mut text = String::new();
    let mut input_tokens = 0u32;
    let mut output_tokens = 0u32;

    for round in 0..MAX_TOOL_ROUNDS {
        let mut body = json!({
            "model": spec.model,
            "max_tokens": spec.max_tokens,
            "temperature": spec.temperature,
            "stream": true,
            "messages": messages,
        });
        if let Some(system) = &spec.system {
            body["system"] = json!(system);
        }
        if let Some(tools) = &catalog {
            body["tools"] = tools.clone();
        }

        let request = UpstreamRequest {
            provider: Provider::Anthropic,
            url: ctx.config.upstream_url(Provider::Anthropic),
            api_key: api_key.clone(),
            body,
        };

        let mut round_text = String::new();
        let mut stream = StreamContext::new(Provider::Anthropic);
        stream.on_text = Some(Box::new(|t| round_text.push_str(t)));

        let result = client.stream_post(&request, &mut stream);

        let tool_calls = std::mem::take(&mut stream.tool_calls);
        let stop_reason = stream.stop_reason.take();
        input_tokens += stream.input_tokens;
        output_tokens += stream.output_tokens;
        drop(stream);

        text.push_str(&round_text);
        result?;

        let wants_tools = stop_reason.as_deref() == Some("tool_use") && !tool_calls.is_empty();
        if !wants_tools {
            break;
        }
        if round + 1 == MAX_TOOL_ROUNDS {
            warn!("tool round limit reached, concluding turn");
            break;
        }

        let mut assistant_blocks = Vec::new();
        if !round_text.is_empty() {
            assistant_blocks.push(json!({"type": "text", "text": round_text}));
        }
        for call in &tool_calls {
            assistant_blocks.push(json!({
                "type": "tool_use",
                "id": call.id,
                "name": call.name,
                "input": call.input,
            }));
        }
        messages.push(json!({"role": "assistant", "content": assistant_blocks}));

        let mut result_blocks = Vec::new();
        for call in &tool_calls {
            let result = ctx.tools.dispatch(&call.name, &call.input);
            debug!(tool = %call.name, is_error = result.is_error, "tool executed");
            result_blocks.push(json!({
                "type": "tool_result",
                "tool_use_id": call.id,
                "content": result.output,
                "is_error": result.is_error,
            }));
        }
        messages.push(json!({"role": "user", "content": result_blocks}));
    }

    Ok(TurnResult {
        text,
        input_tokens,
        output_tokens,
    })
}

/// OpenAI dialect: a single text round; the system prompt rides as the
/// first message.
fn run_openai_turn(
    ctx: &AppContext,
    client: &UpstreamClient,
    spec: &JobSpec,
) -> Result<TurnResult> {
    let api_key = ctx
        .config
        .api_key(Provider::OpenAi)
        .ok_or_else(|| GatewayError::Auth("no OpenAI API key configured".into()))?
        .to_string();

    let mut messages = Vec::with_capacity(spec.messages.len() + 1);
    if let Some(system) = &spec.system {
        messages.push(json!({"role": "system", "content": system}));
    }
    messages.extend(spec.messages.iter().cloned());

    let request = UpstreamRequest {
        provider: Provider::OpenAi,
        url: ctx.config.upstream_url(Provider::OpenAi),
        api_key,
        body: json!({
            "model": spec.model,
            "max_tokens": spec.max_tokens,
            "temperature": spec.temperature,
            "stream": true,
            "stream_options": {"include_usage": true},
            "messages": messages,
        }),
    };

    let mut text = String::new();
    let mut stream = StreamContext::new(Provider::OpenAi);
    stream.on_text = Some(Box::new(|t| text.push_str(t)));

    let result = client.stream_post(&request, &mut stream);
    let input_tokens = stream.input_tokens;
    let output_tokens = stream.output_tokens;
    drop(stream);
    result?;

    Ok(TurnResult {
        text,
        input_tokens,
        output_tokens,
    })
}

fn openai_envelope(spec: &JobSpec, turn: &TurnResult) -> Response {
    let id = uuid::Uuid::new_v4().simple().to_string();
    Response::json(
        200,
        "OK",
        &json!({
            "id": format!("chatcmpl-{id}"),
            "object": "chat.completion",
            "model": spec.model,
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": turn.text},
                "finish_reason": "stop",
            }],
            "usage": {
                "prompt_tokens": turn.input_tokens,
                "completion_tokens": turn.output_tokens,
                "total_tokens": turn.input_tokens + turn.output_tokens,
            },
        }),
    )
}

fn webchat_envelope(
    ctx: &AppContext,
    spec: &JobSpec,
    session_id: Option<&str>,
    user_message: &str,
    turn: &TurnResult,
) -> Response {
    if let Some(sid) = session_id {
        if let Err(e) = ctx.store.add_message(sid, Role::User, user_message) {
            warn!(session_id = %sid, error = %e, "failed to persist user message");
        }
        if let Err(e) = ctx.store.add_message(sid, Role::Assistant, &turn.text) {
            warn!(session_id = %sid, error = %e, "failed to persist assistant message");
        }
    }

    let mut body = json!({"response": turn.text, "model": spec.model});
    if let Some(sid) = session_id {
        body["session_id"] = json!(sid);
    }
    Response::json(200, "OK", &body)
}

/// `{"error": "<msg>"}` with the given status, the webhook error shape.
pub(crate) fn plain_error(status: u16, reason: &str, message: &str) -> Outcome {
    Outcome::Respond(Response::json(status, reason, &json!({"error": message})))
}

/// `{"error": {"message", "type"}}`, the OpenAI-compatible error shape.
pub(crate) fn typed_error(status: u16, reason: &str, message: &str, error_type: &str) -> Outcome {
    Outcome::Respond(Response::json(
        status,
        reason,
        &json!({"error": {"message": message, "type": error_type}}),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::http::RequestParser;

    fn test_ctx(config: Config) -> AppContext {
        let config = Config {
            session_db_path: Some(":memory:".into()),
            ..config
        };
        AppContext::new(config).unwrap()
    }

    fn post(path: &str, body: &str) -> ParsedRequest {
        let raw = format!(
            "POST {path} HTTP/1.1\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        let mut parser = RequestParser::new();
        parser.advance(raw.as_bytes()).unwrap();
        parser.finish()
    }

    fn response_json(outcome: Outcome) -> (u16, serde_json::Value) {
        match outcome {
            Outcome::Respond(resp) => {
                let bytes = resp.to_bytes();
                let text = String::from_utf8(bytes).unwrap();
                let body = text.split("\r\n\r\n").nth(1).unwrap();
                (resp.status_code(), serde_json::from_str(body).unwrap())
            }
            _ => panic!("expected a direct response"),
        }
    }

    #[test]
    fn chat_rejects_empty_and_malformed_bodies() {
        let ctx = test_ctx(Config::default());

        let (status, body) = response_json(chat::handle(&ctx, &post("/v1/chat/completions", "")));
        assert_eq!(status, 400);
        assert_eq!(body["error"]["message"], "Empty body");

        let (status, body) =
            response_json(chat::handle(&ctx, &post("/v1/chat/completions", "{oops")));
        assert_eq!(status, 400);
        assert_eq!(body["error"]["message"], "Invalid JSON");

        let (status, body) = response_json(chat::handle(
            &ctx,
            &post("/v1/chat/completions", r#"{"messages":[]}"#),
        ));
        assert_eq!(status, 400);
        assert_eq!(body["error"]["message"], "Missing messages array");

        let (status, body) = response_json(chat::handle(
            &ctx,
            &post(
                "/v1/chat/completions",
                r#"{"messages":[{"role":"system","content":"x"}]}"#,
            ),
        ));
        assert_eq!(status, 400);
        assert_eq!(body["error"]["message"], "No user message found");
    }

    #[test]
    fn chat_model_prefix_selects_provider() {
        let config = Config {
            anthropic_api_key: Some("ak".into()),
            openai_api_key: Some("ok".into()),
            ..Config::default()
        };
        let ctx = test_ctx(config);

        let outcome = chat::handle(
            &ctx,
            &post(
                "/v1/chat/completions",
                r#"{"model":"claude-3-5-sonnet","messages":[{"role":"user","content":"hi"}]}"#,
            ),
        );
        match outcome {
            Outcome::Dispatch(spec) => {
                assert_eq!(spec.provider, Provider::Anthropic);
                assert_eq!(spec.model, "claude-3-5-sonnet");
            }
            _ => panic!("expected dispatch"),
        }

        let outcome = chat::handle(
            &ctx,
            &post(
                "/v1/chat/completions",
                r#"{"model":"gpt-4o","messages":[{"role":"user","content":"hi"}]}"#,
            ),
        );
        match outcome {
            Outcome::Dispatch(spec) => assert_eq!(spec.provider, Provider::OpenAi),
            _ => panic!("expected dispatch"),
        }
    }

    #[test]
    fn chat_uses_last_user_and_first_system() {
        let config = Config {
            anthropic_api_key: Some("ak".into()),
            ..Config::default()
        };
        let ctx = test_ctx(config);

        let body = r#"{"messages":[
            {"role":"system","content":"first system"},
            {"role":"user","content":"first user"},
            {"role":"system","content":"second system"},
            {"role":"user","content":"last user"}
        ]}"#;
        match chat::handle(&ctx, &post("/v1/chat/completions", body)) {
            Outcome::Dispatch(spec) => {
                assert_eq!(spec.system.as_deref(), Some("first system"));
                assert_eq!(spec.messages.len(), 1);
                assert_eq!(spec.messages[0]["content"], "last user");
            }
            _ => panic!("expected dispatch"),
        }
    }

    #[test]
    fn chat_without_key_is_server_error() {
        let ctx = test_ctx(Config::default());
        let (status, body) = response_json(chat::handle(
            &ctx,
            &post(
                "/v1/chat/completions",
                r#"{"model":"claude-x","messages":[{"role":"user","content":"hi"}]}"#,
            ),
        ));
        assert_eq!(status, 500);
        assert_eq!(body["error"]["message"], "No API key configured");
        assert_eq!(body["error"]["type"], "server_error");
    }

    #[test]
    fn webhook_error_envelopes() {
        let ctx = test_ctx(Config::default());

        let (status, body) = response_json(webhook::handle(&ctx, &post("/hooks/webchat", "")));
        assert_eq!(status, 400);
        assert_eq!(body["error"], "Empty body");

        let (status, body) = response_json(webhook::handle(&ctx, &post("/hooks/webchat", "{}")));
        assert_eq!(status, 400);
        assert_eq!(body["error"], "Missing 'message' field");

        let (status, body) = response_json(webhook::handle(
            &ctx,
            &post("/hooks/webchat", r#"{"message":"hi"}"#),
        ));
        assert_eq!(status, 500);
        assert_eq!(body["error"], "No API key configured");
    }

    #[test]
    fn webhook_restores_history_in_order() {
        let config = Config {
            anthropic_api_key: Some("ak".into()),
            ..Config::default()
        };
        let ctx = test_ctx(config);
        ctx.store.ensure_session("s1", "webchat").unwrap();
        ctx.store
            .add_message("s1", crate::session::Role::User, "earlier question")
            .unwrap();
        ctx.store
            .add_message("s1", crate::session::Role::Assistant, "earlier answer")
            .unwrap();

        let outcome = webhook::handle(
            &ctx,
            &post("/hooks/webchat", r#"{"message":"new","session_id":"s1"}"#),
        );
        match outcome {
            Outcome::Dispatch(spec) => {
                assert_eq!(spec.messages.len(), 3);
                assert_eq!(spec.messages[0]["content"], "earlier question");
                assert_eq!(spec.messages[1]["content"], "earlier answer");
                assert_eq!(spec.messages[2]["content"], "new");
                match spec.reply {
                    crate::upstream::ReplyShape::Webchat { session_id, .. } => {
                        assert_eq!(session_id.as_deref(), Some("s1"));
                    }
                    _ => panic!("expected webchat reply shape"),
                }
            }
            _ => panic!("expected dispatch"),
        }
    }

    #[test]
    fn ws_upgrade_requires_upgrade_headers() {
        let ctx = test_ctx(Config::default());
        let req = post("/ws", "");
        match ws_upgrade(&ctx, &req) {
            Outcome::Respond(resp) => assert_eq!(resp.status_code(), 400),
            _ => panic!("expected 400 without upgrade headers"),
        }
    }
}
