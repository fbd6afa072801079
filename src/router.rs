//! Route table and dispatch.
//!
//! A linear scan in registration order; the first matching route wins. A
//! pattern matches exactly, or (when it ends in `*`) as a prefix on the
//! characters before the wildcard. CORS preflight and bearer auth are
//! handled here so handlers stay thin.

use serde_json::json;
use tracing::warn;

use crate::gateway::AppContext;
use crate::handlers::Outcome;
use crate::http::{Method, ParsedRequest, Response};

pub type Handler = fn(&AppContext, &ParsedRequest) -> Outcome;

struct Route {
    method: Method,
    pattern: String,
    handler: Handler,
}

#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    pub fn new() -> Router {
        Router { routes: Vec::new() }
    }

    pub fn add(&mut self, method: Method, pattern: &str, handler: Handler) {
        tracing::debug!(method = method.as_str(), pattern = %pattern, "route registered");
        self.routes.push(Route {
            method,
            pattern: pattern.to_string(),
            handler,
        });
    }

    pub fn dispatch(&self, ctx: &AppContext, req: &ParsedRequest) -> Outcome {
        if req.method() == Method::Options {
            return Outcome::Respond(preflight_response());
        }

        if let Some(token) = ctx.config.auth_token() {
            let is_health = req.method() == Method::Get && req.path == "/health";
            if !is_health && !authorized(req, token) {
                warn!(path = %req.path, "unauthorized request");
                return Outcome::Respond(Response::json(
                    401,
                    "Unauthorized",
                    &json!({"error": "Unauthorized"}),
                ));
            }
        }

        for route in &self.routes {
            if route_matches(&route.pattern, route.method, req.method(), &req.path) {
                return (route.handler)(ctx, req);
            }
        }

        Outcome::Respond(Response::json(
            404,
            "Not Found",
            &json!({"error": "Not Found"}),
        ))
    }
}

/// Bearer token check: presence and exact equality, nothing else.
fn authorized(req: &ParsedRequest, expected: &str) -> bool {
    req.header("Authorization")
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|token| token == expected)
        .unwrap_or(false)
}

fn preflight_response() -> Response {
    let mut resp = Response::new();
    resp.set_status(204, "No Content");
    resp.add_header("Access-Control-Allow-Origin", "*");
    resp.add_header("Access-Control-Allow-Methods", "GET, POST, OPTIONS");
    resp.add_header("Access-Control-Allow-Headers", "Content-Type, Authorization");
    resp
}

fn route_matches(pattern: &str, route_method: Method, method: Method, path: &str) -> bool {
    if route_method != method {
        return false;
    }
    if pattern == path {
        return true;
    }
    if pattern.len() > 1 {
        if let Some(prefix) = pattern.strip_suffix('*') {
            return path.starts_with(prefix);
        }
    }
    false
}
