use serde_json::json;

use super::Outcome;
use crate::gateway::AppContext;
use crate::http::{ParsedRequest, Response};

/// `GET /health`: liveness and gateway stats. No auth.
pub fn handle(ctx: &AppContext, _req: &ParsedRequest) -> Outcome {
    Outcome::Respond(Response::json(
        200,
        "OK",
        &json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_seconds": ctx.stats.uptime_seconds(),
            "total_requests": ctx.stats.total_requests(),
            "active_connections": ctx.stats.active_connections(),
        }),
    ))
}
