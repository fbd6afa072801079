//! Upstream HTTP client and the bounded worker pool that runs it.
//!
//! Each upstream POST is a blocking streaming call. Handlers never make it
//! from the reactor thread: they return a job spec, the connection parks in
//! Processing, and a pool worker runs the call, builds the full response,
//! and reports back over a channel paired with a reactor waker.

use mio::Waker;
use serde_json::Value;
use std::io::Read;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::Provider;
use crate::error::{GatewayError, Result};
use crate::gateway::AppContext;
use crate::handlers;
use crate::http::Response;
use crate::sse::StreamContext;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const STREAM_CHUNK_SIZE: usize = 8192;

/// One upstream POST: url, auth, and the JSON body (already carrying
/// `"stream": true`).
pub struct UpstreamRequest {
    pub provider: Provider,
    pub url: String,
    pub api_key: String,
    pub body: Value,
}

pub struct UpstreamClient {
    http: reqwest::blocking::Client,
}

impl UpstreamClient {
    pub fn new(timeout_secs: u64) -> Result<UpstreamClient> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| GatewayError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(UpstreamClient { http })
    }

    /// POST the request and feed the chunked SSE response through the
    /// stream context until the dialect signals completion.
    pub fn stream_post(&self, request: &UpstreamRequest, stream: &mut StreamContext) -> Result<()> {
        let builder = self.http.post(&request.url);
        let builder = match request.provider {
            Provider::Anthropic => builder
                .header("x-api-key", &request.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .header("content-type", "application/json"),
            Provider::OpenAi => builder
                .header("Authorization", format!("Bearer {}", request.api_key))
                .header("Content-Type", "application/json"),
        };

        let body = serde_json::to_vec(&request.body)?;
        let mut response = builder.body(body).send()?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            let message = format!("upstream returned {status}: {text}");
            warn!(status = status.as_u16(), "upstream request failed");
            stream.fail(&message);
            return Err(GatewayError::Upstream(message));
        }

        let mut chunk = [0u8; STREAM_CHUNK_SIZE];
        loop {
            let n = response
                .read(&mut chunk)
                .map_err(|e| GatewayError::Upstream(format!("stream read failed: {e}")))?;
            if n == 0 {
                break;
            }
            stream.feed(&chunk[..n]);
            if stream.is_done() || stream.error().is_some() {
                break;
            }
        }

        if let Some(message) = stream.error() {
            return Err(GatewayError::Upstream(message.to_string()));
        }
        stream.finish();
        Ok(())
    }
}

// ── Job plumbing ─────────────────────────────────────────────────────────────

/// How the worker should shape the final client response.
pub enum ReplyShape {
    /// Canonical OpenAI `chat.completion` envelope.
    OpenAiCompletion,
    /// Webhook envelope, optionally persisting the turn under a session.
    Webchat {
        session_id: Option<String>,
        user_message: String,
    },
}

/// Provider-independent description of one chat turn.
pub struct JobSpec {
    pub provider: Provider,
    pub model: String,
    pub system: Option<String>,
    /// Provider-shaped `{role, content}` message objects, oldest first.
    pub messages: Vec<Value>,
    pub max_tokens: u32,
    pub temperature: f64,
    pub reply: ReplyShape,
}

pub struct QueuedJob {
    pub conn_key: usize,
    pub conn_id: u64,
    pub spec: JobSpec,
}

pub struct Completion {
    pub conn_key: usize,
    pub conn_id: u64,
    pub response: Response,
}

/// Fixed-size pool of upstream workers fed from a shared queue. Completions
/// flow back over `completion_tx`; the waker nudges the reactor out of its
/// poll wait.
pub struct WorkerPool {
    job_tx: Sender<QueuedJob>,
}

impl WorkerPool {
    pub fn start(
        workers: usize,
        ctx: Arc<AppContext>,
        completion_tx: Sender<Completion>,
        waker: Arc<Waker>,
    ) -> WorkerPool {
        let (job_tx, job_rx) = mpsc::channel::<QueuedJob>();
        let job_rx = Arc::new(Mutex::new(job_rx));

        for worker_id in 0..workers {
            let job_rx = job_rx.clone();
            let ctx = ctx.clone();
            let completion_tx = completion_tx.clone();
            let waker = waker.clone();

            std::thread::Builder::new()
                .name(format!("upstream-{worker_id}"))
                .spawn(move || worker_loop(worker_id, ctx, job_rx, completion_tx, waker))
                .expect("failed to spawn upstream worker");
        }

        info!(workers, "upstream worker pool started");
        WorkerPool { job_tx }
    }

    pub fn submit(&self, job: QueuedJob) {
        // Send fails only if every worker died; the connection then idles
        // until the client gives up.
        if self.job_tx.send(job).is_err() {
            error!("upstream worker pool is gone, dropping job");
        }
    }
}

fn worker_loop(
    worker_id: usize,
    ctx: Arc<AppContext>,
    job_rx: Arc<Mutex<Receiver<QueuedJob>>>,
    completion_tx: Sender<Completion>,
    waker: Arc<Waker>,
) {
    let client = match UpstreamClient::new(ctx.config.upstream_timeout_secs) {
        Ok(c) => c,
        Err(e) => {
            error!(worker_id, error = %e, "upstream worker failed to start");
            return;
        }
    };

    loop {
        let job = {
            let rx = match job_rx.lock() {
                Ok(rx) => rx,
                Err(_) => return,
            };
            match rx.recv() {
                Ok(job) => job,
                Err(_) => return, // pool dropped
            }
        };

        debug!(worker_id, conn = job.conn_key, "running upstream job");
        let response = handlers::run_upstream_job(&ctx, &client, job.spec);

        if completion_tx
            .send(Completion {
                conn_key: job.conn_key,
                conn_id: job.conn_id,
                response,
            })
            .is_err()
        {
            return; // reactor gone
        }
        if let Err(e) = waker.wake() {
            warn!(error = %e, "failed to wake reactor");
        }
    }
}
