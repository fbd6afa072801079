//! portico: a local-machine AI gateway.
//!
//! A single-threaded edge-triggered HTTP/1.1 and WebSocket server that
//! proxies chat requests to Anthropic and OpenAI, consumes their SSE
//! streams, persists conversations, and dispatches model-requested tool
//! calls.

pub mod channel;
pub mod config;
pub mod conn;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod http;
pub mod logging;
pub mod reactor;
pub mod router;
pub mod session;
pub mod sse;
pub mod systemd;
pub mod tls;
pub mod tools;
pub mod upstream;
pub mod ws;
