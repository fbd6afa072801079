//! Single-threaded edge-triggered event loop.
//!
//! One thread owns the listener, every connection, and all buffer state.
//! Readiness is edge-triggered, so accept and read paths drain until
//! WouldBlock. Upstream workers never touch connections: their completions
//! arrive over a channel, and a waker breaks the poll wait.

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::conn::{ConnState, Connection, ReadOutcome};
use crate::error::{GatewayError, Result};
use crate::gateway::AppContext;
use crate::handlers::Outcome;
use crate::http::{ParseStatus, ParsedRequest, Response};
use crate::router::Router;
use crate::session::Role;
use crate::upstream::{Completion, QueuedJob, WorkerPool};
use crate::ws;

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const TOKEN_BASE: usize = 2;

/// Poll timeout keeps shutdown latency under a second.
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

pub struct Reactor {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    connections: Slab<Connection>,
    ctx: Arc<AppContext>,
    router: Router,
    tls: Option<Arc<rustls::ServerConfig>>,
    running: Arc<AtomicBool>,
    completions: Receiver<Completion>,
    waker: Arc<Waker>,
    next_conn_id: u64,
}

impl Reactor {
    pub fn new(
        mut listener: TcpListener,
        ctx: Arc<AppContext>,
        router: Router,
        tls: Option<Arc<rustls::ServerConfig>>,
        running: Arc<AtomicBool>,
        completions: Receiver<Completion>,
    ) -> Result<Reactor> {
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);

        Ok(Reactor {
            poll,
            events: Events::with_capacity(256),
            listener,
            connections: Slab::new(),
            ctx,
            router,
            tls,
            running,
            completions,
            waker,
            next_conn_id: 1,
        })
    }

    pub fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }

    /// Block until the running flag clears.
    pub fn run(&mut self, pool: &WorkerPool) -> Result<()> {
        info!("event loop started");

        while self.running.load(Ordering::SeqCst) {
            if let Err(e) = self.poll.poll(&mut self.events, Some(POLL_TIMEOUT)) {
                if e.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "poll failed");
                return Err(e.into());
            }

            let ready: Vec<(Token, bool, bool, bool)> = self
                .events
                .iter()
                .map(|e| (e.token(), e.is_readable(), e.is_writable(), e.is_error()))
                .collect();

            for (token, readable, writable, is_error) in ready {
                match token {
                    LISTENER => self.accept_loop(),
                    WAKER => {} // completions drained below
                    token => self.connection_event(token, readable, writable, is_error, pool),
                }
            }

            self.drain_completions(pool);
        }

        info!("event loop stopped");
        self.close_all();
        Ok(())
    }

    fn accept_loop(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(error = %e, "set_nodelay failed");
                    }

                    let id = self.next_conn_id;
                    self.next_conn_id += 1;

                    let entry = self.connections.vacant_entry();
                    let token = Token(TOKEN_BASE + entry.key());
                    let mut conn = match Connection::new(id, token, stream, self.tls.as_ref()) {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "failed to set up connection");
                            continue;
                        }
                    };
                    if let Err(e) =
                        self.poll
                            .registry()
                            .register(conn.source(), token, Interest::READABLE)
                    {
                        warn!(error = %e, "failed to register connection");
                        continue;
                    }
                    entry.insert(conn);
                    self.ctx.stats.connection_opened();
                    debug!(peer = %peer, conn = id, "new connection");
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn connection_event(
        &mut self,
        token: Token,
        readable: bool,
        writable: bool,
        is_error: bool,
        pool: &WorkerPool,
    ) {
        let Some(key) = token.0.checked_sub(TOKEN_BASE) else {
            return;
        };
        if !self.connections.contains(key) {
            return;
        }

        if is_error {
            self.close_connection(key);
            return;
        }

        if readable {
            match self.on_readable(key, pool) {
                Ok(true) => {}
                Ok(false) => {
                    self.close_connection(key);
                    return;
                }
                Err(e) => {
                    debug!(conn = key, error = %e, "closing connection");
                    self.close_connection(key);
                    return;
                }
            }
        }

        if writable && self.connections.contains(key) {
            match self.on_writable(key, pool) {
                Ok(true) => {}
                Ok(false) => {
                    self.close_connection(key);
                    return;
                }
                Err(e) => {
                    debug!(conn = key, error = %e, "closing connection on write");
                    self.close_connection(key);
                    return;
                }
            }
        }

        self.update_interest(key);
    }

    /// Drain the socket, then run the parse/dispatch cycle for whatever is
    /// buffered. Returns false when the connection should close.
    fn on_readable(&mut self, key: usize, pool: &WorkerPool) -> Result<bool> {
        let outcome = self.connections[key].fill_read_buf()?;

        if !self.process_buffered(key, pool)? {
            return Ok(false);
        }

        if outcome == ReadOutcome::Eof {
            // Peer sent FIN. Finish what is in flight; close once idle.
            if let Some(conn) = self.connections.get(key) {
                let idle = matches!(
                    conn.state,
                    ConnState::ReadingHeaders | ConnState::ReadingBody | ConnState::WebSocket
                ) && !conn.wants_write();
                if idle {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    fn on_writable(&mut self, key: usize, pool: &WorkerPool) -> Result<bool> {
        if !self.finish_write(key)? {
            return Ok(false);
        }
        // A flushed keep-alive response may leave a pipelined request
        // already buffered; edge triggering will not re-announce it.
        if matches!(self.connections[key].state, ConnState::ReadingHeaders)
            && !self.connections[key].read_buf.is_empty()
        {
            return self.process_buffered(key, pool);
        }
        Ok(true)
    }

    /// Parse-and-dispatch until the buffer runs dry or the connection
    /// stops accepting new requests (Processing/Writing/closed).
    fn process_buffered(&mut self, key: usize, pool: &WorkerPool) -> Result<bool> {
        loop {
            let Some(conn) = self.connections.get_mut(key) else {
                return Ok(true);
            };

            match conn.state {
                ConnState::ReadingHeaders | ConnState::ReadingBody => {
                    match conn.parser.advance(&conn.read_buf)? {
                        ParseStatus::NeedMore => {
                            conn.state = if conn.parser.reading_body() {
                                ConnState::ReadingBody
                            } else {
                                ConnState::ReadingHeaders
                            };
                            return Ok(true);
                        }
                        ParseStatus::Complete { consumed } => {
                            conn.read_buf.drain(..consumed);
                            let parser = std::mem::take(&mut conn.parser);
                            let req = parser.finish();
                            conn.keep_alive = req.keep_alive();
                            conn.state = ConnState::Processing;

                            if !self.dispatch_request(key, req, pool)? {
                                return Ok(false);
                            }
                        }
                    }
                }
                ConnState::WebSocket => return self.ws_cycle(key),
                ConnState::Processing | ConnState::Writing => return Ok(true),
                ConnState::Closed => return Ok(false),
            }
        }
    }

    fn dispatch_request(&mut self, key: usize, req: ParsedRequest, pool: &WorkerPool) -> Result<bool> {
        self.ctx.stats.record_request();
        debug!(method = req.method().as_str(), path = %req.path, "request");

        match self.router.dispatch(&self.ctx, &req) {
            Outcome::Respond(resp) => self.deliver_response(key, resp),
            Outcome::Dispatch(spec) => {
                let conn = &self.connections[key];
                pool.submit(QueuedJob {
                    conn_key: key,
                    conn_id: conn.id,
                    spec,
                });
                Ok(true)
            }
            Outcome::UpgradeWebSocket => self.upgrade_websocket(key, &req),
        }
    }

    /// Queue a response and flush as far as the socket allows.
    fn deliver_response(&mut self, key: usize, mut resp: Response) -> Result<bool> {
        resp.ensure_header("Access-Control-Allow-Origin", "*");
        let conn = &mut self.connections[key];
        conn.queue_write(&resp.to_bytes());
        conn.state = ConnState::Writing;
        self.finish_write(key)
    }

    /// Push pending bytes. On a fully flushed HTTP response, either reset
    /// for keep-alive or request close.
    fn finish_write(&mut self, key: usize) -> Result<bool> {
        let conn = &mut self.connections[key];
        if !conn.flush()? {
            return Ok(true); // wait for WRITABLE
        }

        if conn.state == ConnState::Writing {
            if conn.keep_alive {
                conn.reset_for_next_request();
            } else {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn upgrade_websocket(&mut self, key: usize, req: &ParsedRequest) -> Result<bool> {
        let ws_key = req
            .header("Sec-WebSocket-Key")
            .ok_or_else(|| GatewayError::Protocol("missing Sec-WebSocket-Key".into()))?
            .to_string();

        let session_id = self.ctx.store.create_session("webchat")?;

        let conn = &mut self.connections[key];
        conn.queue_write(&ws::upgrade_response(&ws_key));
        conn.state = ConnState::WebSocket;
        conn.ws_session_id = Some(session_id.clone());
        conn.flush()?;

        info!(conn = conn.id, session_id = %session_id, "websocket upgraded");
        Ok(true)
    }

    /// Parse buffered WebSocket frames: text goes through the channel
    /// layer, ping answers pong, close tears the connection down.
    fn ws_cycle(&mut self, key: usize) -> Result<bool> {
        loop {
            let parsed = {
                let conn = &self.connections[key];
                ws::parse_frame(&conn.read_buf)?
            };
            let Some((frame, consumed)) = parsed else {
                break;
            };

            let conn = &mut self.connections[key];
            conn.read_buf.drain(..consumed);

            match frame.opcode {
                ws::Opcode::Text => {
                    let text = String::from_utf8_lossy(&frame.payload).into_owned();
                    let session_id = conn.ws_session_id.clone().unwrap_or_default();
                    self.handle_ws_text(key, &session_id, &text);
                }
                ws::Opcode::Ping => {
                    conn.queue_write(&ws::build_frame(ws::Opcode::Pong, &frame.payload));
                }
                ws::Opcode::Close => {
                    conn.queue_write(&ws::build_frame(ws::Opcode::Close, &[]));
                    let _ = conn.flush();
                    return Ok(false);
                }
                ws::Opcode::Pong | ws::Opcode::Binary | ws::Opcode::Continuation => {
                    debug!(opcode = ?frame.opcode, "ignoring websocket frame");
                }
            }
        }

        let conn = &mut self.connections[key];
        conn.flush()?;
        Ok(true)
    }

    fn handle_ws_text(&mut self, key: usize, session_id: &str, text: &str) {
        debug!(session_id = %session_id, len = text.len(), "websocket message");

        if let Err(e) = self.ctx.store.add_message(session_id, Role::User, text) {
            warn!(error = %e, "failed to persist websocket message");
        }

        let reply = self
            .ctx
            .channels
            .find("webchat")
            .and_then(|channel| channel.on_message(session_id, text));

        if let Some(reply) = reply {
            if let Err(e) = self.ctx.store.add_message(session_id, Role::Assistant, &reply) {
                warn!(error = %e, "failed to persist websocket reply");
            }
            self.connections[key].queue_write(&ws::text_frame(&reply));
        }
    }

    fn drain_completions(&mut self, pool: &WorkerPool) {
        while let Ok(completion) = self.completions.try_recv() {
            let key = completion.conn_key;
            let valid = self
                .connections
                .get(key)
                .map(|conn| conn.id == completion.conn_id && conn.state == ConnState::Processing)
                .unwrap_or(false);
            if !valid {
                debug!(conn = key, "dropping completion for stale connection");
                continue;
            }

            let keep = match self.deliver_response(key, completion.response) {
                Ok(keep) => keep,
                Err(e) => {
                    debug!(conn = key, error = %e, "failed to deliver completion");
                    false
                }
            };

            if !keep {
                self.close_connection(key);
                continue;
            }

            // The response may have freed the connection for a pipelined
            // request that arrived while the job ran.
            if matches!(self.connections[key].state, ConnState::ReadingHeaders)
                && !self.connections[key].read_buf.is_empty()
            {
                match self.process_buffered(key, pool) {
                    Ok(true) => {}
                    Ok(false) => {
                        self.close_connection(key);
                        continue;
                    }
                    Err(e) => {
                        debug!(conn = key, error = %e, "closing connection");
                        self.close_connection(key);
                        continue;
                    }
                }
            }

            self.update_interest(key);
        }
    }

    fn update_interest(&mut self, key: usize) {
        let Some(conn) = self.connections.get_mut(key) else {
            return;
        };
        let token = conn.token;
        let interest = conn.interest();
        if let Err(e) = self.poll.registry().reregister(conn.source(), token, interest) {
            warn!(conn = key, error = %e, "reregister failed");
        }
    }

    fn close_connection(&mut self, key: usize) {
        if let Some(mut conn) = self.connections.try_remove(key) {
            let _ = self.poll.registry().deregister(conn.source());
            conn.shutdown();
            self.ctx.stats.connection_closed();
            debug!(conn = conn.id, "connection closed");
        }
    }

    fn close_all(&mut self) {
        let keys: Vec<usize> = self.connections.iter().map(|(key, _)| key).collect();
        for key in keys {
            self.close_connection(key);
        }
    }
}
