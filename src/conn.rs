//! Per-socket connection state: buffers, lifecycle, and the byte transport
//! (plain TCP or TLS-terminated).
//!
//! Connections are owned exclusively by the reactor through a slab keyed by
//! token; nothing else holds a reference to one. Each connection also
//! carries a process-unique id so a completion arriving after the slab slot
//! was recycled can be detected and dropped.

use mio::net::TcpStream;
use mio::{Interest, Token};
use rustls::{ServerConfig, ServerConnection};
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Instant;

use crate::error::{GatewayError, Result};
use crate::http::{limits, RequestParser};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    ReadingHeaders,
    ReadingBody,
    Processing,
    Writing,
    WebSocket,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Socket drained to WouldBlock; buffered data may have grown.
    Drained,
    /// Peer closed its end.
    Eof,
}

pub enum Transport {
    Plain(TcpStream),
    Tls {
        stream: TcpStream,
        session: Box<ServerConnection>,
    },
}

pub struct Connection {
    pub id: u64,
    pub token: Token,
    transport: Transport,
    pub state: ConnState,
    pub read_buf: Vec<u8>,
    write_buf: Vec<u8>,
    write_pos: usize,
    pub parser: RequestParser,
    pub connected_at: Instant,
    pub keep_alive: bool,
    pub ws_session_id: Option<String>,
}

impl Connection {
    pub fn new(id: u64, token: Token, stream: TcpStream, tls: Option<&Arc<ServerConfig>>) -> Result<Connection> {
        let transport = match tls {
            Some(config) => {
                let session = ServerConnection::new(config.clone())
                    .map_err(|e| GatewayError::Config(format!("TLS session init failed: {e}")))?;
                Transport::Tls {
                    stream,
                    session: Box::new(session),
                }
            }
            None => Transport::Plain(stream),
        };

        Ok(Connection {
            id,
            token,
            transport,
            state: ConnState::ReadingHeaders,
            read_buf: Vec::with_capacity(limits::READ_BUF_SIZE),
            write_buf: Vec::new(),
            write_pos: 0,
            parser: RequestParser::new(),
            connected_at: Instant::now(),
            keep_alive: true,
            ws_session_id: None,
        })
    }

    /// The raw stream, for poll registration.
    pub fn source(&mut self) -> &mut TcpStream {
        match &mut self.transport {
            Transport::Plain(s) => s,
            Transport::Tls { stream, .. } => stream,
        }
    }

    /// Drain the socket into the read buffer until WouldBlock (required
    /// under edge-triggered readiness). Enforces the read-buffer cap.
    pub fn fill_read_buf(&mut self) -> Result<ReadOutcome> {
        let mut chunk = [0u8; limits::READ_BUF_SIZE];
        loop {
            if self.read_buf.len() > limits::MAX_READ_BUF {
                return Err(GatewayError::Protocol("request too large".into()));
            }

            match &mut self.transport {
                Transport::Plain(stream) => match stream.read(&mut chunk) {
                    Ok(0) => return Ok(ReadOutcome::Eof),
                    Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        return Ok(ReadOutcome::Drained)
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                },
                Transport::Tls { stream, session } => {
                    match session.read_tls(stream) {
                        Ok(0) => return Ok(ReadOutcome::Eof),
                        Ok(_) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            return Ok(ReadOutcome::Drained)
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e.into()),
                    }

                    let io_state = session
                        .process_new_packets()
                        .map_err(|e| GatewayError::Protocol(format!("TLS error: {e}")))?;

                    let mut to_read = io_state.plaintext_bytes_to_read();
                    while to_read > 0 {
                        let n = session.reader().read(&mut chunk)?;
                        if n == 0 {
                            break;
                        }
                        self.read_buf.extend_from_slice(&chunk[..n]);
                        to_read = to_read.saturating_sub(n);
                    }

                    // Handshake flights become writable immediately
                    while session.wants_write() {
                        match session.write_tls(stream) {
                            Ok(_) => {}
                            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                            Err(e) => return Err(e.into()),
                        }
                    }
                }
            }
        }
    }

    pub fn queue_write(&mut self, bytes: &[u8]) {
        self.write_buf.extend_from_slice(bytes);
    }

    /// Push queued bytes out. Returns true when everything (including TLS
    /// records) has been written; false means wait for WRITABLE.
    pub fn flush(&mut self) -> Result<bool> {
        match &mut self.transport {
            Transport::Plain(stream) => {
                while self.write_pos < self.write_buf.len() {
                    match stream.write(&self.write_buf[self.write_pos..]) {
                        Ok(0) => {
                            return Err(GatewayError::Io(std::io::Error::new(
                                std::io::ErrorKind::WriteZero,
                                "connection closed during write",
                            )))
                        }
                        Ok(n) => self.write_pos += n,
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(false),
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            Transport::Tls { stream, session } => {
                if self.write_pos < self.write_buf.len() {
                    session
                        .writer()
                        .write_all(&self.write_buf[self.write_pos..])?;
                    self.write_pos = self.write_buf.len();
                }
                while session.wants_write() {
                    match session.write_tls(stream) {
                        Ok(_) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(false),
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }

        self.write_buf.clear();
        self.write_pos = 0;
        Ok(true)
    }

    pub fn wants_write(&self) -> bool {
        if self.write_pos < self.write_buf.len() {
            return true;
        }
        match &self.transport {
            Transport::Plain(_) => false,
            Transport::Tls { session, .. } => session.wants_write(),
        }
    }

    pub fn interest(&self) -> Interest {
        if self.wants_write() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        }
    }

    /// Keep-alive reset: back to ReadingHeaders with a fresh parser. Bytes
    /// of a pipelined next request stay in the read buffer.
    pub fn reset_for_next_request(&mut self) {
        self.state = ConnState::ReadingHeaders;
        self.parser = RequestParser::new();
        if self.read_buf.capacity() > limits::READ_BUF_SIZE * 4 && self.read_buf.is_empty() {
            self.read_buf.shrink_to(limits::READ_BUF_SIZE);
        }
    }

    pub fn shutdown(&mut self) {
        let stream = self.source();
        let _ = stream.flush();
        let _ = stream.shutdown(std::net::Shutdown::Both);
        self.state = ConnState::Closed;
    }
}
