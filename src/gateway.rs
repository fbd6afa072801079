//! Gateway assembly: shared context, stats, the listening socket, and the
//! wiring between router, worker pool, and reactor.

use mio::net::TcpListener;
use std::net::SocketAddr;
use std::os::fd::FromRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Instant;
use tracing::info;

use crate::channel::{ChannelSet, WebchatChannel};
use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::http::Method;
use crate::reactor::Reactor;
use crate::router::Router;
use crate::session::SessionStore;
use crate::tools::{self, ToolDispatcher, ToolRegistry};
use crate::upstream::WorkerPool;
use crate::{handlers, systemd, tls};

/// Gateway counters. Written from the reactor thread, read from handlers
/// and workers, so atomics rather than plain fields.
pub struct Stats {
    start: Instant,
    total_requests: AtomicU64,
    active_connections: AtomicU64,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Stats {
        Stats {
            start: Instant::now(),
            total_requests: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
        }
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start.elapsed().as_secs()
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }
}

/// Everything handlers and upstream workers need, assembled once in main
/// and shared by reference. No process-wide globals.
pub struct AppContext {
    pub config: Config,
    pub store: SessionStore,
    pub tools: ToolDispatcher,
    pub channels: ChannelSet,
    pub stats: Stats,
}

impl AppContext {
    pub fn new(config: Config) -> Result<AppContext> {
        let store = SessionStore::open(&config.session_db_path())?;

        let mut registry = ToolRegistry::new();
        tools::register_defaults(
            &mut registry,
            config.workspace_dir.as_ref().map(Into::into),
        );

        let mut channels = ChannelSet::new();
        channels.register(Box::new(WebchatChannel));

        Ok(AppContext {
            config,
            store,
            tools: ToolDispatcher::new(registry),
            channels,
            stats: Stats::new(),
        })
    }
}

pub struct Gateway {
    ctx: Arc<AppContext>,
    router: Router,
    listener: TcpListener,
    local_addr: SocketAddr,
    tls: Option<Arc<rustls::ServerConfig>>,
    running: Arc<AtomicBool>,
}

impl Gateway {
    /// Bind the listen socket and register routes. Fails fast on bad bind
    /// address or a broken TLS pair.
    pub fn bind(ctx: AppContext) -> Result<Gateway> {
        let tls = match (&ctx.config.tls_cert_path, &ctx.config.tls_key_path) {
            (Some(cert), Some(key)) => Some(tls::load_server_config(cert, key)?),
            (None, None) => None,
            _ => {
                return Err(GatewayError::Config(
                    "TLS needs both tls_cert_path and tls_key_path".into(),
                ))
            }
        };

        let listener = listen(&ctx.config.gateway_bind, ctx.config.gateway_port, 128)?;
        let local_addr = listener
            .local_addr()
            .map_err(GatewayError::Io)?;

        let mut router = Router::new();
        router.add(Method::Get, "/health", handlers::health::handle);
        router.add(Method::Post, "/hooks/webchat", handlers::webhook::handle);
        router.add(Method::Post, "/v1/chat/completions", handlers::chat::handle);
        router.add(Method::Get, "/ws", handlers::ws_upgrade);

        Ok(Gateway {
            ctx: Arc::new(ctx),
            router,
            listener,
            local_addr,
            tls,
            // Starts set so a shutdown signal delivered before run() still
            // takes effect instead of being overwritten.
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Flag observed by the event loop; clearing it stops the gateway
    /// within the poll timeout.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn context(&self) -> Arc<AppContext> {
        self.ctx.clone()
    }

    /// Run the event loop until the running flag clears. Blocks.
    pub fn run(self) -> Result<()> {
        let (completion_tx, completion_rx) = mpsc::channel();
        let mut reactor = Reactor::new(
            self.listener,
            self.ctx.clone(),
            self.router,
            self.tls,
            self.running.clone(),
            completion_rx,
        )?;

        let pool = WorkerPool::start(
            self.ctx.config.upstream_workers.max(1),
            self.ctx.clone(),
            completion_tx,
            reactor.waker(),
        );

        info!(addr = %self.local_addr, "gateway listening");
        systemd::notify_ready();
        systemd::notify_status(&format!("listening on {}", self.local_addr));

        let result = reactor.run(&pool);

        systemd::notify_stopping();
        self.ctx.channels.shutdown();
        result
    }
}

/// Create the listening socket with SO_REUSEADDR and SO_REUSEPORT, bound
/// and non-blocking. Raw libc because the reuse options must be set
/// between socket() and bind().
fn listen(addr: &str, port: u16, backlog: i32) -> Result<TcpListener> {
    use std::net::Ipv4Addr;

    let ip: Ipv4Addr = addr
        .parse()
        .map_err(|_| GatewayError::Config(format!("invalid bind address: {addr}")))?;

    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(GatewayError::Io(std::io::Error::last_os_error()));
        }

        let opt: libc::c_int = 1;
        for level_opt in [libc::SO_REUSEADDR, libc::SO_REUSEPORT] {
            if libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                level_opt,
                &opt as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            ) < 0
            {
                return Err(close_and_report(fd));
            }
        }

        let sa = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from(ip).to_be(),
            },
            sin_zero: [0; 8],
        };

        if libc::bind(
            fd,
            &sa as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        ) < 0
        {
            return Err(close_and_report(fd));
        }

        if libc::listen(fd, backlog) < 0 {
            return Err(close_and_report(fd));
        }

        let std_listener = std::net::TcpListener::from_raw_fd(fd);
        std_listener
            .set_nonblocking(true)
            .map_err(GatewayError::Io)?;
        Ok(TcpListener::from_std(std_listener))
    }
}

/// Capture errno from a failed socket call, then release the fd.
fn close_and_report(fd: libc::c_int) -> GatewayError {
    let err = std::io::Error::last_os_error();
    unsafe { libc::close(fd) };
    GatewayError::Io(err)
}
