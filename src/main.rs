use anyhow::{bail, Context, Result};
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::info;

use portico::config::Config;
use portico::gateway::{AppContext, Gateway};
use portico::logging;

#[derive(Parser)]
#[command(name = "portico", version, about = "Local-machine AI gateway")]
struct Cli {
    /// Config file path (default: ~/.portico/config.json)
    #[arg(long, value_name = "PATH")]
    config: Option<String>,

    /// Listen port (overrides config)
    #[arg(long, value_name = "PORT")]
    port: Option<u16>,

    /// Bind address (overrides config)
    #[arg(long, value_name = "ADDR")]
    bind: Option<String>,

    /// Run as a daemon
    #[arg(long)]
    daemon: bool,

    /// Verbose logging
    #[arg(long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(port) = cli.port {
        config.gateway_port = port;
    }
    if let Some(bind) = cli.bind {
        config.gateway_bind = bind;
    }

    if cli.daemon {
        info!("daemonizing");
        daemonize()?;
    }

    setup_signals();

    let ctx = AppContext::new(config).context("Failed to initialize gateway")?;
    let gateway = Gateway::bind(ctx).context("Failed to bind gateway")?;

    SHUTDOWN_FLAG
        .set(gateway.running_flag())
        .ok()
        .context("signal flag already installed")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %gateway.local_addr(),
        "portico gateway starting"
    );

    gateway.run().context("Gateway error")?;

    info!("goodbye");
    Ok(())
}

// ── Signals ─────────────────────────────────────────────────────────────────

static SHUTDOWN_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

extern "C" fn handle_shutdown(_sig: libc::c_int) {
    // Only an atomic store: async-signal-safe.
    if let Some(flag) = SHUTDOWN_FLAG.get() {
        flag.store(false, Ordering::SeqCst);
    }
}

fn setup_signals() {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = handle_shutdown as extern "C" fn(libc::c_int) as usize;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(libc::SIGINT, &sa, std::ptr::null_mut());
        libc::sigaction(libc::SIGTERM, &sa, std::ptr::null_mut());

        // Broken-pipe writes surface as EPIPE and close the connection
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

// ── Daemonize ───────────────────────────────────────────────────────────────

/// Classic double fork. stderr stays attached for logging; stdin and
/// stdout are pointed at /dev/null.
fn daemonize() -> Result<()> {
    use std::os::fd::AsRawFd;

    unsafe {
        match libc::fork() {
            -1 => bail!("fork failed: {}", std::io::Error::last_os_error()),
            0 => {}
            _ => std::process::exit(0),
        }

        if libc::setsid() < 0 {
            bail!("setsid failed: {}", std::io::Error::last_os_error());
        }

        match libc::fork() {
            -1 => bail!("second fork failed: {}", std::io::Error::last_os_error()),
            0 => {}
            _ => std::process::exit(0),
        }

        libc::umask(0o027);
        let _ = std::env::set_current_dir("/");

        let devnull = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/null")
            .context("cannot open /dev/null")?;
        libc::dup2(devnull.as_raw_fd(), 0);
        libc::dup2(devnull.as_raw_fd(), 1);
    }

    Ok(())
}
