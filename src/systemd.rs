//! Minimal sd_notify without libsystemd: datagrams to `NOTIFY_SOCKET`,
//! including abstract (`@`-prefixed) socket names.

use std::os::unix::net::UnixDatagram;
use tracing::debug;

fn send(state: &str) -> std::io::Result<()> {
    let Some(socket) = std::env::var_os("NOTIFY_SOCKET") else {
        return Ok(()); // not running under systemd
    };
    let path = socket.to_string_lossy().into_owned();

    let sock = UnixDatagram::unbound()?;
    if let Some(name) = path.strip_prefix('@') {
        use std::os::linux::net::SocketAddrExt;
        let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
        sock.send_to_addr(state.as_bytes(), &addr)?;
    } else {
        sock.send_to(state.as_bytes(), &path)?;
    }
    Ok(())
}

fn notify(state: &str) {
    debug!(state = %state, "sd_notify");
    if let Err(e) = send(state) {
        debug!(error = %e, "sd_notify failed");
    }
}

pub fn notify_ready() {
    notify("READY=1");
}

pub fn notify_stopping() {
    notify("STOPPING=1");
}

pub fn notify_status(status: &str) {
    notify(&format!("STATUS={status}"));
}

pub fn notify_watchdog() {
    notify("WATCHDOG=1");
}
