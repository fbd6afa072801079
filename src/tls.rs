//! TLS termination for the listen socket.
//!
//! Cert and key are PEM files; the pair is validated at startup by building
//! the rustls server config, so a broken pair fails before the listener
//! accepts anything. rustls' defaults negotiate TLS 1.2 or newer.

use rustls::pki_types::PrivateKeyDer;
use rustls::ServerConfig;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tracing::info;

use crate::error::{GatewayError, Result};

pub fn load_server_config(cert_path: &str, key_path: &str) -> Result<Arc<ServerConfig>> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| {
            GatewayError::Config(format!(
                "TLS certificate and private key don't match or are invalid: {e}"
            ))
        })?;

    info!(cert = %cert_path, "TLS initialized");
    Ok(Arc::new(config))
}

fn load_certs(path: &str) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| GatewayError::Config(format!("cannot open TLS certificate {path}: {e}")))?;
    let certs: std::io::Result<Vec<_>> = rustls_pemfile::certs(&mut BufReader::new(file)).collect();
    let certs =
        certs.map_err(|e| GatewayError::Config(format!("cannot parse TLS certificate: {e}")))?;
    if certs.is_empty() {
        return Err(GatewayError::Config(format!(
            "no certificates found in {path}"
        )));
    }
    Ok(certs)
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| GatewayError::Config(format!("cannot open TLS key {path}: {e}")))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| GatewayError::Config(format!("cannot parse TLS key: {e}")))?
        .ok_or_else(|| GatewayError::Config(format!("no private key found in {path}")))
}
