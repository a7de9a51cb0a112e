use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use ring::digest::{digest, SHA256};
use std::path::Path;
use tracing::info;
use wtransport::Identity;

use crate::config::ServerConfig;

// Dev certificate paths
const DEV_CERT_FILE: &str = "certs/cert.pem";
const DEV_KEY_FILE: &str = "certs/key.pem";

/// TLS configuration for the WebTransport endpoint
pub struct TlsConfig {
    pub identity: Identity,
    /// Base64-encoded SHA-256 hash of the leaf certificate (for browser flags)
    pub cert_hash: String,
}

impl TlsConfig {
    /// Load the certificate named by `config`, falling back to `certs/`
    pub async fn load(config: &ServerConfig) -> Result<Self> {
        let (cert_path, key_path) = resolve_paths(
            config.tls_cert_path.as_deref(),
            config.tls_key_path.as_deref(),
            |path| Path::new(path).exists(),
        )?;
        info!(cert = cert_path, "Loading TLS certificate");

        let identity = Identity::load_pemfiles(cert_path, key_path)
            .await
            .context("Failed to load certificate from PEM files")?;

        let cert_hash = identity
            .certificate_chain()
            .as_slice()
            .first()
            .map(|cert| cert_hash(cert.der()))
            .unwrap_or_default();

        info!("Certificate hash: {}", cert_hash);
        info!(
            "Chrome flag: --ignore-certificate-errors-spki-list={}",
            cert_hash
        );

        Ok(Self {
            identity,
            cert_hash,
        })
    }
}

/// Base64 SHA-256 of a DER certificate
pub fn cert_hash(der: &[u8]) -> String {
    STANDARD.encode(digest(&SHA256, der).as_ref())
}

fn resolve_paths<'a>(
    cert: Option<&'a str>,
    key: Option<&'a str>,
    exists: impl Fn(&str) -> bool,
) -> Result<(&'a str, &'a str)> {
    if let (Some(cert), Some(key)) = (cert, key) {
        return Ok((cert, key));
    }
    if exists(DEV_CERT_FILE) && exists(DEV_KEY_FILE) {
        return Ok((DEV_CERT_FILE, DEV_KEY_FILE));
    }
    Err(anyhow!(
        "TLS certificate not found.\n\n\
        For development: place a certificate and key in certs/cert.pem and certs/key.pem.\n\
        For production: set TLS_CERT_PATH and TLS_KEY_PATH environment variables."
    ))
}
