//! TCP port forwarding over the VLESS encryption layer.
//!
//! The server side accepts encrypted connections and forwards the plaintext
//! to a fixed upstream address. The client side accepts plaintext
//! connections and carries them to a tunnel server.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use vless_encryption::config::{encode_key, SCHEME};
use vless_encryption::{ClientInstance, NfsPrivateKey, ServerInstance};

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Key type for one entry of a generated chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum KeyKind {
    X25519,
    Mlkem768,
}

/// A matching pair of config strings.
#[derive(Clone, Debug)]
pub struct GeneratedConfig {
    pub decryption: String,
    pub encryption: String,
}

/// Generate fresh keys for `chain` and render both config strings.
///
/// `mode` is `native`, `xorpub` or `random`; `lifetime` is the server ticket
/// field, e.g. `600s` or `0s`.
pub fn generate_config(
    chain: &[KeyKind],
    mode: &str,
    lifetime: &str,
    zero_rtt: bool,
) -> Result<GeneratedConfig> {
    anyhow::ensure!(!chain.is_empty(), "a chain needs at least one key");
    let mut private = Vec::with_capacity(chain.len());
    let mut public = Vec::with_capacity(chain.len());
    for kind in chain {
        let len = match kind {
            KeyKind::X25519 => 32,
            KeyKind::Mlkem768 => 64,
        };
        let mut material = vec![0u8; len];
        OsRng.fill_bytes(&mut material);
        let key = NfsPrivateKey::from_bytes(&material).context("generated key rejected")?;
        private.push(encode_key(&material));
        public.push(encode_key(key.public_key().as_bytes()));
    }
    let rtt = if zero_rtt { "0rtt" } else { "1rtt" };
    let config = GeneratedConfig {
        decryption: format!("{}.{}.{}.{}", SCHEME, mode, lifetime, private.join(".")),
        encryption: format!("{}.{}.{}.{}", SCHEME, mode, rtt, public.join(".")),
    };
    // both strings must round-trip through the parsers
    config
        .decryption
        .parse::<vless_encryption::ServerConfig>()
        .context("invalid server settings")?;
    config
        .encryption
        .parse::<vless_encryption::ClientConfig>()
        .context("invalid client settings")?;
    Ok(config)
}

/// Accept encrypted connections on `listener` and forward each to `upstream`.
///
/// Runs until the listener fails.
pub async fn run_server(
    listener: TcpListener,
    upstream: String,
    instance: Arc<ServerInstance>,
    handshake_timeout: Duration,
) -> Result<()> {
    info!(listen = ?listener.local_addr().ok(), %upstream, "tunnel server online");
    loop {
        let (socket, peer) = listener.accept().await.context("accept failed")?;
        let instance = instance.clone();
        let upstream = upstream.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_encrypted(socket, &upstream, &instance, handshake_timeout).await {
                warn!(%peer, "connection closed: {:#}", e);
            }
        });
    }
}

async fn serve_encrypted(
    socket: TcpStream,
    upstream: &str,
    instance: &ServerInstance,
    handshake_timeout: Duration,
) -> Result<()> {
    let _ = socket.set_nodelay(true);
    let mut conn = timeout(handshake_timeout, instance.handshake(socket))
        .await
        .context("handshake timed out")?
        .context("handshake failed")?;
    debug!(resumed = conn.is_resumed(), cipher = ?conn.cipher(), "accepted tunnel");
    let mut target = TcpStream::connect(upstream)
        .await
        .with_context(|| format!("failed to reach upstream {}", upstream))?;
    let (up, down) = copy_bidirectional(&mut conn, &mut target)
        .await
        .context("relay failed")?;
    debug!(up, down, "tunnel finished");
    Ok(())
}

/// Accept plaintext connections on `listener` and carry each to `server`.
pub async fn run_client(
    listener: TcpListener,
    server: String,
    instance: Arc<ClientInstance>,
    handshake_timeout: Duration,
) -> Result<()> {
    info!(listen = ?listener.local_addr().ok(), %server, "tunnel client online");
    loop {
        let (socket, peer) = listener.accept().await.context("accept failed")?;
        let instance = instance.clone();
        let server = server.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_plain(socket, &server, &instance, handshake_timeout).await {
                warn!(%peer, "connection closed: {:#}", e);
            }
        });
    }
}

async fn serve_plain(
    mut socket: TcpStream,
    server: &str,
    instance: &ClientInstance,
    handshake_timeout: Duration,
) -> Result<()> {
    let remote = TcpStream::connect(server)
        .await
        .with_context(|| format!("failed to reach tunnel server {}", server))?;
    let _ = remote.set_nodelay(true);
    let mut conn = timeout(handshake_timeout, instance.handshake(remote))
        .await
        .context("handshake timed out")?
        .context("handshake failed")?;
    debug!(resumed = conn.is_resumed(), "opened tunnel");
    let (up, down) = copy_bidirectional(&mut socket, &mut conn)
        .await
        .context("relay failed")?;
    debug!(up, down, "tunnel finished");
    Ok(())
}
