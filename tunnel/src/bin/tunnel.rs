use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;
use vless_encryption::{ClientConfig, ClientInstance, ServerConfig, ServerInstance};
use vless_tunnel::{generate_config, run_client, run_server, KeyKind};

#[derive(Parser, Debug)]
#[command(name = "tunnel", about = "TCP port forwarding over VLESS encryption")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decrypt incoming connections and forward them upstream
    Server {
        #[arg(long, default_value = "127.0.0.1:8443")]
        listen: String,
        #[arg(long)]
        forward: String,
        #[arg(long, env = "VLESS_DECRYPTION")]
        decryption: String,
        #[arg(long, default_value_t = 30)]
        handshake_timeout: u64,
        #[arg(long)]
        verbose_handshakes: bool,
    },
    /// Encrypt local connections and send them to a tunnel server
    Client {
        #[arg(long, default_value = "127.0.0.1:1080")]
        listen: String,
        #[arg(long)]
        server: String,
        #[arg(long, env = "VLESS_ENCRYPTION")]
        encryption: String,
        #[arg(long, default_value_t = 30)]
        handshake_timeout: u64,
        #[arg(long)]
        verbose_handshakes: bool,
    },
    /// Print a fresh pair of matching config strings
    Keygen {
        #[arg(long, value_enum, value_delimiter = ',', default_value = "mlkem768")]
        chain: Vec<KeyKind>,
        #[arg(long, default_value = "native")]
        mode: String,
        #[arg(long, default_value = "600s")]
        lifetime: String,
        #[arg(long)]
        one_rtt: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let cli = Cli::parse();
    match cli.command {
        Command::Server {
            listen,
            forward,
            decryption,
            handshake_timeout,
            verbose_handshakes,
        } => {
            let config: ServerConfig = decryption.parse().context("invalid decryption setting")?;
            let mut options = config.options;
            options.verbose_logging = verbose_handshakes;
            let instance = Arc::new(
                ServerInstance::new(config.chain, options).context("failed to build server")?,
            );
            let listener = TcpListener::bind(&listen)
                .await
                .with_context(|| format!("failed to bind {}", listen))?;
            let serve = run_server(
                listener,
                forward,
                instance.clone(),
                Duration::from_secs(handshake_timeout),
            );
            wait_for(serve).await?;
            instance.close();
        }
        Command::Client {
            listen,
            server,
            encryption,
            handshake_timeout,
            verbose_handshakes,
        } => {
            let config: ClientConfig = encryption.parse().context("invalid encryption setting")?;
            let mut options = config.options;
            options.verbose_logging = verbose_handshakes;
            let instance = Arc::new(
                ClientInstance::new(config.chain, options).context("failed to build client")?,
            );
            let listener = TcpListener::bind(&listen)
                .await
                .with_context(|| format!("failed to bind {}", listen))?;
            let serve = run_client(
                listener,
                server,
                instance,
                Duration::from_secs(handshake_timeout),
            );
            wait_for(serve).await?;
        }
        Command::Keygen {
            chain,
            mode,
            lifetime,
            one_rtt,
        } => {
            let config = generate_config(&chain, &mode, &lifetime, !one_rtt)?;
            println!("decryption: {}", config.decryption);
            println!("encryption: {}", config.encryption);
        }
    }
    Ok(())
}

/// Run `serve` until it fails or Ctrl-C arrives.
async fn wait_for(serve: impl std::future::Future<Output = Result<()>>) -> Result<()> {
    tokio::select! {
        result = serve => result,
        result = signal::ctrl_c() => {
            result.context("failed to install signal handler")?;
            info!("shutting down");
            Ok(())
        }
    }
}
