//! Backhaul CLI
//!
//! Runs the reverse tunnel proxy, or a reference agent that connects to it
//! and replays requests against a local HTTP service.

use anyhow::{Context, Result};
use backhaul_agent::{Agent, AgentConfig, HttpOrigin};
use backhaul_proto::Capability;
use backhaul_server::{ProxyConfig, ProxyServer, TlsConfig};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("BACKHAUL_GIT_HASH"),
    ", built ",
    env!("BACKHAUL_BUILD_TIME"),
    ")"
);

/// Backhaul - reverse tunneling HTTP proxy
#[derive(Parser, Debug)]
#[command(name = "backhaul")]
#[command(about = "Backhaul - expose services behind NAT through agents that dial in")]
#[command(version = VERSION)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true, env = "BACKHAUL_LOG_FILE")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the tunnel proxy
    #[command(long_about = r#"
Accept agent WebSocket connections and tunnel every other HTTP request to
them. Requests asking for text/event-stream are bridged to a streaming agent.

EXAMPLES:
  # Listen on the default port
  backhaul serve

  # Only tunnel /proxy/*, with a 30 second deadline
  backhaul serve --path-prefix /proxy --request-timeout-secs 30

  # Serve HTTPS
  backhaul serve --listen 0.0.0.0:8443 --tls-cert cert.pem --tls-key key.pem

ENVIRONMENT VARIABLES:
  BACKHAUL_LISTEN            Address to bind
  BACKHAUL_REQUEST_TIMEOUT   Single request deadline in seconds
  BACKHAUL_HEARTBEAT         SSE keep-alive interval in seconds
  BACKHAUL_PATH_PREFIX       Only tunnel paths under this prefix
  BACKHAUL_STREAM_NAMESPACE  Only stream SSE requests under this path
    "#)]
    Serve {
        /// Address to listen on
        #[arg(long, env = "BACKHAUL_LISTEN", default_value = "0.0.0.0:8000")]
        listen: SocketAddr,

        /// Seconds to wait for an agent reply
        #[arg(long, env = "BACKHAUL_REQUEST_TIMEOUT", default_value = "10")]
        request_timeout_secs: u64,

        /// Seconds of SSE idle time before a keep-alive comment
        #[arg(long, env = "BACKHAUL_HEARTBEAT", default_value = "15")]
        heartbeat_secs: u64,

        /// Only tunnel paths under this prefix (stripped before forwarding)
        #[arg(long, env = "BACKHAUL_PATH_PREFIX")]
        path_prefix: Option<String>,

        /// Only stream SSE requests whose path is under this namespace
        #[arg(long, env = "BACKHAUL_STREAM_NAMESPACE")]
        stream_namespace: Option<String>,

        /// What pending requests do when their agent disconnects (await-timeout, fail-fast)
        #[arg(long, env = "BACKHAUL_DISCONNECT_POLICY", default_value = "await-timeout")]
        disconnect_policy: backhaul_control::DisconnectPolicy,

        /// Largest request body accepted, in bytes
        #[arg(long, default_value_t = backhaul_server::config::DEFAULT_MAX_BODY_BYTES)]
        max_body_bytes: usize,

        /// Enable permissive CORS
        #[arg(long)]
        cors: bool,

        /// TLS certificate (PEM)
        #[arg(long, requires = "tls_key")]
        tls_cert: Option<PathBuf>,

        /// TLS private key (PEM)
        #[arg(long, requires = "tls_cert")]
        tls_key: Option<PathBuf>,
    },

    /// Run a reference agent forwarding tunneled requests to a local service
    Agent {
        /// Proxy URL (e.g. ws://proxy.example.com:8000)
        #[arg(long, env = "BACKHAUL_PROXY")]
        proxy: String,

        /// Local service to forward to (e.g. http://127.0.0.1:3000)
        #[arg(long, env = "BACKHAUL_ORIGIN")]
        origin: String,

        /// Register as a streaming agent
        #[arg(long)]
        stream: bool,

        /// Seconds to wait for the local service
        #[arg(long, default_value = "30")]
        request_timeout_secs: u64,

        /// Maximum consecutive connection failures (0 = infinite)
        #[arg(long, default_value = "0")]
        max_reconnect_attempts: u32,

        /// Maximum reconnection delay in seconds
        #[arg(long, default_value = "60")]
        max_reconnect_delay: u64,
    },
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool, log_file: Option<&PathBuf>) -> Result<()> {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(file_layer)
        .with(filter)
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose, cli.log_file.as_ref())?;

    match cli.command {
        Commands::Serve {
            listen,
            request_timeout_secs,
            heartbeat_secs,
            path_prefix,
            stream_namespace,
            disconnect_policy,
            max_body_bytes,
            cors,
            tls_cert,
            tls_key,
        } => {
            info!("Backhaul {} starting...", VERSION);

            let tls = match (tls_cert, tls_key) {
                (Some(cert_path), Some(key_path)) => {
                    let _ = rustls::crypto::ring::default_provider().install_default();
                    Some(TlsConfig {
                        cert_path,
                        key_path,
                    })
                }
                _ => None,
            };

            let config = ProxyConfig {
                bind_addr: listen,
                request_timeout: Duration::from_secs(request_timeout_secs),
                heartbeat_interval: Duration::from_secs(heartbeat_secs),
                path_prefix,
                stream_namespace,
                disconnect_policy,
                max_body_bytes,
                enable_cors: cors,
                tls,
            };

            info!("Request timeout: {}s", request_timeout_secs);
            info!("Disconnect policy: {}", config.disconnect_policy);
            if let Some(prefix) = config.normalized_prefix() {
                info!("Tunneling only paths under {}", prefix);
            }
            if config.enable_cors {
                warn!("CORS enabled for all origins");
            }

            let server = ProxyServer::new(config);
            server
                .start_with_shutdown(async {
                    let _ = tokio::signal::ctrl_c().await;
                    info!("Received Ctrl+C, shutting down...");
                })
                .await
                .context("Proxy server failed")?;

            info!("Backhaul stopped");
            Ok(())
        }
        Commands::Agent {
            proxy,
            origin,
            stream,
            request_timeout_secs,
            max_reconnect_attempts,
            max_reconnect_delay,
        } => {
            let config = AgentConfig {
                proxy_url: proxy,
                capability: if stream {
                    Capability::Stream
                } else {
                    Capability::Regular
                },
                origin_url: origin,
                request_timeout: Duration::from_secs(request_timeout_secs),
                max_backoff: Duration::from_secs(max_reconnect_delay),
                max_attempts: max_reconnect_attempts,
                ..Default::default()
            };

            let socket_url = config.socket_url().context("Invalid proxy URL")?;
            let origin_base = config.origin_base().context("Invalid origin URL")?;
            info!("Proxy: {}", socket_url);
            info!("Origin: {}", origin_base);
            info!("Capability: {}", config.capability);

            if socket_url.scheme() == "wss" {
                let _ = rustls::crypto::ring::default_provider().install_default();
            }

            let agent = Agent::new(config.clone(), HttpOrigin::new(origin_base, config.request_timeout));

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C, shutting down...");
                }
                result = agent.run() => {
                    if let Err(e) = result {
                        error!("Agent stopped: {}", e);
                        return Err(e.into());
                    }
                }
            }

            info!("Agent stopped");
            Ok(())
        }
    }
}
