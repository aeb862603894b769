//! Burrow Bridge Server
//!
//! Exposes a single directory to editors over WebSocket.
//!
//! # Usage
//!
//! ```bash
//! # Plain WebSocket on localhost
//! burrow-bridge ~/project --port 8765
//!
//! # TLS with a throwaway certificate
//! burrow-bridge ~/project --self-signed
//! ```

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use burrow_bridge::{BridgeServer, LocalBackend, MountRegistry, DEFAULT_PORT};
use burrow_core::{BridgeConfig, TlsConfig};

#[derive(Parser, Debug)]
#[command(name = "burrow-bridge")]
#[command(about = "Serve a directory to web-based editors")]
#[command(version)]
struct Args {
    /// Directory to expose
    path: PathBuf,

    /// Mount name shown to clients
    #[arg(short, long, default_value = "workspace")]
    name: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Bind address
    #[arg(short, long, default_value = "127.0.0.1")]
    bind: IpAddr,

    /// Serve TLS with a generated self-signed certificate
    #[arg(long)]
    self_signed: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .init();

    let config = BridgeConfig {
        port: args.port,
        bind: args.bind,
        tls: args.self_signed.then(|| TlsConfig {
            self_signed: true,
            ..TlsConfig::default()
        }),
        ..BridgeConfig::default()
    };

    let registry = Arc::new(MountRegistry::with_scheme(config.scheme.clone()));
    let token = registry.register(&args.name, &args.path)?;

    let server = BridgeServer::bind(&config, registry.clone(), Arc::new(LocalBackend)).await?;

    info!("Starting Burrow bridge");
    println!("Bridge:  {}", server.url());
    println!("Mount:   {}", registry.uri_for(&token, ""));

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down...");
            shutdown.cancel();
        }
    });

    server.serve().await?;
    Ok(())
}
