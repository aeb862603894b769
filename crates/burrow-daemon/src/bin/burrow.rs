//! Burrow CLI
//!
//! Usage:
//!   burrow serve --mount src=~/project     Serve directories to editors
//!   burrow dial <alias>                    Dial an SSH host from the config
//!   burrow config                          Print a sample configuration

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use burrow_bridge::{BridgeClient, BridgeServer, LocalBackend, MountRegistry, ServiceDirectory};
use burrow_core::{Config, MountConfig, Signal, TlsConfig};
use burrow_daemon::{DialError, HostsProvider, Orchestrator};

#[derive(Parser)]
#[command(name = "burrow")]
#[command(about = "Remote file-system bridge and SSH dialer", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve directories to editors over WebSocket
    Serve {
        /// Directory to expose, as name=path (repeatable)
        #[arg(short, long = "mount", value_parser = parse_mount)]
        mounts: Vec<MountConfig>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Bind address
        #[arg(short, long)]
        bind: Option<IpAddr>,

        /// PEM certificate chain
        #[arg(long, requires = "tls_key")]
        tls_cert: Option<PathBuf>,

        /// PEM private key
        #[arg(long, requires = "tls_cert")]
        tls_key: Option<PathBuf>,

        /// Serve TLS with a generated self-signed certificate
        #[arg(long, conflicts_with = "tls_cert")]
        self_signed: bool,
    },

    /// Dial a host and hold the connection until Ctrl+C
    Dial {
        /// Host alias from the [hosts] table
        alias: String,

        /// After connecting, check for a bridge on this remote port
        #[arg(long)]
        check_bridge: Option<u16>,
    },

    /// Print a sample configuration file
    Config,
}

fn parse_mount(value: &str) -> Result<MountConfig, String> {
    let (name, path) = value
        .split_once('=')
        .ok_or_else(|| format!("expected name=path, got {:?}", value))?;
    if name.is_empty() || path.is_empty() {
        return Err(format!("expected name=path, got {:?}", value));
    }
    Ok(MountConfig {
        name: name.to_string(),
        path: PathBuf::from(path),
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Set up logging
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };

    match cli.command {
        Commands::Serve {
            mounts,
            port,
            bind,
            tls_cert,
            tls_key,
            self_signed,
        } => {
            let mut config = config;
            config.bridge.mounts.extend(mounts);
            if let Some(port) = port {
                config.bridge.port = port;
            }
            if let Some(bind) = bind {
                config.bridge.bind = bind;
            }
            if self_signed || tls_cert.is_some() {
                config.bridge.tls = Some(TlsConfig {
                    cert_path: tls_cert,
                    key_path: tls_key,
                    self_signed,
                });
            }
            run_serve(config).await?;
        }
        Commands::Dial {
            alias,
            check_bridge,
        } => {
            run_dial(config, alias, check_bridge).await?;
        }
        Commands::Config => {
            print!("{}", Config::sample());
        }
    }

    Ok(())
}

async fn run_serve(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let bridge = config.bridge;
    if bridge.mounts.is_empty() {
        error!("Nothing to serve: pass --mount name=path or add [[bridge.mounts]]");
        return Err("no mounts configured".into());
    }

    let registry = Arc::new(MountRegistry::with_scheme(bridge.scheme.clone()));
    let mut tokens = Vec::new();
    for mount in &bridge.mounts {
        let token = registry.register(&mount.name, &mount.path)?;
        tokens.push((mount.name.clone(), token));
    }

    let services = ServiceDirectory::new();
    let server = services
        .acquire(bridge.port, || {
            BridgeServer::bind(&bridge, registry.clone(), Arc::new(LocalBackend))
        })
        .await?;

    info!("Starting Burrow bridge...");
    info!("  Listening on: {}", server.url());
    for (name, token) in &tokens {
        info!("  {}: {}", name, registry.uri_for(token, ""));
    }

    signal::ctrl_c().await?;
    info!("Shutting down...");
    services.release(bridge.port).await;

    Ok(())
}

async fn run_dial(
    config: Config,
    alias: String,
    check_bridge: Option<u16>,
) -> Result<(), Box<dyn std::error::Error>> {
    let provider = HostsProvider::from_config(&config);
    let known: Vec<String> = provider.aliases().map(str::to_string).collect();
    let orchestrator = Orchestrator::with_russh(Arc::new(provider), &config.ssh);

    let handle = orchestrator.start(&alias);
    let mut events = handle.events();
    let printer = tokio::spawn(async move {
        while let Some(signal) = events.recv().await {
            match signal {
                Signal::Value(record) => println!("{}", record),
                Signal::Completed => break,
                Signal::Failed(reason) => {
                    println!("dial failed: {}", reason);
                    break;
                }
            }
        }
    });

    let control = tokio::select! {
        result = handle.wait() => result,
        _ = signal::ctrl_c() => Err(DialError::Cancelled),
    };

    let control = match control {
        Ok(control) => control,
        Err(DialError::Cancelled) => {
            info!("Dial cancelled");
            return Ok(());
        }
        Err(e @ DialError::HostNotFound(_)) => {
            if !known.is_empty() {
                error!("Known hosts: {}", known.join(", "));
            }
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    };

    info!("Connected to {} via {}", control.alias(), control.chain().join(" -> "));

    if let Some(port) = check_bridge {
        match control.open_forward("127.0.0.1", port).await {
            Ok(stream) => {
                let url = format!("ws://127.0.0.1:{}", port);
                match BridgeClient::over_stream(&url, stream).await {
                    Ok(client) => match client.hello(Some("burrow-dial")).await {
                        Ok(info) => info!(
                            "Remote bridge on {} (protocol {}, {})",
                            info.host_name,
                            info.protocol_version,
                            info.capabilities.join(", ")
                        ),
                        Err(e) => warn!("Bridge hello failed: {}", e),
                    },
                    Err(e) => warn!("No bridge on remote port {}: {}", port, e),
                }
            }
            Err(e) => warn!("Forward to remote port {} failed: {}", port, e),
        }
    }

    info!("Holding connection, press Ctrl+C to release");
    signal::ctrl_c().await?;
    control.release().await;
    let _ = printer.await;

    Ok(())
}
