use std::fs;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::{TcpListener, UdpSocket};
use tracing::{error, info, warn};

use ovc_server::config::Config;
use ovc_server::server::ServerCtx;
use ovc_server::{signaling, udp};

#[derive(Parser)]
#[command(name = "ovc-server", about = "Proximity voice chat server")]
struct Args {
    /// Path to configuration file (TOML), defaults to ./ovc.conf when present
    #[arg(short, long)]
    config: Option<String>,

    /// Bind address (IP), overrides config
    #[arg(long)]
    host: Option<String>,

    /// Signaling WebSocket port, overrides config
    #[arg(long)]
    port: Option<u16>,

    /// Legacy UDP ingress port, overrides config
    #[arg(long)]
    udp_port: Option<u16>,

    /// Auth code file path, overrides config
    #[arg(long)]
    auth_file: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ovc_server=info".into()),
        )
        .init();

    let args = Args::parse();

    // Load config
    let mut config: Config = if let Some(config_path) = &args.config {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("failed to read config file: {config_path}"))?;
        toml::from_str(&content).context("invalid configuration")?
    } else if std::path::Path::new("ovc.conf").exists() {
        let content = fs::read_to_string("ovc.conf").context("failed to read ovc.conf")?;
        toml::from_str(&content).context("invalid configuration")?
    } else {
        Config::default()
    };

    // CLI overrides
    if let Some(host) = args.host {
        config.bind_host = host;
    }
    if let Some(port) = args.port {
        config.signaling_port = port;
    }
    if let Some(port) = args.udp_port {
        config.udp_port = Some(port);
    }
    if let Some(path) = args.auth_file {
        config.auth_file = path.into();
    }
    let config = config.normalized();

    info!("voice chat server starting");
    info!(
        host = %config.bind_host,
        signaling_port = config.signaling_port,
        udp_port = ?config.udp_port,
        max_voice_distance = config.max_voice_distance,
        origins = ?config.allowed_origins,
    );
    if config.allowed_origins.iter().any(|o| o == "*") {
        warn!("origin allow-list contains '*': any web origin may connect");
    }

    let ctx = Arc::new(ServerCtx::new(config)?);

    // Bind the signaling listener; failure here is fatal.
    let listener = TcpListener::bind(format!(
        "{}:{}",
        ctx.config.bind_host, ctx.config.signaling_port
    ))
    .await
    .with_context(|| {
        format!(
            "failed to bind signaling listener on {}:{}",
            ctx.config.bind_host, ctx.config.signaling_port
        )
    })?;
    info!(
        "signaling listener bound on {}:{}{}",
        ctx.config.bind_host,
        ctx.config.signaling_port,
        signaling::VOICE_PATH
    );

    // Optional legacy UDP ingress with enlarged buffers.
    if let Some(udp_port) = ctx.config.udp_port {
        let socket = bind_udp(&ctx.config.bind_host, udp_port)?;
        info!("UDP ingress bound on {}:{udp_port}", ctx.config.bind_host);
        let udp_ctx = ctx.clone();
        tokio::spawn(async move {
            udp::run_udp_loop(socket, udp_ctx).await;
        });
    }

    // SIGINT/SIGTERM trigger the graceful close.
    {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            info!("shutdown signal received");
            ctx.begin_shutdown();
        });
    }

    info!("server ready, accepting connections");
    let mut shutdown = ctx.shutdown_rx();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(result) => result,
                    Err(e) => {
                        error!("accept error: {e}");
                        continue;
                    }
                };
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    signaling::handle_connection(stream, peer_addr, ctx).await;
                });
            }
        }
    }

    // Stop accepting, let sessions observe the shutdown flag, send their
    // disconnects and drain the router, then exit cleanly.
    drop(listener);
    let drain_deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !ctx.sessions.is_empty() && tokio::time::Instant::now() < drain_deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    if !ctx.sessions.is_empty() {
        warn!(remaining = ctx.sessions.len(), "sessions still open at shutdown deadline");
    }
    info!("shutdown complete");
    Ok(())
}

fn bind_udp(host: &str, port: u16) -> Result<Arc<UdpSocket>> {
    let sock = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )
    .context("failed to create UDP socket")?;
    let _ = sock.set_recv_buffer_size(1024 * 1024);
    let _ = sock.set_send_buffer_size(1024 * 1024);
    let addr: std::net::SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid UDP address {host}:{port}"))?;
    sock.bind(&addr.into())
        .with_context(|| format!("failed to bind UDP on {host}:{port}"))?;
    sock.set_nonblocking(true)
        .context("failed to set non-blocking")?;
    let std_sock: std::net::UdpSocket = sock.into();
    Ok(Arc::new(
        UdpSocket::from_std(std_sock).context("failed to wrap UDP socket in tokio")?,
    ))
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
