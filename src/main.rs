mod auth;
mod buffer_pool;
mod config;
mod domain;
mod error;
mod http;
mod pipe;
mod registry;
mod rule_source;
mod rules;
mod session;
mod socks5;
mod upstream;

use crate::config::{Cli, ProxyConfig};
use crate::error::ProxyResult;
use crate::http::HttpServer;
use crate::registry::Registry;
use crate::rules::RuleEngine;
use crate::socks5::Socks5Server;
use clap::Parser;
use color_eyre::eyre::{eyre, Result};

use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;

#[tokio::main]
async fn main() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ruleproxy=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    color_eyre::install()?;

    let args = Cli::parse();
    let config = Arc::new(ProxyConfig::from_cli(args)?);

    let rules = config
        .load_rules()
        .map_err(|e| eyre!("Failed to load rules: {}", e))?;
    info!("Loaded {} routing rules", rules.len());
    let rules = Arc::new(RuleEngine::new(rules));
    let registry = Arc::new(Registry::new());

    let http_listener = TcpListener::bind(config.http_listen_addr).await?;
    let socks_listener = TcpListener::bind(config.socks_listen_addr).await?;
    info!("HTTP proxy listening on http://{}", config.http_listen_addr);
    info!("SOCKS5 proxy listening on {}", config.socks_listen_addr);
    info!("PAC file at http://{}/proxy.pac", config.http_listen_addr);

    let http_server = Arc::new(HttpServer::new(
        Arc::clone(&rules),
        Arc::clone(&registry),
        config.pac_script(),
    ));
    let socks_server = Arc::new(Socks5Server::new(Arc::clone(&rules), Arc::clone(&registry)));

    tokio::spawn(report_connections(Arc::clone(&registry), Arc::clone(&config)));

    #[cfg(unix)]
    tokio::spawn(reload_on_sighup(Arc::clone(&rules), Arc::clone(&config)));

    let http_loop = async move {
        loop {
            match http_listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let _ = stream.set_nodelay(true);
                    let server = Arc::clone(&http_server);
                    tokio::spawn(async move {
                        log_session_end("HTTP", peer_addr, server.handle(stream).await);
                    });
                }
                Err(e) => warn!("HTTP accept error: {} (continuing)", e),
            }
        }
    };

    let socks_loop = async move {
        loop {
            match socks_listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let _ = stream.set_nodelay(true);
                    let server = Arc::clone(&socks_server);
                    tokio::spawn(async move {
                        log_session_end("SOCKS5", peer_addr, server.handle(stream).await);
                    });
                }
                Err(e) => warn!("SOCKS5 accept error: {} (continuing)", e),
            }
        }
    };

    let shutdown_registry = Arc::clone(&registry);
    let shutdown = async move {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            return;
        }
        info!("Shutdown signal received");
        drain(&shutdown_registry).await;
    };

    tokio::select! {
        _ = http_loop => warn!("HTTP server loop terminated"),
        _ = socks_loop => warn!("SOCKS5 server loop terminated"),
        _ = shutdown => info!("Server shutdown complete"),
    }

    Ok(())
}

/// Only failures worth an operator's attention go above debug
fn log_session_end(protocol: &str, peer: SocketAddr, result: ProxyResult<()>) {
    match result {
        Ok(()) => {}
        Err(e) if e.is_client_side() => debug!("{} session from {} ended: {}", protocol, peer, e),
        Err(e) => warn!("{} session from {} failed: {}", protocol, peer, e),
    }
}

/// Wait up to 30 seconds for live tunnels to close
async fn drain(registry: &Registry) {
    if registry.is_empty() {
        return;
    }
    info!("Waiting for {} connections to close...", registry.len());

    for i in 1..=30 {
        tokio::time::sleep(Duration::from_secs(1)).await;

        if registry.is_empty() {
            info!("All connections closed gracefully");
            return;
        }

        if i % 5 == 0 {
            info!("Still waiting for {} connections... ({}/30s)", registry.len(), i);
        }
    }

    warn!("Forced shutdown with {} connections still active", registry.len());
}

async fn report_connections(registry: Arc<Registry>, config: Arc<ProxyConfig>) {
    let mut interval = tokio::time::interval(config.snapshot_interval);
    let mut last_active = 0;

    loop {
        interval.tick().await;

        let active = registry.len();
        if active != last_active {
            info!("Active connections: {}", active);
            last_active = active;
        }

        let Some(path) = config.snapshot_file.clone() else {
            continue;
        };
        let registry = Arc::clone(&registry);
        let saved = tokio::task::spawn_blocking(move || registry.save_snapshot(&path)).await;
        match saved {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to write connection snapshot: {}", e),
            Err(e) => error!("Snapshot task failed: {}", e),
        }
    }
}

#[cfg(unix)]
async fn reload_on_sighup(rules: Arc<RuleEngine>, config: Arc<ProxyConfig>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangups = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to install SIGHUP handler: {}", e);
            return;
        }
    };

    while hangups.recv().await.is_some() {
        match config.load_rules() {
            Ok(new_rules) => {
                rules.reload(new_rules);
                info!("Reloaded {} routing rules", rules.len());
            }
            // Keep serving with the previous table.
            Err(e) => error!("Rule reload failed: {}", e),
        }
    }
}
