use crate::http::pac_script;
use crate::rule_source::{self, RuleSourceError};
use crate::rules::Rule;
use clap::{value_parser, Parser};
use color_eyre::eyre::eyre;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Command line interface configuration
#[derive(Parser, Debug)]
#[command(
    author, version,
    about = "Local SOCKS5/HTTP proxy with rule-based upstream chaining",
    long_about = "ruleproxy accepts SOCKS5 and HTTP proxy clients on two local ports and routes each\nconnection either directly or through an upstream SOCKS5/HTTP proxy chosen by an ordered\nrule list.\n\nFeatures:\n- Domain, IP/CIDR, application and catch-all rules (first match wins)\n- Upstream SOCKS5 (optional username/password) and HTTP CONNECT (optional Basic auth)\n- Proxy auto-config file at GET /proxy.pac on the HTTP port\n- Rule reload on SIGHUP\n- Periodic connection snapshots (--snapshot-file, --snapshot-interval)\n"
)]
pub struct Cli {
    /// IP address to bind both listeners to
    #[arg(long, default_value = "127.0.0.1")]
    pub listen_ip: IpAddr,

    /// HTTP proxy listen port
    #[arg(long = "http-port", default_value_t = 9090)]
    pub http_port: u16,

    /// SOCKS5 proxy listen port
    #[arg(long = "socks-port", default_value_t = 9091)]
    pub socks_port: u16,

    /// JSON file with upstream proxies and routing rules (none: everything direct)
    #[arg(long, value_name = "FILE")]
    pub rules: Option<PathBuf>,

    /// Write a JSON snapshot of live connections to this file
    #[arg(long = "snapshot-file", value_name = "FILE")]
    pub snapshot_file: Option<PathBuf>,

    /// Seconds between connection snapshots
    #[arg(
        long = "snapshot-interval",
        default_value_t = 60,
        value_parser = value_parser!(u64).range(1..)
    )]
    pub snapshot_interval: u64,
}

/// Validated runtime configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub http_listen_addr: SocketAddr,
    pub socks_listen_addr: SocketAddr,
    pub rules_path: Option<PathBuf>,
    pub snapshot_file: Option<PathBuf>,
    pub snapshot_interval: Duration,
}

impl ProxyConfig {
    /// Create ProxyConfig from CLI arguments
    pub fn from_cli(args: Cli) -> color_eyre::Result<Self> {
        if args.http_port == 0 || args.socks_port == 0 {
            return Err(eyre!("Listen ports must be non-zero"));
        }
        if args.http_port == args.socks_port {
            return Err(eyre!(
                "HTTP and SOCKS5 listeners cannot share port {}",
                args.http_port
            ));
        }

        Ok(Self {
            http_listen_addr: SocketAddr::new(args.listen_ip, args.http_port),
            socks_listen_addr: SocketAddr::new(args.listen_ip, args.socks_port),
            rules_path: args.rules,
            snapshot_file: args.snapshot_file,
            snapshot_interval: Duration::from_secs(args.snapshot_interval),
        })
    }

    /// PAC script pointing browsers at both listeners
    pub fn pac_script(&self) -> String {
        pac_script(
            self.http_listen_addr.ip(),
            self.http_listen_addr.port(),
            self.socks_listen_addr.port(),
        )
    }

    /// Read the configured rule file; no file means an empty rule table
    pub fn load_rules(&self) -> Result<Vec<Rule>, RuleSourceError> {
        match &self.rules_path {
            Some(path) => rule_source::load(path),
            None => Ok(Vec::new()),
        }
    }
}
