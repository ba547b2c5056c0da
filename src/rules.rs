use crate::auth::Auth;
use crate::domain::domain_matches;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Protocol spoken by an upstream proxy
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    Socks5,
    Http,
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyKind::Socks5 => f.write_str("socks5"),
            ProxyKind::Http => f.write_str("http"),
        }
    }
}

/// Resolved upstream proxy endpoint a `Proxy` decision points at.
///
/// Construction goes through [`UpstreamProxy::new`], which guarantees a
/// non-empty host and a non-zero port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpstreamProxy {
    host: String,
    port: u16,
    kind: ProxyKind,
    auth: Option<Auth>,
}

impl UpstreamProxy {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        kind: ProxyKind,
        auth: Option<Auth>,
    ) -> Option<Self> {
        let host = host.into();
        if host.is_empty() || port == 0 {
            return None;
        }
        Some(Self { host, port, kind, auth })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn kind(&self) -> ProxyKind {
        self.kind
    }

    pub fn auth(&self) -> Option<&Auth> {
        self.auth.as_ref()
    }
}

/// Where a connection is routed
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RoutingDecision {
    Direct,
    Proxy(UpstreamProxy),
}

impl fmt::Display for RoutingDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingDecision::Direct => f.write_str("direct"),
            RoutingDecision::Proxy(p) => write!(f, "{}://{}:{}", p.kind, p.host, p.port),
        }
    }
}

/// What a rule compares against
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MatchKind {
    /// `example.com` or `*.example.com`
    Domain(String),
    /// Exact address string, or an IPv4 CIDR such as `10.0.0.0/8`
    IpOrCidr(String),
    /// Case-insensitive substring of the originating application identity
    AppIdentity(String),
    All,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rule {
    pub match_kind: MatchKind,
    pub decision: RoutingDecision,
}

impl Rule {
    pub fn new(match_kind: MatchKind, decision: RoutingDecision) -> Self {
        Self { match_kind, decision }
    }

    fn matches(&self, source_identity: Option<&str>, target_host: &str) -> bool {
        match &self.match_kind {
            MatchKind::All => true,
            // Substring on purpose: "Safari" matches "com.apple.Safari".
            MatchKind::AppIdentity(pattern) => match source_identity {
                Some(identity) => identity
                    .to_lowercase()
                    .contains(&pattern.to_lowercase()),
                None => false,
            },
            MatchKind::Domain(pattern) => domain_matches(pattern, target_host),
            MatchKind::IpOrCidr(pattern) => ip_matches(pattern, target_host),
        }
    }
}

/// Ordered first-match rule table.
///
/// Evaluation never mutates the table. `reload` swaps in a whole new table;
/// a concurrent `decide` sees either the previous or the new set, never a mix.
#[derive(Debug, Default)]
pub struct RuleEngine {
    rules: RwLock<Arc<Vec<Rule>>>,
}

impl RuleEngine {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self {
            rules: RwLock::new(Arc::new(rules)),
        }
    }

    /// Decide how to route a connection. No match (or no rules) means `Direct`.
    pub fn decide(&self, source_identity: Option<&str>, target_host: &str) -> RoutingDecision {
        let rules = Arc::clone(&self.rules.read());
        rules
            .iter()
            .find(|rule| rule.matches(source_identity, target_host))
            .map(|rule| rule.decision.clone())
            .unwrap_or(RoutingDecision::Direct)
    }

    /// Replace the whole rule table
    pub fn reload(&self, rules: Vec<Rule>) {
        *self.rules.write() = Arc::new(rules);
    }

    pub fn len(&self) -> usize {
        self.rules.read().len()
    }
}

/// Match a host against an exact address or an IPv4 CIDR. Fails closed.
fn ip_matches(pattern: &str, target_host: &str) -> bool {
    let Some((network, prefix)) = pattern.split_once('/') else {
        return pattern == target_host;
    };

    let Ok(prefix_len) = prefix.parse::<u8>() else {
        return false;
    };
    if prefix_len > 32 {
        return false;
    }

    let (Some(network), Some(host)) = (parse_ipv4(network), parse_ipv4(target_host)) else {
        return false;
    };

    let mask = if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - prefix_len)
    };
    (host & mask) == (network & mask)
}

// IPv6 targets never parse here, so IPv6 CIDR rules never match.
fn parse_ipv4(s: &str) -> Option<u32> {
    s.parse::<Ipv4Addr>().ok().map(u32::from)
}
