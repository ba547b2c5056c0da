use crate::auth::Auth;
use crate::domain::validate_domain_pattern;
use crate::rules::{MatchKind, ProxyKind, RoutingDecision, Rule, UpstreamProxy};
use serde::Deserialize;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum RuleSourceError {
    #[error("failed to read rule file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid rule document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("proxy {name:?} is invalid: {reason}")]
    InvalidProxy { name: String, reason: &'static str },

    #[error("proxy {0:?} is defined more than once")]
    DuplicateProxy(String),

    #[error("invalid rule pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// Upstream proxy definition as written in the rule file
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyEntry {
    pub name: String,
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "match", rename_all = "lowercase")]
pub enum MatchEntry {
    Domain { pattern: String },
    #[serde(alias = "cidr")]
    Ip { pattern: String },
    App { pattern: String },
    All,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionEntry {
    Direct,
    Proxy(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleEntry {
    #[serde(flatten)]
    pub matcher: MatchEntry,
    pub action: ActionEntry,
}

/// Top-level rule file: named proxies plus the ordered rule list
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuleDocument {
    #[serde(default)]
    pub proxies: Vec<ProxyEntry>,
    #[serde(default)]
    pub rules: Vec<RuleEntry>,
}

impl RuleDocument {
    pub fn parse(text: &str) -> Result<Self, RuleSourceError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Turn the document into an ordered rule table.
    ///
    /// Rules pointing at an unknown or disabled proxy are dropped with a
    /// warning; everything else that is malformed fails the whole load.
    pub fn resolve(self) -> Result<Vec<Rule>, RuleSourceError> {
        let mut proxies: HashMap<String, Option<UpstreamProxy>> = HashMap::new();
        for entry in self.proxies {
            let name = entry.name.clone();
            if proxies.contains_key(&name) {
                return Err(RuleSourceError::DuplicateProxy(name));
            }
            let proxy = if entry.enabled {
                Some(entry.into_upstream()?)
            } else {
                None
            };
            proxies.insert(name, proxy);
        }

        let mut rules = Vec::with_capacity(self.rules.len());
        for (index, entry) in self.rules.into_iter().enumerate() {
            let decision = match entry.action {
                ActionEntry::Direct => RoutingDecision::Direct,
                ActionEntry::Proxy(name) => match proxies.get(&name) {
                    Some(Some(proxy)) => RoutingDecision::Proxy(proxy.clone()),
                    Some(None) => {
                        warn!("Skipping rule #{}: proxy {:?} is disabled", index, name);
                        continue;
                    }
                    None => {
                        warn!("Skipping rule #{}: unknown proxy {:?}", index, name);
                        continue;
                    }
                },
            };

            let match_kind = match entry.matcher {
                MatchEntry::Domain { pattern } => {
                    validate_domain_pattern(&pattern).map_err(|reason| {
                        RuleSourceError::InvalidPattern {
                            pattern: pattern.clone(),
                            reason,
                        }
                    })?;
                    MatchKind::Domain(pattern)
                }
                MatchEntry::Ip { pattern } => MatchKind::IpOrCidr(pattern),
                MatchEntry::App { pattern } => {
                    if pattern.is_empty() {
                        return Err(RuleSourceError::InvalidPattern {
                            pattern,
                            reason: "application pattern cannot be empty".to_string(),
                        });
                    }
                    MatchKind::AppIdentity(pattern)
                }
                MatchEntry::All => MatchKind::All,
            };
            rules.push(Rule::new(match_kind, decision));
        }

        debug!("Resolved {} rules", rules.len());
        Ok(rules)
    }
}

impl ProxyEntry {
    fn into_upstream(self) -> Result<UpstreamProxy, RuleSourceError> {
        let auth = match (self.username, self.password) {
            (Some(u), Some(p)) => {
                // RFC 1929 length fields are one byte and must be non-zero.
                let representable = |s: &str| (1..=255).contains(&s.len());
                if self.kind == ProxyKind::Socks5 && !(representable(&u) && representable(&p)) {
                    return Err(RuleSourceError::InvalidProxy {
                        name: self.name,
                        reason: "SOCKS5 username and password must be 1 to 255 bytes",
                    });
                }
                Some(Auth::new(u, p))
            }
            (None, None) => None,
            _ => {
                return Err(RuleSourceError::InvalidProxy {
                    name: self.name,
                    reason: "username and password must be given together",
                })
            }
        };
        UpstreamProxy::new(self.host, self.port, self.kind, auth).ok_or(
            RuleSourceError::InvalidProxy {
                name: self.name,
                reason: "host must be non-empty and port non-zero",
            },
        )
    }
}

/// Read and resolve a rule file
pub fn load(path: &Path) -> Result<Vec<Rule>, RuleSourceError> {
    let text = std::fs::read_to_string(path).map_err(|source| RuleSourceError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    RuleDocument::parse(&text)?.resolve()
}
