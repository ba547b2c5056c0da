use crate::error::{ProxyError, ProxyResult};
use crate::pipe;
use crate::registry::{Connection, Registry};
use crate::rules::RuleEngine;
use crate::upstream::connect_outbound;
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Success reply with a placeholder bound address of 0.0.0.0:0
const SUCCESS_REPLY: [u8; 10] = [SOCKS_VERSION, 0x00, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0];

/// Destination address from a SOCKS5 request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TargetAddr {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Domain(String),
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ipv4(ip) => write!(f, "{}", ip),
            TargetAddr::Ipv6(ip) => write!(f, "{}", ip),
            TargetAddr::Domain(name) => f.write_str(name),
        }
    }
}

/// A parsed CONNECT request waiting for a routing decision
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingRequest {
    pub target: TargetAddr,
    pub port: u16,
}

/// Inbound SOCKS5 server (RFC 1928, CONNECT only, no authentication)
pub struct Socks5Server {
    rules: Arc<RuleEngine>,
    registry: Arc<Registry>,
}

impl Socks5Server {
    pub fn new(rules: Arc<RuleEngine>, registry: Arc<Registry>) -> Self {
        Self { rules, registry }
    }

    /// Drive one accepted client connection to completion.
    ///
    /// The success reply is sent as soon as the request is parsed, before the
    /// outbound leg exists, so clients can start streaming immediately. If the
    /// outbound connect then fails the client is simply closed; no SOCKS error
    /// code can follow a success reply.
    pub async fn handle<S>(&self, mut client: S) -> ProxyResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        negotiate(&mut client).await?;
        let request = read_request(&mut client).await?;

        let host = request.target.to_string();
        let decision = self.rules.decide(None, &host);
        debug!("SOCKS5 CONNECT {}:{} -> {}", host, request.port, decision);

        client.write_all(&SUCCESS_REPLY).await?;

        let outbound = connect_outbound(&decision, &host, request.port).await?;

        let guard = self
            .registry
            .register(Connection::new(None, host, request.port, decision));
        if !outbound.early_data.is_empty() {
            guard.add_received(outbound.early_data.len() as u64);
            client.write_all(&outbound.early_data).await?;
        }

        pipe::tunnel(client, outbound.stream, guard).await;
        Ok(())
    }
}

/// Read a fixed-size field; a short read is a protocol violation
async fn read_field<S>(stream: &mut S, buf: &mut [u8], what: &str) -> ProxyResult<()>
where
    S: AsyncRead + Unpin,
{
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            Err(ProxyError::protocol(format!("truncated {}", what)))
        }
        Err(e) => Err(e.into()),
    }
}

/// Greeting and method selection. Offered methods are read and ignored;
/// the reply always selects "no authentication".
async fn negotiate<S>(stream: &mut S) -> ProxyResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut greeting = [0u8; 2];
    read_field(stream, &mut greeting, "greeting").await?;
    if greeting[0] != SOCKS_VERSION {
        return Err(ProxyError::protocol(format!(
            "unsupported SOCKS version {:#04x}",
            greeting[0]
        )));
    }

    let mut methods = vec![0u8; greeting[1] as usize];
    read_field(stream, &mut methods, "method list").await?;

    stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;
    Ok(())
}

/// Read `VER | CMD | RSV | ATYP | DST.ADDR | DST.PORT`
async fn read_request<S>(stream: &mut S) -> ProxyResult<PendingRequest>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    read_field(stream, &mut header, "request header").await?;
    if header[0] != SOCKS_VERSION {
        return Err(ProxyError::protocol(format!(
            "unsupported SOCKS version {:#04x}",
            header[0]
        )));
    }
    if header[1] != CMD_CONNECT {
        return Err(ProxyError::protocol(format!(
            "unsupported command {:#04x}",
            header[1]
        )));
    }

    let target = match header[3] {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            read_field(stream, &mut octets, "IPv4 address").await?;
            TargetAddr::Ipv4(Ipv4Addr::from(octets))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            read_field(stream, &mut len, "domain length").await?;
            if len[0] == 0 {
                return Err(ProxyError::protocol("empty domain"));
            }
            let mut name = vec![0u8; len[0] as usize];
            read_field(stream, &mut name, "domain").await?;
            let name = String::from_utf8(name)
                .map_err(|_| ProxyError::protocol("domain is not valid UTF-8"))?;
            TargetAddr::Domain(name)
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            read_field(stream, &mut octets, "IPv6 address").await?;
            TargetAddr::Ipv6(Ipv6Addr::from(octets))
        }
        other => {
            return Err(ProxyError::protocol(format!(
                "unsupported address type {:#04x}",
                other
            )))
        }
    };

    let mut port = [0u8; 2];
    read_field(stream, &mut port, "port").await?;

    Ok(PendingRequest {
        target,
        port: u16::from_be_bytes(port),
    })
}
