use crate::error::{ProxyError, ProxyResult};
use crate::pipe;
use crate::registry::{Connection, Registry};
use crate::rules::{RoutingDecision, RuleEngine};
use crate::upstream::{connect_outbound, Outbound};
use http::uri::{Authority, Uri};
use http::{Method, StatusCode};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Upper bound on a request head; longer heads are rejected
const MAX_REQUEST_HEAD: usize = 4096;

const MAX_HEADERS: usize = 64;

const PAC_PATH: &str = "/proxy.pac";

/// Build the proxy auto-config script advertising both local listeners
pub fn pac_script(host: IpAddr, http_port: u16, socks_port: u16) -> String {
    let host = match host {
        IpAddr::V4(ip) if ip.is_unspecified() => "127.0.0.1".to_string(),
        IpAddr::V6(ip) if ip.is_unspecified() => "[::1]".to_string(),
        IpAddr::V6(ip) => format!("[{}]", ip),
        IpAddr::V4(ip) => ip.to_string(),
    };
    format!(
        "function FindProxyForURL(url, host) {{\n    \
         return \"PROXY {host}:{http_port}; SOCKS5 {host}:{socks_port}; DIRECT\";\n}}\n"
    )
}

fn status_line(status: StatusCode) -> String {
    format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    )
}

const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

fn bad_gateway() -> String {
    format!(
        "{}Content-Length: 0\r\nConnection: close\r\n\r\n",
        status_line(StatusCode::BAD_GATEWAY)
    )
}

/// Parsed request head plus every byte read so far
struct RequestHead {
    method: String,
    target: String,
    host_header: Option<String>,
    head_len: usize,
    data: Vec<u8>,
}

/// Inbound HTTP proxy server: CONNECT tunnels, plain forwarding and the PAC file
pub struct HttpServer {
    rules: Arc<RuleEngine>,
    registry: Arc<Registry>,
    pac: String,
}

impl HttpServer {
    pub fn new(rules: Arc<RuleEngine>, registry: Arc<Registry>, pac: String) -> Self {
        Self {
            rules,
            registry,
            pac,
        }
    }

    /// Drive one accepted client connection to completion
    pub async fn handle<S>(&self, mut client: S) -> ProxyResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let head = read_head(&mut client).await?;

        if head.method == Method::CONNECT.as_str() {
            return self.connect(client, head).await;
        }
        if head.method == Method::GET.as_str() && head.target == PAC_PATH {
            return self.serve_pac(client).await;
        }
        self.forward(client, head).await
    }

    async fn connect<S>(&self, mut client: S, head: RequestHead) -> ProxyResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let authority: Authority = head
            .target
            .parse()
            .map_err(|_| ProxyError::protocol(format!("bad CONNECT target {:?}", head.target)))?;
        let port = authority
            .port_u16()
            .ok_or_else(|| ProxyError::protocol("CONNECT target without port"))?;
        let host = unbracket(authority.host()).to_string();

        let (outbound, decision) = self.open(&mut client, &host, port).await?;
        client.write_all(CONNECTION_ESTABLISHED).await?;

        // Bytes the client pipelined behind the CONNECT head belong to the tunnel.
        let pipelined = &head.data[head.head_len..];
        let conn = Connection::new(None, host, port, decision);
        self.attach(client, outbound, conn, pipelined).await
    }

    async fn forward<S>(&self, mut client: S, head: RequestHead) -> ProxyResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (host, port) = forward_target(&head)?;
        let (outbound, decision) = self.open(&mut client, &host, port).await?;
        let conn = Connection::new(None, host, port, decision);
        self.attach(client, outbound, conn, &head.data).await
    }

    /// Decide and open the outbound leg, answering 502 on failure
    async fn open<S>(
        &self,
        client: &mut S,
        host: &str,
        port: u16,
    ) -> ProxyResult<(Outbound, RoutingDecision)>
    where
        S: AsyncWrite + Unpin,
    {
        let decision = self.rules.decide(None, host);
        debug!("HTTP {}:{} -> {}", host, port, decision);

        match connect_outbound(&decision, host, port).await {
            Ok(outbound) => Ok((outbound, decision)),
            Err(e) => {
                let _ = client.write_all(bad_gateway().as_bytes()).await;
                let _ = client.shutdown().await;
                Err(e.into())
            }
        }
    }

    /// Register the tunnel, flush buffered bytes both ways, then relay
    async fn attach<S>(
        &self,
        mut client: S,
        mut outbound: Outbound,
        conn: Connection,
        to_remote: &[u8],
    ) -> ProxyResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let guard = self.registry.register(conn);

        // Counted before writing, as in `pipe::relay`.
        if !to_remote.is_empty() {
            guard.add_sent(to_remote.len() as u64);
            outbound.stream.write_all(to_remote).await?;
        }
        if !outbound.early_data.is_empty() {
            guard.add_received(outbound.early_data.len() as u64);
            client.write_all(&outbound.early_data).await?;
        }

        pipe::tunnel(client, outbound.stream, guard).await;
        Ok(())
    }

    async fn serve_pac<S>(&self, mut client: S) -> ProxyResult<()>
    where
        S: AsyncWrite + Unpin,
    {
        let response = format!(
            "{}Content-Type: application/x-ns-proxy-autoconfig\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status_line(StatusCode::OK),
            self.pac.len(),
            self.pac
        );
        client.write_all(response.as_bytes()).await?;
        client.shutdown().await?;
        Ok(())
    }
}

fn unbracket(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

fn default_port(scheme: Option<&str>) -> u16 {
    match scheme {
        Some(s) if s.eq_ignore_ascii_case("https") => 443,
        _ => 80,
    }
}

/// Destination of a plain HTTP request: absolute URL first, then `Host`
fn forward_target(head: &RequestHead) -> ProxyResult<(String, u16)> {
    if let Ok(uri) = head.target.parse::<Uri>() {
        if let Some(host) = uri.host() {
            let port = uri
                .port_u16()
                .unwrap_or_else(|| default_port(uri.scheme_str()));
            return Ok((unbracket(host).to_string(), port));
        }
    }

    let host_header = head
        .host_header
        .as_deref()
        .ok_or_else(|| ProxyError::protocol("request has no absolute URL or Host header"))?;
    let authority: Authority = host_header
        .parse()
        .map_err(|_| ProxyError::protocol(format!("bad Host header {:?}", host_header)))?;
    Ok((
        unbracket(authority.host()).to_string(),
        authority.port_u16().unwrap_or(80),
    ))
}

/// Read until the request head is complete or the size bound is hit
async fn read_head<S>(stream: &mut S) -> ProxyResult<RequestHead>
where
    S: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; MAX_REQUEST_HEAD];
    let mut filled = 0;

    loop {
        if filled == buf.len() {
            return Err(ProxyError::protocol("request head too large"));
        }
        let n = stream.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(ProxyError::protocol("connection closed before request head"));
        }
        filled += n;

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut headers);
        match request.parse(&buf[..filled]) {
            Ok(httparse::Status::Complete(head_len)) => {
                let (Some(method), Some(target)) = (request.method, request.path) else {
                    return Err(ProxyError::protocol("incomplete request line"));
                };
                let host_header = request
                    .headers
                    .iter()
                    .find(|h| h.name.eq_ignore_ascii_case("host"))
                    .and_then(|h| std::str::from_utf8(h.value).ok())
                    .map(|v| v.trim().to_string());
                let method = method.to_string();
                let target = target.to_string();
                buf.truncate(filled);
                return Ok(RequestHead {
                    method,
                    target,
                    host_header,
                    head_len,
                    data: buf,
                });
            }
            Ok(httparse::Status::Partial) => continue,
            Err(e) => return Err(ProxyError::protocol(format!("malformed request: {}", e))),
        }
    }
}
