use crate::auth::Auth;
use crate::rules::{ProxyKind, RoutingDecision};
use bytes::{Bytes, BytesMut};
use std::io;
use std::net::IpAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const USER_PASS_VERSION: u8 = 0x01;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Upper bound on an upstream HTTP CONNECT response head
const MAX_HTTP_RESPONSE_HEAD: usize = 8 * 1024;

/// Error type for outbound connections and upstream handshakes
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream unreachable: {0}")]
    Unreachable(#[source] io::Error),

    #[error("upstream I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("upstream replied with SOCKS version {0:#04x}")]
    InvalidVersion(u8),

    #[error("upstream accepted none of the offered authentication methods")]
    NoAcceptableMethods,

    #[error("upstream authentication failed")]
    AuthenticationFailed,

    #[error("upstream SOCKS5 connect failed with reply code {0:#04x}")]
    ConnectionFailed(u8),

    #[error("upstream HTTP proxy refused CONNECT with status {0}")]
    ConnectionRefused(u16),

    #[error("invalid upstream response: {0}")]
    InvalidResponse(&'static str),

    #[error("invalid target for upstream request: {0}")]
    InvalidTarget(String),
}

/// Result type for upstream operations
pub type UpstreamResult<T> = Result<T, UpstreamError>;

/// An outbound leg that is ready to carry tunnel bytes
#[derive(Debug)]
pub struct Outbound {
    pub stream: TcpStream,
    /// Tunnel bytes the upstream sent along with its handshake reply.
    /// They belong to the client and must be written before relaying.
    pub early_data: Bytes,
}

/// Open the outbound leg for `host:port` according to `decision`
pub async fn connect_outbound(
    decision: &RoutingDecision,
    host: &str,
    port: u16,
) -> UpstreamResult<Outbound> {
    match decision {
        RoutingDecision::Direct => Ok(Outbound {
            stream: dial(host, port).await?,
            early_data: Bytes::new(),
        }),
        RoutingDecision::Proxy(proxy) => {
            let mut stream = dial(proxy.host(), proxy.port()).await?;
            let early_data = match proxy.kind() {
                ProxyKind::Socks5 => {
                    socks5_handshake(&mut stream, host, port, proxy.auth()).await?;
                    Bytes::new()
                }
                ProxyKind::Http => {
                    http_connect_handshake(&mut stream, host, port, proxy.auth()).await?
                }
            };
            debug!("upstream {} ready for {}:{}", decision, host, port);
            Ok(Outbound { stream, early_data })
        }
    }
}

async fn dial(host: &str, port: u16) -> UpstreamResult<TcpStream> {
    let host = strip_brackets(host);
    let stream = TcpStream::connect((host, port))
        .await
        .map_err(UpstreamError::Unreachable)?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

fn strip_brackets(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

/// `host:port`, bracketing IPv6 literals
pub fn format_authority(host: &str, port: u16) -> String {
    let host = strip_brackets(host);
    if host.parse::<std::net::Ipv6Addr>().is_ok() {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Read exactly `buf.len()` bytes, treating early EOF as a truncated reply
async fn read_reply<S>(stream: &mut S, buf: &mut [u8]) -> UpstreamResult<()>
where
    S: AsyncRead + Unpin,
{
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            Err(UpstreamError::InvalidResponse("truncated reply"))
        }
        Err(e) => Err(e.into()),
    }
}

/// Encode `ATYP | DST.ADDR` for a SOCKS5 request
fn encode_target(host: &str, out: &mut Vec<u8>) -> UpstreamResult<()> {
    match strip_brackets(host).parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            out.push(ATYP_IPV4);
            out.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            out.push(ATYP_IPV6);
            out.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let len = u8::try_from(host.len()).map_err(|_| {
                UpstreamError::InvalidTarget(format!("domain too long: {} bytes", host.len()))
            })?;
            if len == 0 {
                return Err(UpstreamError::InvalidTarget("empty host".to_string()));
            }
            out.push(ATYP_DOMAIN);
            out.push(len);
            out.extend_from_slice(host.as_bytes());
        }
    }
    Ok(())
}

/// Run the SOCKS5 client handshake (RFC 1928, RFC 1929) on an open stream.
///
/// On success the bound-address part of the reply has been fully consumed,
/// so the next byte read from `stream` is tunnel payload.
pub async fn socks5_handshake<S>(
    stream: &mut S,
    target_host: &str,
    target_port: u16,
    auth: Option<&Auth>,
) -> UpstreamResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Method negotiation
    let mut greeting = vec![SOCKS_VERSION, 1, METHOD_NO_AUTH];
    if auth.is_some() {
        greeting[1] = 2;
        greeting.push(METHOD_USER_PASS);
    }
    stream.write_all(&greeting).await?;

    let mut selection = [0u8; 2];
    read_reply(stream, &mut selection).await?;
    if selection[0] != SOCKS_VERSION {
        return Err(UpstreamError::InvalidVersion(selection[0]));
    }

    match (selection[1], auth) {
        (METHOD_NO_AUTH, _) => {}
        (METHOD_USER_PASS, Some(auth)) => authenticate(stream, auth).await?,
        _ => return Err(UpstreamError::NoAcceptableMethods),
    }

    // CONNECT request
    let mut request = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];
    encode_target(target_host, &mut request)?;
    request.extend_from_slice(&target_port.to_be_bytes());
    stream.write_all(&request).await?;

    // VER | REP | RSV | ATYP
    let mut header = [0u8; 4];
    read_reply(stream, &mut header).await?;
    if header[0] != SOCKS_VERSION {
        return Err(UpstreamError::InvalidVersion(header[0]));
    }
    if header[1] != 0x00 {
        return Err(UpstreamError::ConnectionFailed(header[1]));
    }

    // Drain BND.ADDR and BND.PORT; leaving them would corrupt the tunnel.
    let remaining = match header[3] {
        ATYP_IPV4 => 4 + 2,
        ATYP_IPV6 => 16 + 2,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            read_reply(stream, &mut len).await?;
            len[0] as usize + 2
        }
        _ => return Err(UpstreamError::InvalidResponse("unknown bound address type")),
    };
    let mut bound = vec![0u8; remaining];
    read_reply(stream, &mut bound).await?;

    Ok(())
}

async fn authenticate<S>(stream: &mut S, auth: &Auth) -> UpstreamResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let user = auth.username.as_bytes();
    let pass = auth.password.as_bytes();
    let (Ok(ulen), Ok(plen)) = (u8::try_from(user.len()), u8::try_from(pass.len())) else {
        return Err(UpstreamError::AuthenticationFailed);
    };
    if ulen == 0 || plen == 0 {
        return Err(UpstreamError::AuthenticationFailed);
    }

    // VER | ULEN | UNAME | PLEN | PASSWD
    let mut msg = Vec::with_capacity(3 + user.len() + pass.len());
    msg.push(USER_PASS_VERSION);
    msg.push(ulen);
    msg.extend_from_slice(user);
    msg.push(plen);
    msg.extend_from_slice(pass);
    stream.write_all(&msg).await?;

    let mut status = [0u8; 2];
    read_reply(stream, &mut status).await?;
    if status[1] != 0x00 {
        return Err(UpstreamError::AuthenticationFailed);
    }
    Ok(())
}

/// Run the HTTP CONNECT client handshake on an open stream.
///
/// The response head is buffered until its terminating blank line, so a
/// status line split across reads is handled. Any bytes that arrived after
/// the head are returned; they are already tunnel payload.
pub async fn http_connect_handshake<S>(
    stream: &mut S,
    target_host: &str,
    target_port: u16,
    auth: Option<&Auth>,
) -> UpstreamResult<Bytes>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let authority = format_authority(target_host, target_port);
    let mut request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
    if let Some(auth) = auth {
        request.push_str("Proxy-Authorization: ");
        request.push_str(&auth.basic_header_value());
        request.push_str("\r\n");
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(UpstreamError::InvalidResponse("connection closed during CONNECT"));
        }

        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut response = httparse::Response::new(&mut headers);
        let parsed = match response.parse(&buf) {
            Ok(httparse::Status::Complete(head_len)) => Some((head_len, response.code)),
            Ok(httparse::Status::Partial) => None,
            Err(_) => return Err(UpstreamError::InvalidResponse("malformed CONNECT response")),
        };

        match parsed {
            Some((head_len, Some(200))) => return Ok(buf.split_off(head_len).freeze()),
            Some((_, Some(code))) => return Err(UpstreamError::ConnectionRefused(code)),
            Some((_, None)) => return Err(UpstreamError::InvalidResponse("missing status code")),
            None if buf.len() >= MAX_HTTP_RESPONSE_HEAD => {
                return Err(UpstreamError::InvalidResponse("CONNECT response head too large"))
            }
            None => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::UpstreamProxy;
    use tokio::io::DuplexStream;
    use tokio::net::TcpListener;

    async fn expect_bytes(stream: &mut DuplexStream, expected: &[u8]) {
        let mut buf = vec![0u8; expected.len()];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, expected);
    }

    /// Minimal SOCKS5 server: no auth, expects a domain CONNECT, replies with `reply`
    async fn fake_socks_server(mut server: DuplexStream, domain: &'static str, reply: Vec<u8>) {
        expect_bytes(&mut server, &[0x05, 0x01, 0x00]).await;
        server.write_all(&[0x05, 0x00]).await.unwrap();

        let mut request = vec![0x05, 0x01, 0x00, 0x03, domain.len() as u8];
        request.extend_from_slice(domain.as_bytes());
        request.extend_from_slice(&443u16.to_be_bytes());
        expect_bytes(&mut server, &request).await;

        server.write_all(&reply).await.unwrap();
        server.write_all(b"DATA").await.unwrap();
    }

    async fn handshake_then_read_payload(reply: Vec<u8>) {
        let (mut client, server) = tokio::io::duplex(1024);
        let server_task = tokio::spawn(fake_socks_server(server, "example.com", reply));

        socks5_handshake(&mut client, "example.com", 443, None).await.unwrap();

        let mut payload = [0u8; 4];
        client.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, b"DATA");
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_socks5_drains_ipv4_bound_address() {
        handshake_then_read_payload(vec![0x05, 0x00, 0x00, 0x01, 10, 0, 0, 1, 0x1f, 0x90]).await;
    }

    #[tokio::test]
    async fn test_socks5_drains_ipv6_bound_address() {
        let mut reply = vec![0x05, 0x00, 0x00, 0x04];
        reply.extend_from_slice(&[0u8; 16]);
        reply.extend_from_slice(&[0x00, 0x50]);
        handshake_then_read_payload(reply).await;
    }

    #[tokio::test]
    async fn test_socks5_drains_domain_bound_address() {
        let mut reply = vec![0x05, 0x00, 0x00, 0x03, 5];
        reply.extend_from_slice(b"proxy");
        reply.extend_from_slice(&[0x04, 0x38]);
        handshake_then_read_payload(reply).await;
    }

    #[tokio::test]
    async fn test_socks5_username_password() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let server_task = tokio::spawn(async move {
            expect_bytes(&mut server, &[0x05, 0x02, 0x00, 0x02]).await;
            server.write_all(&[0x05, 0x02]).await.unwrap();

            let mut auth = vec![0x01, 4];
            auth.extend_from_slice(b"user");
            auth.push(4);
            auth.extend_from_slice(b"pass");
            expect_bytes(&mut server, &auth).await;
            server.write_all(&[0x01, 0x00]).await.unwrap();

            expect_bytes(&mut server, &[0x05, 0x01, 0x00, 0x01, 192, 168, 1, 10, 0x00, 0x16]).await;
            server
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let auth = Auth::new("user".to_string(), "pass".to_string());
        socks5_handshake(&mut client, "192.168.1.10", 22, Some(&auth)).await.unwrap();
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_socks5_authentication_failure() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let mut greeting = [0u8; 4];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[0x05, 0x02]).await.unwrap();
            let mut auth = [0u8; 11];
            server.read_exact(&mut auth).await.unwrap();
            server.write_all(&[0x01, 0x01]).await.unwrap();
        });

        let auth = Auth::new("user".to_string(), "pass".to_string());
        let err = socks5_handshake(&mut client, "example.com", 443, Some(&auth))
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::AuthenticationFailed));
    }

    #[tokio::test]
    async fn test_socks5_unrequested_auth_method_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[0x05, 0x02]).await.unwrap();
        });

        let err = socks5_handshake(&mut client, "example.com", 443, None).await.unwrap_err();
        assert!(matches!(err, UpstreamError::NoAcceptableMethods));
    }

    #[tokio::test]
    async fn test_socks5_connect_failure_code() {
        let (mut client, server) = tokio::io::duplex(1024);
        tokio::spawn(fake_socks_server(
            server,
            "example.com",
            vec![0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0],
        ));

        let err = socks5_handshake(&mut client, "example.com", 443, None).await.unwrap_err();
        assert!(matches!(err, UpstreamError::ConnectionFailed(0x05)));
    }

    #[tokio::test]
    async fn test_socks5_invalid_version() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[0x04, 0x00]).await.unwrap();
        });

        let err = socks5_handshake(&mut client, "example.com", 443, None).await.unwrap_err();
        assert!(matches!(err, UpstreamError::InvalidVersion(0x04)));
    }

    #[tokio::test]
    async fn test_socks5_truncated_reply() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[0x05]).await.unwrap();
        });

        let err = socks5_handshake(&mut client, "example.com", 443, None).await.unwrap_err();
        assert!(matches!(err, UpstreamError::InvalidResponse(_)));
    }

    #[test]
    fn test_encode_target_forms() {
        let mut out = Vec::new();
        encode_target("10.1.2.3", &mut out).unwrap();
        assert_eq!(out, vec![0x01, 10, 1, 2, 3]);

        let mut out = Vec::new();
        encode_target("[::1]", &mut out).unwrap();
        assert_eq!(out[0], 0x04);
        assert_eq!(out.len(), 17);
        assert_eq!(out[16], 1);

        let mut out = Vec::new();
        encode_target("example.com", &mut out).unwrap();
        assert_eq!(out[..2], [0x03, 11]);
        assert_eq!(&out[2..], b"example.com");

        let long = "a".repeat(256);
        assert!(matches!(
            encode_target(&long, &mut Vec::new()),
            Err(UpstreamError::InvalidTarget(_))
        ));
    }

    #[test]
    fn test_format_authority() {
        assert_eq!(format_authority("example.com", 443), "example.com:443");
        assert_eq!(format_authority("::1", 8080), "[::1]:8080");
        assert_eq!(format_authority("[::1]", 8080), "[::1]:8080");
        assert_eq!(format_authority("10.0.0.1", 80), "10.0.0.1:80");
    }

    async fn read_request_head(server: &mut DuplexStream) -> String {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            server.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        String::from_utf8(head).unwrap()
    }

    #[tokio::test]
    async fn test_http_connect_split_response_keeps_early_data() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let server_task = tokio::spawn(async move {
            let head = read_request_head(&mut server).await;
            assert!(head.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
            assert!(head.contains("Host: example.com:443\r\n"));
            assert!(head.contains("Proxy-Authorization: Basic dXNlcjpwYXNz\r\n"));

            server.write_all(b"HTTP/1.1 200 Conn").await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            server
                .write_all(b"ection established\r\nProxy-Agent: test\r\n\r\nEXTRA")
                .await
                .unwrap();
        });

        let auth = Auth::new("user".to_string(), "pass".to_string());
        let early = http_connect_handshake(&mut client, "example.com", 443, Some(&auth))
            .await
            .unwrap();
        server_task.await.unwrap();

        // Depending on scheduling the payload arrives with the head or later.
        let mut rest = early.to_vec();
        while rest.len() < 5 {
            let mut more = [0u8; 5];
            let n = client.read(&mut more[..5 - rest.len()]).await.unwrap();
            rest.extend_from_slice(&more[..n]);
        }
        assert_eq!(rest, b"EXTRA");
    }

    #[tokio::test]
    async fn test_http_connect_refused() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            read_request_head(&mut server).await;
            server
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await
                .unwrap();
        });

        let err = http_connect_handshake(&mut client, "example.com", 443, None)
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::ConnectionRefused(407)));
    }

    #[tokio::test]
    async fn test_http_connect_garbage_response() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            read_request_head(&mut server).await;
            server.write_all(b"SSH-2.0-OpenSSH\r\n\r\n").await.unwrap();
        });

        let err = http_connect_handshake(&mut client, "example.com", 443, None)
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_http_connect_closed_early() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            read_request_head(&mut server).await;
            server.write_all(b"HTTP/1.1 200").await.unwrap();
        });

        let err = http_connect_handshake(&mut client, "example.com", 443, None)
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_connect_outbound_direct() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let outbound = connect_outbound(&RoutingDecision::Direct, "127.0.0.1", port)
            .await
            .unwrap();
        assert!(outbound.early_data.is_empty());
        accept.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_outbound_through_socks_upstream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let upstream = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x00]);
            stream.write_all(&[0x05, 0x00]).await.unwrap();

            let mut request = [0u8; 5 + 15 + 2];
            stream.read_exact(&mut request).await.unwrap();
            assert_eq!(&request[5..20], b"api.example.com");
            stream
                .write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0, 0])
                .await
                .unwrap();
        });

        let proxy = UpstreamProxy::new("127.0.0.1", port, ProxyKind::Socks5, None).unwrap();
        connect_outbound(&RoutingDecision::Proxy(proxy), "api.example.com", 443)
            .await
            .unwrap();
        upstream.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_outbound_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = connect_outbound(&RoutingDecision::Direct, "127.0.0.1", port)
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::Unreachable(_)));
    }
}
