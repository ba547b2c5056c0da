use crate::buffer_pool::BufferLease;
use crate::registry::TunnelGuard;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Copy bytes from `source` to `destination` until EOF or an I/O error.
///
/// Each chunk read is reported through `on_bytes` before it is written, so
/// counters never lag behind what the peer has seen. The destination is shut
/// down on every exit path. Returns the total number of bytes relayed.
pub async fn relay<R, W, F>(mut source: R, mut destination: W, mut on_bytes: F) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnMut(u64),
{
    let mut buf = BufferLease::new();
    let mut total = 0u64;

    let result = loop {
        let n = match source.read(buf.as_mut_slice()).await {
            Ok(0) => break Ok(total),
            Ok(n) => n,
            Err(e) => break Err(e),
        };
        on_bytes(n as u64);
        if let Err(e) = destination.write_all(&buf.as_slice()[..n]).await {
            break Err(e);
        }
        total += n as u64;
    };

    let _ = destination.shutdown().await;
    result
}

/// Relay a tunnel in both directions until either side closes.
///
/// Client-to-remote bytes count as sent, remote-to-client bytes as received.
/// Each direction runs on its own task; when one finishes the other is
/// aborted, which drops both streams, and the guard unregisters the tunnel.
pub async fn tunnel<C, R>(client: C, remote: R, guard: TunnelGuard)
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    R: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (remote_read, remote_write) = tokio::io::split(remote);
    let guard = Arc::new(guard);

    let up_guard = Arc::clone(&guard);
    let mut upstream = tokio::spawn(relay(client_read, remote_write, move |n| {
        up_guard.add_sent(n)
    }));
    let down_guard = Arc::clone(&guard);
    let mut downstream = tokio::spawn(relay(remote_read, client_write, move |n| {
        down_guard.add_received(n)
    }));

    let (direction, finished, other) = tokio::select! {
        res = &mut upstream => ("client->remote", res, downstream),
        res = &mut downstream => ("remote->client", res, upstream),
    };
    other.abort();
    let _ = other.await;

    match finished {
        Ok(Ok(bytes)) => debug!(id = %guard.id(), direction, bytes, "tunnel closed"),
        Ok(Err(e)) => debug!(id = %guard.id(), direction, "tunnel closed on error: {}", e),
        Err(e) => debug!(id = %guard.id(), direction, "relay task failed: {}", e),
    }
}
