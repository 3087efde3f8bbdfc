//! Tunnel connection setup (spec §4.6).
//!
//! Resolves the relay's hostname to every address it has (v4 and v6) and
//! tries each in turn, then applies the socket tuning below.
//! `tokio::net` does not expose `SO_KEEPALIVE` idle/interval timing or a
//! pre-connect send-buffer size uniformly across platforms, so — as
//! `firezone-relay`/`firezone-bin-shared` do — the raw socket is configured
//! with `socket2` before being handed back to tokio.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::{lookup_host, TcpStream};
use tracing::{debug, warn};

/// Initial tunnel recv timeout (spec §4.6); removed after the per-flow handshake.
pub const INITIAL_RECV_TIMEOUT: Duration = Duration::from_secs(5);
const SEND_BUFFER_CLIENT_SIDE_HINT: usize = 256 * 1024;

/// Connects to `host:port`, trying every resolved address (IPv4 and IPv6)
/// until one succeeds, and applies the client-side tunnel socket tuning.
pub async fn dial(host: &str, port: u16) -> io::Result<TcpStream> {
    let addrs: Vec<SocketAddr> = lookup_host((host, port)).await?.collect();
    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no addresses resolved for {host}:{port}"),
        ));
    }

    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                debug!(%addr, "tunnel connected");
                configure_client_socket(&stream)?;
                return Ok(stream);
            }
            Err(e) => {
                warn!(%addr, error = %e, "tunnel connect attempt failed");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "connect failed")))
}

fn configure_client_socket(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let sock_ref = SockRef::from(stream);
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(30))
        .with_interval(Duration::from_secs(5));
    sock_ref.set_tcp_keepalive(&keepalive)?;
    // Best-effort: ask for a generous send buffer; the OS may clamp this.
    let _ = sock_ref.set_send_buffer_size(SEND_BUFFER_CLIENT_SIDE_HINT);
    Ok(())
}

/// Applies the relay-side upstream/tunnel socket tuning (spec §4.6, §4.9):
/// `TCP_NODELAY`, keepalive idle 60s / interval 10s / count 3, and 256 kB
/// send/receive buffers.
pub fn configure_relay_socket(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let sock_ref = SockRef::from(stream);
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(60))
        .with_interval(Duration::from_secs(10));
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    let keepalive = keepalive.with_retries(3);
    sock_ref.set_tcp_keepalive(&keepalive)?;
    sock_ref.set_send_buffer_size(256 * 1024)?;
    sock_ref.set_recv_buffer_size(256 * 1024)?;
    Ok(())
}

/// Wraps a read future with the tunnel's initial recv timeout, returning
/// `Ok(None)` on timeout (a bounded periodic wake, not an error — spec §5
/// "Cancellation") and the read's own result otherwise.
pub async fn recv_with_timeout<F, T>(fut: F) -> io::Result<Option<T>>
where
    F: std::future::Future<Output = io::Result<T>>,
{
    match tokio::time::timeout(INITIAL_RECV_TIMEOUT, fut).await {
        Ok(res) => res.map(Some),
        Err(_elapsed) => Ok(None),
    }
}
