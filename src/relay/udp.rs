//! Relay UDP engine (spec §4.10).
//!
//! One kernel UDP socket is kept per `(tunnel_peer, client_src_port)`, shared
//! by every logical UDP flow that client multiplexes through that source
//! port. Each socket has its own receiver task; all of them write back to the
//! same tunnel connection, serialised by `tunnel_write`.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio::io::AsyncWriteExt;
use tokio::net::UdpSocket;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::protocol::Frame;
use crate::rewrite::rewrite_ipv4;

const SOCKET_RECV_POLL: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct UdpFlowMeta {
    conn_id: u32,
    client_src_port: u16,
    client_real_ipv4: Ipv4Addr,
}

struct PeerSockets {
    sockets: HashMap<u16, Arc<UdpSocket>>,
    stopped: Arc<AtomicBool>,
}

/// Relay-side UDP flow state shared by every tunnel that has bootstrapped
/// UDP multiplexing (spec §3 `RelayUdpState`).
pub struct RelayUdpState {
    proxy_local_ip: Ipv4Addr,
    game_server_ip: IpAddr,
    by_peer: SyncMutex<HashMap<SocketAddr, PeerSockets>>,
    flows: SyncMutex<HashMap<(SocketAddr, u16, u16), UdpFlowMeta>>,
}

impl RelayUdpState {
    pub fn new(proxy_local_ip: Ipv4Addr, game_server_ip: IpAddr) -> Arc<Self> {
        Arc::new(RelayUdpState {
            proxy_local_ip,
            game_server_ip,
            by_peer: SyncMutex::new(HashMap::new()),
            flows: SyncMutex::new(HashMap::new()),
        })
    }

    /// Handles one `0x03` frame read from `peer`'s tunnel connection: ensures
    /// a socket exists for `(peer, client_src_port)`, records flow metadata,
    /// rewrites the client's real address out of the payload, and sends it
    /// upstream to the game server.
    pub async fn handle_outbound<W>(
        self: &Arc<Self>,
        peer: SocketAddr,
        client_real_ipv4: Ipv4Addr,
        conn_id: u32,
        client_src_port: u16,
        dst_port: u16,
        payload: &[u8],
        tunnel_write: Arc<AsyncMutex<W>>,
    ) where
        W: tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let socket = match self.get_or_create_socket(peer, client_src_port, tunnel_write) {
            Some(s) => s,
            None => return,
        };

        self.flows.lock().insert(
            (peer, client_src_port, dst_port),
            UdpFlowMeta {
                conn_id,
                client_src_port,
                client_real_ipv4,
            },
        );

        let mut buf = payload.to_vec();
        rewrite_ipv4(&mut buf, client_real_ipv4, self.proxy_local_ip);

        let upstream = SocketAddr::new(self.game_server_ip, dst_port);
        if let Err(e) = socket.send_to(&buf, upstream).await {
            warn!(error = %e, %upstream, "failed to send udp datagram upstream");
        }
    }

    fn get_or_create_socket<W>(
        self: &Arc<Self>,
        peer: SocketAddr,
        client_src_port: u16,
        tunnel_write: Arc<AsyncMutex<W>>,
    ) -> Option<Arc<UdpSocket>>
    where
        W: tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        {
            let by_peer = self.by_peer.lock();
            if let Some(peer_sockets) = by_peer.get(&peer) {
                if let Some(s) = peer_sockets.sockets.get(&client_src_port) {
                    return Some(s.clone());
                }
            }
        }

        // Bind attempt happens outside the lock (it's a syscall), guarded by
        // re-checking under the lock before insertion below.
        let socket = match bind_socket(self.proxy_local_ip, client_src_port) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, client_src_port, "failed to bind relay udp socket");
                return None;
            }
        };

        let mut by_peer = self.by_peer.lock();
        let peer_sockets = by_peer.entry(peer).or_insert_with(|| PeerSockets {
            sockets: HashMap::new(),
            stopped: Arc::new(AtomicBool::new(false)),
        });
        if let Some(existing) = peer_sockets.sockets.get(&client_src_port) {
            return Some(existing.clone());
        }
        let socket = Arc::new(socket);
        peer_sockets
            .sockets
            .insert(client_src_port, socket.clone());
        let stopped = peer_sockets.stopped.clone();
        drop(by_peer);

        let state = self.clone();
        tokio::spawn(state.run_socket_receiver(peer, client_src_port, socket.clone(), stopped, tunnel_write));
        Some(socket)
    }

    async fn run_socket_receiver<W>(
        self: Arc<Self>,
        peer: SocketAddr,
        client_src_port: u16,
        socket: Arc<UdpSocket>,
        stopped: Arc<AtomicBool>,
        tunnel_write: Arc<AsyncMutex<W>>,
    ) where
        W: tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let mut buf = vec![0u8; 65535];
        while !stopped.load(Ordering::Acquire) {
            let recv = tokio::time::timeout(SOCKET_RECV_POLL, socket.recv_from(&mut buf)).await;
            let (n, from) = match recv {
                Ok(Ok(v)) => v,
                Ok(Err(e)) => {
                    warn!(error = %e, %peer, client_src_port, "udp upstream socket error, stopping receiver");
                    break;
                }
                Err(_elapsed) => continue,
            };
            let game_server_port = from.port();
            let meta = self
                .flows
                .lock()
                .get(&(peer, client_src_port, game_server_port))
                .cloned();
            let meta = match meta {
                Some(m) => m,
                None => {
                    debug!(%peer, client_src_port, game_server_port, "udp datagram for unknown flow, dropping");
                    continue;
                }
            };

            let mut payload = buf[..n].to_vec();
            if payload.len() == 7 && payload[0] == 0x02 {
                rewrite_nat_discovery(&mut payload, meta.client_real_ipv4, meta.client_src_port);
            } else {
                rewrite_ipv4(&mut payload, self.proxy_local_ip, meta.client_real_ipv4);
            }

            let frame = Frame::Udp {
                conn_id: meta.conn_id,
                src_port: game_server_port,
                dst_port: meta.client_src_port,
                payload,
            };
            let bytes = match frame.encode() {
                Ok(b) => b,
                Err(e) => {
                    warn!(error = %e, "failed to encode udp frame for tunnel");
                    continue;
                }
            };
            let mut w = tunnel_write.lock().await;
            if let Err(e) = w.write_all(&bytes).await {
                warn!(error = %e, %peer, "failed to write udp frame to tunnel, stopping receiver");
                break;
            }
        }
        info!(%peer, client_src_port, "udp socket receiver stopped");
    }

    /// Unblocks every receiver task for `peer` and drops its sockets (spec
    /// §4.10 "Shutdown").
    pub fn shutdown_peer(&self, peer: SocketAddr) {
        if let Some(peer_sockets) = self.by_peer.lock().remove(&peer) {
            peer_sockets.stopped.store(true, Ordering::Release);
        }
        self.flows.lock().retain(|(p, _, _), _| *p != peer);
    }
}

/// Rewrites a 7-byte game-level NAT-discovery response in place (spec §6,
/// §4.10): `0x02 | ip[4] DNF-order | port[2] LE` becomes the client's real
/// address and source port, in the same encoding.
fn rewrite_nat_discovery(buf: &mut [u8], client_real_ipv4: Ipv4Addr, client_src_port: u16) {
    let octets = client_real_ipv4.octets();
    buf[1] = octets[3];
    buf[2] = octets[2];
    buf[3] = octets[1];
    buf[4] = octets[0];
    let port_bytes = client_src_port.to_le_bytes();
    buf[5] = port_bytes[0];
    buf[6] = port_bytes[1];
}

/// Binds a UDP socket to `(ip, port)`, falling back to an OS-assigned
/// ephemeral port on `EADDRINUSE` (another client already holds that source
/// port) as spec §4.10 requires.
fn bind_socket(ip: Ipv4Addr, port: u16) -> std::io::Result<UdpSocket> {
    let primary = SocketAddr::new(IpAddr::V4(ip), port);
    let std_socket = match std::net::UdpSocket::bind(primary) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            warn!(%primary, "udp source port in use by another client, falling back to an ephemeral port");
            std::net::UdpSocket::bind(SocketAddr::new(IpAddr::V4(ip), 0))?
        }
        Err(e) => return Err(e),
    };
    std_socket.set_nonblocking(true)?;
    UdpSocket::from_std(std_socket)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nat_discovery_rewrite_matches_spec_scenario() {
        let mut buf = vec![0x02, 0xc0, 0xa8, 0x02, 0x4b, 0xc7, 0x13];
        rewrite_nat_discovery(&mut buf, Ipv4Addr::new(10, 20, 30, 40), 51003);
        assert_eq!(buf, vec![0x02, 0x28, 0x1e, 0x14, 0x0a, 0x3b, 0xc7]);
    }
}
