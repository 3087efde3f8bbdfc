//! Relay dispatcher (spec §4.9): accepts tunnel connections, parses the
//! handshake, and either enters UDP-multiplex mode, answers a liveness
//! probe, or drives one TCP flow's bidirectional forwarding.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::protocol::{self, Frame, FrameReader, Handshake};
use crate::relay::udp::RelayUdpState;
use crate::rewrite::rewrite_ipv4;
use crate::tunnel;

const GAME_TO_CLIENT_BUF: usize = 64 * 1024;

/// One logical relay server entry (spec §6 `servers[]`): a listen port bound
/// to a single upstream game server address.
pub struct RelayServer {
    pub name: String,
    pub listen_port: u16,
    pub game_server_ip: IpAddr,
    client_ips: SyncMutex<HashMap<IpAddr, Ipv4Addr>>,
    udp: Arc<RelayUdpState>,
}

impl RelayServer {
    pub fn new(name: String, listen_port: u16, game_server_ip: IpAddr) -> std::io::Result<Arc<Self>> {
        let proxy_local_ip = local_route_ipv4(SocketAddr::new(game_server_ip, 80))?;
        Ok(Arc::new(RelayServer {
            name,
            listen_port,
            game_server_ip,
            client_ips: SyncMutex::new(HashMap::new()),
            udp: RelayUdpState::new(proxy_local_ip, game_server_ip),
        }))
    }

    /// Binds this server's listen port. Split out from [`Self::serve`] so a
    /// caller reloading config can confirm the new listener came up before
    /// discarding the old one (spec §6 "a SIGHUP on the relay triggers
    /// config reload").
    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        let listener = TcpListener::bind(("::", self.listen_port)).await?;
        info!(server = %self.name, port = self.listen_port, "relay listening");
        Ok(listener)
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                server.handle_connection(stream, peer).await;
            });
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = tunnel::configure_relay_socket(&stream) {
            warn!(error = %e, %peer, "failed to tune tunnel socket");
        }
        let (mut read_half, mut write_half) = tokio::io::split(stream);
        let handshake = match protocol::read_handshake(&mut read_half).await {
            Ok(h) => h,
            Err(e) => {
                warn!(error = %e, %peer, "failed to read tunnel handshake");
                return;
            }
        };

        if handshake.is_udp_bootstrap() {
            self.handle_udp_bootstrap(read_half, write_half, peer).await;
        } else if handshake.is_liveness_probe() {
            debug!(%peer, "liveness probe, closing");
            let _ = write_half.shutdown().await;
        } else {
            self.handle_tcp_flow(handshake, read_half, write_half, peer)
                .await;
        }
    }

    async fn handle_udp_bootstrap<R, W>(self: Arc<Self>, mut read_half: R, mut write_half: W, peer: SocketAddr)
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
        W: tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let mut ip_bytes = [0u8; 4];
        if let Err(e) = read_half.read_exact(&mut ip_bytes).await {
            warn!(error = %e, %peer, "failed to read udp bootstrap client ip");
            return;
        }
        let client_real_ipv4 = Ipv4Addr::from(ip_bytes);
        self.client_ips.lock().insert(peer.ip(), client_real_ipv4);

        let echo = Handshake {
            conn_id: protocol::UDP_BOOTSTRAP_CONN_ID,
            dst_port: protocol::UDP_BOOTSTRAP_PORT,
        };
        if let Err(e) = protocol::write_handshake(&mut write_half, echo).await {
            warn!(error = %e, %peer, "failed to echo udp bootstrap handshake");
            return;
        }
        info!(%peer, %client_real_ipv4, "udp tunnel bootstrapped");

        let tunnel_write = Arc::new(AsyncMutex::new(write_half));
        let mut reader = FrameReader::new(read_half);
        loop {
            match reader.read_frame(|_| true).await {
                Ok(Frame::Udp {
                    conn_id,
                    src_port,
                    dst_port,
                    payload,
                }) => {
                    self.udp
                        .handle_outbound(
                            peer,
                            client_real_ipv4,
                            conn_id,
                            src_port,
                            dst_port,
                            &payload,
                            tunnel_write.clone(),
                        )
                        .await;
                }
                Ok(Frame::Heartbeat { conn_id }) => {
                    let bytes = Frame::Heartbeat { conn_id }.encode().unwrap_or_default();
                    let mut w = tunnel_write.lock().await;
                    if w.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
                Ok(Frame::Tcp { .. }) => {
                    warn!(%peer, "unexpected tcp frame on udp-bootstrapped tunnel");
                }
                Err(e) => {
                    info!(error = %e, %peer, "udp tunnel closed");
                    break;
                }
            }
        }
        self.udp.shutdown_peer(peer);
        self.client_ips.lock().remove(&peer.ip());
    }

    async fn handle_tcp_flow<R, W>(
        self: Arc<Self>,
        handshake: Handshake,
        read_half: R,
        write_half: W,
        peer: SocketAddr,
    ) where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
        W: tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let upstream_addr = SocketAddr::new(self.game_server_ip, handshake.dst_port);
        let upstream = match TcpStream::connect(upstream_addr).await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, %upstream_addr, %peer, "failed to connect to upstream game server");
                return;
            }
        };
        if let Err(e) = tunnel::configure_relay_socket(&upstream) {
            warn!(error = %e, %upstream_addr, "failed to tune upstream socket");
        }

        let proxy_local_ip = match local_route_ipv4(upstream_addr) {
            Ok(ip) => ip,
            Err(e) => {
                warn!(error = %e, "failed to determine proxy local ip, rewriting will be skipped");
                Ipv4Addr::UNSPECIFIED
            }
        };
        let client_real_ipv4 = self.client_ips.lock().get(&peer.ip()).copied();

        let (upstream_read, upstream_write) = upstream.into_split();
        let upstream_write = Arc::new(AsyncMutex::new(upstream_write));
        let conn_id = handshake.conn_id;

        let client_to_game = tokio::spawn(Self::forward_client_to_game(
            read_half,
            upstream_write.clone(),
            conn_id,
            client_real_ipv4,
            proxy_local_ip,
        ));
        let game_to_client = tokio::spawn(Self::forward_game_to_client(
            upstream_read,
            upstream_write,
            write_half,
            conn_id,
            client_real_ipv4,
            proxy_local_ip,
        ));

        let _ = tokio::join!(client_to_game, game_to_client);
        debug!(%peer, conn_id, "tcp flow forwarders finished");
    }

    async fn forward_client_to_game<R>(
        read_half: R,
        upstream_write: Arc<AsyncMutex<tokio::net::tcp::OwnedWriteHalf>>,
        conn_id: u32,
        client_real_ipv4: Option<Ipv4Addr>,
        proxy_local_ip: Ipv4Addr,
    ) where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let mut reader = FrameReader::new(read_half);
        loop {
            match reader.read_frame(|id| id == conn_id).await {
                Ok(Frame::Tcp { payload, .. }) => {
                    let mut payload = payload;
                    if let Some(client_ip) = client_real_ipv4 {
                        rewrite_ipv4(&mut payload, client_ip, proxy_local_ip);
                    }
                    if upstream_write.lock().await.write_all(&payload).await.is_err() {
                        break;
                    }
                }
                Ok(Frame::Heartbeat { .. }) => {
                    // Heartbeat replies are handled by the UDP-style reader
                    // loop's own tunnel; for a plain TCP flow the relay has no
                    // separate write half of the tunnel available here, so a
                    // missing reply is tolerated per spec §4.4 (the flow's
                    // recv timeout is the real liveness signal).
                }
                Ok(Frame::Udp { .. }) => {
                    warn!(conn_id, "unexpected udp frame on tcp flow tunnel");
                }
                Err(e) => {
                    debug!(error = %e, conn_id, "client-to-game forwarder stopping");
                    break;
                }
            }
        }
        let _ = upstream_write.lock().await.shutdown().await;
    }

    async fn forward_game_to_client<W>(
        mut upstream_read: tokio::net::tcp::OwnedReadHalf,
        upstream_write: Arc<AsyncMutex<tokio::net::tcp::OwnedWriteHalf>>,
        mut tunnel_write: W,
        conn_id: u32,
        client_real_ipv4: Option<Ipv4Addr>,
        proxy_local_ip: Ipv4Addr,
    ) where
        W: tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let mut buf = vec![0u8; GAME_TO_CLIENT_BUF];
        loop {
            let n = match upstream_read.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!(error = %e, conn_id, "game-to-client forwarder stopping");
                    break;
                }
            };
            let mut payload = buf[..n].to_vec();
            if let Some(client_ip) = client_real_ipv4 {
                rewrite_ipv4(&mut payload, proxy_local_ip, client_ip);
            }
            let mut send_failed = false;
            for frame in protocol::split_tcp_frames(conn_id, &payload) {
                match frame.encode() {
                    Ok(bytes) => {
                        if tunnel_write.write_all(&bytes).await.is_err() {
                            send_failed = true;
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, conn_id, "failed to encode tcp frame for tunnel"),
                }
            }
            if send_failed {
                break;
            }
        }
        // Shut down upstream first so forward_client_to_game's next write
        // fails and it exits too, then close the tunnel side.
        let _ = upstream_write.lock().await.shutdown().await;
        let _ = tunnel_write.shutdown().await;
    }
}

/// The address the OS would use to reach `target`, found via the classic
/// unconnected-UDP-socket trick (spec §4.9 `proxy_local_ip`): no packets are
/// sent, but `connect` selects a route and `local_addr` reveals which local
/// interface/address the kernel picked.
fn local_route_ipv4(target: SocketAddr) -> std::io::Result<Ipv4Addr> {
    let probe = std::net::UdpSocket::bind(("0.0.0.0", 0))?;
    probe.connect(target)?;
    match probe.local_addr()?.ip() {
        IpAddr::V4(ip) => Ok(ip),
        IpAddr::V6(_) => Ok(Ipv4Addr::UNSPECIFIED),
    }
}
