//! UDP flow engine, client side (spec §4.5).
//!
//! A single tunnel TCP connection multiplexes every UDP flow for this
//! client. `ConnectionId`s are allocated per `(src_ip, src_port, dst_ip,
//! dst_port)` tuple starting at 100 000; the handshake-response special case
//! (`ConnectionId == 0xFFFFFFFF`) is the game's own NAT-discovery reply and is
//! re-injected directly rather than looked up by tuple.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::flow::tcp::PacketInjector;
use crate::packet::{build_udp_datagram, IpIdCounter, UdpDatagramSpec};
use crate::protocol::{self, Frame, FrameReader, Handshake};
use crate::tunnel;

const MAX_RECONNECT_ATTEMPTS: u32 = 5;
const RECONNECT_SPACING: Duration = Duration::from_secs(3);
const BOOTSTRAP_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Identifies one client-side UDP flow by its four-tuple (spec §3, §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UdpFlowTuple {
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_ip: Ipv4Addr,
    pub dst_port: u16,
}

struct TunnelMaps {
    forward: HashMap<UdpFlowTuple, u32>,
    reverse: HashMap<u32, UdpFlowTuple>,
}

impl TunnelMaps {
    fn new() -> Self {
        TunnelMaps {
            forward: HashMap::new(),
            reverse: HashMap::new(),
        }
    }
}

/// Client-side UDP tunnel state (spec §3 `UdpClientState`).
pub struct UdpClientState {
    relay_host: String,
    relay_port: u16,
    client_ip: Ipv4Addr,
    game_server_ip: Ipv4Addr,
    injector: PacketInjector,
    tunnel_write: AsyncMutex<Option<Box<dyn tokio::io::AsyncWrite + Unpin + Send>>>,
    maps: SyncMutex<TunnelMaps>,
    next_conn_id: AtomicU32,
    connected: AtomicBool,
    ip_id: SyncMutex<IpIdCounter>,
}

impl UdpClientState {
    pub fn new(
        relay_host: String,
        relay_port: u16,
        client_ip: Ipv4Addr,
        game_server_ip: Ipv4Addr,
        injector: PacketInjector,
    ) -> Arc<Self> {
        Arc::new(UdpClientState {
            relay_host,
            relay_port,
            client_ip,
            game_server_ip,
            injector,
            tunnel_write: AsyncMutex::new(None),
            maps: SyncMutex::new(TunnelMaps::new()),
            next_conn_id: AtomicU32::new(protocol::FIRST_UDP_CONN_ID),
            connected: AtomicBool::new(false),
            ip_id: SyncMutex::new(IpIdCounter::new()),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Entry point for the diverter loop: frame and forward one diverted UDP
    /// datagram, bootstrapping the tunnel on first use.
    pub async fn send_datagram(
        self: &Arc<Self>,
        tuple: UdpFlowTuple,
        payload: &[u8],
    ) -> std::io::Result<()> {
        if !self.is_connected() {
            self.bootstrap().await?;
        }

        let conn_id = {
            let mut maps = self.maps.lock();
            if let Some(id) = maps.forward.get(&tuple) {
                *id
            } else {
                let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
                maps.forward.insert(tuple, id);
                maps.reverse.insert(id, tuple);
                id
            }
        };

        let frame = Frame::Udp {
            conn_id,
            src_port: tuple.src_port,
            dst_port: tuple.dst_port,
            payload: payload.to_vec(),
        };
        self.write_frame(&frame).await
    }

    /// Dials the relay, performs the UDP-bootstrap handshake (spec §4.5
    /// steps 1-4), spawns the reader task, and marks the tunnel connected.
    async fn bootstrap(self: &Arc<Self>) -> std::io::Result<()> {
        let stream = tunnel::dial(&self.relay_host, self.relay_port).await?;
        let (mut read_half, mut write_half) = tokio::io::split(stream);

        protocol::write_handshake(
            &mut write_half,
            Handshake {
                conn_id: protocol::UDP_BOOTSTRAP_CONN_ID,
                dst_port: protocol::UDP_BOOTSTRAP_PORT,
            },
        )
        .await?;
        write_half.write_all(&self.client_ip.octets()).await?;

        let mut echo = [0u8; Handshake::LEN];
        tokio::time::timeout(BOOTSTRAP_ACK_TIMEOUT, read_half.read_exact(&mut echo))
            .await
            .map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::TimedOut, "udp bootstrap ack timed out")
            })??;
        let echoed = Handshake::from_bytes(echo);
        if echoed.conn_id != protocol::UDP_BOOTSTRAP_CONN_ID {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "relay did not echo the udp bootstrap connection id",
            ));
        }

        *self.tunnel_write.lock().await = Some(Box::new(write_half));
        self.connected.store(true, Ordering::Release);
        info!(client_ip = %self.client_ip, "udp tunnel bootstrapped");

        let state = self.clone();
        tokio::spawn(async move {
            state.run_reader(Box::new(read_half)).await;
        });

        Ok(())
    }

    async fn write_frame(&self, frame: &Frame) -> std::io::Result<()> {
        let mut guard = self.tunnel_write.lock().await;
        match guard.as_mut() {
            Some(w) => {
                let bytes = frame.encode().map_err(|e| {
                    std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
                })?;
                w.write_all(&bytes).await
            }
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "udp tunnel not connected",
            )),
        }
    }

    async fn run_reader(self: Arc<Self>, mut read_half: Box<dyn tokio::io::AsyncRead + Unpin + Send>) {
        let mut reader = FrameReader::new(&mut read_half);
        let outcome = self.read_loop(&mut reader).await;
        self.connected.store(false, Ordering::Release);
        *self.tunnel_write.lock().await = None;
        warn!(error = ?outcome, "udp tunnel lost, attempting reconnect");

        // try_reconnect() re-bootstraps and spawns a fresh reader task for
        // the new connection on success; this task's job is done either way.
        if !self.try_reconnect().await {
            warn!("udp tunnel reconnect attempts exhausted, giving up");
        }
    }

    async fn read_loop(
        &self,
        reader: &mut FrameReader<&mut Box<dyn tokio::io::AsyncRead + Unpin + Send>>,
    ) -> std::io::Result<()> {
        loop {
            let frame = reader
                .read_frame(|_| true)
                .await
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
            match frame {
                Frame::Udp {
                    conn_id,
                    src_port,
                    dst_port,
                    payload,
                } => self.handle_inbound(conn_id, src_port, dst_port, &payload),
                Frame::Heartbeat { .. } => {
                    debug!("udp tunnel heartbeat");
                }
                Frame::Tcp { .. } => {
                    warn!("unexpected tcp frame on udp tunnel");
                }
            }
        }
    }

    fn handle_inbound(&self, conn_id: u32, src_port_field: u16, dst_port_field: u16, payload: &[u8]) {
        let (from_ip, from_port, to_ip, to_port) = if conn_id == protocol::UDP_BOOTSTRAP_CONN_ID {
            (self.game_server_ip, src_port_field, self.client_ip, dst_port_field)
        } else {
            let tuple = match self.maps.lock().reverse.get(&conn_id).copied() {
                Some(t) => t,
                None => {
                    warn!(conn_id, "udp frame for unknown connection id, dropping");
                    return;
                }
            };
            (tuple.dst_ip, tuple.dst_port, tuple.src_ip, tuple.src_port)
        };

        let ip_id = self.ip_id.lock().next();
        let spec = UdpDatagramSpec {
            src_ip: from_ip,
            dst_ip: to_ip,
            src_port: from_port,
            dst_port: to_port,
            ip_id,
            payload,
        };
        match build_udp_datagram(&spec) {
            Ok(bytes) => {
                let _ = self.injector.send(bytes);
            }
            Err(e) => warn!(error = %e, "failed to build synthesised udp datagram"),
        }
    }

    /// Reconnects with a bounded retry policy (≤5 attempts, 3 s spacing),
    /// clearing the flow-tuple maps on success.
    async fn try_reconnect(self: &Arc<Self>) -> bool {
        for attempt in 1..=MAX_RECONNECT_ATTEMPTS {
            sleep(RECONNECT_SPACING).await;
            match self.bootstrap().await {
                Ok(()) => {
                    let mut maps = self.maps.lock();
                    maps.forward.clear();
                    maps.reverse.clear();
                    info!(attempt, "udp tunnel reconnected");
                    return true;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "udp tunnel reconnect attempt failed");
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    fn tuple() -> UdpFlowTuple {
        UdpFlowTuple {
            src_ip: Ipv4Addr::new(10, 0, 0, 2),
            src_port: 5063,
            dst_ip: Ipv4Addr::new(1, 2, 3, 4),
            dst_port: 10011,
        }
    }

    #[test]
    fn conn_ids_start_at_one_hundred_thousand() {
        let (tx, _rx) = unbounded_channel();
        let state = UdpClientState::new(
            "127.0.0.1".into(),
            0,
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(1, 2, 3, 4),
            tx,
        );
        assert_eq!(
            state.next_conn_id.load(Ordering::Relaxed),
            protocol::FIRST_UDP_CONN_ID
        );
    }

    #[test]
    fn forward_lookup_is_stable_across_calls() {
        let (tx, _rx) = unbounded_channel();
        let state = UdpClientState::new(
            "127.0.0.1".into(),
            0,
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(1, 2, 3, 4),
            tx,
        );
        let id = state.next_conn_id.fetch_add(1, Ordering::Relaxed);
        state.maps.lock().forward.insert(tuple(), id);
        assert_eq!(state.maps.lock().forward.get(&tuple()).copied(), Some(id));
    }
}
