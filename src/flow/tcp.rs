//! TCP flow engine (client side, spec §4.4) and flow table (§4.3).

use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex as SyncMutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::packet::{build_tcp_segment, IpIdCounter, TcpFlags, TcpSegmentSpec};
use crate::protocol::{self, Frame, FrameReader};
use crate::tunnel;

/// Initial synthesised server-side sequence number (spec §3).
pub const INITIAL_SERVER_SEQ: u32 = 12345;
/// Window advertised in the synthesised SYN-ACK only (spec §3).
pub const ADVERTISED_WINDOW: u16 = 65535;
const MAX_SEGMENT_SIZE: usize = 1460;
const WINDOW_PROBE_INTERVAL: Duration = Duration::from_secs(1);
const ZERO_WINDOW_WARN_AFTER: Duration = Duration::from_secs(30);
const FIN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const POST_FIN_GRACE: Duration = Duration::from_secs(2);
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

pub type PacketInjector = tokio::sync::mpsc::UnboundedSender<Vec<u8>>;

/// Identifies one TCP conversation on the client side (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub client_ip: Ipv4Addr,
    pub client_port: u16,
    pub server_port: u16,
}

struct SeqState {
    server_seq: u32,
    server_ack: u32,
    client_acked_seq: u32,
    client_window: u16,
    data_window: u16,
}

/// A dynamically-dispatched tunnel half, so tests can substitute an in-memory
/// `tokio::io::duplex` pair for a real `TcpStream` without changing the engine.
pub type TunnelReadHalf = Box<dyn AsyncRead + Unpin + Send>;
pub type TunnelWriteHalf = Box<dyn AsyncWrite + Unpin + Send>;

pub struct TcpFlow {
    pub key: FlowKey,
    pub conn_id: u32,
    game_server_ip: Ipv4Addr,
    injector: PacketInjector,
    seq: SyncMutex<SeqState>,
    buffer: SyncMutex<VecDeque<u8>>,
    ip_id: SyncMutex<IpIdCounter>,
    established: AtomicBool,
    closing: AtomicBool,
    running: AtomicBool,
    last_window_probe: SyncMutex<Option<Instant>>,
    window_zero_start: SyncMutex<Option<Instant>>,
    zero_window_warned: AtomicBool,
    tunnel_write: AsyncMutex<Option<TunnelWriteHalf>>,
}

impl TcpFlow {
    fn new(
        key: FlowKey,
        conn_id: u32,
        game_server_ip: Ipv4Addr,
        injector: PacketInjector,
    ) -> Arc<Self> {
        Arc::new(TcpFlow {
            key,
            conn_id,
            game_server_ip,
            injector,
            seq: SyncMutex::new(SeqState {
                server_seq: INITIAL_SERVER_SEQ,
                server_ack: 0,
                client_acked_seq: INITIAL_SERVER_SEQ,
                client_window: 65535,
                data_window: 65535,
            }),
            buffer: SyncMutex::new(VecDeque::new()),
            ip_id: SyncMutex::new(IpIdCounter::new()),
            established: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            running: AtomicBool::new(false),
            last_window_probe: SyncMutex::new(None),
            window_zero_start: SyncMutex::new(None),
            zero_window_warned: AtomicBool::new(false),
            tunnel_write: AsyncMutex::new(None),
        })
    }

    pub fn is_established(&self) -> bool {
        self.established.load(Ordering::Acquire)
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// For tests/observation: current `(server_seq, server_ack, client_acked_seq)`.
    pub fn seq_snapshot(&self) -> (u32, u32, u32) {
        let s = self.seq.lock();
        (s.server_seq, s.server_ack, s.client_acked_seq)
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Opens a tunnel connection to the relay, performs the TCP flow handshake
    /// on it, and emits the synthesised SYN-ACK. Spawns the tunnel reader and
    /// heartbeat task and returns the new, running flow.
    pub async fn on_syn(
        key: FlowKey,
        conn_id: u32,
        game_server_ip: Ipv4Addr,
        client_seq: u32,
        relay_host: &str,
        relay_port: u16,
        injector: PacketInjector,
    ) -> std::io::Result<Arc<Self>> {
        let stream = tunnel::dial(relay_host, relay_port).await?;
        let (read_half, write_half) = tokio::io::split(stream);
        Self::start_on_tunnel(
            key,
            conn_id,
            game_server_ip,
            client_seq,
            Box::new(read_half),
            Box::new(write_half),
            injector,
        )
        .await
    }

    /// Test/embedding seam: build a flow already wired to an open tunnel
    /// (read half, write half), performing the handshake write and the
    /// synthesised SYN-ACK emission, without dialing a real relay socket.
    pub async fn start_on_tunnel(
        key: FlowKey,
        conn_id: u32,
        game_server_ip: Ipv4Addr,
        client_seq: u32,
        mut read_half: TunnelReadHalf,
        mut write_half: TunnelWriteHalf,
        injector: PacketInjector,
    ) -> std::io::Result<Arc<Self>> {
        let flow = Self::new(key, conn_id, game_server_ip, injector);
        {
            let mut s = flow.seq.lock();
            s.server_ack = client_seq.wrapping_add(1);
            s.server_seq = INITIAL_SERVER_SEQ;
        }

        protocol::write_handshake(
            &mut write_half,
            protocol::Handshake {
                conn_id,
                dst_port: key.server_port,
            },
        )
        .await?;

        flow.emit_segment(TcpFlags::syn_ack(), &[]);
        {
            let mut s = flow.seq.lock();
            s.server_seq = s.server_seq.wrapping_add(1);
        }

        *flow.tunnel_write.lock().await = Some(write_half);
        flow.running.store(true, Ordering::Release);

        let reader_flow = flow.clone();
        tokio::spawn(async move {
            reader_flow.run_tunnel_reader(&mut read_half).await;
        });

        info!(conn_id, ?key, "tcp flow started");
        Ok(flow)
    }

    /// `on_ack` (spec §4.4) for an empty-payload ACK segment.
    pub fn on_ack(&self, ack: u32) {
        let became_established = {
            let mut s = self.seq.lock();
            if !self.established.load(Ordering::Acquire) && ack == s.server_seq {
                s.client_acked_seq = ack;
                true
            } else {
                if ack > s.client_acked_seq {
                    s.client_acked_seq = ack;
                }
                false
            }
        };
        if became_established {
            self.established.store(true, Ordering::Release);
            debug!(conn_id = self.conn_id, "flow established");
        }
        self.drain_buffer();
    }

    /// `on_data` (spec §4.4). Forwards payload to the tunnel and ACKs locally.
    pub async fn on_data(&self, seq: u32, ack: u32, payload: &[u8]) {
        if !self.established.load(Ordering::Acquire) {
            warn!(conn_id = self.conn_id, "data on unestablished flow, dropping");
            return;
        }
        {
            let mut s = self.seq.lock();
            if ack > s.client_acked_seq {
                s.client_acked_seq = ack;
            }
            s.server_ack = seq.wrapping_add(payload.len() as u32);
        }

        if let Err(e) = self.write_tunnel_frame(Frame::Tcp {
            conn_id: self.conn_id,
            payload: payload.to_vec(),
        })
        .await
        {
            warn!(conn_id = self.conn_id, error = %e, "failed to forward payload to tunnel");
        }

        self.emit_segment(TcpFlags::ack_only(), &[]);
    }

    /// `on_fin` (spec §4.4).
    pub async fn on_fin(&self, seq: u32) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let mut s = self.seq.lock();
            s.server_ack = seq.wrapping_add(1);
        }

        let deadline = Instant::now() + FIN_DRAIN_TIMEOUT;
        while self.buffered_len() > 0 && Instant::now() < deadline {
            self.drain_buffer();
            sleep(Duration::from_millis(20)).await;
        }

        if let Some(mut w) = self.tunnel_write.lock().await.take() {
            let _ = w.shutdown().await;
        }

        self.emit_segment(TcpFlags::fin_ack(), &[]);
        {
            let mut s = self.seq.lock();
            s.server_seq = s.server_seq.wrapping_add(1);
        }
        info!(conn_id = self.conn_id, "flow closing (fin)");

        // Grace period before the flow is torn down, so a game client that is
        // slow to process the FIN (or retransmits its own FIN) is not met
        // with an already-removed flow.
        sleep(POST_FIN_GRACE).await;
        self.running.store(false, Ordering::Release);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// `update_window` (spec §4.4).
    pub fn update_window(&self, window: u16) {
        let opened_from_zero = {
            let mut s = self.seq.lock();
            let opened = s.client_window == 0 && window > 0;
            s.client_window = window;
            s.data_window = window;
            opened
        };
        if opened_from_zero && self.buffered_len() > 0 {
            self.drain_buffer();
        }
    }

    /// Appends tunnel-origin bytes to the outbound buffer and attempts a drain.
    fn enqueue_outbound(&self, data: &[u8]) {
        self.buffer.lock().extend(data);
        self.drain_buffer();
    }

    /// Outbound data policy (spec §4.4 "drain-buffer").
    fn drain_buffer(&self) {
        loop {
            let (in_flight, client_window, closing) = {
                let s = self.seq.lock();
                (
                    s.server_seq.wrapping_sub(s.client_acked_seq),
                    s.client_window,
                    self.closing.load(Ordering::Acquire),
                )
            };
            let window_available = (client_window as u32).saturating_sub(in_flight);

            if window_available == 0 {
                let mut buf_empty = self.buffer.lock().is_empty();
                if buf_empty || closing {
                    return;
                }
                let now = Instant::now();
                let mut zero_start = self.window_zero_start.lock();
                let started = *zero_start.get_or_insert(now);
                drop(zero_start);

                if now.duration_since(started) >= ZERO_WINDOW_WARN_AFTER
                    && !self.zero_window_warned.swap(true, Ordering::AcqRel)
                {
                    warn!(conn_id = self.conn_id, "zero window for 30s, client not draining");
                }

                let mut last_probe = self.last_window_probe.lock();
                let should_probe = last_probe
                    .map(|t| now.duration_since(t) >= WINDOW_PROBE_INTERVAL)
                    .unwrap_or(true);
                if should_probe {
                    *last_probe = Some(now);
                    drop(last_probe);
                    let first_byte = {
                        let buf = self.buffer.lock();
                        buf_empty = buf.is_empty();
                        buf.front().copied()
                    };
                    if let Some(b) = first_byte {
                        self.emit_segment(TcpFlags::psh_ack(), &[b]);
                    }
                }
                return;
            }

            self.window_zero_start.lock().take();
            self.zero_window_warned.store(false, Ordering::Release);

            let chunk = {
                let mut buf = self.buffer.lock();
                if buf.is_empty() {
                    return;
                }
                let n = (window_available as usize)
                    .min(MAX_SEGMENT_SIZE)
                    .min(buf.len());
                let chunk: Vec<u8> = buf.drain(..n).collect();
                chunk
            };
            if chunk.is_empty() {
                return;
            }
            let seq_for_segment = {
                let mut s = self.seq.lock();
                let seq_now = s.server_seq;
                s.server_seq = s.server_seq.wrapping_add(chunk.len() as u32);
                seq_now
            };
            self.emit_segment_at(TcpFlags::psh_ack(), &chunk, seq_for_segment);
        }
    }

    fn emit_segment(&self, flags: TcpFlags, payload: &[u8]) {
        let seq = self.seq.lock().server_seq;
        self.emit_segment_at(flags, payload, seq);
    }

    fn emit_segment_at(&self, flags: TcpFlags, payload: &[u8], seq: u32) {
        let (ack, window) = {
            let s = self.seq.lock();
            (
                s.server_ack,
                if flags.syn {
                    ADVERTISED_WINDOW
                } else {
                    s.data_window
                },
            )
        };
        let ip_id = self.ip_id.lock().next();
        let spec = TcpSegmentSpec {
            src_ip: self.game_server_ip,
            dst_ip: self.key.client_ip,
            src_port: self.key.server_port,
            dst_port: self.key.client_port,
            seq,
            ack,
            window,
            flags,
            ip_id,
            payload,
        };
        match build_tcp_segment(&spec) {
            Ok(bytes) => {
                let _ = self.injector.send(bytes);
            }
            Err(e) => warn!(conn_id = self.conn_id, error = %e, "failed to build synthesised segment"),
        }
    }

    async fn write_tunnel_frame(&self, frame: Frame) -> std::io::Result<()> {
        let mut guard = self.tunnel_write.lock().await;
        if let Some(w) = guard.as_mut() {
            let bytes = frame
                .encode()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
            w.write_all(&bytes).await?;
        }
        Ok(())
    }

    async fn run_tunnel_reader(self: Arc<Self>, read_half: &mut TunnelReadHalf) {
        let mut reader = FrameReader::new(&mut *read_half);
        let mut heartbeat_tick = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat_tick.tick().await; // first tick fires immediately

        loop {
            if !self.is_running() && self.buffered_len() == 0 {
                break;
            }
            tokio::select! {
                _ = heartbeat_tick.tick() => {
                    let _ = self.write_tunnel_frame(Frame::Heartbeat { conn_id: self.conn_id }).await;
                }
                frame = tokio::time::timeout(
                    tunnel::INITIAL_RECV_TIMEOUT,
                    reader.read_frame(|id| id == self.conn_id),
                ) => {
                    match frame {
                        Ok(Ok(Frame::Tcp { payload, .. })) => {
                            self.enqueue_outbound(&payload);
                        }
                        Ok(Ok(Frame::Heartbeat { .. })) => {
                            debug!(conn_id = self.conn_id, "heartbeat reply received");
                        }
                        Ok(Ok(Frame::Udp { .. })) => {
                            warn!(conn_id = self.conn_id, "unexpected UDP frame on TCP tunnel");
                        }
                        Ok(Err(e)) => {
                            info!(conn_id = self.conn_id, error = %e, "tunnel closed or desynchronised");
                            break;
                        }
                        Err(_elapsed) => {
                            // bounded periodic wake, loop to re-check running/heartbeat.
                            continue;
                        }
                    }
                }
            }
        }
        self.running.store(false, Ordering::Release);
    }
}

/// Flow table (spec §4.3): keyed lookup/insertion serialised by one lock held
/// only for the table operation itself.
pub struct FlowTable {
    flows: SyncMutex<HashMap<FlowKey, Arc<TcpFlow>>>,
    next_conn_id: AtomicU32,
}

impl FlowTable {
    pub fn new() -> Self {
        FlowTable {
            flows: SyncMutex::new(HashMap::new()),
            next_conn_id: AtomicU32::new(protocol::FIRST_TCP_CONN_ID),
        }
    }

    pub fn alloc_conn_id(&self) -> u32 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Inserts `flow`, returning and replacing any prior flow on the same key
    /// (spec §4.3: "reception of a new SYN for an existing key removes the
    /// prior flow"). The caller is responsible for stopping the returned flow.
    pub fn insert_replacing(&self, key: FlowKey, flow: Arc<TcpFlow>) -> Option<Arc<TcpFlow>> {
        self.flows.lock().insert(key, flow)
    }

    pub fn get(&self, key: &FlowKey) -> Option<Arc<TcpFlow>> {
        self.flows.lock().get(key).cloned()
    }

    pub fn remove(&self, key: &FlowKey) -> Option<Arc<TcpFlow>> {
        self.flows.lock().remove(key)
    }
}

impl Default for FlowTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use etherparse::{Ipv4Header, TcpHeader};
    use tokio::sync::mpsc::unbounded_channel;

    fn test_key() -> FlowKey {
        FlowKey {
            client_ip: Ipv4Addr::new(10, 0, 0, 2),
            client_port: 54321,
            server_port: 10011,
        }
    }

    async fn start_test_flow() -> (Arc<TcpFlow>, tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>, tokio::io::DuplexStream) {
        let (tunnel_side, flow_side) = tokio::io::duplex(65536);
        let (flow_read, flow_write) = tokio::io::split(flow_side);
        let (inj_tx, inj_rx) = unbounded_channel();

        let flow = TcpFlow::start_on_tunnel(
            test_key(),
            1,
            Ipv4Addr::new(1, 2, 3, 4),
            1000,
            Box::new(flow_read),
            Box::new(flow_write),
            inj_tx,
        )
        .await
        .unwrap();

        (flow, inj_rx, tunnel_side)
    }

    #[tokio::test]
    async fn syn_emits_synthesised_syn_ack_per_spec_scenario() {
        let (_flow, mut inj_rx, mut tunnel_side) = start_test_flow().await;

        // Handshake bytes (6) should have been written to the tunnel first.
        use tokio::io::AsyncReadExt;
        let mut handshake = [0u8; 6];
        tunnel_side.read_exact(&mut handshake).await.unwrap();
        assert_eq!(&handshake[0..4], &1u32.to_be_bytes());
        assert_eq!(&handshake[4..6], &10011u16.to_be_bytes());

        let packet = inj_rx.recv().await.unwrap();
        let (ip, rest) = Ipv4Header::from_slice(&packet).unwrap();
        let (tcp, _payload) = TcpHeader::from_slice(rest).unwrap();
        assert_eq!(ip.source, [1, 2, 3, 4]);
        assert_eq!(ip.destination, [10, 0, 0, 2]);
        assert_eq!(tcp.source_port, 10011);
        assert_eq!(tcp.destination_port, 54321);
        assert_eq!(tcp.sequence_number, INITIAL_SERVER_SEQ);
        assert_eq!(tcp.acknowledgment_number, 1001);
        assert_eq!(tcp.window_size, ADVERTISED_WINDOW);
        assert!(tcp.syn && tcp.ack);
    }

    #[tokio::test]
    async fn ack_establishes_flow_when_ack_matches_server_seq() {
        let (flow, _inj_rx, _tunnel_side) = start_test_flow().await;
        assert!(!flow.is_established());
        flow.on_ack(INITIAL_SERVER_SEQ + 1);
        assert!(flow.is_established());
        let (server_seq, _, client_acked) = flow.seq_snapshot();
        assert_eq!(server_seq, INITIAL_SERVER_SEQ + 1);
        assert_eq!(client_acked, INITIAL_SERVER_SEQ + 1);
    }

    #[tokio::test]
    async fn data_forwards_to_tunnel_and_acks_locally() {
        let (flow, mut inj_rx, mut tunnel_side) = start_test_flow().await;
        use tokio::io::AsyncReadExt;
        let mut handshake = [0u8; 6];
        tunnel_side.read_exact(&mut handshake).await.unwrap();
        let _syn_ack = inj_rx.recv().await.unwrap();

        flow.on_ack(INITIAL_SERVER_SEQ + 1);
        flow.on_data(1001, INITIAL_SERVER_SEQ + 1, b"hello").await;

        let mut frame_header = [0u8; 7];
        tunnel_side.read_exact(&mut frame_header).await.unwrap();
        assert_eq!(frame_header[0], 0x01);
        assert_eq!(&frame_header[1..5], &1u32.to_be_bytes());
        let len = u16::from_be_bytes([frame_header[5], frame_header[6]]);
        assert_eq!(len, 5);
        let mut payload = [0u8; 5];
        tunnel_side.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, b"hello");

        let ack_packet = inj_rx.recv().await.unwrap();
        let (_ip, rest) = Ipv4Header::from_slice(&ack_packet).unwrap();
        let (tcp, payload) = TcpHeader::from_slice(rest).unwrap();
        assert!(payload.is_empty());
        assert_eq!(tcp.acknowledgment_number, 1006);
        assert!(tcp.ack && !tcp.syn);
    }

    #[tokio::test]
    async fn window_zero_with_buffered_data_emits_one_byte_probe() {
        let (flow, mut inj_rx, mut tunnel_side) = start_test_flow().await;
        use tokio::io::AsyncWriteExt as _;
        let _ = inj_rx.recv().await.unwrap(); // SYN-ACK

        flow.on_ack(INITIAL_SERVER_SEQ + 1);

        // Peer advertises a zero window.
        flow.update_window(0);

        // Tunnel delivers 100 bytes that must be buffered, not sent.
        let frame = Frame::Tcp {
            conn_id: 1,
            payload: vec![0xAB; 100],
        };
        tunnel_side.write_all(&frame.encode().unwrap()).await.unwrap();

        let probe = tokio::time::timeout(Duration::from_secs(2), inj_rx.recv())
            .await
            .expect("probe should be emitted within 2s")
            .unwrap();
        let (_ip, rest) = Ipv4Header::from_slice(&probe).unwrap();
        let (tcp, payload) = TcpHeader::from_slice(rest).unwrap();
        assert_eq!(payload.len(), 1);
        assert_eq!(payload[0], 0xAB);
        assert!(tcp.psh && tcp.ack);
        assert_eq!(tcp.sequence_number, INITIAL_SERVER_SEQ + 1); // unchanged, probe does not advance seq
    }

    #[test]
    fn flow_table_replaces_prior_flow_on_same_key() {
        let table = FlowTable::new();
        let key = test_key();
        let (tx, _rx) = unbounded_channel();
        let flow_a = TcpFlow::new(key, table.alloc_conn_id(), Ipv4Addr::new(1, 2, 3, 4), tx.clone());
        let flow_b = TcpFlow::new(key, table.alloc_conn_id(), Ipv4Addr::new(1, 2, 3, 4), tx);
        assert!(table.insert_replacing(key, flow_a.clone()).is_none());
        let replaced = table.insert_replacing(key, flow_b.clone());
        assert!(Arc::ptr_eq(&replaced.unwrap(), &flow_a));
        assert!(Arc::ptr_eq(&table.get(&key).unwrap(), &flow_b));
    }

    #[test]
    fn conn_ids_start_at_one_and_increment() {
        let table = FlowTable::new();
        assert_eq!(table.alloc_conn_id(), 1);
        assert_eq!(table.alloc_conn_id(), 2);
    }
}
