//! The tunnel framing protocol between the client and the relay (spec §4.7).
//!
//! Every message after the initial 6-byte handshake starts with a type byte.
//! All multi-byte integers are big-endian.

use std::collections::VecDeque;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

use crate::error::ProtocolError;

/// Reserved `ConnectionId` marking a UDP tunnel-bootstrap handshake.
pub const UDP_BOOTSTRAP_CONN_ID: u32 = 0xFFFF_FFFF;
/// Reserved `ConnectionId` for the startup liveness probe (paired with port 65535).
pub const LIVENESS_PROBE_CONN_ID: u32 = 0;
/// The fixed destination port carried in the UDP bootstrap handshake.
pub const UDP_BOOTSTRAP_PORT: u16 = 10011;
/// The destination port that, paired with `LIVENESS_PROBE_CONN_ID`, marks a liveness probe.
pub const LIVENESS_PROBE_PORT: u16 = 65535;

const TYPE_TCP: u8 = 0x01;
const TYPE_HEARTBEAT: u8 = 0x02;
const TYPE_UDP: u8 = 0x03;

/// First `ConnectionId` handed out for TCP flows.
pub const FIRST_TCP_CONN_ID: u32 = 1;
/// First `ConnectionId` handed out for UDP flows.
pub const FIRST_UDP_CONN_ID: u32 = 100_000;

/// The 6-byte message that opens every fresh tunnel connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub conn_id: u32,
    pub dst_port: u16,
}

impl Handshake {
    pub const LEN: usize = 6;

    pub fn is_udp_bootstrap(&self) -> bool {
        self.conn_id == UDP_BOOTSTRAP_CONN_ID
    }

    pub fn is_liveness_probe(&self) -> bool {
        self.conn_id == LIVENESS_PROBE_CONN_ID && self.dst_port == LIVENESS_PROBE_PORT
    }

    pub fn to_bytes(self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[0..4].copy_from_slice(&self.conn_id.to_be_bytes());
        buf[4..6].copy_from_slice(&self.dst_port.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: [u8; Self::LEN]) -> Self {
        Handshake {
            conn_id: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            dst_port: u16::from_be_bytes([buf[4], buf[5]]),
        }
    }
}

pub async fn write_handshake<W: AsyncWrite + Unpin>(
    w: &mut W,
    h: Handshake,
) -> std::io::Result<()> {
    w.write_all(&h.to_bytes()).await
}

pub async fn read_handshake<R: AsyncRead + Unpin>(r: &mut R) -> Result<Handshake, ProtocolError> {
    let mut buf = [0u8; Handshake::LEN];
    r.read_exact(&mut buf)
        .await
        .map_err(ProtocolError::Handshake)?;
    Ok(Handshake::from_bytes(buf))
}

/// A parsed tunnel message following the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Tcp {
        conn_id: u32,
        payload: Vec<u8>,
    },
    Heartbeat {
        conn_id: u32,
    },
    Udp {
        conn_id: u32,
        src_port: u16,
        dst_port: u16,
        payload: Vec<u8>,
    },
}

impl Frame {
    pub fn conn_id(&self) -> u32 {
        match self {
            Frame::Tcp { conn_id, .. } => *conn_id,
            Frame::Heartbeat { conn_id } => *conn_id,
            Frame::Udp { conn_id, .. } => *conn_id,
        }
    }

    /// Serialize this frame onto the wire. Payloads longer than `u16::MAX` are
    /// rejected here; callers that read more than that from a single source in
    /// one call (the relay's game-to-client forwarder) must split before calling
    /// (see [`split_tcp_frames`]).
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        match self {
            Frame::Tcp { conn_id, payload } => encode_tcp(*conn_id, payload),
            Frame::Heartbeat { conn_id } => Ok(encode_heartbeat(*conn_id)),
            Frame::Udp {
                conn_id,
                src_port,
                dst_port,
                payload,
            } => encode_udp(*conn_id, *src_port, *dst_port, payload),
        }
    }
}

fn encode_tcp(conn_id: u32, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if payload.len() > u16::MAX as usize {
        return Err(ProtocolError::PayloadTooLarge(payload.len()));
    }
    let mut buf = Vec::with_capacity(1 + 4 + 2 + payload.len());
    buf.push(TYPE_TCP);
    buf.extend_from_slice(&conn_id.to_be_bytes());
    buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

fn encode_heartbeat(conn_id: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(7);
    buf.push(TYPE_HEARTBEAT);
    buf.extend_from_slice(&conn_id.to_be_bytes());
    buf.extend_from_slice(&0u16.to_be_bytes());
    buf
}

fn encode_udp(
    conn_id: u32,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Result<Vec<u8>, ProtocolError> {
    if payload.len() > u16::MAX as usize {
        return Err(ProtocolError::PayloadTooLarge(payload.len()));
    }
    let mut buf = Vec::with_capacity(1 + 4 + 2 + 2 + 2 + payload.len());
    buf.push(TYPE_UDP);
    buf.extend_from_slice(&conn_id.to_be_bytes());
    buf.extend_from_slice(&src_port.to_be_bytes());
    buf.extend_from_slice(&dst_port.to_be_bytes());
    buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    frame: &Frame,
) -> Result<(), ProtocolError> {
    let bytes = frame.encode()?;
    w.write_all(&bytes).await.map_err(ProtocolError::Handshake)?;
    Ok(())
}

/// Splits raw bytes larger than the wire's `u16` length field into one or more
/// `0x01` TCP frames, per spec §4.7 ("a relay that reads more than that from the
/// game server in one call must emit two `0x01` messages").
pub fn split_tcp_frames(conn_id: u32, payload: &[u8]) -> Vec<Frame> {
    payload
        .chunks(u16::MAX as usize)
        .map(|chunk| Frame::Tcp {
            conn_id,
            payload: chunk.to_vec(),
        })
        .collect()
}

/// Byte-resynchronizing frame reader.
///
/// Reads are buffered internally so that, per spec §4.7's resynchronisation rule,
/// a frame whose embedded `ConnectionId` fails the caller's validity predicate
/// causes the reader to drop a single byte and retry parsing from the next
/// offset, rather than treating the stream as unrecoverably desynchronised.
pub struct FrameReader<R> {
    inner: R,
    buf: VecDeque<u8>,
    desync_count: u64,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        FrameReader {
            inner,
            buf: VecDeque::new(),
            desync_count: 0,
        }
    }

    async fn fill(&mut self, want: usize) -> Result<(), ProtocolError> {
        let mut chunk = [0u8; 4096];
        while self.buf.len() < want {
            let n = self
                .inner
                .read(&mut chunk)
                .await
                .map_err(ProtocolError::Handshake)?;
            if n == 0 {
                return Err(ProtocolError::ShortRead);
            }
            self.buf.extend(&chunk[..n]);
        }
        Ok(())
    }

    fn peek(&self, i: usize) -> Option<u8> {
        self.buf.get(i).copied()
    }

    /// Read one frame, accepting it only if `is_valid_conn_id` returns true for
    /// its embedded `ConnectionId` (pass `|_| true` to accept any id).
    pub async fn read_frame(
        &mut self,
        is_valid_conn_id: impl Fn(u32) -> bool,
    ) -> Result<Frame, ProtocolError> {
        loop {
            self.fill(1).await?;
            let type_byte = self.peek(0).unwrap();
            let header_len = match type_byte {
                TYPE_TCP => 1 + 4 + 2,
                TYPE_HEARTBEAT => 1 + 4 + 2,
                TYPE_UDP => 1 + 4 + 2 + 2 + 2,
                _other => {
                    self.resync(1);
                    continue;
                }
            };
            self.fill(header_len).await?;
            let conn_id = u32::from_be_bytes([
                self.peek(1).unwrap(),
                self.peek(2).unwrap(),
                self.peek(3).unwrap(),
                self.peek(4).unwrap(),
            ]);

            if !is_valid_conn_id(conn_id) {
                self.resync(1);
                continue;
            }

            match type_byte {
                TYPE_TCP => {
                    let len = u16::from_be_bytes([self.peek(5).unwrap(), self.peek(6).unwrap()])
                        as usize;
                    self.fill(header_len + len).await?;
                    self.drain(header_len);
                    let payload = self.take(len);
                    return Ok(Frame::Tcp { conn_id, payload });
                }
                TYPE_HEARTBEAT => {
                    self.drain(header_len);
                    return Ok(Frame::Heartbeat { conn_id });
                }
                TYPE_UDP => {
                    let src_port =
                        u16::from_be_bytes([self.peek(5).unwrap(), self.peek(6).unwrap()]);
                    let dst_port =
                        u16::from_be_bytes([self.peek(7).unwrap(), self.peek(8).unwrap()]);
                    let len = u16::from_be_bytes([self.peek(9).unwrap(), self.peek(10).unwrap()])
                        as usize;
                    self.fill(header_len + len).await?;
                    self.drain(header_len);
                    let payload = self.take(len);
                    return Ok(Frame::Udp {
                        conn_id,
                        src_port,
                        dst_port,
                        payload,
                    });
                }
                _ => unreachable!(),
            }
        }
    }

    fn resync(&mut self, n: usize) {
        self.desync_count += 1;
        if self.desync_count % 100 == 1 {
            warn!(count = self.desync_count, "tunnel frame resynchronisation");
        }
        self.drain(n);
    }

    fn drain(&mut self, n: usize) {
        for _ in 0..n {
            self.buf.pop_front();
        }
    }

    fn take(&mut self, n: usize) -> Vec<u8> {
        self.buf.drain(..n).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn handshake_round_trip() {
        let h = Handshake {
            conn_id: 42,
            dst_port: 10011,
        };
        let bytes = h.to_bytes();
        let mut cursor = Cursor::new(bytes.to_vec());
        let parsed = read_handshake(&mut cursor).await.unwrap();
        assert_eq!(parsed, h);
    }

    #[test]
    fn udp_bootstrap_handshake_is_recognised() {
        let h = Handshake {
            conn_id: UDP_BOOTSTRAP_CONN_ID,
            dst_port: UDP_BOOTSTRAP_PORT,
        };
        assert!(h.is_udp_bootstrap());
        assert!(!h.is_liveness_probe());
    }

    #[test]
    fn liveness_probe_handshake_is_recognised() {
        let h = Handshake {
            conn_id: LIVENESS_PROBE_CONN_ID,
            dst_port: LIVENESS_PROBE_PORT,
        };
        assert!(h.is_liveness_probe());
    }

    #[tokio::test]
    async fn tcp_frame_round_trip() {
        let frame = Frame::Tcp {
            conn_id: 1,
            payload: b"hello".to_vec(),
        };
        let encoded = frame.encode().unwrap();
        assert_eq!(
            encoded,
            vec![0x01, 0x00, 0x00, 0x00, 0x01, 0x00, 0x05, b'h', b'e', b'l', b'l', b'o']
        );
        let mut reader = FrameReader::new(Cursor::new(encoded));
        let parsed = reader.read_frame(|id| id == 1).await.unwrap();
        assert_eq!(parsed, frame);
    }

    #[tokio::test]
    async fn heartbeat_frame_round_trip() {
        let frame = Frame::Heartbeat { conn_id: 7 };
        let encoded = frame.encode().unwrap();
        assert_eq!(encoded.len(), 7);
        let mut reader = FrameReader::new(Cursor::new(encoded));
        let parsed = reader.read_frame(|_| true).await.unwrap();
        assert_eq!(parsed, frame);
    }

    #[tokio::test]
    async fn udp_frame_round_trip() {
        let frame = Frame::Udp {
            conn_id: 100_000,
            src_port: 5063,
            dst_port: 10011,
            payload: vec![1, 2, 3, 4],
        };
        let encoded = frame.encode().unwrap();
        let mut reader = FrameReader::new(Cursor::new(encoded));
        let parsed = reader.read_frame(|_| true).await.unwrap();
        assert_eq!(parsed, frame);
    }

    #[tokio::test]
    async fn resync_skips_garbage_byte_before_a_valid_frame() {
        let frame = Frame::Heartbeat { conn_id: 3 };
        let mut encoded = vec![0xAAu8];
        encoded.extend(frame.encode().unwrap());
        let mut reader = FrameReader::new(Cursor::new(encoded));
        let parsed = reader.read_frame(|id| id == 3).await.unwrap();
        assert_eq!(parsed, frame);
    }

    #[tokio::test]
    async fn resync_skips_frame_with_wrong_conn_id() {
        let wrong = Frame::Heartbeat { conn_id: 99 };
        let right = Frame::Heartbeat { conn_id: 3 };
        let mut encoded = wrong.encode().unwrap();
        encoded.extend(right.encode().unwrap());
        let mut reader = FrameReader::new(Cursor::new(encoded));
        let parsed = reader.read_frame(|id| id == 3).await.unwrap();
        assert_eq!(parsed, right);
    }

    #[test]
    fn split_tcp_frames_caps_each_chunk_at_u16_max() {
        let payload = vec![0u8; (u16::MAX as usize) + 10];
        let frames = split_tcp_frames(5, &payload);
        assert_eq!(frames.len(), 2);
        match &frames[0] {
            Frame::Tcp { payload, .. } => assert_eq!(payload.len(), u16::MAX as usize),
            _ => panic!("expected tcp frame"),
        }
        match &frames[1] {
            Frame::Tcp { payload, .. } => assert_eq!(payload.len(), 10),
            _ => panic!("expected tcp frame"),
        }
    }
}
