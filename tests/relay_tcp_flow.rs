//! End-to-end "tunnel TCP forward" scenario (spec §8): a real tunnel
//! connection into a `RelayServer`, forwarding to a loopback echo stand-in
//! for the game server, exercising the relay's accept/handshake/forward path
//! without any in-module shortcuts.

use std::net::{IpAddr, Ipv4Addr};

use dnf_relay_tunnel::protocol::{self, Frame, FrameReader, Handshake};
use dnf_relay_tunnel::relay::RelayServer;
use dnf_relay_tunnel::tunnel;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Accepts one connection, echoes back whatever it reads, then exits.
async fn spawn_echo_game_server() -> u16 {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 1024];
        loop {
            let n = match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            if stream.write_all(&buf[..n]).await.is_err() {
                return;
            }
        }
    });
    port
}

/// Reserves a free loopback TCP port by binding and immediately dropping the
/// listener (the relay's own `serve()` binds the real listener).
async fn free_port() -> u16 {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn tcp_flow_forwards_through_relay_to_game_server_and_back() {
    let game_server_port = spawn_echo_game_server().await;
    let relay_port = free_port().await;

    let relay = RelayServer::new(
        "test".to_string(),
        relay_port,
        IpAddr::V4(Ipv4Addr::LOCALHOST),
    )
    .unwrap();
    let listener = relay.bind().await.unwrap();
    tokio::spawn(relay.serve(listener));

    let stream = tunnel::dial("127.0.0.1", relay_port).await.unwrap();
    let (read_half, mut write_half) = tokio::io::split(stream);

    let conn_id = 1u32;
    protocol::write_handshake(
        &mut write_half,
        Handshake {
            conn_id,
            dst_port: game_server_port,
        },
    )
    .await
    .unwrap();

    protocol::write_frame(
        &mut write_half,
        &Frame::Tcp {
            conn_id,
            payload: b"hello relay".to_vec(),
        },
    )
    .await
    .unwrap();

    let mut reader = FrameReader::new(read_half);
    let frame = tokio::time::timeout(std::time::Duration::from_secs(5), reader.read_frame(|id| id == conn_id))
        .await
        .expect("relay should echo the game server's reply within 5s")
        .unwrap();

    match frame {
        Frame::Tcp { payload, .. } => assert_eq!(payload, b"hello relay"),
        other => panic!("expected a tcp frame, got {other:?}"),
    }
}
