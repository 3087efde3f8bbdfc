//! End-to-end "UDP bootstrap" scenario (spec §8): a tunnel connection
//! bootstraps UDP multiplexing against a `RelayServer`, which must open an
//! upstream socket to a loopback stand-in for the game server and relay
//! datagrams in both directions.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use dnf_relay_tunnel::protocol::{self, Frame, FrameReader, Handshake};
use dnf_relay_tunnel::relay::RelayServer;
use dnf_relay_tunnel::tunnel;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, UdpSocket};

/// Echoes every datagram it receives back to its sender, forever.
async fn spawn_echo_game_server() -> u16 {
    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let port = socket.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        loop {
            let (n, from) = match socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(_) => return,
            };
            let _ = socket.send_to(&buf[..n], from).await;
        }
    });
    port
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn udp_datagram_round_trips_through_relay_bootstrap() {
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
    let (mut read_half, mut write_half) = tokio::io::split(stream);

    protocol::write_handshake(
        &mut write_half,
        Handshake {
            conn_id: protocol::UDP_BOOTSTRAP_CONN_ID,
            dst_port: protocol::UDP_BOOTSTRAP_PORT,
        },
    )
    .await
    .unwrap();
    write_half
        .write_all(&Ipv4Addr::new(10, 0, 0, 2).octets())
        .await
        .unwrap();

    let echo = protocol::read_handshake(&mut read_half).await.unwrap();
    assert_eq!(echo.conn_id, protocol::UDP_BOOTSTRAP_CONN_ID);
    assert_eq!(echo.dst_port, protocol::UDP_BOOTSTRAP_PORT);

    let mut reader = FrameReader::new(read_half);

    let client_src_port = 5063u16;
    let conn_id = 100_000u32;
    protocol::write_frame(
        &mut write_half,
        &Frame::Udp {
            conn_id,
            src_port: client_src_port,
            dst_port: game_server_port,
            payload: b"ping".to_vec(),
        },
    )
    .await
    .unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(5), reader.read_frame(|_| true))
        .await
        .expect("relay should echo the game server's reply within 5s")
        .unwrap();

    match frame {
        Frame::Udp {
            src_port,
            dst_port,
            payload,
            ..
        } => {
            assert_eq!(src_port, game_server_port);
            assert_eq!(dst_port, client_src_port);
            assert_eq!(payload, b"ping");
        }
        other => panic!("expected a udp frame, got {other:?}"),
    }
}
