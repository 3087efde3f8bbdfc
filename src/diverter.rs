//! Client diverter loop (spec §4.8).
//!
//! The kernel-mode hook itself — filtering, driver extraction, virtual
//! adapter setup — is an external collaborator (spec §1); this module is the
//! seam it plugs into. That seam is expressed as two `tokio::mpsc` channels
//! rather than a trait: the hook feeds already-filtered raw IP packets in on
//! one channel, and every [`PacketInjector`] clone handed to a flow is the
//! other half of the same channel the hook drains to re-inject synthesised
//! replies. Channels keep the hook itself out of this crate entirely while
//! still giving tests a way to drive the loop without any OS-level plumbing.

use std::net::Ipv4Addr;

use etherparse::{IpNumber, Ipv4Header, TcpHeader, UdpHeader};
use tokio::sync::mpsc::Receiver;
use tracing::{debug, warn};

use crate::flow::tcp::{FlowKey, FlowTable, PacketInjector, TcpFlow};
use crate::flow::udp_client::{UdpClientState, UdpFlowTuple};

pub struct DiverterConfig {
    pub game_server_ip: Ipv4Addr,
    pub relay_host: String,
    pub relay_port: u16,
}

/// Owns the TCP flow table and the client's single UDP tunnel, and routes
/// diverted packets into one or the other.
pub struct Diverter {
    config: DiverterConfig,
    flows: FlowTable,
    udp: std::sync::Arc<UdpClientState>,
    injector: PacketInjector,
}

impl Diverter {
    pub fn new(config: DiverterConfig, client_ip: Ipv4Addr, injector: PacketInjector) -> Self {
        let udp = UdpClientState::new(
            config.relay_host.clone(),
            config.relay_port,
            client_ip,
            config.game_server_ip,
            injector.clone(),
        );
        Diverter {
            config,
            flows: FlowTable::new(),
            udp,
            injector,
        }
    }

    /// Drains `incoming` until the hook's sender side is dropped, dispatching
    /// each diverted packet into the TCP or UDP engine (spec §4.8).
    pub async fn run(&self, mut incoming: Receiver<Vec<u8>>) {
        while let Some(packet) = incoming.recv().await {
            self.handle_packet(&packet).await;
        }
        debug!("diverter loop stopped: packet source closed");
    }

    async fn handle_packet(&self, packet: &[u8]) {
        let (ip, rest) = match Ipv4Header::from_slice(packet) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "dropping diverted packet with unparsable ipv4 header");
                return;
            }
        };
        match ip.protocol {
            IpNumber::TCP => self.handle_tcp(&ip, rest).await,
            IpNumber::UDP => self.handle_udp(&ip, rest).await,
            other => debug!(?other, "ignoring diverted packet of unsupported ip protocol"),
        }
    }

    async fn handle_tcp(&self, ip: &Ipv4Header, rest: &[u8]) {
        let (tcp, payload) = match TcpHeader::from_slice(rest) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "dropping diverted packet with unparsable tcp header");
                return;
            }
        };
        let key = FlowKey {
            client_ip: Ipv4Addr::from(ip.source),
            client_port: tcp.source_port,
            server_port: tcp.destination_port,
        };

        if tcp.syn && !tcp.ack {
            if let Some(prior) = self.flows.remove(&key) {
                prior.stop();
            }
            let conn_id = self.flows.alloc_conn_id();
            match TcpFlow::on_syn(
                key,
                conn_id,
                self.config.game_server_ip,
                tcp.sequence_number,
                &self.config.relay_host,
                self.config.relay_port,
                self.injector.clone(),
            )
            .await
            {
                Ok(flow) => {
                    self.flows.insert_replacing(key, flow);
                }
                Err(e) => warn!(error = %e, ?key, "failed to start tcp flow on diverted syn"),
            }
            return;
        }

        let flow = match self.flows.get(&key) {
            Some(f) => f,
            None => {
                debug!(?key, "non-syn packet for unknown flow, dropping");
                return;
            }
        };

        flow.update_window(tcp.window_size);

        if tcp.rst {
            flow.stop();
            self.flows.remove(&key);
            return;
        }
        if tcp.fin {
            flow.on_fin(tcp.sequence_number).await;
            self.flows.remove(&key);
            return;
        }
        if payload.is_empty() {
            flow.on_ack(tcp.acknowledgment_number);
        } else {
            flow.on_data(tcp.sequence_number, tcp.acknowledgment_number, payload)
                .await;
        }
    }

    async fn handle_udp(&self, ip: &Ipv4Header, rest: &[u8]) {
        let (udp, payload) = match UdpHeader::from_slice(rest) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "dropping diverted packet with unparsable udp header");
                return;
            }
        };
        let tuple = UdpFlowTuple {
            src_ip: Ipv4Addr::from(ip.source),
            src_port: udp.source_port,
            dst_ip: Ipv4Addr::from(ip.destination),
            dst_port: udp.destination_port,
        };
        if let Err(e) = self.udp.send_datagram(tuple, payload).await {
            warn!(error = %e, ?tuple, "failed to forward diverted udp datagram");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{build_tcp_segment, TcpFlags, TcpSegmentSpec};
    use tokio::sync::mpsc::{unbounded_channel, channel};

    #[tokio::test]
    async fn unknown_flow_non_syn_packet_is_dropped_without_panicking() {
        let (inj_tx, _inj_rx) = unbounded_channel();
        let diverter = Diverter::new(
            DiverterConfig {
                game_server_ip: Ipv4Addr::new(1, 2, 3, 4),
                relay_host: "127.0.0.1".to_string(),
                relay_port: 0,
            },
            Ipv4Addr::new(10, 0, 0, 2),
            inj_tx,
        );

        let spec = TcpSegmentSpec {
            src_ip: Ipv4Addr::new(10, 0, 0, 2),
            dst_ip: Ipv4Addr::new(1, 2, 3, 4),
            src_port: 54321,
            dst_port: 10011,
            seq: 1001,
            ack: 12346,
            window: 8192,
            flags: TcpFlags::ack_only(),
            ip_id: 1,
            payload: b"",
        };
        let packet = build_tcp_segment(&spec).unwrap();

        let (tx, rx) = channel(1);
        tx.send(packet).await.unwrap();
        drop(tx);
        diverter.run(rx).await;
        assert!(diverter.flows.get(&FlowKey {
            client_ip: Ipv4Addr::new(10, 0, 0, 2),
            client_port: 54321,
            server_port: 10011,
        }).is_none());
    }
}
