pub mod tcp;
pub mod udp_client;

pub use tcp::{FlowKey, FlowTable, PacketInjector, TcpFlow};
pub use udp_client::{UdpClientState, UdpFlowTuple};
