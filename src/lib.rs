pub mod config;
pub mod diverter;
pub mod error;
pub mod flow;
pub mod packet;
pub mod protocol;
pub mod relay;
pub mod rewrite;
pub mod tunnel;

pub use diverter::{Diverter, DiverterConfig};
pub use flow::{FlowKey, FlowTable, PacketInjector, TcpFlow, UdpClientState, UdpFlowTuple};
