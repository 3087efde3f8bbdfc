pub mod dispatcher;
pub mod udp;

pub use dispatcher::RelayServer;
