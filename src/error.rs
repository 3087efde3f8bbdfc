//! Typed errors for the library layer. Binaries collect these into `anyhow::Result`
//! at the process boundary (see `bin/client.rs`, `bin/relay.rs`).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("embedded config markers not found in the last {0} bytes of the executable")]
    MarkersNotFound(usize),
    #[error("embedded config JSON is not valid UTF-8")]
    NotUtf8(#[source] std::str::Utf8Error),
    #[error("failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing required config field `{0}`")]
    MissingField(&'static str),
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("connection closed before a complete frame was read")]
    ShortRead,
    #[error("handshake read failed: {0}")]
    Handshake(#[source] std::io::Error),
    #[error("frame payload length {0} exceeds the 65535-byte wire limit")]
    PayloadTooLarge(usize),
}

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("tunnel connect to relay failed: {0}")]
    TunnelConnect(#[source] std::io::Error),
    #[error("tunnel handshake failed: {0}")]
    Handshake(#[source] ProtocolError),
    #[error("flow is not established")]
    NotEstablished,
}

#[derive(Debug, Error)]
pub enum PacketError {
    #[error("buffer too short to contain an IPv4 header")]
    TooShortForIpv4,
    #[error("unsupported IP version {0}")]
    UnsupportedIpVersion(u8),
    #[error("buffer too short to contain a full {0} header")]
    TooShortForTransport(&'static str),
    #[error("packet build failed: {0}")]
    Build(String),
}
