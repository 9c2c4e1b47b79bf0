use thiserror::Error;

use crate::packet::PacketError;

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("http error: {0}")]
    Http(#[from] ureq::Error),
    #[error("protocol error: {0}")]
    Packet(#[from] PacketError),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("namespace {nsp} rejected the connection: {reason}")]
    Rejected { nsp: String, reason: String },
    #[error("not connected")]
    NotConnected,
    #[error("link was shut down")]
    Closed,
    #[error("failed to spawn heartbeat thread: {0}")]
    Spawn(#[source] std::io::Error),
}
