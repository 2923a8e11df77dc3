//! Simulator-side LLUDP transport
//!
//! One UDP socket is shared by many logical circuits. Each circuit owns its own
//! sequence numbering, acknowledgement bookkeeping, retransmission and priority
//! lanes; the manager demultiplexes inbound datagrams and performs the
//! circuit-code handshake.

pub mod circuit;
pub mod handlers;
pub mod manager;
pub mod packets;
pub mod pool;
pub mod registry;
pub mod scheduler;
pub mod serialization;
pub mod transport;

// Re-export main types for convenience
pub use circuit::{Circuit, CircuitIdentity, CircuitKind, CircuitOptions, CircuitState, TerminationReason};
pub use manager::{CircuitManager, LoggingMessageService, MessageService, ServiceEvent};
pub use packets::{OutgoingMessage, Packet, PacketFrequency};
pub use scheduler::{ObjectUpdateRecord, ObjectUpdateScheduler, SceneObjects};
pub use serialization::PacketCodec;

use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum NetworkError {
    #[error("Malformed packet: {reason}")]
    MalformedPacket { reason: String },

    #[error("No circuit for {endpoint}")]
    UnknownCircuit { endpoint: String },

    #[error("Handshake rejected for circuit {code}: {reason}")]
    HandshakeMismatch { code: u32, reason: String },

    #[error("Failed to serialize {message}: {reason}")]
    SerializationFailure { message: &'static str, reason: String },

    #[error("Packet {sequence} unacknowledged after {resends} resends")]
    RetransmitExhausted { sequence: u32, resends: u32 },

    #[error("Circuit {code} timed out")]
    CircuitTimeout { code: u32 },

    #[error("Circuit {code} never acknowledged its logout reply")]
    LogoutTimeout { code: u32 },

    #[error("Circuit {code} is closing")]
    CircuitClosed { code: u32 },

    #[error("Transport error: {reason}")]
    Transport { reason: String },
}

pub type NetworkResult<T> = Result<T, NetworkError>;

impl NetworkError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        NetworkError::MalformedPacket { reason: reason.into() }
    }

    pub(crate) fn unknown_endpoint(endpoint: SocketAddr) -> Self {
        NetworkError::UnknownCircuit { endpoint: endpoint.to_string() }
    }
}

impl From<std::io::Error> for NetworkError {
    fn from(err: std::io::Error) -> Self {
        NetworkError::Transport { reason: err.to_string() }
    }
}
