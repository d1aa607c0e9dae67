//! Typed errors for the network layer.

use std::net::SocketAddr;

use thiserror::Error;

/// Which of the bridge's sockets an error concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketRole {
    Sender,
    Receiver,
    Discovery,
}

impl std::fmt::Display for SocketRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Sender => "sender",
            Self::Receiver => "receiver",
            Self::Discovery => "discovery",
        })
    }
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to bind {role} socket to {addr}: {source}")]
    Bind {
        role: SocketRole,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid peer address '{0}'")]
    InvalidPeer(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;
