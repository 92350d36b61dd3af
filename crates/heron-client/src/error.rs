// Error taxonomy for connections, the consumer engine and the producer.
use heron_wire::{MessageId, PeerError};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Rejected before any connection is attempted.
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("transport error")]
    Transport(#[from] heron_transport::Error),
    /// Malformed or unexpected bytes from the peer; fatal to that connection.
    #[error("protocol error")]
    Wire(#[from] heron_wire::Error),
    #[error("peer error: {0}")]
    Peer(#[from] PeerError),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("{0} timed out")]
    Timeout(&'static str),
    /// The command never left this side of the connection.
    #[error("connection closed")]
    Closed,
    /// Written, but the connection died before the peer replied; the peer
    /// may or may not have applied it.
    #[error("connection closed before the peer replied")]
    Unacknowledged,
    #[error("message {0} already responded to")]
    AlreadyResponded(MessageId),
    #[error("no connections available")]
    NoConnections,
}

impl Error {
    /// True for failures that end the connection they happened on.
    pub fn is_connection_fatal(&self) -> bool {
        match self {
            Error::Peer(err) => err.is_fatal(),
            Error::Config(_) | Error::AlreadyResponded(_) => false,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heron_wire::ErrorCode;

    #[test]
    fn recoverable_peer_errors_keep_the_connection() {
        let err = Error::Peer(PeerError::new(ErrorCode::FinFailed, "FIN failed"));
        assert!(!err.is_connection_fatal());
        let err = Error::Peer(PeerError::new(ErrorCode::BadTopic, "bad"));
        assert!(err.is_connection_fatal());
        assert!(Error::Closed.is_connection_fatal());
        assert!(Error::Unacknowledged.is_connection_fatal());
    }
}
