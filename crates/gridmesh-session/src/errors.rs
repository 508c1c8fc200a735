//! Session/downloader error taxonomy — transport, protocol, and application
//! failures as distinct variants, never a bare `String`.

use gridmesh_core::wire::WireError;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("socket i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no reply within the fetch deadline")]
    Timeout,
    #[error("session was disconnected while a request was outstanding")]
    Cancelled,
    #[error("inbound message failed signature verification")]
    BadSignature,
    #[error("peer used tag {0:?} before completing the Hello handshake")]
    PreconditionViolated(gridmesh_core::wire::Tag),
    #[error("malformed datagram: {0}")]
    Wire(#[from] WireError),
    #[error("peer replied with an error: {0}")]
    PeerError(String),
    #[error("peer does not have the requested datum")]
    NotFound,
    #[error("chunk datum's recomputed hash does not match the requested hash")]
    ChunkHashMismatch,
    #[error("internal node's recomputed hash does not match the requested hash")]
    TreeHashMismatch,
    #[error("directory's recomputed hash does not match the requested hash")]
    DirectoryHashMismatch,
    #[error("reply's embedded hash field does not match the requested hash")]
    ReplyHashMismatch,
    #[error("five consecutive Hello timeouts; NAT-traversal fallback required")]
    NatFallbackRequired,
    #[error(transparent)]
    Merkle(#[from] gridmesh_core::merkle::MerkleError),
}
