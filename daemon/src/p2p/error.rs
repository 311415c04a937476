use crate::core::storage::StorageError;
use replica_common::{crypto::CryptoError, serializer::ReaderError};
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum P2pError {
    #[error("Peer disconnected")]
    Disconnected,
    #[error("Error while sending packet: {0}")]
    SendError(String),
    #[error("Request timed out")]
    TimedOut(#[from] tokio::time::error::Elapsed),
    #[error("Wrong magic value 0x{0:08x} in protocol version {1}")]
    InvalidMagic(u32, u32),
    #[error("Header padding is not zero")]
    InvalidHeaderPadding,
    #[error("Unexpected data packet 0x{0:04x}")]
    UnknownCommand(u16),
    #[error("Unexpected meta packet 0x{0:04x}")]
    UnknownMetaCommand(u16),
    #[error("Expected {expected} packet, received 0x{got:04x}")]
    UnexpectedCommand { expected: &'static str, got: u16 },
    #[error("No payload expected for 0x{0:04x}, length {1}")]
    UnexpectedPayload(u16, u32),
    #[error("Wrong packet size for 0x{0:04x}: {1}")]
    WrongPacketSize(u16, u32),
    #[error("Incompatible protocol versions: I support {min}-{max}, peer supports {peer_min}-{peer_max}")]
    IncompatibleProtocol {
        min: u32,
        max: u32,
        peer_min: u32,
        peer_max: u32,
    },
    #[error("Peer presented a node id of {got} instead of {expected}")]
    NodeIdMismatch { expected: u32, got: u32 },
    #[error("Authentication of peer failed: {0}")]
    AuthFailed(&'static str),
    #[error("Digest integrity check failed: sector {0} +{1}")]
    DigestMismatch(u64, u32),
    #[error("Request from peer beyond end of local disk: capacity {capacity} sectors < sector {sector} + {size} bytes")]
    BeyondEndOfDevice { capacity: u64, sector: u64, size: u32 },
    #[error("Unaligned peer request: sector {0} +{1}")]
    UnalignedRequest(u64, u32),
    #[error("Oversized peer request: {0} bytes")]
    OversizedRequest(u32),
    #[error("Unknown volume {0}")]
    UnknownVolume(u32),
    #[error("Timed out waiting for missing ack packets")]
    PeerSeqTimeout,
    #[error("Page allocation interrupted by shutdown")]
    AllocInterrupted,
    #[error("Unrelated data, aborting")]
    UnrelatedData,
    #[error("Split-brain detected but unresolved")]
    SplitBrainUnresolved,
    #[error("State change failed: {0}")]
    StateChangeFailed(&'static str),
    #[error("Concurrent cluster-wide state change in progress")]
    TwopcBusy,
    #[error("Cluster-wide state change rejected by peer")]
    TwopcRejected,
    #[error("Shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Reader(#[from] ReaderError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl P2pError {
    // True for failures that warrant a reconnect rather than dropping
    // to standalone
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            P2pError::Io(_) | P2pError::TimedOut(_) | P2pError::Disconnected | P2pError::SendError(_)
        )
    }
}
