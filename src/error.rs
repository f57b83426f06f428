use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::session::HandshakeState;

/// A frame could not be turned into a [`RawMessage`](crate::wire::message::RawMessage).
///
/// Framing errors are message-level: the offending frame is discarded and the
/// reader resynchronises on the next magic value. The connection survives.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    #[error("bad magic: expected e9beb4d9, found {}", hex::encode(.found))]
    BadMagic { found: [u8; 4] },

    #[error("command field has non-NUL padding: {}", hex::encode(.field))]
    BadPadding { field: [u8; 12] },

    #[error("command field is not printable ASCII: {}", hex::encode(.field))]
    BadCommand { field: [u8; 12] },

    #[error(
        "checksum mismatch on '{command}': header {}, payload {}",
        hex::encode(.expected),
        hex::encode(.actual)
    )]
    BadChecksum {
        command: String,
        expected: [u8; 4],
        actual: [u8; 4],
    },

    #[error("payload length {length} exceeds maximum {max}")]
    Oversized { length: u32, max: u32 },

    #[error("frame truncated: need {needed} more bytes")]
    Truncated { needed: usize },
}

/// Failure while reading a frame from a byte stream.
#[derive(Debug, Error)]
pub enum WireError {
    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Connection-level failure. The connection is dropped, nothing else.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("connected to ourselves (nonce {nonce:#018x})")]
    SelfConnection { nonce: u64 },

    #[error("peer protocol version {peer} is below minimum {min}")]
    VersionMismatch { peer: i32, min: i32 },

    #[error("peer shares none of our streams (peer: {peer:?})")]
    NoCommonStream { peer: Vec<u32> },

    #[error("unexpected '{command}' while {state:?}")]
    UnexpectedMessage {
        command: String,
        state: HandshakeState,
    },

    #[error("malformed payload: {0}")]
    Malformed(io::Error),

    #[error("handshake did not complete within the deadline")]
    Timeout,

    #[error("session is closed")]
    Closed,

    #[error("transport: {0}")]
    Io(#[from] io::Error),
}

impl From<WireError> for HandshakeError {
    fn from(err: WireError) -> Self {
        match err {
            // Framing errors are recovered from by the reader; anything that
            // surfaces here is the stream itself failing.
            WireError::Framing(e) => HandshakeError::Malformed(io::Error::new(
                io::ErrorKind::InvalidData,
                e.to_string(),
            )),
            WireError::Io(e) => HandshakeError::Io(e),
        }
    }
}

/// Peer-level failure. Retried after the cool-down.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("dial {addr}: {source}")]
    Dial {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },
}

/// Process-level failure that must reach the operator.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file '{path}': {reason}")]
    Parse { path: String, reason: String },

    #[error("invalid address '{addr}': {reason}")]
    InvalidAddress { addr: String, reason: String },

    #[error("no stream numbers configured")]
    NoStreams,

    #[error("no bootstrap addresses: every static node and DNS seed failed")]
    NoBootstrapAddresses,
}

/// An object was refused admission.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("object is {age_secs}s old, older than {max_secs}s")]
    Expired { age_secs: u64, max_secs: u64 },

    #[error("object timestamp is {ahead_secs}s in the future")]
    FromFuture { ahead_secs: u64 },

    #[error("proof of work does not meet the target")]
    InsufficientWork,
}

/// Errors surfaced by the node supervisor.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Io(#[from] io::Error),
}
