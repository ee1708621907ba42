use crate::emsg::{EMsg, EResult};

/// Errors raised while framing, decrypting or decoding CM traffic.
///
/// Every variant except `Config` and `Io` describes a condition the connection
/// cannot recover from in place: the caller must drop the socket and, if it
/// wants to, reconnect and start the handshake again.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("bad frame magic: {0:02x?}")]
    BadMagic([u8; 4]),

    #[error("truncated {what}: need {needed} bytes, have {available}")]
    Truncated { what: &'static str, needed: usize, available: usize },

    #[error("cipher failure: {0}")]
    Cipher(&'static str),

    #[error("key exchange failed: {0}")]
    KeyExchange(#[from] rsa::Error),

    #[error("multi envelope decompression failed: {0}")]
    Decompress(String),

    #[error("multi envelope size mismatch: declared {declared}, got {actual}")]
    SizeMismatch { declared: usize, actual: usize },

    #[error("multi envelopes nested deeper than {0}")]
    NestingTooDeep(usize),

    #[error("negative protobuf header length {0}")]
    NegativeHeaderLength(i32),

    #[error("protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("channel encryption rejected: {0:?}")]
    HandshakeRejected(EResult),

    #[error("unexpected handshake message {0:?}")]
    UnexpectedHandshake(EMsg),

    #[error("{0:?} received before channel encryption completed")]
    NotEncrypted(EMsg),

    #[error("frame sink closed")]
    SinkClosed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),
}

impl ProtocolError {
    /// Returns `true` when the connection must be torn down.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Config(_))
    }
}

impl From<zip::result::ZipError> for ProtocolError {
    fn from(err: zip::result::ZipError) -> Self {
        Self::Decompress(err.to_string())
    }
}
