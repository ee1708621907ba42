use steam_cm::ProtocolError;

/// Errors raised while talking to content servers.
#[derive(Debug, thiserror::Error)]
pub enum ContentError {
    #[error("http transport error: {0}")]
    Http(String),

    #[error("{url} returned status {status}")]
    Status { url: String, status: u16 },

    #[error("malformed response from {url}: {reason}")]
    BadResponse { url: String, reason: String },

    #[error("no content server connections left")]
    PoolExhausted,

    #[error("chunk {chunk} decoded to {actual} bytes, expected {expected}")]
    ChunkSize { chunk: String, expected: u64, actual: u64 },

    #[error("refusing to write outside the download root: {0}")]
    UnsafePath(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Vdf(#[from] VdfError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),
}

impl ContentError {
    /// Returns `true` when the connection that produced this error must be
    /// removed from the pool.
    pub fn evicts_connection(&self) -> bool {
        matches!(self, Self::Http(_) | Self::Status { .. } | Self::BadResponse { .. })
    }
}

impl From<reqwest::Error> for ContentError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err.to_string())
    }
}

/// Errors raised by the VDF text parser.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VdfError {
    #[error("unterminated string starting on line {line}")]
    UnterminatedString { line: usize },

    #[error("unbalanced braces on line {line}")]
    UnbalancedBraces { line: usize },

    #[error("expected {expected} on line {line}")]
    Unexpected { expected: &'static str, line: usize },

    #[error("missing key {0:?}")]
    MissingKey(String),
}

/// Errors raised while decoding a depot manifest.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("manifest section {magic:#010x} overruns the buffer: need {needed}, have {available}")]
    Truncated { magic: u32, needed: usize, available: usize },

    #[error("manifest has no payload section")]
    MissingPayload,

    #[error("protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("filename is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("filename decryption failed: {0}")]
    Filename(#[source] ProtocolError),

    #[error("filename is not valid utf-8")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("decompression failed: {0}")]
    Decompress(String),
}

impl From<zip::result::ZipError> for ManifestError {
    fn from(err: zip::result::ZipError) -> Self {
        Self::Decompress(err.to_string())
    }
}
