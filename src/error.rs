//! Error types for the upgrade server

use std::io;

use http::StatusCode;

/// Result type alias for upgrade and negotiation operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while accepting, upgrading, or compressing for a connection
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error from the underlying socket
    #[error("I/O error: {0}")]
    Io(io::Error),
    /// Server configuration was rejected at construction time
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    /// Request head could not be parsed
    #[error("invalid HTTP: {0}")]
    InvalidHttp(&'static str),
    /// Upgrade request failed validation or client verification
    #[error("handshake rejected with {status}: {reason}")]
    HandshakeRejected {
        /// Status written back to the client
        status: StatusCode,
        /// Short description of the failed check
        reason: &'static str,
    },
    /// Sec-WebSocket-Extensions header is malformed
    #[error("invalid extension header: {0}")]
    Extension(String),
    /// A single extension offer could not be normalized
    #[error("invalid extension offer: {0}")]
    Negotiation(String),
    /// Compression/decompression error
    #[error("compression error: {0}")]
    Compression(String),
    /// Inflated message exceeds the configured maximum payload
    #[error("message too large")]
    MessageTooLarge,
    /// Limiter job was dropped before it could report a result
    #[error("compression job cancelled")]
    JobCancelled,
    /// Connection closed by the peer
    #[error("connection closed")]
    ConnectionClosed,
    /// Connection reset by peer
    #[error("connection reset by peer")]
    ConnectionReset,
    /// Handshake did not complete in time
    #[error("handshake timed out")]
    Timeout,
}

/// Construction-time configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Neither a port nor an external listener was supplied
    #[error("one of `port` or `server` must be specified")]
    MissingListenSource,
    /// Both a port and an external listener were supplied
    #[error("`port` and `server` are mutually exclusive")]
    ConflictingListenSource,
    /// The external listener is already used by another server
    #[error("the listener is already being used by another WebSocket server")]
    ServerAlreadyClaimed,
    /// Window bits outside 8..=15
    #[error("invalid max window bits {0}, expected 8..=15")]
    InvalidWindowBits(u8),
    /// zlib level above 9
    #[error("invalid compression level {0}, expected 0..=9")]
    InvalidCompressionLevel(u32),
    /// Path filter does not start with '/'
    #[error("invalid path filter {0:?}")]
    InvalidPath(String),
    /// Configuration file could not be read
    #[error("failed to read config: {0}")]
    Read(#[source] io::Error),
    /// Configuration file is not valid TOML for this server
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

impl Error {
    /// Status code used when this error aborts a handshake
    pub fn status(&self) -> StatusCode {
        match self {
            Error::HandshakeRejected { status, .. } => *status,
            Error::Timeout => StatusCode::REQUEST_TIMEOUT,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionReset => Error::ConnectionReset,
            io::ErrorKind::BrokenPipe => Error::ConnectionClosed,
            io::ErrorKind::UnexpectedEof => Error::ConnectionClosed,
            io::ErrorKind::TimedOut => Error::Timeout,
            _ => Error::Io(e),
        }
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(e) => e,
            Error::ConnectionReset => {
                io::Error::new(io::ErrorKind::ConnectionReset, "connection reset")
            }
            Error::ConnectionClosed => {
                io::Error::new(io::ErrorKind::BrokenPipe, "connection closed")
            }
            Error::Timeout => io::Error::new(io::ErrorKind::TimedOut, "handshake timed out"),
            other => io::Error::other(other.to_string()),
        }
    }
}
