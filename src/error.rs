//! Error types for the OpenVPN client.

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the client.
#[derive(Error, Debug)]
pub enum Error {
    /// The transport reached EOF, possibly mid-frame.
    #[error("transport closed")]
    TransportClosed,

    /// A packet header could not be parsed.
    #[error("malformed packet header: {0}")]
    MalformedHeader(String),

    /// Generic handshake-phase failure.
    #[error("bad handshake: {0}")]
    BadHandshake(String),

    /// The TLS handshake over the control channel failed.
    #[error("bad TLS handshake: {0}")]
    BadTlsHandshake(String),

    /// The inner control-channel message could not be parsed.
    #[error("bad control message: {0}")]
    BadControlMessage(String),

    /// The server rejected our credentials.
    #[error("server returned AUTH_FAILED")]
    AuthFailed,

    /// The active key slot was never initialized.
    #[error("no active key in session")]
    NoActiveKey,

    /// A data packet fell behind or inside the replay window.
    #[error("replayed data packet")]
    Replay,

    /// A data packet failed MAC or AEAD verification.
    #[error("data packet failed authentication")]
    BadAuthentication,

    /// The retransmit budget or the handshake deadline ran out.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS configuration or protocol errors.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
}

impl Error {
    /// Create a new malformed-header error.
    pub fn malformed<S: Into<String>>(msg: S) -> Self {
        Self::MalformedHeader(msg.into())
    }

    /// Create a new handshake error.
    pub fn handshake<S: Into<String>>(msg: S) -> Self {
        Self::BadHandshake(msg.into())
    }

    /// Create a new control-message error.
    pub fn control<S: Into<String>>(msg: S) -> Self {
        Self::BadControlMessage(msg.into())
    }

    /// Create a new configuration error.
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Check whether this is a transport read timeout.
    pub(crate) fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Io(e) if matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
            )
        )
    }

    /// Wrap for transport through `std::io::Error`, preserving timeout kinds
    /// so the TLS adapter sees the contract it expects.
    pub(crate) fn into_io(self) -> std::io::Error {
        match self {
            Self::Io(e) => e,
            Self::HandshakeTimeout => {
                std::io::Error::new(std::io::ErrorKind::TimedOut, Self::HandshakeTimeout)
            }
            other => std::io::Error::new(std::io::ErrorKind::Other, other),
        }
    }

    /// Recover an `Error` smuggled through the TLS stack, falling back to a
    /// TLS handshake failure for anything rustls generated itself.
    pub(crate) fn from_tls_io(err: std::io::Error) -> Self {
        let is_ours = err.get_ref().map(|e| e.is::<Error>()).unwrap_or(false);
        if is_ours {
            match err.into_inner().map(|e| e.downcast::<Error>()) {
                Some(Ok(e)) => *e,
                _ => Self::BadTlsHandshake("control channel error".into()),
            }
        } else {
            Self::BadTlsHandshake(err.to_string())
        }
    }
}
