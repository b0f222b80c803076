//! TLS socket errors

/// TLS errors
///
/// Transient would-block conditions never surface here: the retry engine
/// absorbs them. Ordinary peer close during steady-state IO is not an error
/// either; it is reported through [`Transfer::Closed`](super::Transfer::Closed).
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    /// Unsupported version, incomplete client certificate pair, bad option.
    /// Always raised before any byte reaches the transport.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Invalid TLS version: {0}")]
    InvalidVersion(String),

    #[error("Connection timed out: {host}:{port}")]
    ConnectionTimeout { host: String, port: u16 },

    /// Raw transport IO attempted while a TLS session is active
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("TLS session is not established")]
    NotEstablished,

    #[error("Handshake failed: {0}")]
    Handshake(openssl::ssl::Error),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TlsError {
    /// Whether this is a configuration problem detected before connecting
    pub fn is_configuration(&self) -> bool {
        matches!(self, TlsError::Configuration(_) | TlsError::InvalidVersion(_))
    }
}
