//! TLS client sockets
//!
//! This module layers an OpenSSL client session over an already-connected
//! byte stream and exposes the same read/write/close contract as the plain
//! transport.
//!
//! # Architecture
//!
//! 1. `Capabilities` resolves the requested version against what the linked
//!    OpenSSL can speak, before any network IO
//! 2. `Negotiator` builds the context and drives the handshake under a
//!    deadline
//! 3. The retry engine (`retry`) turns partial, would-block IO into
//!    complete writes and prompt reads with adaptive chunk sizes
//! 4. `PeerTrust` snapshots version, cipher, certificates and the
//!    verification verdict
//! 5. `TlsSocket` composes the above and enforces the lifecycle
//!
//! Peer close, broken pipes and TLS failures during steady-state IO are not
//! errors: reads and writes return [`Transfer::Closed`]. Certificate
//! mistrust never aborts the handshake; check `peer_verified()`.
//!
//! # Examples
//!
//! ```no_run
//! use tlsock::tls::{TlsParameters, TlsSocket, TlsVersion, Transfer, VerifyMode};
//! use std::net::TcpStream;
//!
//! let params = TlsParameters::builder()
//!     .version(TlsVersion::Tls12)
//!     .verify_mode(VerifyMode::None)
//!     .peer_host("example.com")
//!     .build()
//!     .unwrap();
//!
//! let tcp_stream = TcpStream::connect("example.com:443").unwrap();
//! let mut socket = TlsSocket::connect(tcp_stream, &params).unwrap();
//!
//! if socket.peer_verified() != Some(true) {
//!     eprintln!("untrusted peer: {:?}", socket.trust());
//! }
//!
//! socket.write(b"GET / HTTP/1.0\r\n\r\n").unwrap();
//! while let Transfer::Done(data) = socket.read(None).unwrap() {
//!     print!("{}", String::from_utf8_lossy(&data));
//! }
//! socket.close();
//! ```

#[cfg(test)]
pub(crate) mod builtin_cert;
pub mod capability;
pub mod cert;
pub mod config;
pub mod error;
pub mod handshake;
pub mod retry;
pub mod session;
pub mod socket;
pub mod trust;

pub use capability::Capabilities;
pub use cert::CertInfo;
pub use config::{TlsParameters, TlsParametersBuilder, TlsVersion, VerifyMode};
pub use error::TlsError;
pub use handshake::Negotiator;
pub use retry::{Attempt, RetryPolicy, Transfer};
pub use session::TlsSession;
pub use socket::{SocketState, TlsSocket, SOCKET_TYPE};
pub use trust::{CipherInfo, PeerTrust, VerificationOutcome};

/// Result type for TLS operations
pub type Result<T> = std::result::Result<T, TlsError>;
