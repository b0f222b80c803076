//! TLS socket facade
//!
//! The public stream object. It walks a linear lifecycle:
//!
//! ```text
//! Unestablished --initialize()--> Established --close()--> Closed
//!       \___________________________close()______________/^
//! ```
//!
//! Raw transport IO is allowed only before the session exists; once TLS is
//! active every byte must go through the session so plaintext can never
//! leak onto an encrypted stream. `shutdown()` is deliberately inert: a
//! half-close underneath live TLS desynchronizes the close sequence.

use super::capability::Capabilities;
use super::config::{TlsParameters, TlsVersion};
use super::error::TlsError;
use super::handshake::Negotiator;
use super::retry::{RetryPolicy, Transfer};
use super::session::TlsSession;
use super::trust::{CipherInfo, PeerTrust};
use super::Result;
use crate::net::Transport;
use bytes::Bytes;
use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use tracing::debug;

/// Socket category reported to the enclosing framework
pub const SOCKET_TYPE: &str = "tcp-tls";

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Unestablished,
    Established,
    Closed,
}

enum Inner<T: Transport> {
    Unestablished(T),
    Established(TlsSession<T>),
    Closed,
}

/// TLS client socket layered over a connected transport
///
/// Not internally synchronized: drive one instance from one thread.
pub struct TlsSocket<T: Transport> {
    inner: Inner<T>,
    negotiator: Negotiator,
}

impl<T: Transport> TlsSocket<T> {
    /// Wrap `transport` and negotiate TLS over it
    pub fn connect(transport: T, params: &TlsParameters) -> Result<Self> {
        let mut socket = Self::new(transport, params)?;
        socket.initialize()?;
        Ok(socket)
    }

    /// Wrap `transport` without touching it.
    ///
    /// Every configuration check happens here, against the host's
    /// capability table.
    pub fn new(transport: T, params: &TlsParameters) -> Result<Self> {
        Self::with_capabilities(transport, params, Capabilities::host())
    }

    /// Like [`TlsSocket::new`] with an explicit capability table
    pub fn with_capabilities(transport: T, params: &TlsParameters, caps: &Capabilities) -> Result<Self> {
        let negotiator = Negotiator::new(params, caps)?;
        Ok(TlsSocket {
            inner: Inner::Unestablished(transport),
            negotiator,
        })
    }

    /// Replace the retry policy used by the handshake and steady-state IO
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.negotiator.set_policy(policy);
        self
    }

    /// Run the handshake.
    ///
    /// All-or-nothing: on failure the transport is closed, the socket moves
    /// to `Closed` and the error is returned.
    pub fn initialize(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.inner, Inner::Closed) {
            Inner::Unestablished(transport) => {
                let session = self.negotiator.establish(transport)?;
                self.inner = Inner::Established(session);
                Ok(())
            }
            established @ Inner::Established(_) => {
                self.inner = established;
                Ok(())
            }
            Inner::Closed => Err(TlsError::NotEstablished),
        }
    }

    pub fn state(&self) -> SocketState {
        match self.inner {
            Inner::Unestablished(_) => SocketState::Unestablished,
            Inner::Established(_) => SocketState::Established,
            Inner::Closed => SocketState::Closed,
        }
    }

    pub fn is_established(&self) -> bool {
        self.state() == SocketState::Established
    }

    /// Socket category (`"tcp-tls"`)
    pub fn socket_type(&self) -> &'static str {
        SOCKET_TYPE
    }

    fn session_mut(&mut self) -> Result<&mut TlsSession<T>> {
        match &mut self.inner {
            Inner::Established(session) => Ok(session),
            _ => Err(TlsError::NotEstablished),
        }
    }

    fn session(&self) -> Option<&TlsSession<T>> {
        match &self.inner {
            Inner::Established(session) => Some(session),
            _ => None,
        }
    }

    /// Write all of `data` through TLS.
    ///
    /// Returns the byte count, or [`Transfer::Closed`] if the peer went
    /// away or the TLS layer failed mid-stream.
    pub fn write(&mut self, data: &[u8]) -> Result<Transfer<usize>> {
        self.session_mut()?.write(data)
    }

    /// Read available decrypted data, up to `max_len` bytes.
    ///
    /// Does not wait to fill the request; returns [`Transfer::Closed`] at
    /// end of stream.
    pub fn read(&mut self, max_len: Option<usize>) -> Result<Transfer<Bytes>> {
        self.session_mut()?.read(max_len)
    }

    /// Write straight to the transport, bypassing TLS.
    ///
    /// Only valid before the handshake.
    pub fn raw_write(&mut self, data: &[u8]) -> Result<usize> {
        match &mut self.inner {
            Inner::Unestablished(transport) => Ok(transport.write(data)?),
            Inner::Established(_) => Err(TlsError::ProtocolViolation(
                "raw write on an established TLS socket".to_string(),
            )),
            Inner::Closed => Err(TlsError::NotEstablished),
        }
    }

    /// Read straight from the transport, bypassing TLS.
    ///
    /// Only valid before the handshake.
    pub fn raw_read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match &mut self.inner {
            Inner::Unestablished(transport) => Ok(transport.read(buf)?),
            Inner::Established(_) => Err(TlsError::ProtocolViolation(
                "raw read on an established TLS socket".to_string(),
            )),
            Inner::Closed => Err(TlsError::NotEstablished),
        }
    }

    /// Accepted and ignored in every state; use [`TlsSocket::close`].
    pub fn shutdown(&mut self, how: Shutdown) -> Result<()> {
        debug!(?how, state = ?self.state(), "shutdown ignored on TLS socket");
        Ok(())
    }

    /// Tear down TLS, then close the transport. Idempotent; never fails.
    pub fn close(&mut self) {
        match std::mem::replace(&mut self.inner, Inner::Closed) {
            Inner::Unestablished(mut transport) => {
                if let Err(e) = transport.close() {
                    debug!(error = %e, "transport close failed");
                }
            }
            Inner::Established(mut session) => session.close(),
            Inner::Closed => {}
        }
    }

    /// Session metadata, once established
    pub fn trust(&self) -> Option<&PeerTrust> {
        self.session().map(TlsSession::trust)
    }

    pub fn peer_cert(&self) -> Option<&X509> {
        self.trust().and_then(PeerTrust::peer_cert)
    }

    pub fn peer_cert_chain(&self) -> Option<&[X509]> {
        self.trust().map(PeerTrust::peer_cert_chain)
    }

    pub fn cipher(&self) -> Option<&CipherInfo> {
        self.trust().and_then(PeerTrust::cipher)
    }

    pub fn negotiated_version(&self) -> Option<TlsVersion> {
        self.trust().and_then(PeerTrust::version)
    }

    /// Verification verdict recorded during the handshake
    pub fn peer_verified(&self) -> Option<bool> {
        self.trust().map(PeerTrust::peer_verified)
    }

    pub fn client_cert(&self) -> Option<&X509> {
        self.trust().and_then(PeerTrust::client_cert)
    }

    pub fn client_key(&self) -> Option<&PKey<Private>> {
        self.trust().and_then(PeerTrust::client_key)
    }

    pub fn servername(&self) -> Option<&str> {
        self.trust().and_then(PeerTrust::servername)
    }

    /// Underlying transport, while it is still open
    pub fn transport(&self) -> Option<&T> {
        match &self.inner {
            Inner::Unestablished(transport) => Some(transport),
            Inner::Established(session) => Some(session.get_ref()),
            Inner::Closed => None,
        }
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        match self.transport() {
            Some(transport) => Ok(transport.peer_addr()?),
            None => Err(TlsError::NotEstablished),
        }
    }
}

impl<T: Transport> Drop for TlsSocket<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T: Transport> std::fmt::Debug for TlsSocket<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSocket")
            .field("state", &self.state())
            .field("trust", &self.trust())
            .finish()
    }
}

fn into_io_error(err: TlsError) -> io::Error {
    match err {
        TlsError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}

/// `Read` view: the closed sentinel reads as EOF
impl<T: Transport> Read for TlsSocket<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match TlsSocket::read(self, Some(buf.len())).map_err(into_io_error)? {
            Transfer::Done(data) => {
                buf[..data.len()].copy_from_slice(&data);
                Ok(data.len())
            }
            Transfer::Closed => Ok(0),
        }
    }
}

/// `Write` view: the closed sentinel is a broken pipe
impl<T: Transport> Write for TlsSocket<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match TlsSocket::write(self, buf).map_err(into_io_error)? {
            Transfer::Done(n) => Ok(n),
            Transfer::Closed => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "TLS stream closed",
            )),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
