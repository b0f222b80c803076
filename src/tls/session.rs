//! Established TLS session
//!
//! Owns the OpenSSL stream (and through it the transport) once the
//! handshake has completed. All reads and writes go through the retry
//! engine; the trust snapshot taken at handshake time rides along.

use super::retry::{self, Attempt, Readiness, RetryPolicy, Transfer};
use super::trust::PeerTrust;
use super::Result;
use crate::net::{Bounded, Interest, Transport};
use bytes::Bytes;
use openssl::ssl::SslStream;
use std::io;
use std::time::Duration;
use tracing::debug;

impl<T: Transport> Readiness for SslStream<T> {
    fn wait_ready(&mut self, interest: Interest, timeout: Duration) -> io::Result<bool> {
        // Decrypted bytes already buffered inside OpenSSL
        if interest == Interest::Read && self.ssl().pending() > 0 {
            return Ok(true);
        }
        self.get_ref().wait(interest, timeout)
    }
}

/// TLS session over a transport
pub struct TlsSession<T: Transport> {
    stream: SslStream<Bounded<T>>,
    trust: PeerTrust,
    policy: RetryPolicy,
    failed: bool,
}

impl<T: Transport> TlsSession<T> {
    pub(crate) fn new(stream: SslStream<Bounded<T>>, trust: PeerTrust, policy: RetryPolicy) -> Self {
        TlsSession {
            stream,
            trust,
            policy,
            failed: false,
        }
    }

    /// Session metadata captured at handshake completion
    pub fn trust(&self) -> &PeerTrust {
        &self.trust
    }

    /// Whether steady-state IO has hit the closed sentinel
    pub fn failed(&self) -> bool {
        self.failed
    }

    /// Write all of `data` through the session
    pub fn write(&mut self, data: &[u8]) -> Result<Transfer<usize>> {
        let result = retry::write_all(&self.policy, &mut self.stream, data, |s, chunk| {
            match s.ssl_write(chunk) {
                Ok(n) => Attempt::Progress(n),
                Err(e) => retry::classify(e),
            }
        });

        if matches!(result, Ok(Transfer::Closed)) {
            self.failed = true;
        }
        result
    }

    /// Read whatever decrypted data is available, up to `max_len` bytes
    pub fn read(&mut self, max_len: Option<usize>) -> Result<Transfer<Bytes>> {
        let result = retry::read_some(&self.policy, &mut self.stream, max_len, |s, buf| {
            match s.ssl_read(buf) {
                Ok(n) => Attempt::Progress(n),
                Err(e) => retry::classify(e),
            }
        });

        if matches!(result, Ok(Transfer::Closed)) {
            self.failed = true;
        }
        result
    }

    /// Get reference to underlying transport
    pub fn get_ref(&self) -> &T {
        self.stream.get_ref().get_ref()
    }

    /// Tear the session down, then close the transport.
    ///
    /// Best effort: failures are logged and swallowed. No close_notify is
    /// attempted once the stream has already failed.
    pub(crate) fn close(&mut self) {
        if !self.failed {
            if let Err(e) = self.stream.shutdown() {
                debug!(error = %e, "TLS shutdown failed");
            }
        }

        if let Err(e) = self.stream.get_mut().close() {
            debug!(error = %e, "transport close failed");
        }
    }
}

impl<T: Transport> std::fmt::Debug for TlsSession<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSession")
            .field("trust", &self.trust)
            .field("policy", &self.policy)
            .field("failed", &self.failed)
            .finish()
    }
}
