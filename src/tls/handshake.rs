//! TLS session negotiation
//!
//! Builds the client context from [`TlsParameters`] and runs the handshake
//! over an already-connected transport.
//!
//! Certificate verification never aborts the handshake: the verify callback
//! records each verdict and always tells OpenSSL to continue. Callers read
//! the outcome through `peer_verified()` and apply their own policy.

use super::capability::Capabilities;
use super::config::{TlsParameters, TlsVersion, VerifyMode};
use super::error::TlsError;
use super::retry::{self, Attempt, HandshakeStatus, RetryPolicy};
use super::session::TlsSession;
use super::trust::{PeerTrust, VerifyRecorder};
use super::Result;
use crate::net::{Bounded, Transport};
use openssl::pkey::{PKey, Private};
use openssl::ssl::{
    ErrorCode, Ssl, SslContext, SslContextBuilder, SslMethod, SslMode, SslOptions, SslStream,
};
use openssl::x509::X509;
use std::io;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Peer identity reported in timeout errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PeerId {
    pub host: String,
    pub port: u16,
}

impl PeerId {
    fn resolve<T: Transport>(peer_host: Option<&str>, transport: &T) -> Self {
        let addr = transport.peer_addr().ok();
        PeerId {
            host: peer_host
                .map(str::to_string)
                .or_else(|| addr.map(|a| a.ip().to_string()))
                .unwrap_or_else(|| "<unknown>".to_string()),
            port: addr.map(|a| a.port()).unwrap_or(0),
        }
    }

    fn timeout_error(self) -> TlsError {
        TlsError::ConnectionTimeout {
            host: self.host,
            port: self.port,
        }
    }
}

/// Client-side session negotiator
///
/// Construction performs every configuration check; nothing here touches
/// the network until [`Negotiator::establish`].
pub struct Negotiator {
    ctx: SslContext,
    version: TlsVersion,
    verify_mode: VerifyMode,
    client_cert: Option<X509>,
    client_key: Option<PKey<Private>>,
    peer_host: Option<String>,
    timeout: Duration,
    nonblocking: bool,
    policy: RetryPolicy,
}

impl Negotiator {
    /// Validate parameters against `caps` and build the TLS context
    pub fn new(params: &TlsParameters, caps: &Capabilities) -> Result<Self> {
        let version = caps.resolve(params.version())?;

        let identity = match (params.client_cert(), params.client_key()) {
            (Some(cert), Some(key)) => Some((parse_cert(cert)?, parse_key(key)?)),
            (None, None) => None,
            _ => {
                return Err(TlsError::Configuration(
                    "client certificate and key must be supplied together".to_string(),
                ));
            }
        };

        let ctx = build_context(
            version,
            params.verify_mode(),
            params.cipher_spec(),
            params.ca_file().map(|p| p.to_path_buf()),
            identity.as_ref(),
        )?;

        let (client_cert, client_key) = match identity {
            Some((cert, key)) => (Some(cert), Some(key)),
            None => (None, None),
        };

        Ok(Negotiator {
            ctx,
            version,
            verify_mode: params.verify_mode(),
            client_cert,
            client_key,
            peer_host: params.peer_host().map(str::to_string),
            timeout: params.timeout(),
            nonblocking: params.nonblocking(),
            policy: RetryPolicy::default(),
        })
    }

    /// Override the retry policy
    pub fn set_policy(&mut self, policy: RetryPolicy) {
        self.policy = policy;
    }

    /// Resolved protocol version
    pub fn version(&self) -> TlsVersion {
        self.version
    }

    /// SNI name that will be sent, if any
    pub fn sni_name(&self) -> Option<&str> {
        self.peer_host.as_deref().filter(|host| sni_eligible(host))
    }

    /// Run the handshake over `transport`.
    ///
    /// On failure the transport is closed before the error is returned.
    pub fn establish<T: Transport>(&self, transport: T) -> Result<TlsSession<T>> {
        let peer = PeerId::resolve(self.peer_host.as_deref(), &transport);

        let mut ssl = Ssl::new(&self.ctx)?;

        let recorder = VerifyRecorder::default();
        let hook = recorder.clone();
        ssl.set_verify_callback(self.verify_mode.to_openssl_mode(), move |preverify_ok, store| {
            trace!(depth = store.error_depth(), ok = preverify_ok, "verify callback");
            hook.record(preverify_ok);
            true
        });

        if let Some(name) = self.sni_name() {
            ssl.set_hostname(name)?;
        }

        debug!(
            host = %peer.host,
            port = peer.port,
            version = %self.version,
            nonblocking = self.nonblocking,
            "starting TLS handshake"
        );

        if self.nonblocking {
            transport.set_nonblocking(true)?;
        }

        let mut stream = SslStream::new(ssl, Bounded::new(transport))?;

        let result = if self.nonblocking {
            self.handshake_nonblocking(&mut stream, peer)
        } else {
            self.handshake_blocking(&mut stream, peer)
        };

        if let Err(e) = result {
            debug!(error = %e, "TLS handshake failed");
            if let Err(close_err) = stream.get_mut().close() {
                debug!(error = %close_err, "closing transport after failed handshake");
            }
            return Err(e);
        }

        let trust = PeerTrust::capture(
            stream.ssl(),
            recorder.outcome(),
            self.client_cert.clone(),
            self.client_key.clone(),
        );

        debug!(
            version = ?trust.version(),
            cipher = ?trust.cipher().map(|c| c.name.as_str()),
            verified = trust.peer_verified(),
            "TLS session established"
        );
        if self.verify_mode != VerifyMode::None && !trust.peer_verified() {
            warn!("peer certificate failed verification; handshake continued");
        }

        Ok(TlsSession::new(stream, trust, self.policy))
    }

    /// One blocking handshake call. Every transport read and write inside
    /// it is bounded by the time left until the deadline.
    fn handshake_blocking<T: Transport>(
        &self,
        stream: &mut SslStream<Bounded<T>>,
        peer: PeerId,
    ) -> Result<()> {
        stream
            .get_mut()
            .set_deadline(Some(Instant::now() + self.timeout))?;
        let result = stream.connect();
        let cleared = stream.get_mut().set_deadline(None);

        match result {
            Ok(()) => Ok(cleared?),
            Err(e) if is_deadline_overrun(&e) => Err(peer.timeout_error()),
            Err(e) => Err(retry::handshake_error(e)),
        }
    }

    /// Handshake driven through the retry engine until the deadline
    fn handshake_nonblocking<T: Transport>(
        &self,
        stream: &mut SslStream<Bounded<T>>,
        peer: PeerId,
    ) -> Result<()> {
        let deadline = Instant::now() + self.timeout;

        let status = retry::drive_handshake(&self.policy, stream, deadline, |s| match s.connect() {
            Ok(()) => Attempt::Progress(()),
            Err(e) => retry::classify_handshake(e),
        })?;

        match status {
            HandshakeStatus::Complete => Ok(()),
            HandshakeStatus::DeadlineExceeded => Err(peer.timeout_error()),
        }
    }
}

/// A blocking handshake that stopped on the transport timeout
fn is_deadline_overrun(err: &openssl::ssl::Error) -> bool {
    match err.code() {
        ErrorCode::WANT_READ | ErrorCode::WANT_WRITE => true,
        _ => matches!(
            err.io_error().map(|e| e.kind()),
            Some(io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
        ),
    }
}

/// SNI is only sent for names, never for IP literals
pub(crate) fn sni_eligible(host: &str) -> bool {
    !host.is_empty() && host.parse::<IpAddr>().is_err()
}

fn parse_cert(data: &[u8]) -> Result<X509> {
    X509::from_pem(data)
        .or_else(|_| X509::from_der(data))
        .map_err(|e| TlsError::Certificate(format!("failed to parse client certificate: {}", e)))
}

fn parse_key(data: &[u8]) -> Result<PKey<Private>> {
    PKey::private_key_from_pem(data)
        .or_else(|_| PKey::private_key_from_der(data))
        .map_err(|e| TlsError::Certificate(format!("failed to parse client private key: {}", e)))
}

fn build_context(
    version: TlsVersion,
    verify_mode: VerifyMode,
    cipher_spec: Option<&str>,
    ca_file: Option<PathBuf>,
    identity: Option<&(X509, PKey<Private>)>,
) -> Result<SslContext> {
    let mut builder = SslContextBuilder::new(SslMethod::tls_client())?;

    // Pin both bounds; Auto leaves the library's range untouched
    if let Some(pinned) = version.to_openssl_version() {
        builder.set_min_proto_version(Some(pinned))?;
        builder.set_max_proto_version(Some(pinned))?;
    }

    builder.set_options(SslOptions::ALL);
    builder.set_mode(
        SslMode::AUTO_RETRY | SslMode::ACCEPT_MOVING_WRITE_BUFFER | SslMode::ENABLE_PARTIAL_WRITE,
    );
    builder.set_verify(verify_mode.to_openssl_mode());

    builder.set_default_verify_paths()?;
    if let Some(path) = ca_file {
        builder.set_ca_file(&path)?;
    }

    match cipher_spec {
        Some(spec) => builder.set_cipher_list(spec)?,
        // Legacy pins are refused at the default security level
        None if is_legacy(version) => {
            builder.set_cipher_list("DEFAULT:@SECLEVEL=0")?
        }
        None => {}
    }

    if let Some((cert, key)) = identity {
        builder.set_certificate(cert)?;
        builder.set_private_key(key)?;
        builder
            .check_private_key()
            .map_err(|e| TlsError::Certificate(format!("client key does not match certificate: {}", e)))?;
    }

    Ok(builder.build())
}

fn is_legacy(version: TlsVersion) -> bool {
    matches!(version, TlsVersion::Ssl3 | TlsVersion::Tls10 | TlsVersion::Tls11)
}
