//! Peer trust accessors
//!
//! Read-only projections of an established session: negotiated version and
//! cipher, peer certificate and chain, the client identity in use, and the
//! verification outcome recorded during the handshake. The snapshot is taken
//! once, when the handshake completes, and never changes afterwards.

use super::cert::CertInfo;
use super::config::TlsVersion;
use openssl::pkey::{PKey, Private};
use openssl::ssl::{NameType, SslRef};
use openssl::x509::{X509VerifyResult, X509};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

const UNSET: u8 = 0;
const VALID: u8 = 1;
const INVALID: u8 = 2;

/// Result of peer certificate verification for one handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerificationOutcome {
    /// No certificate was judged (e.g. anonymous cipher)
    #[default]
    Unknown,
    Valid,
    Invalid,
}

impl VerificationOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, VerificationOutcome::Valid)
    }
}

/// Collects verify-callback verdicts while a handshake runs.
///
/// Shared with the callback installed on the `Ssl`; every certificate in
/// the chain reports once and a single failure makes the outcome invalid.
#[derive(Debug, Clone, Default)]
pub(crate) struct VerifyRecorder {
    state: Arc<AtomicU8>,
}

impl VerifyRecorder {
    pub(crate) fn record(&self, valid: bool) {
        if valid {
            let _ = self
                .state
                .compare_exchange(UNSET, VALID, Ordering::AcqRel, Ordering::Acquire);
        } else {
            self.state.store(INVALID, Ordering::Release);
        }
    }

    pub(crate) fn outcome(&self) -> VerificationOutcome {
        match self.state.load(Ordering::Acquire) {
            VALID => VerificationOutcome::Valid,
            INVALID => VerificationOutcome::Invalid,
            _ => VerificationOutcome::Unknown,
        }
    }
}

/// Negotiated cipher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherInfo {
    /// OpenSSL cipher name, e.g. `ECDHE-RSA-AES256-GCM-SHA384`
    pub name: String,
    /// Protocol version the cipher was defined for
    pub version: String,
    /// Secret key bits
    pub bits: i32,
}

/// Session metadata captured at handshake completion
#[derive(Clone)]
pub struct PeerTrust {
    version: Option<TlsVersion>,
    cipher: Option<CipherInfo>,
    servername: Option<String>,
    peer_cert: Option<X509>,
    peer_chain: Vec<X509>,
    verification: VerificationOutcome,
    client_cert: Option<X509>,
    client_key: Option<PKey<Private>>,
}

impl PeerTrust {
    /// Snapshot an established `Ssl`.
    ///
    /// If the verify callback never ran, the library's own verify result
    /// decides, provided a peer certificate was presented.
    pub(crate) fn capture(
        ssl: &SslRef,
        recorded: VerificationOutcome,
        client_cert: Option<X509>,
        client_key: Option<PKey<Private>>,
    ) -> Self {
        let peer_cert = ssl.peer_certificate();

        let verification = match recorded {
            VerificationOutcome::Unknown if peer_cert.is_some() => {
                if ssl.verify_result() == X509VerifyResult::OK {
                    VerificationOutcome::Valid
                } else {
                    VerificationOutcome::Invalid
                }
            }
            other => other,
        };

        PeerTrust {
            version: ssl.version_str().parse().ok(),
            cipher: ssl.current_cipher().map(|c| CipherInfo {
                name: c.name().to_string(),
                version: c.version().to_string(),
                bits: c.bits().secret,
            }),
            servername: ssl.servername(NameType::HOST_NAME).map(|s| s.to_string()),
            peer_chain: ssl
                .peer_cert_chain()
                .map(|chain| chain.iter().map(|c| c.to_owned()).collect())
                .unwrap_or_default(),
            peer_cert,
            verification,
            client_cert,
            client_key,
        }
    }

    /// Negotiated protocol version
    pub fn version(&self) -> Option<TlsVersion> {
        self.version
    }

    pub fn cipher(&self) -> Option<&CipherInfo> {
        self.cipher.as_ref()
    }

    /// SNI name sent during the handshake
    pub fn servername(&self) -> Option<&str> {
        self.servername.as_deref()
    }

    pub fn peer_cert(&self) -> Option<&X509> {
        self.peer_cert.as_ref()
    }

    /// Chain as sent by the peer (leaf first on the client side)
    pub fn peer_cert_chain(&self) -> &[X509] {
        &self.peer_chain
    }

    pub fn verification(&self) -> VerificationOutcome {
        self.verification
    }

    /// Whether the peer certificate passed verification
    pub fn peer_verified(&self) -> bool {
        self.verification.is_valid()
    }

    pub fn client_cert(&self) -> Option<&X509> {
        self.client_cert.as_ref()
    }

    pub fn client_key(&self) -> Option<&PKey<Private>> {
        self.client_key.as_ref()
    }

    /// Summary of the peer certificate
    pub fn peer_cert_info(&self) -> Option<CertInfo> {
        self.peer_cert.as_deref().map(CertInfo::from_x509)
    }

    /// Summaries of the peer chain
    pub fn peer_chain_info(&self) -> Vec<CertInfo> {
        self.peer_chain.iter().map(|c| CertInfo::from_x509(c)).collect()
    }
}

impl std::fmt::Debug for PeerTrust {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerTrust")
            .field("version", &self.version)
            .field("cipher", &self.cipher)
            .field("servername", &self.servername)
            .field("peer_cert", &self.peer_cert_info())
            .field("peer_chain_len", &self.peer_chain.len())
            .field("verification", &self.verification)
            .field("client_cert", &self.client_cert.is_some())
            .finish()
    }
}
