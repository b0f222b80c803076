//! TLS parameters
//!
//! This module provides the client-side parameter set consumed by the
//! negotiator: version, client certificate pair, verify-mode, cipher spec,
//! handshake deadline and peer hostname.

use super::error::TlsError;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Default handshake deadline
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TlsVersion {
    /// Negotiate the highest version both ends support
    Auto,
    /// SSL 2.0 (never available with a modern OpenSSL)
    Ssl2,
    /// SSL 3.0 (deprecated, rarely compiled in)
    Ssl3,
    /// TLS 1.0
    Tls10,
    /// TLS 1.1
    Tls11,
    /// TLS 1.2
    Tls12,
    /// TLS 1.3
    Tls13,
}

impl TlsVersion {
    /// Every canonical version, `Auto` first
    pub const ALL: [TlsVersion; 7] = [
        TlsVersion::Auto,
        TlsVersion::Ssl2,
        TlsVersion::Ssl3,
        TlsVersion::Tls10,
        TlsVersion::Tls11,
        TlsVersion::Tls12,
        TlsVersion::Tls13,
    ];

    /// Get OpenSSL protocol version constant.
    ///
    /// `Auto` has no pinned version; neither does SSLv2, which OpenSSL
    /// cannot express any more.
    pub fn to_openssl_version(&self) -> Option<openssl::ssl::SslVersion> {
        use openssl::ssl::SslVersion;
        match self {
            TlsVersion::Auto | TlsVersion::Ssl2 => None,
            TlsVersion::Ssl3 => Some(SslVersion::SSL3),
            TlsVersion::Tls10 => Some(SslVersion::TLS1),
            TlsVersion::Tls11 => Some(SslVersion::TLS1_1),
            TlsVersion::Tls12 => Some(SslVersion::TLS1_2),
            TlsVersion::Tls13 => Some(SslVersion::TLS1_3),
        }
    }

    /// Get version as string
    pub fn as_str(&self) -> &'static str {
        match self {
            TlsVersion::Auto => "Auto",
            TlsVersion::Ssl2 => "SSLv2",
            TlsVersion::Ssl3 => "SSLv3",
            TlsVersion::Tls10 => "TLSv1.0",
            TlsVersion::Tls11 => "TLSv1.1",
            TlsVersion::Tls12 => "TLSv1.2",
            TlsVersion::Tls13 => "TLSv1.3",
        }
    }
}

impl FromStr for TlsVersion {
    type Err = TlsError;

    /// Parse a version token (case-insensitive).
    ///
    /// `Auto`, `TLS` and `SSL23` are legacy spellings of auto-negotiation.
    /// OpenSSL's own names (`TLSv1`, `TLSv1.2`, ...) are accepted too.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let token = match upper.strip_prefix("TLSV") {
            Some(rest) => format!("TLS{}", rest),
            None => match upper.strip_prefix("SSLV") {
                Some(rest) => format!("SSL{}", rest),
                None => upper,
            },
        };

        match token.as_str() {
            "AUTO" | "TLS" | "SSL23" => Ok(TlsVersion::Auto),
            "SSL2" => Ok(TlsVersion::Ssl2),
            "SSL3" => Ok(TlsVersion::Ssl3),
            "TLS1" | "TLS1.0" => Ok(TlsVersion::Tls10),
            "TLS1.1" => Ok(TlsVersion::Tls11),
            "TLS1.2" => Ok(TlsVersion::Tls12),
            "TLS1.3" => Ok(TlsVersion::Tls13),
            _ => Err(TlsError::InvalidVersion(s.to_string())),
        }
    }
}

impl std::fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Peer certificate verification mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerifyMode {
    /// Don't ask OpenSSL to enforce anything
    None,
    /// Verify the peer certificate
    #[default]
    Peer,
    /// Verify once per connection (no re-check on renegotiation)
    PeerOnce,
    /// Verify, and treat a missing peer certificate as a failure
    FailIfNoPeerCert,
}

impl VerifyMode {
    /// Get OpenSSL verify mode.
    ///
    /// "Once" only affects server-side renegotiation, so a client maps it
    /// to plain `PEER`.
    pub fn to_openssl_mode(&self) -> openssl::ssl::SslVerifyMode {
        use openssl::ssl::SslVerifyMode;
        match self {
            VerifyMode::None => SslVerifyMode::NONE,
            VerifyMode::Peer | VerifyMode::PeerOnce => SslVerifyMode::PEER,
            VerifyMode::FailIfNoPeerCert => {
                SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VerifyMode::None => "none",
            VerifyMode::Peer => "peer",
            VerifyMode::PeerOnce => "peer-once",
            VerifyMode::FailIfNoPeerCert => "fail-if-no-peer-cert",
        }
    }
}

impl FromStr for VerifyMode {
    type Err = TlsError;

    /// Accepts `none`, `peer`, `peer-once`, `fail-if-no-peer-cert` and the
    /// OpenSSL constant names (`VERIFY_PEER`, `VERIFY_CLIENT_ONCE`, ...).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase().replace('_', "-");
        let token = lower.strip_prefix("verify-").unwrap_or(&lower);

        match token {
            "none" => Ok(VerifyMode::None),
            "peer" => Ok(VerifyMode::Peer),
            "peer-once" | "client-once" => Ok(VerifyMode::PeerOnce),
            "fail-if-no-peer-cert" => Ok(VerifyMode::FailIfNoPeerCert),
            _ => Err(TlsError::Configuration(format!("unknown verify mode: {}", s))),
        }
    }
}

/// TLS parameters (immutable after building)
#[derive(Debug, Clone)]
pub struct TlsParameters {
    pub(crate) version: TlsVersion,
    pub(crate) client_cert: Option<Vec<u8>>,
    pub(crate) client_key: Option<Vec<u8>>,
    pub(crate) verify_mode: VerifyMode,
    pub(crate) cipher_spec: Option<String>,
    pub(crate) timeout: Duration,
    pub(crate) peer_host: Option<String>,
    pub(crate) ca_file: Option<PathBuf>,
    pub(crate) nonblocking: bool,
}

impl Default for TlsParameters {
    fn default() -> Self {
        TlsParameters {
            version: TlsVersion::Auto,
            client_cert: None,
            client_key: None,
            verify_mode: VerifyMode::Peer,
            cipher_spec: None,
            timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            peer_host: None,
            ca_file: None,
            nonblocking: false,
        }
    }
}

impl TlsParameters {
    /// Create a new parameter builder
    pub fn builder() -> TlsParametersBuilder {
        TlsParametersBuilder::new()
    }

    /// Build parameters from `(option, value)` pairs.
    ///
    /// Recognized options: `version`, `client_cert`, `client_key`,
    /// `verify_mode`, `cipher_spec`, `timeout` (seconds), `peer_host`,
    /// `ca_file`, `nonblocking`. Certificate and key values are inline PEM
    /// if they contain a PEM armor line, otherwise a file path.
    pub fn from_options<I, K, V>(options: I) -> Result<Self, TlsError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut builder = TlsParametersBuilder::new();

        for (key, value) in options {
            let value = value.as_ref();
            builder = match key.as_ref() {
                "version" => builder.version(value.parse()?),
                "client_cert" => match inline_pem(value) {
                    Some(pem) => builder.client_cert(pem),
                    None => builder.client_cert_file(value)?,
                },
                "client_key" => match inline_pem(value) {
                    Some(pem) => builder.client_key(pem),
                    None => builder.client_key_file(value)?,
                },
                "verify_mode" => builder.verify_mode(value.parse()?),
                "cipher_spec" => builder.cipher_spec(value),
                "timeout" => builder.timeout(parse_seconds(value)?),
                "peer_host" => builder.peer_host(value),
                "ca_file" => builder.ca_file(value),
                "nonblocking" => builder.nonblocking(parse_bool(value)?),
                other => {
                    return Err(TlsError::Configuration(format!("unknown option: {}", other)));
                }
            };
        }

        builder.build()
    }

    /// Requested protocol version
    pub fn version(&self) -> TlsVersion {
        self.version
    }

    /// Client certificate material (PEM or DER)
    pub fn client_cert(&self) -> Option<&[u8]> {
        self.client_cert.as_deref()
    }

    /// Client private key material (PEM or DER)
    pub fn client_key(&self) -> Option<&[u8]> {
        self.client_key.as_deref()
    }

    pub fn verify_mode(&self) -> VerifyMode {
        self.verify_mode
    }

    pub fn cipher_spec(&self) -> Option<&str> {
        self.cipher_spec.as_deref()
    }

    /// Handshake deadline
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn peer_host(&self) -> Option<&str> {
        self.peer_host.as_deref()
    }

    pub fn ca_file(&self) -> Option<&Path> {
        self.ca_file.as_deref()
    }

    /// Whether the nonblocking retry path is enabled for this socket
    pub fn nonblocking(&self) -> bool {
        self.nonblocking
    }
}

/// Parameter builder
#[derive(Debug, Default)]
pub struct TlsParametersBuilder {
    params: TlsParameters,
}

impl TlsParametersBuilder {
    fn new() -> Self {
        TlsParametersBuilder {
            params: TlsParameters::default(),
        }
    }

    /// Set the requested protocol version
    pub fn version(mut self, version: TlsVersion) -> Self {
        self.params.version = version;
        self
    }

    /// Set client certificate (PEM or DER bytes)
    pub fn client_cert(mut self, cert: impl Into<Vec<u8>>) -> Self {
        self.params.client_cert = Some(cert.into());
        self
    }

    /// Set client private key (PEM or DER bytes)
    pub fn client_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.params.client_key = Some(key.into());
        self
    }

    /// Load client certificate from file
    pub fn client_cert_file<P: AsRef<Path>>(self, path: P) -> Result<Self, TlsError> {
        let cert = read_file(path.as_ref())?;
        Ok(self.client_cert(cert))
    }

    /// Load client private key from file
    pub fn client_key_file<P: AsRef<Path>>(self, path: P) -> Result<Self, TlsError> {
        let key = read_file(path.as_ref())?;
        Ok(self.client_key(key))
    }

    pub fn verify_mode(mut self, mode: VerifyMode) -> Self {
        self.params.verify_mode = mode;
        self
    }

    /// Restrict negotiable ciphers (OpenSSL cipher list syntax)
    pub fn cipher_spec(mut self, spec: impl Into<String>) -> Self {
        self.params.cipher_spec = Some(spec.into());
        self
    }

    /// Set handshake deadline
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.params.timeout = timeout;
        self
    }

    /// Set peer hostname (sent as SNI unless it is an IP literal)
    pub fn peer_host(mut self, host: impl Into<String>) -> Self {
        self.params.peer_host = Some(host.into());
        self
    }

    /// Add a CA bundle used to judge the peer certificate
    pub fn ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.params.ca_file = Some(path.into());
        self
    }

    /// Enable the nonblocking retry path
    pub fn nonblocking(mut self, nonblocking: bool) -> Self {
        self.params.nonblocking = nonblocking;
        self
    }

    /// Build the parameters
    pub fn build(self) -> Result<TlsParameters, TlsError> {
        let params = self.params;

        match (&params.client_cert, &params.client_key) {
            (Some(_), None) => {
                return Err(TlsError::Configuration(
                    "client certificate given without a private key".to_string(),
                ));
            }
            (None, Some(_)) => {
                return Err(TlsError::Configuration(
                    "client private key given without a certificate".to_string(),
                ));
            }
            _ => {}
        }

        if params.timeout.is_zero() {
            return Err(TlsError::Configuration(
                "handshake timeout must be non-zero".to_string(),
            ));
        }

        Ok(params)
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, TlsError> {
    let mut data = Vec::new();
    File::open(path)?.read_to_end(&mut data)?;
    Ok(data)
}

fn inline_pem(value: &str) -> Option<Vec<u8>> {
    value
        .contains("-----BEGIN ")
        .then(|| value.as_bytes().to_vec())
}

fn parse_seconds(value: &str) -> Result<Duration, TlsError> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs > 0.0)
        .map(Duration::from_secs_f64)
        .ok_or_else(|| TlsError::Configuration(format!("invalid timeout: {}", value)))
}

fn parse_bool(value: &str) -> Result<bool, TlsError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(TlsError::Configuration(format!("invalid boolean: {}", value))),
    }
}
