//! Protocol version capability table
//!
//! Resolves a requested version against the versions the linked OpenSSL
//! can actually speak. The host table is computed once per process; the
//! check runs before any network interaction so a misconfigured socket
//! never touches its transport.

use super::config::TlsVersion;
use super::error::TlsError;
use std::collections::BTreeSet;
use std::sync::OnceLock;

/// OpenSSL 1.1.1, the first release with TLS 1.3
const OPENSSL_1_1_1: i64 = 0x1010_1000;

/// Set of protocol versions a TLS library supports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    versions: BTreeSet<TlsVersion>,
}

impl Capabilities {
    /// Capabilities of the OpenSSL linked into this process
    pub fn host() -> &'static Capabilities {
        static HOST: OnceLock<Capabilities> = OnceLock::new();
        HOST.get_or_init(|| Capabilities::for_openssl_version(openssl::version::number()))
    }

    /// Derive the table from an `OPENSSL_VERSION_NUMBER` value.
    ///
    /// Building the crate takes OpenSSL 1.1.1 or newer (`SslVersion::TLS1_3`),
    /// so the host table always has TLS 1.3 and never SSLv3 or SSLv2. Older
    /// numbers only describe other deployments.
    pub fn for_openssl_version(number: i64) -> Self {
        let versions = TlsVersion::ALL.into_iter().filter(|version| match version {
            TlsVersion::Auto | TlsVersion::Tls10 | TlsVersion::Tls11 | TlsVersion::Tls12 => true,
            TlsVersion::Ssl2 | TlsVersion::Ssl3 => false,
            TlsVersion::Tls13 => number >= OPENSSL_1_1_1,
        });
        Capabilities::from_versions(versions)
    }

    /// Build an explicit table. `Auto` is always included.
    pub fn from_versions<I: IntoIterator<Item = TlsVersion>>(versions: I) -> Self {
        let mut versions: BTreeSet<TlsVersion> = versions.into_iter().collect();
        versions.insert(TlsVersion::Auto);
        Capabilities { versions }
    }

    /// Whether `version` is available
    pub fn supports(&self, version: TlsVersion) -> bool {
        self.versions.contains(&version)
    }

    /// Supported versions in ascending order, `Auto` first
    pub fn versions(&self) -> impl Iterator<Item = TlsVersion> + '_ {
        self.versions.iter().copied()
    }

    /// Translate a requested version into a canonical, supported one
    pub fn resolve(&self, requested: TlsVersion) -> Result<TlsVersion, TlsError> {
        if self.supports(requested) {
            Ok(requested)
        } else {
            Err(TlsError::Configuration(format!(
                "{} is not supported by the linked TLS library",
                requested
            )))
        }
    }

    /// Parse a version token and resolve it
    pub fn resolve_str(&self, requested: &str) -> Result<TlsVersion, TlsError> {
        self.resolve(requested.parse()?)
    }
}
