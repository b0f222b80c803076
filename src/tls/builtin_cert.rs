//! Self-signed identity for unit tests
//!
//! A certificate and RSA key (CN=example.com, SANs example.com and
//! *.example.com, valid until 2046). The PEM lives under `tests/data` and
//! is shared with the integration tests; it never ships in the library.

use openssl::pkey::{PKey, Private};
use openssl::x509::X509;

/// Certificate followed by its private key, both PEM
pub(crate) const BUILTIN_CERT: &str = include_str!("../../tests/data/example_com.pem");

/// Parse the bundled certificate and key
pub(crate) fn builtin_identity() -> Result<(X509, PKey<Private>), openssl::error::ErrorStack> {
    let cert = X509::from_pem(BUILTIN_CERT.as_bytes())?;
    let key = PKey::private_key_from_pem(BUILTIN_CERT.as_bytes())?;
    Ok((cert, key))
}

mod tests {
    use super::*;

    #[test]
    fn test_builtin_identity_matches() {
        let (cert, key) = builtin_identity().unwrap();
        assert!(key.rsa().is_ok());
        assert!(cert.public_key().unwrap().public_eq(&key));
    }
}
