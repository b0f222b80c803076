//! Shared loopback fixtures for integration tests
//!
//! Each helper spawns a one-shot OpenSSL server thread on 127.0.0.1 and
//! hands the accepted TLS stream to a closure.

#![allow(dead_code)]

use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::ssl::{Ssl, SslContext, SslContextBuilder, SslMethod, SslStream, SslVerifyMode, SslVersion};
use openssl::x509::extension::{BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName};
use openssl::x509::{X509NameBuilder, X509};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread::{self, JoinHandle};

/// Self-signed `example.com` certificate followed by its RSA key
pub const BUILTIN_CERT: &str = include_str!("../data/example_com.pem");

/// Parse the bundled certificate and key
pub fn builtin_identity() -> (X509, PKey<Private>) {
    let cert = X509::from_pem(BUILTIN_CERT.as_bytes()).unwrap();
    let key = PKey::private_key_from_pem(BUILTIN_CERT.as_bytes()).unwrap();
    (cert, key)
}

/// Server context presenting `cert`/`key`, optionally pinned to a version
pub fn server_context(
    cert: &X509,
    key: &PKey<Private>,
    version: Option<SslVersion>,
    require_client_cert: bool,
) -> SslContext {
    let mut builder = SslContextBuilder::new(SslMethod::tls_server()).unwrap();
    builder.set_certificate(cert).unwrap();
    builder.set_private_key(key).unwrap();

    if let Some(version) = version {
        builder.set_min_proto_version(Some(version)).unwrap();
        builder.set_max_proto_version(Some(version)).unwrap();
    }

    if require_client_cert {
        // Accept any client identity; the test inspects what arrived
        builder.set_verify_callback(
            SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT,
            |_, _| true,
        );
    }

    builder.build()
}

/// Server context with the bundled self-signed certificate
pub fn builtin_server_context(version: Option<SslVersion>) -> SslContext {
    let (cert, key) = builtin_identity();
    server_context(&cert, &key, version, false)
}

/// Accept one TLS connection and run `handler` on it.
///
/// A failed server-side handshake is not a test failure by itself; the
/// handler is simply skipped and `None` is returned from the join handle.
pub fn spawn_tls_server<F, R>(ctx: SslContext, handler: F) -> (SocketAddr, JoinHandle<Option<R>>)
where
    F: FnOnce(SslStream<TcpStream>) -> R + Send + 'static,
    R: Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = thread::spawn(move || {
        let (tcp_stream, _) = listener.accept().unwrap();
        let ssl = Ssl::new(&ctx).unwrap();
        ssl.accept(tcp_stream).ok().map(handler)
    });

    (addr, handle)
}

/// Accept one TCP connection and run `handler` on the plain stream
pub fn spawn_tcp_server<F>(handler: F) -> SocketAddr
where
    F: FnOnce(TcpStream) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    thread::spawn(move || {
        if let Ok((tcp_stream, _)) = listener.accept() {
            handler(tcp_stream);
        }
    });

    addr
}

fn ec_key() -> PKey<Private> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap()
}

fn build_cert(
    cn: &str,
    serial: u32,
    key: &PKey<Private>,
    issuer: Option<(&X509, &PKey<Private>)>,
) -> X509 {
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_nid(Nid::COMMONNAME, cn).unwrap();
    let name = name.build();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    let serial = BigNum::from_u32(serial).unwrap().to_asn1_integer().unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_pubkey(key).unwrap();
    builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
    builder.set_not_after(&Asn1Time::days_from_now(30).unwrap()).unwrap();

    let signer = match issuer {
        None => {
            builder.set_issuer_name(&name).unwrap();
            builder
                .append_extension(BasicConstraints::new().critical().ca().build().unwrap())
                .unwrap();
            builder
                .append_extension(KeyUsage::new().critical().key_cert_sign().crl_sign().build().unwrap())
                .unwrap();
            key
        }
        Some((ca_cert, ca_key)) => {
            builder.set_issuer_name(ca_cert.subject_name()).unwrap();
            builder.append_extension(BasicConstraints::new().build().unwrap()).unwrap();
            builder
                .append_extension(
                    KeyUsage::new()
                        .critical()
                        .digital_signature()
                        .key_encipherment()
                        .build()
                        .unwrap(),
                )
                .unwrap();
            builder
                .append_extension(ExtendedKeyUsage::new().server_auth().build().unwrap())
                .unwrap();
            let san = SubjectAlternativeName::new()
                .dns("localhost")
                .ip("127.0.0.1")
                .build(&builder.x509v3_context(Some(&**ca_cert), None))
                .unwrap();
            builder.append_extension(san).unwrap();
            ca_key
        }
    };

    builder.sign(signer, MessageDigest::sha256()).unwrap();
    builder.build()
}

/// A private CA and a `localhost` leaf it signed
pub struct TestPki {
    pub ca_cert: X509,
    pub leaf_cert: X509,
    pub leaf_key: PKey<Private>,
}

impl TestPki {
    pub fn generate() -> Self {
        let ca_key = ec_key();
        let ca_cert = build_cert("tlsock test CA", 1, &ca_key, None);
        let leaf_key = ec_key();
        let leaf_cert = build_cert("localhost", 2, &leaf_key, Some((&ca_cert, &ca_key)));
        TestPki {
            ca_cert,
            leaf_cert,
            leaf_key,
        }
    }
}
