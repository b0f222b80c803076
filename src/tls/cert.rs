//! Certificate summaries
//!
//! Readable projections of the X.509 certificates seen during a handshake.

use openssl::nid::Nid;
use openssl::x509::{X509NameRef, X509Ref};
use std::net::{Ipv4Addr, Ipv6Addr};

/// Summary of one peer or chain certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertInfo {
    /// Subject CN, `<undef>` when absent
    pub subject: String,
    /// Issuer CN, `<undef>` when absent
    pub issuer: String,
    /// `DNS:` and `IP:` entries of the SAN extension
    pub subject_alt_names: Vec<String>,
    /// Serial number, upper-case hex
    pub serial: String,
    pub not_before: String,
    pub not_after: String,
}

impl CertInfo {
    pub fn from_x509(cert: &X509Ref) -> Self {
        CertInfo {
            subject: common_name(cert.subject_name()),
            issuer: common_name(cert.issuer_name()),
            subject_alt_names: subject_alt_names(cert),
            serial: cert
                .serial_number()
                .to_bn()
                .and_then(|bn| bn.to_hex_str().map(|hex| hex.to_string()))
                .unwrap_or_default(),
            not_before: cert.not_before().to_string(),
            not_after: cert.not_after().to_string(),
        }
    }

    /// Whether `host` appears among the DNS names, exactly or under a
    /// single-label wildcard
    pub fn names_host(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.subject_alt_names
            .iter()
            .filter_map(|san| san.strip_prefix("DNS:"))
            .any(|name| {
                let name = name.to_ascii_lowercase();
                match name.strip_prefix("*.") {
                    Some(suffix) => host
                        .split_once('.')
                        .is_some_and(|(label, rest)| !label.is_empty() && rest == suffix),
                    None => name == host,
                }
            })
    }

    /// Whether subject and issuer are the same name
    pub fn is_self_issued(&self) -> bool {
        self.subject == self.issuer
    }
}

fn common_name(name: &X509NameRef) -> String {
    match name.entries_by_nid(Nid::COMMONNAME).next() {
        Some(entry) => match entry.data().as_utf8() {
            Ok(cn) => cn.to_string(),
            Err(_) => "<undef>".to_string(),
        },
        None => "<undef>".to_string(),
    }
}

fn subject_alt_names(cert: &X509Ref) -> Vec<String> {
    let Some(sans) = cert.subject_alt_names() else {
        return Vec::new();
    };

    sans.iter()
        .filter_map(|name| {
            if let Some(host) = name.dnsname() {
                return Some(format!("DNS:{}", host));
            }
            match name.ipaddress()? {
                &[a, b, c, d] => Some(format!("IP:{}", Ipv4Addr::new(a, b, c, d))),
                ip if ip.len() == 16 => {
                    let mut octets = [0u8; 16];
                    octets.copy_from_slice(ip);
                    Some(format!("IP:{}", Ipv6Addr::from(octets)))
                }
                _ => None,
            }
        })
        .collect()
}
