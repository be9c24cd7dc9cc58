//! PEM and X.509 read-path utilities.
//!
//! Parses certificate chains and private keys into the DER types consumed
//! by the TLS engine and extracts the leaf metadata (DNS names, validity
//! window) the lifecycle engine decides on.

use std::io::BufReader;

use chrono::{DateTime, TimeZone, Utc};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

use crate::error::{AcmeError, Result};

/// Parse a PEM-encoded certificate chain, leaf first.
pub fn parse_certificates(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(pem.as_bytes());
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| AcmeError::Material(format!("failed to parse certificate PEM: {e}")))?;
    if certs.is_empty() {
        return Err(AcmeError::Material(
            "no certificates found in PEM data".to_string(),
        ));
    }
    Ok(certs)
}

/// Parse a PEM-encoded private key (PKCS#1, PKCS#8 or SEC1).
pub fn parse_private_key(pem: &str) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(pem.as_bytes());
    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(rustls_pemfile::Item::Pkcs1Key(key))) => {
                return Ok(PrivateKeyDer::Pkcs1(key))
            }
            Ok(Some(rustls_pemfile::Item::Pkcs8Key(key))) => {
                return Ok(PrivateKeyDer::Pkcs8(key))
            }
            Ok(Some(rustls_pemfile::Item::Sec1Key(key))) => {
                return Ok(PrivateKeyDer::Sec1(key))
            }
            Ok(Some(_)) => continue,
            Ok(None) => {
                return Err(AcmeError::Material(
                    "no private key found in PEM data".to_string(),
                ))
            }
            Err(e) => {
                return Err(AcmeError::Material(format!(
                    "failed to parse private key PEM: {e}"
                )))
            }
        }
    }
}

/// DNS names a certificate is valid for: its SAN DNS entries, or the
/// subject CN when the certificate carries no SAN extension.
pub fn dns_names(cert: &CertificateDer<'_>) -> Result<Vec<String>> {
    let (_, x509) = X509Certificate::from_der(cert.as_ref())
        .map_err(|e| AcmeError::Material(format!("failed to parse X.509 certificate: {e}")))?;

    let mut names = Vec::new();
    if let Ok(Some(san)) = x509.subject_alternative_name() {
        for name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                names.push(dns.to_string());
            }
        }
    }
    if names.is_empty() {
        if let Some(cn) = x509.subject().iter_common_name().next() {
            if let Ok(cn) = cn.as_str() {
                names.push(cn.to_string());
            }
        }
    }
    Ok(names)
}

/// Validity window (not-before, not-after) of a certificate.
pub fn cert_validity(cert: &CertificateDer<'_>) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let (_, x509) = X509Certificate::from_der(cert.as_ref())
        .map_err(|e| AcmeError::Material(format!("failed to parse X.509 certificate: {e}")))?;
    let validity = x509.validity();
    let not_before = asn1_to_utc(validity.not_before.timestamp())?;
    let not_after = asn1_to_utc(validity.not_after.timestamp())?;
    Ok((not_before, not_after))
}

fn asn1_to_utc(timestamp: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(timestamp, 0)
        .single()
        .ok_or_else(|| AcmeError::Material("certificate validity out of range".to_string()))
}
