//! Keypair, CSR and challenge-certificate generation.
//!
//! All write-path cryptography lives here: RSA keypairs for accounts,
//! certificates and challenges, the certificate signing request, and the
//! short-lived self-signed certificates that answer TLS-SNI challenges.

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::stack::Stack;
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::{X509, X509Builder, X509NameBuilder, X509ReqBuilder};
use tracing::info;

use crate::acme::db::CertDb;
use crate::error::{AcmeError, Result, ResultExt};

/// RSA key size used for account, certificate and challenge keypairs.
pub(crate) const DEFAULT_KEY_BITS: u32 = 4096;

/// Validity of the self-signed certificates answering TLS-SNI challenges.
const CHALLENGE_CERT_DAYS: u32 = 7;

pub(crate) type KeyPair = PKey<Private>;

fn material<E: std::fmt::Display>(e: E) -> AcmeError {
    AcmeError::Material(e.to_string())
}

/// Generate an RSA keypair without blocking the orchestrator.
pub(crate) async fn generate_keypair(bits: u32) -> Result<KeyPair> {
    tokio::task::spawn_blocking(move || generate_keypair_blocking(bits))
        .await
        .map_err(|e| AcmeError::Material(format!("keypair generation task failed: {e}")))?
}

pub(crate) fn generate_keypair_blocking(bits: u32) -> Result<KeyPair> {
    let rsa = Rsa::generate(bits).map_err(material)?;
    PKey::from_rsa(rsa).map_err(material)
}

pub(crate) fn keypair_to_pem(key: &KeyPair) -> Result<String> {
    let pem = key.private_key_to_pem_pkcs8().map_err(material)?;
    String::from_utf8(pem).map_err(material)
}

pub(crate) fn keypair_from_pem(pem: &str) -> Result<KeyPair> {
    PKey::private_key_from_pem(pem.as_bytes()).map_err(material)
}

/// Read a keypair from the database, or create and persist a fresh one.
pub(crate) async fn get_or_create_keypair(
    db: &CertDb,
    kind: &str,
    file_name: &str,
    bits: u32,
) -> Result<KeyPair> {
    if db
        .exists(file_name)
        .await
        .describe(format!("Keypair for {kind} file check"))?
    {
        let pem = db
            .read_string(file_name)
            .await
            .describe(format!("Keypair for {kind} file read"))?;
        let key = keypair_from_pem(&pem)?;
        info!(kind, file = file_name, "Existing keypair read");
        Ok(key)
    } else {
        info!(kind, "Creating new keypair");
        let key = generate_keypair(bits).await?;
        let pem = keypair_to_pem(&key)?;
        db.write(file_name, pem.as_bytes())
            .await
            .describe(format!("Keypair for {kind} file write"))?;
        info!(kind, file = file_name, "New keypair written");
        Ok(key)
    }
}

/// Build a certificate signing request covering every hostname.
///
/// The first hostname becomes the CN; all hostnames are added as DNS SANs.
/// Returns the request in DER (for the CA) and PEM (for auditing on disk).
pub(crate) fn build_csr(
    hostnames: &[String],
    organization: &str,
    key: &KeyPair,
) -> Result<(Vec<u8>, String)> {
    let first = hostnames
        .first()
        .ok_or_else(|| AcmeError::Material("CSR needs at least one hostname".to_string()))?;

    let mut name = X509NameBuilder::new().map_err(material)?;
    name.append_entry_by_nid(Nid::COMMONNAME, first)
        .map_err(material)?;
    if !organization.is_empty() {
        name.append_entry_by_nid(Nid::ORGANIZATIONNAME, organization)
            .map_err(material)?;
    }
    let name = name.build();

    let mut builder = X509ReqBuilder::new().map_err(material)?;
    builder.set_version(0).map_err(material)?;
    builder.set_subject_name(&name).map_err(material)?;
    builder.set_pubkey(key).map_err(material)?;

    let mut san = SubjectAlternativeName::new();
    for hostname in hostnames {
        san.dns(hostname);
    }
    let san = san
        .build(&builder.x509v3_context(None))
        .map_err(material)?;
    let mut extensions = Stack::new().map_err(material)?;
    extensions.push(san).map_err(material)?;
    builder.add_extensions(&extensions).map_err(material)?;

    builder
        .sign(key, MessageDigest::sha256())
        .map_err(material)?;
    let req = builder.build();
    let der = req.to_der().map_err(material)?;
    let pem = String::from_utf8(req.to_pem().map_err(material)?).map_err(material)?;
    Ok((der, pem))
}

/// Build a short-lived self-signed certificate for the given DNS names,
/// used to answer TLS-SNI challenges.
pub(crate) fn self_signed_certificate(
    key: &KeyPair,
    dns_names: &[String],
    valid_days: u32,
) -> Result<String> {
    let first = dns_names
        .first()
        .ok_or_else(|| AcmeError::Material("certificate needs at least one name".to_string()))?;

    let mut name = X509NameBuilder::new().map_err(material)?;
    name.append_entry_by_nid(Nid::COMMONNAME, first)
        .map_err(material)?;
    let name = name.build();

    let mut builder = X509Builder::new().map_err(material)?;
    builder.set_version(2).map_err(material)?;
    let mut serial = BigNum::new().map_err(material)?;
    serial
        .rand(159, MsbOption::MAYBE_ZERO, false)
        .map_err(material)?;
    builder
        .set_serial_number(serial.to_asn1_integer().map_err(material)?.as_ref())
        .map_err(material)?;
    builder.set_subject_name(&name).map_err(material)?;
    builder.set_issuer_name(&name).map_err(material)?;
    builder
        .set_not_before(Asn1Time::days_from_now(0).map_err(material)?.as_ref())
        .map_err(material)?;
    builder
        .set_not_after(Asn1Time::days_from_now(valid_days).map_err(material)?.as_ref())
        .map_err(material)?;
    builder.set_pubkey(key).map_err(material)?;

    let mut san = SubjectAlternativeName::new();
    for dns_name in dns_names {
        san.dns(dns_name);
    }
    let san = san
        .build(&builder.x509v3_context(None, None))
        .map_err(material)?;
    builder.append_extension(san).map_err(material)?;

    builder
        .sign(key, MessageDigest::sha256())
        .map_err(material)?;
    let pem = builder.build().to_pem().map_err(material)?;
    String::from_utf8(pem).map_err(material)
}

pub(crate) fn challenge_certificate(key: &KeyPair, dns_names: &[String]) -> Result<String> {
    self_signed_certificate(key, dns_names, CHALLENGE_CERT_DAYS)
}

/// Whether the keypair's public key matches the chain's leaf certificate.
pub(crate) fn keypair_matches_leaf(key_pem: &str, chain_pem: &str) -> Result<bool> {
    let certs = X509::stack_from_pem(chain_pem.as_bytes()).map_err(material)?;
    let leaf = certs
        .first()
        .ok_or_else(|| AcmeError::Material("no certificates found in PEM data".to_string()))?;
    let key = keypair_from_pem(key_pem)?;
    Ok(leaf.public_key().map_err(material)?.public_eq(&key))
}
