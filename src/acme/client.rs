//! Client seam to the ACME certificate authority.
//!
//! The protocol library is an external collaborator: the engine drives
//! sessions, registrations, authorizations, challenges and certificate
//! orders through these traits and never speaks the wire protocol itself.
//! Implementations are injected at construction, the same way the
//! surrounding server injects DNS providers.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;

/// Factory for authenticated CA sessions.
#[async_trait]
pub trait AcmeProvider: Send + Sync {
    /// Open a session against the CA directory at `provider_url`,
    /// authenticated with the PEM-encoded account keypair.
    async fn connect(&self, provider_url: &str, account_key_pem: &str)
        -> Result<Arc<dyn AcmeSession>>;
}

/// Result of attempting to create a registration.
///
/// A CA that already knows the account keypair answers with the location
/// of the existing registration; that is a recoverable outcome, not an
/// error.
pub enum CreateRegistration {
    Created(Arc<dyn AcmeRegistration>),
    Conflict { location: String },
}

/// An authenticated client-side context bound to one account keypair and
/// provider URL.
#[async_trait]
pub trait AcmeSession: Send + Sync {
    /// Create a new registration with the given contact URIs.
    async fn create_registration(&self, contact_uris: &[String]) -> Result<CreateRegistration>;

    /// Bind to an existing registration at a known location URI.
    async fn bind_registration(&self, location: &str) -> Result<Arc<dyn AcmeRegistration>>;
}

/// The persistent account record at the CA.
#[async_trait]
pub trait AcmeRegistration: Send + Sync {
    /// Absolute URI of this registration at the CA.
    fn location(&self) -> String;

    /// Contact URIs the CA currently has on file.
    async fn contact_uris(&self) -> Result<Vec<String>>;

    /// Replace the contact URIs and accept the agreement at `agreement_url`.
    async fn update(&self, contact_uris: &[String], agreement_url: &str) -> Result<()>;

    /// All authorizations that exist for this registration.
    async fn authorizations(&self) -> Result<Vec<Arc<dyn AcmeAuthorization>>>;

    /// Request a new authorization for a domain.
    async fn authorize_domain(&self, domain: &str) -> Result<Arc<dyn AcmeAuthorization>>;

    /// Submit a CSR (DER). `Ok(None)` means the order is not ready yet and
    /// the caller should poll again.
    async fn request_certificate(&self, csr_der: &[u8])
        -> Result<Option<Arc<dyn AcmeCertificateOrder>>>;
}

/// Status of an authorization or challenge, as reported by the CA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcmeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
}

impl AcmeStatus {
    /// Whether the CA will not change this status anymore.
    pub fn is_terminal(self) -> bool {
        matches!(self, AcmeStatus::Valid | AcmeStatus::Invalid)
    }
}

impl fmt::Display for AcmeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AcmeStatus::Pending => "pending",
            AcmeStatus::Processing => "processing",
            AcmeStatus::Valid => "valid",
            AcmeStatus::Invalid => "invalid",
        };
        f.write_str(name)
    }
}

/// Proof-of-control task types this engine can complete, with the
/// CA-supplied parameters needed to build the challenge certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeKind {
    /// tls-sni-01: serve a self-signed certificate for `subject`.
    TlsSni01 { subject: String },
    /// tls-sni-02: serve a self-signed certificate for both names.
    TlsSni02 { subject: String, san_b: String },
    /// A challenge type this engine does not support.
    Other(String),
}

impl ChallengeKind {
    pub fn type_name(&self) -> &str {
        match self {
            ChallengeKind::TlsSni01 { .. } => "tls-sni-01",
            ChallengeKind::TlsSni02 { .. } => "tls-sni-02",
            ChallengeKind::Other(name) => name,
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, ChallengeKind::Other(_))
    }
}

/// A CA-issued token asserting the client may request certificates for a
/// domain, gated by one or more challenges.
#[async_trait]
pub trait AcmeAuthorization: Send + Sync {
    fn domain(&self) -> String;

    async fn status(&self) -> Result<AcmeStatus>;

    /// Acceptable challenge combinations; completing every challenge of
    /// one combination satisfies the authorization.
    async fn combinations(&self) -> Result<Vec<Vec<Arc<dyn AcmeChallenge>>>>;
}

/// A single proof-of-control task.
#[async_trait]
pub trait AcmeChallenge: Send + Sync {
    fn kind(&self) -> ChallengeKind;

    /// Tell the CA the challenge response is in place.
    async fn trigger(&self) -> Result<()>;

    /// Refresh and report the current status. A server-supplied retry hint
    /// surfaces as [`crate::AcmeError::RetryAfter`].
    async fn poll(&self) -> Result<AcmeStatus>;
}

/// An issued (or issuing) certificate at the CA.
#[async_trait]
pub trait AcmeCertificateOrder: Send + Sync {
    /// Download the end-entity certificate (PEM). `Ok(None)` means the CA
    /// is still issuing.
    async fn download_certificate(&self) -> Result<Option<String>>;

    /// Download the intermediate chain (PEM, one certificate per entry).
    async fn download_chain(&self) -> Result<Option<Vec<String>>>;
}
