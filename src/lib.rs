//! Automated TLS certificate lifecycle management for rustls servers.
//!
//! `dyncert` obtains, renews and hot-swaps X.509 server certificates from
//! an ACME certificate authority and exposes a live certificate store that
//! the TLS stack consults on every handshake to select a certificate by
//! SNI hostname.
//!
//! The two halves are tightly coupled: the lifecycle engine
//! ([`AcmeManager`]) produces certificates, and the dynamic store
//! ([`CertStore`]) atomically publishes them to running listeners. The
//! store implements `rustls::server::ResolvesServerCert`, so wiring it
//! into a `rustls::ServerConfig` is all a server needs:
//!
//! ```rust,ignore
//! let store = Arc::new(CertStore::new());
//! let tls_config = rustls::ServerConfig::builder()
//!     .with_no_client_auth()
//!     .with_cert_resolver(store.clone());
//!
//! let manager = AcmeManager::new(store, "/var/lib/certs", provider);
//! manager.start_with(conf).await?;
//! ```
//!
//! The ACME protocol client itself is pluggable: implementations of the
//! traits in [`acme::client`] are injected at construction.

pub mod acme;
pub mod config;
pub mod error;
pub mod observability;
pub mod tls;

pub use acme::client::{
    AcmeAuthorization, AcmeCertificateOrder, AcmeChallenge, AcmeProvider, AcmeRegistration,
    AcmeSession, AcmeStatus, ChallengeKind, CreateRegistration,
};
pub use acme::manager::AcmeManager;
pub use config::{Account, AcmeConfig, Certificate};
pub use error::{AcmeError, Result};
pub use tls::store::{CertEntry, CertStore, KeystoreSnapshot};
