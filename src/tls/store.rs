//! Dynamic certificate store.
//!
//! Holds the authoritative set of active certificate entries and publishes
//! an immutable keystore snapshot to the TLS engine on every mutation. The
//! store implements [`ResolvesServerCert`], so a `rustls::ServerConfig`
//! wired to it picks up installed and replaced certificates on the next
//! handshake without a restart.
//!
//! Mutations (`put`, `remove`, `set_default_alias`) are serialized by a
//! mutex; the snapshot is swapped in with a single atomic pointer store, so
//! concurrent handshakes see either the previous or the fully rebuilt
//! keystore, never a partial update.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use rustls::crypto::ring::sign::any_supported_type;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tracing::{debug, info};

use crate::error::{AcmeError, Result};
use crate::tls::pem;

/// Alias elected when no entry matches the configured default id.
const DUMMY_ALIAS: &str = "dummy";

/// One installed certificate: private key, leaf-first chain and the
/// prebuilt signing material handed to handshakes.
pub struct CertEntry {
    id: String,
    default_cert: bool,
    chain: Vec<CertificateDer<'static>>,
    dns_names: Vec<String>,
    certified: Arc<CertifiedKey>,
}

impl CertEntry {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_default(&self) -> bool {
        self.default_cert
    }

    /// The end-entity certificate (`chain[0]`).
    pub fn leaf(&self) -> &CertificateDer<'static> {
        &self.chain[0]
    }

    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    /// DNS names the leaf is valid for.
    pub fn dns_names(&self) -> &[String] {
        &self.dns_names
    }

    pub fn certified_key(&self) -> &Arc<CertifiedKey> {
        &self.certified
    }
}

impl fmt::Debug for CertEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertEntry")
            .field("id", &self.id)
            .field("default_cert", &self.default_cert)
            .field("dns_names", &self.dns_names)
            .finish_non_exhaustive()
    }
}

/// Immutable keystore published to the TLS engine.
pub struct KeystoreSnapshot {
    /// Every entry, ordered by id.
    aliases: BTreeMap<String, Arc<CertifiedKey>>,
    /// Exact DNS name to alias.
    exact: HashMap<String, String>,
    /// Wildcard SAN suffix ("example.com" for "*.example.com") to alias.
    wildcard: HashMap<String, String>,
    default_alias: String,
    default_key: Option<Arc<CertifiedKey>>,
}

impl KeystoreSnapshot {
    fn empty() -> Self {
        KeystoreSnapshot {
            aliases: BTreeMap::new(),
            exact: HashMap::new(),
            wildcard: HashMap::new(),
            default_alias: DUMMY_ALIAS.to_string(),
            default_key: None,
        }
    }

    /// The elected fallback alias, or `"dummy"` when none is configured.
    pub fn default_alias(&self) -> &str {
        &self.default_alias
    }

    /// Ids of all contained entries, in deterministic order.
    pub fn alias_ids(&self) -> Vec<&str> {
        self.aliases.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }

    /// Select the certificate for an SNI name: exact match, then wildcard
    /// match, then the default entry.
    pub fn select(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
        if let Some(name) = server_name {
            let name = name.trim().to_ascii_lowercase();
            if let Some(alias) = self.exact.get(&name) {
                return self.aliases.get(alias).cloned();
            }
            if let Some((_, parent)) = name.split_once('.') {
                if let Some(alias) = self.wildcard.get(parent) {
                    return self.aliases.get(alias).cloned();
                }
            }
        }
        self.default_key.clone()
    }
}

impl fmt::Debug for KeystoreSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeystoreSnapshot")
            .field("aliases", &self.alias_ids())
            .field("default_alias", &self.default_alias)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct StoreInner {
    entries: BTreeMap<String, Arc<CertEntry>>,
    default_id: Option<String>,
}

/// Thread-safe, mutable store of active certificates.
pub struct CertStore {
    inner: Mutex<StoreInner>,
    published: ArcSwap<KeystoreSnapshot>,
}

impl CertStore {
    pub fn new() -> Self {
        CertStore {
            inner: Mutex::new(StoreInner::default()),
            published: ArcSwap::from_pointee(KeystoreSnapshot::empty()),
        }
    }

    /// Insert or replace an entry from PEM-encoded material.
    ///
    /// The chain must be leaf-first; the key must match a supported signing
    /// algorithm. Malformed material is rejected before any mutation, so
    /// the published snapshot always stays consistent.
    pub fn put(&self, id: &str, default_cert: bool, key_pem: &str, chain_pem: &str) -> Result<()> {
        let chain = pem::parse_certificates(chain_pem)?;
        let key = pem::parse_private_key(key_pem)?;
        let signing_key = any_supported_type(&key)
            .map_err(|e| AcmeError::Material(format!("unusable private key: {e}")))?;
        let dns_names = pem::dns_names(&chain[0])?;
        let certified = Arc::new(CertifiedKey::new(chain.clone(), signing_key));
        let entry = Arc::new(CertEntry {
            id: id.to_string(),
            default_cert,
            chain,
            dns_names,
            certified,
        });

        let mut inner = self.inner.lock().expect("lock poisoned");
        let replaced = inner.entries.insert(id.to_string(), entry).is_some();
        if replaced {
            info!(id, "Replacing certificate");
        } else {
            info!(id, "Installing certificate");
        }
        self.publish(&inner);
        Ok(())
    }

    /// Remove an entry if present.
    pub fn remove(&self, id: &str) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        if inner.entries.remove(id).is_some() {
            info!(id, "Removing certificate");
        } else {
            info!(id, "Nothing to remove");
        }
        self.publish(&inner);
    }

    /// Read-only lookup of an installed entry.
    pub fn get(&self, id: &str) -> Option<Arc<CertEntry>> {
        self.inner
            .lock()
            .expect("lock poisoned")
            .entries
            .get(id)
            .cloned()
    }

    /// Elect which entry serves clients that send no SNI (or none).
    pub fn set_default_alias(&self, id: Option<String>) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.default_id = id;
        self.publish(&inner);
    }

    /// The currently published snapshot.
    pub fn snapshot(&self) -> Arc<KeystoreSnapshot> {
        self.published.load_full()
    }

    /// Rebuild the keystore from every current entry and swap it in.
    fn publish(&self, inner: &StoreInner) {
        let mut snapshot = KeystoreSnapshot::empty();
        for (id, entry) in &inner.entries {
            snapshot
                .aliases
                .insert(id.clone(), entry.certified.clone());
            for name in &entry.dns_names {
                let name = name.to_ascii_lowercase();
                if let Some(suffix) = name.strip_prefix("*.") {
                    snapshot
                        .wildcard
                        .entry(suffix.to_string())
                        .or_insert_with(|| id.clone());
                } else {
                    snapshot.exact.entry(name).or_insert_with(|| id.clone());
                }
            }
            if inner.default_id.as_deref() == Some(id.as_str()) {
                snapshot.default_alias = id.clone();
                snapshot.default_key = Some(entry.certified.clone());
            }
        }
        debug!(aliases = ?snapshot.alias_ids(), default = %snapshot.default_alias, "Reloading certificates");
        self.published.store(Arc::new(snapshot));
    }
}

impl Default for CertStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CertStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().expect("lock poisoned");
        f.debug_struct("CertStore")
            .field("entries", &inner.entries.keys().collect::<Vec<_>>())
            .field("default_id", &inner.default_id)
            .finish()
    }
}

impl ResolvesServerCert for CertStore {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.published.load().select(client_hello.server_name())
    }
}
