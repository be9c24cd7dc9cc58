//! Lifecycle of one configured certificate.
//!
//! Two passes mirror the reconciler's phases: `update_cached` loads
//! whatever usable material already exists (store, then disk) without
//! talking to the CA; `update_others` decides whether renewal is needed
//! and, if so, authorizes every hostname and obtains a fresh chain.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{info, warn};

use crate::acme::account::AuthorizationCache;
use crate::acme::challenge::ChallengeManager;
use crate::acme::client::AcmeRegistration;
use crate::acme::db::{
    CertDb, CERTIFICATE_CHAIN_FILE, CERTIFICATE_KEY_PAIR_FILE, CERTIFICATE_REQUEST_FILE,
};
use crate::acme::keys;
use crate::acme::retry::fetch_with_retry;
use crate::config::Certificate;
use crate::error::{AcmeError, Result, ResultExt};
use crate::tls::{pem, store::CertStore};

pub(crate) struct CertificateManager<'a> {
    registration: Option<Arc<dyn AcmeRegistration>>,
    authorizations: Option<&'a AuthorizationCache>,
    account_id: &'a str,
    account_db_id: &'a str,
    minimum_validity_days: u32,
    certificate_id: &'a str,
    full_certificate_id: String,
    old: Option<&'a Certificate>,
    new: Option<&'a Certificate>,
    db: &'a CertDb,
    store: &'a CertStore,
    key_bits: u32,
}

fn live(certificate: Option<&Certificate>) -> Option<&Certificate> {
    certificate.filter(|c| c.enabled)
}

impl<'a> CertificateManager<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registration: Option<Arc<dyn AcmeRegistration>>,
        authorizations: Option<&'a AuthorizationCache>,
        account_id: &'a str,
        account_db_id: &'a str,
        minimum_validity_days: u32,
        certificate_id: &'a str,
        old: Option<&'a Certificate>,
        new: Option<&'a Certificate>,
        db: &'a CertDb,
        store: &'a CertStore,
        key_bits: u32,
    ) -> Self {
        CertificateManager {
            registration,
            authorizations,
            account_id,
            account_db_id,
            minimum_validity_days,
            certificate_id,
            full_certificate_id: format!("{account_db_id}-{certificate_id}"),
            old,
            new,
            db,
            store,
            key_bits,
        }
    }

    fn keypair_file(&self) -> String {
        format!(
            "{}-{}-{}",
            self.account_db_id, self.certificate_id, CERTIFICATE_KEY_PAIR_FILE
        )
    }

    fn chain_file(&self) -> String {
        format!(
            "{}-{}-{}",
            self.account_db_id, self.certificate_id, CERTIFICATE_CHAIN_FILE
        )
    }

    fn request_file(&self) -> String {
        format!(
            "{}-{}-{}",
            self.account_db_id, self.certificate_id, CERTIFICATE_REQUEST_FILE
        )
    }

    /// Fast pass: unload removed certificates, load cached material.
    ///
    /// Missing files, unparsable material or a keypair that does not match
    /// the leaf all mean "no cached data"; the authoritative pass will
    /// obtain fresh material.
    pub async fn update_cached(&self) -> Result<()> {
        let Some(new_c) = live(self.new) else {
            self.store.remove(&self.full_certificate_id);
            return Ok(());
        };
        if self.store.get(&self.full_certificate_id).is_some() {
            return Ok(());
        }

        let chain_exists = self
            .db
            .exists(&self.chain_file())
            .await
            .describe("Certificate file check")?;
        let keypair_exists = self
            .db
            .exists(&self.keypair_file())
            .await
            .describe("KeyPair file check")?;
        if !(chain_exists && keypair_exists) {
            info!(
                certificate = self.certificate_id,
                "No existing certificate and keypair"
            );
            return Ok(());
        }

        info!(
            certificate = self.certificate_id,
            "Loading existing certificate and keypair"
        );
        let chain_pem = self
            .db
            .read_string(&self.chain_file())
            .await
            .describe("Certificate file read")?;
        let key_pem = self
            .db
            .read_string(&self.keypair_file())
            .await
            .describe("KeyPair file read")?;

        match keys::keypair_matches_leaf(&key_pem, &chain_pem) {
            Ok(true) => {}
            Ok(false) => {
                warn!(
                    certificate = self.certificate_id,
                    "Cached keypair does not match cached certificate, ignoring cached data"
                );
                return Ok(());
            }
            Err(e) => {
                warn!(
                    certificate = self.certificate_id,
                    error = %e,
                    "Cached certificate material unreadable, ignoring cached data"
                );
                return Ok(());
            }
        }

        info!(
            certificate = self.certificate_id,
            "Installing existing certificate and keypair"
        );
        if let Err(e) = self
            .store
            .put(&self.full_certificate_id, new_c.default_cert, &key_pem, &chain_pem)
        {
            warn!(
                certificate = self.certificate_id,
                error = %e,
                "Cached certificate material unusable, ignoring cached data"
            );
        }
        Ok(())
    }

    /// Authoritative pass: renew or issue through the CA when needed.
    pub async fn update_others(&self) -> Result<()> {
        let Some(new_c) = live(self.new) else {
            return Ok(());
        };

        if self.old == Some(new_c) {
            // configuration unchanged; keep the installed certificate while
            // it stays valid long enough
            if let Some(entry) = self.store.get(&self.full_certificate_id) {
                let (not_before, not_after) = pem::cert_validity(entry.leaf())?;
                let now = Utc::now();
                if not_before > now {
                    return Err(AcmeError::InvalidValidityWindow {
                        id: self.full_certificate_id.clone(),
                    });
                }
                if not_after >= now + Duration::days(i64::from(self.minimum_validity_days)) {
                    return Ok(());
                }
                info!(
                    certificate = self.certificate_id,
                    not_after = %not_after,
                    "Certificate expires within the renewal window"
                );
            }
        }

        let Some(authorizations) = self.authorizations else {
            return Err(AcmeError::Protocol(
                "certificate renewal attempted without a CA session".to_string(),
            ));
        };

        info!(
            certificate = self.certificate_id,
            hostnames = ?new_c.hostnames,
            "Domains to authorize"
        );
        for hostname in &new_c.hostnames {
            ChallengeManager::new(
                self.store,
                authorizations,
                self.account_id,
                self.certificate_id,
                hostname,
                self.key_bits,
            )
            .authorize()
            .await?;
        }
        info!(
            certificate = self.certificate_id,
            "All domains successfully authorized by account"
        );

        self.create_certificate(new_c).await?;
        info!(
            certificate = self.certificate_id,
            "Certificate successfully activated"
        );
        Ok(())
    }

    async fn create_certificate(&self, new_c: &Certificate) -> Result<()> {
        let Some(registration) = self.registration.clone() else {
            return Err(AcmeError::Protocol(
                "certificate issuance attempted without a CA session".to_string(),
            ));
        };

        let key = keys::get_or_create_keypair(
            self.db,
            "certificate",
            &self.keypair_file(),
            self.key_bits,
        )
        .await?;

        info!(
            certificate = self.certificate_id,
            "Creating certificate request (CSR)"
        );
        let (csr_der, csr_pem) = keys::build_csr(&new_c.hostnames, &new_c.organization, &key)?;

        info!(
            certificate = self.certificate_id,
            "Saving certificate request for renewal purposes"
        );
        self.db
            .write(&self.request_file(), csr_pem.as_bytes())
            .await
            .describe("Certificate request file write")?;

        info!(certificate = self.certificate_id, "Requesting certificate meta");
        let order = fetch_with_retry(|| {
            let registration = registration.clone();
            let csr_der = csr_der.clone();
            async move { registration.request_certificate(&csr_der).await }
        })
        .await
        .describe("Certificate request")?;

        info!(certificate = self.certificate_id, "Requesting certificate");
        let leaf_pem = fetch_with_retry(|| {
            let order = order.clone();
            async move { order.download_certificate().await }
        })
        .await
        .describe("Certificate download")?;

        info!(
            certificate = self.certificate_id,
            "Requesting certificate chain"
        );
        let chain_pems = fetch_with_retry(|| {
            let order = order.clone();
            async move { order.download_chain().await }
        })
        .await
        .describe("Certificate chain download")?;

        info!(
            certificate = self.certificate_id,
            "Serializing certificate chain"
        );
        let mut full_chain = String::with_capacity(
            leaf_pem.len() + chain_pems.iter().map(String::len).sum::<usize>(),
        );
        for part in std::iter::once(&leaf_pem).chain(chain_pems.iter()) {
            full_chain.push_str(part.trim_end());
            full_chain.push('\n');
        }

        info!(certificate = self.certificate_id, "Saving certificate chain");
        self.db
            .write(&self.chain_file(), full_chain.as_bytes())
            .await
            .describe("Certificate file write")?;

        info!(certificate = self.certificate_id, "Installing certificate");
        let key_pem = keys::keypair_to_pem(&key)?;
        self.store.put(
            &self.full_certificate_id,
            new_c.default_cert,
            &key_pem,
            &full_chain,
        )
    }
}
