//! Lifecycle of one CA account: keypair, registration, agreement, and the
//! per-certificate fan-out.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::Mutex;
use tracing::info;

use crate::acme::certificate::CertificateManager;
use crate::acme::client::{
    AcmeAuthorization, AcmeProvider, AcmeRegistration, AcmeSession, CreateRegistration,
};
use crate::acme::db::{
    account_db_id, CertDb, ACCEPTED_TERMS_FILE, ACCOUNT_KEY_PAIR_FILE, ACCOUNT_LOCATION_FILE,
};
use crate::acme::keys;
use crate::acme::reconcile::map_diff;
use crate::config::Account;
use crate::error::{collect_failures, Result, ResultExt};
use crate::tls::store::CertStore;

/// Authorizations known to one registration, memoized for the lifetime of
/// a single authoritative pass.
///
/// The first lookup fetches every existing authorization from the CA;
/// misses after that create new authorizations on demand.
pub(crate) struct AuthorizationCache {
    registration: Arc<dyn AcmeRegistration>,
    cached: Mutex<Option<HashMap<String, Arc<dyn AcmeAuthorization>>>>,
}

impl AuthorizationCache {
    pub fn new(registration: Arc<dyn AcmeRegistration>) -> Self {
        AuthorizationCache {
            registration,
            cached: Mutex::new(None),
        }
    }

    pub async fn get(&self, domain: &str) -> Result<Arc<dyn AcmeAuthorization>> {
        let mut guard = self.cached.lock().await;
        if guard.is_none() {
            info!("Fetching authorizations");
            let listed = self
                .registration
                .authorizations()
                .await
                .describe("Problem fetching existing authorizations")?;
            *guard = Some(
                listed
                    .into_iter()
                    .map(|authorization| (authorization.domain(), authorization))
                    .collect(),
            );
        }
        let cached = guard.get_or_insert_with(HashMap::new);

        if let Some(authorization) = cached.get(domain) {
            return Ok(authorization.clone());
        }
        info!(domain, "Requesting new authorization");
        let authorization = self
            .registration
            .authorize_domain(domain)
            .await
            .describe("Problem creating new authorization")?;
        cached.insert(domain.to_string(), authorization.clone());
        Ok(authorization)
    }
}

pub(crate) struct AccountManager<'a> {
    account_id: &'a str,
    old: Option<&'a Account>,
    new: Option<&'a Account>,
    old_db_id: Option<String>,
    new_db_id: Option<String>,
    db: &'a CertDb,
    store: &'a CertStore,
    provider: &'a Arc<dyn AcmeProvider>,
    key_bits: u32,
}

fn live(account: Option<&Account>) -> Option<&Account> {
    account.filter(|a| a.enabled)
}

impl<'a> AccountManager<'a> {
    pub fn new(
        account_id: &'a str,
        old: Option<&'a Account>,
        new: Option<&'a Account>,
        db: &'a CertDb,
        store: &'a CertStore,
        provider: &'a Arc<dyn AcmeProvider>,
        key_bits: u32,
    ) -> Self {
        AccountManager {
            account_id,
            old,
            new,
            old_db_id: old.map(|a| account_db_id(account_id, &a.provider_url)),
            new_db_id: new.map(|a| account_db_id(account_id, &a.provider_url)),
            db,
            store,
            provider,
            key_bits,
        }
    }

    /// Fast pass over this account's certificates.
    ///
    /// When the account went away or its on-disk identity changed (the
    /// provider URL is part of it), the old identity's certificates are
    /// unloaded and the new identity's certificates are loaded from disk.
    pub async fn update_cached(&self) -> Result<()> {
        if live(self.new).is_none() || self.new_db_id != self.old_db_id {
            if let Some(db_id) = self.old_db_id.clone() {
                self.update_cached_pass(&db_id, self.old, None).await?;
            }
            if let Some(db_id) = self.new_db_id.clone() {
                self.update_cached_pass(&db_id, None, self.new).await?;
            }
            Ok(())
        } else if let Some(db_id) = self.new_db_id.clone() {
            self.update_cached_pass(&db_id, self.old, self.new).await
        } else {
            Ok(())
        }
    }

    async fn update_cached_pass(
        &self,
        db_id: &str,
        old: Option<&Account>,
        new: Option<&Account>,
    ) -> Result<()> {
        let empty = BTreeMap::new();
        let old_certs = live(old).map_or(&empty, |a| &a.certificates);
        let new_certs = live(new).map_or(&empty, |a| &a.certificates);
        let minimum_validity_days = live(new).map_or(1, |a| a.minimum_validity_days);

        let diff = map_diff(old_certs, new_certs);
        let results = join_all(diff.iter().map(|entry| async move {
            let cm = CertificateManager::new(
                None,
                None,
                self.account_id,
                db_id,
                minimum_validity_days,
                &entry.key,
                entry.old.as_ref(),
                entry.new.as_ref(),
                self.db,
                self.store,
                self.key_bits,
            );
            cm.update_cached()
                .await
                .describe(format!("For certificate {}", entry.key))
        }))
        .await;
        collect_failures(results)
    }

    /// Authoritative pass: contact the CA and bring every certificate up
    /// to date.
    pub async fn update_others(&self) -> Result<()> {
        let Some(new_a) = live(self.new) else {
            return Ok(());
        };
        let Some(db_id) = self.new_db_id.clone() else {
            return Ok(());
        };
        // a changed on-disk identity is treated as a brand-new account
        let old = if self.new_db_id != self.old_db_id {
            None
        } else {
            self.old
        };

        let account_key = keys::get_or_create_keypair(
            self.db,
            "account",
            &format!("{db_id}-{ACCOUNT_KEY_PAIR_FILE}"),
            self.key_bits,
        )
        .await?;
        let account_key_pem = keys::keypair_to_pem(&account_key)?;

        let session = self
            .provider
            .connect(&new_a.provider_url, &account_key_pem)
            .await?;
        info!(account = self.account_id, "Session set up");

        let registration = self
            .get_or_create_registration(&db_id, new_a, session.as_ref())
            .await?;
        let authorizations = AuthorizationCache::new(registration.clone());

        let empty = BTreeMap::new();
        let old_certs = live(old).map_or(&empty, |a| &a.certificates);
        let diff = map_diff(old_certs, &new_a.certificates);
        let authorizations = &authorizations;
        let registration = &registration;
        let db_id = db_id.as_str();
        let results = join_all(diff.iter().map(|entry| async move {
            let cm = CertificateManager::new(
                Some(registration.clone()),
                Some(authorizations),
                self.account_id,
                db_id,
                new_a.minimum_validity_days,
                &entry.key,
                entry.old.as_ref(),
                entry.new.as_ref(),
                self.db,
                self.store,
                self.key_bits,
            );
            cm.update_others()
                .await
                .describe(format!("For certificate {}", entry.key))
        }))
        .await;
        collect_failures(results)
    }

    /// Bind the stored registration, or create one (recovering from the
    /// CA's existing-registration conflict), then reconcile contacts and
    /// the accepted agreement.
    async fn get_or_create_registration(
        &self,
        db_id: &str,
        new_a: &Account,
        session: &dyn AcmeSession,
    ) -> Result<Arc<dyn AcmeRegistration>> {
        let location_file = format!("{db_id}-{ACCOUNT_LOCATION_FILE}");
        let location_exists = self
            .db
            .exists(&location_file)
            .await
            .describe("Account location file check")?;

        let (registration, created) = if location_exists {
            let location = self
                .db
                .read_string(&location_file)
                .await
                .describe("Account location file read")?;
            let location = location.trim().to_string();
            info!(
                account = self.account_id,
                location = %location,
                "Account location file exists, using it"
            );
            let registration = session.bind_registration(&location).await?;
            info!(account = self.account_id, "Registration successfully bound");
            (registration, false)
        } else {
            info!(
                account = self.account_id,
                "No account location file, attempting to create new registration"
            );
            let (registration, created) =
                match session.create_registration(&new_a.contact_uris).await? {
                    CreateRegistration::Created(registration) => {
                        info!(account = self.account_id, "Registration successfully created");
                        (registration, true)
                    }
                    CreateRegistration::Conflict { location } => {
                        info!(
                            account = self.account_id,
                            location = %location,
                            "Registration existed, using provided location"
                        );
                        let registration = session.bind_registration(&location).await?;
                        info!(account = self.account_id, "Registration successfully bound");
                        (registration, false)
                    }
                };
            self.db
                .write(&location_file, registration.location().as_bytes())
                .await
                .describe("Account location file write")?;
            info!(
                account = self.account_id,
                file = %location_file,
                "Account location file saved"
            );
            (registration, created)
        };

        let terms_file = format!("{db_id}-{ACCEPTED_TERMS_FILE}");
        let props_changed = if created {
            true
        } else if registration.contact_uris().await? != new_a.contact_uris {
            true
        } else if !self
            .db
            .exists(&terms_file)
            .await
            .describe("Accepted terms file check")?
        {
            true
        } else {
            self.db
                .read_string(&terms_file)
                .await
                .describe("Accepted terms file read")?
                != new_a.accepted_agreement_url
        };

        if props_changed {
            info!(account = self.account_id, "Updating account registration");
            registration
                .update(&new_a.contact_uris, &new_a.accepted_agreement_url)
                .await?;
            self.db
                .write(&terms_file, new_a.accepted_agreement_url.as_bytes())
                .await
                .describe("Accepted terms file write")?;
        }
        Ok(registration)
    }
}
