//! Single-domain authorization through TLS-SNI challenges.
//!
//! A challenge is answered by installing a short-lived self-signed
//! certificate in the live store under a well-known id, so the CA's probe
//! handshake picks it up by SNI, then polling the CA until it reports a
//! terminal status. The entry is removed again whatever the outcome.

use std::sync::{Arc, Mutex};

use tracing::info;

use crate::acme::account::AuthorizationCache;
use crate::acme::client::{AcmeChallenge, AcmeStatus, ChallengeKind};
use crate::acme::keys;
use crate::acme::retry::fetch_with_retry;
use crate::error::{AcmeError, Result};
use crate::tls::store::CertStore;

pub(crate) struct ChallengeManager<'a> {
    store: &'a CertStore,
    authorizations: &'a AuthorizationCache,
    account_id: &'a str,
    certificate_id: &'a str,
    domain: &'a str,
    key_bits: u32,
}

impl<'a> ChallengeManager<'a> {
    pub fn new(
        store: &'a CertStore,
        authorizations: &'a AuthorizationCache,
        account_id: &'a str,
        certificate_id: &'a str,
        domain: &'a str,
        key_bits: u32,
    ) -> Self {
        ChallengeManager {
            store,
            authorizations,
            account_id,
            certificate_id,
            domain,
            key_bits,
        }
    }

    /// Obtain a valid authorization for this manager's domain.
    pub async fn authorize(&self) -> Result<()> {
        info!(
            account = self.account_id,
            certificate = self.certificate_id,
            domain = self.domain,
            "Authorizing domain"
        );
        let authorization = self.authorizations.get(self.domain).await?;
        let status = authorization.status().await?;
        info!(domain = self.domain, status = %status, "Authorization status");
        if status == AcmeStatus::Valid {
            return Ok(());
        }

        let combinations = authorization.combinations().await?;
        let combination = combinations
            .into_iter()
            .find(|combination| {
                combination
                    .iter()
                    .all(|challenge| challenge.kind().is_supported())
            })
            .ok_or_else(|| {
                AcmeError::Protocol(format!(
                    "no supported challenge combination offered for {}",
                    self.domain
                ))
            })?;
        info!(
            domain = self.domain,
            challenges = combination.len(),
            "Challenges to complete"
        );

        for challenge in &combination {
            self.execute_challenge(challenge).await?;
        }
        info!(domain = self.domain, "Successfully associated with account");
        Ok(())
    }

    async fn execute_challenge(&self, challenge: &Arc<dyn AcmeChallenge>) -> Result<()> {
        let kind = challenge.kind();
        let dns_names = match &kind {
            ChallengeKind::TlsSni01 { subject } => vec![subject.clone()],
            ChallengeKind::TlsSni02 { subject, san_b } => {
                vec![subject.clone(), san_b.clone()]
            }
            ChallengeKind::Other(name) => {
                return Err(AcmeError::Protocol(format!(
                    "unsupported challenge type {name}"
                )))
            }
        };

        info!(domain = self.domain, "Creating challenge keypair");
        let key = keys::generate_keypair(self.key_bits).await?;
        info!(domain = self.domain, "Creating challenge certificate");
        let cert_pem = keys::challenge_certificate(&key, &dns_names)?;
        let key_pem = keys::keypair_to_pem(&key)?;

        let id = format!("letsencrypt-challenge-{}", self.domain);
        info!(id = %id, "Installing challenge certificate");
        self.store.put(&id, false, &key_pem, &cert_pem)?;
        info!(challenge = kind.type_name(), "Challenge prepared, executing");

        // the entry comes out again on success and on failure
        let outcome = self.run_challenge(challenge).await;
        self.store.remove(&id);
        info!(challenge = kind.type_name(), "Challenge cleaned up");

        let status = outcome?;
        info!(
            challenge = kind.type_name(),
            status = %status,
            "Challenge execution completed"
        );
        if status == AcmeStatus::Valid {
            Ok(())
        } else {
            Err(AcmeError::ChallengeFailed {
                challenge: kind.type_name().to_string(),
                domain: self.domain.to_string(),
                status: status.to_string(),
            })
        }
    }

    /// Trigger the challenge and poll it to a terminal status.
    async fn run_challenge(&self, challenge: &Arc<dyn AcmeChallenge>) -> Result<AcmeStatus> {
        challenge.trigger().await?;
        let reported: Mutex<Option<AcmeStatus>> = Mutex::new(None);
        let reported = &reported;
        fetch_with_retry(move || {
            let challenge = challenge.clone();
            async move {
                let status = challenge.poll().await?;
                {
                    let mut last = reported.lock().expect("lock poisoned");
                    if *last != Some(status) {
                        info!(status = %status, "Challenge status");
                        *last = Some(status);
                    }
                }
                Ok(status.is_terminal().then_some(status))
            }
        })
        .await
    }
}
