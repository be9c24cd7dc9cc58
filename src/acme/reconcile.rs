//! Two-phase reconciliation of an old and a new configuration.
//!
//! Phase 1 ("cached") loads everything that already exists in parallel and
//! never contacts the CA. Phase 2 ("authoritative") walks the accounts
//! strictly one after another, creating and renewing whatever is not in
//! good shape. Failures are attributed per account and aggregated; one
//! broken account does not stop the others.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Duration, Local, NaiveTime};
use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::acme::account::AccountManager;
use crate::acme::client::AcmeProvider;
use crate::acme::db::{account_db_id, CertDb};
use crate::config::AcmeConfig;
use crate::error::{AcmeError, Result};
use crate::tls::store::CertStore;

/// A key present in the old map, the new map, or both.
pub(crate) struct MapDiff<K, V> {
    pub key: K,
    pub old: Option<V>,
    pub new: Option<V>,
}

/// One diff entry per key in the union of both maps.
pub(crate) fn map_diff<K: Ord + Clone, V: Clone>(
    old: &BTreeMap<K, V>,
    new: &BTreeMap<K, V>,
) -> Vec<MapDiff<K, V>> {
    let mut result: Vec<MapDiff<K, V>> = old
        .iter()
        .map(|(key, value)| MapDiff {
            key: key.clone(),
            old: Some(value.clone()),
            new: new.get(key).cloned(),
        })
        .collect();
    result.extend(
        new.iter()
            .filter(|(key, _)| !old.contains_key(*key))
            .map(|(key, value)| MapDiff {
                key: key.clone(),
                old: None,
                new: Some(value.clone()),
            }),
    );
    result
}

/// Callback the renewal timer fires into. Held weakly so the timer never
/// keeps the controller alive.
#[async_trait]
pub(crate) trait RenewalHook: Send + Sync {
    async fn renewal_check(&self) -> Result<()>;
}

struct ScheduleState {
    check_time: Option<NaiveTime>,
    timer: Option<JoinHandle<()>>,
}

pub(crate) struct ConfigReconciler {
    db: CertDb,
    store: Arc<CertStore>,
    provider: Arc<dyn AcmeProvider>,
    key_bits: u32,
    hook: Weak<dyn RenewalHook>,
    schedule: Arc<Mutex<ScheduleState>>,
}

impl ConfigReconciler {
    pub fn new(
        db: CertDb,
        store: Arc<CertStore>,
        provider: Arc<dyn AcmeProvider>,
        key_bits: u32,
        hook: Weak<dyn RenewalHook>,
    ) -> Self {
        ConfigReconciler {
            db,
            store,
            provider,
            key_bits,
            hook,
            schedule: Arc::new(Mutex::new(ScheduleState {
                check_time: None,
                timer: None,
            })),
        }
    }

    /// Reconcile `old` into `new`.
    pub async fn update(&self, old: &AcmeConfig, new: &AcmeConfig) -> Result<()> {
        new.validate()?;
        self.reschedule_if_needed(new.renewal_check_time);

        let diff = map_diff(&old.accounts, &new.accounts);
        let managers: Vec<AccountManager<'_>> = diff
            .iter()
            .map(|entry| {
                AccountManager::new(
                    &entry.key,
                    entry.old.as_ref(),
                    entry.new.as_ref(),
                    &self.db,
                    self.store.as_ref(),
                    &self.provider,
                    self.key_bits,
                )
            })
            .collect();

        // phase 1: load cached state for every account concurrently
        let cached = join_all(managers.iter().map(AccountManager::update_cached)).await;

        let mut failures = Vec::new();
        let mut proceed = Vec::with_capacity(managers.len());
        for (entry, result) in diff.iter().zip(cached) {
            match result {
                Ok(()) => proceed.push(true),
                Err(e) => {
                    let e = e.describe(format!("For account {}", entry.key));
                    error!(error = %e, "Error updating account using cached data");
                    failures.push(e);
                    proceed.push(false);
                }
            }
        }

        // phase 2: contact the CA, strictly one account at a time
        for ((entry, manager), ready) in diff.iter().zip(&managers).zip(proceed) {
            if !ready {
                continue;
            }
            if let Err(e) = manager.update_others().await {
                let e = e.describe(format!("For account {}", entry.key));
                error!(error = %e, "Error updating account");
                failures.push(e);
            }
        }

        if !failures.is_empty() {
            return Err(AcmeError::Aggregate(failures));
        }

        // elect the default entry, or clear it when none is configured
        let default_id = new
            .accounts
            .iter()
            .filter(|(_, account)| account.enabled)
            .flat_map(|(account_id, account)| {
                account
                    .certificates
                    .iter()
                    .filter(|(_, cert)| cert.enabled && cert.default_cert)
                    .map(move |(certificate_id, _)| {
                        format!(
                            "{}-{}",
                            account_db_id(account_id, &account.provider_url),
                            certificate_id
                        )
                    })
            })
            .next();
        self.store.set_default_alias(default_id);

        info!(accounts = new.accounts.len(), "Done updating accounts");
        Ok(())
    }

    /// (Re)arm the renewal timer on the first reconcile and whenever the
    /// configured check time changes.
    fn reschedule_if_needed(&self, check_time: NaiveTime) {
        let mut schedule = self.schedule.lock().expect("lock poisoned");
        if schedule.timer.is_some() && schedule.check_time == Some(check_time) {
            return;
        }
        schedule.check_time = Some(check_time);
        if let Some(timer) = schedule.timer.take() {
            timer.abort();
        }
        schedule.timer = Some(spawn_renewal_timer(
            self.schedule.clone(),
            self.hook.clone(),
            check_time,
        ));
    }
}

/// Sleep until the next wall-clock occurrence of `check_time`, then run a
/// renewal check and arm the next timer.
fn spawn_renewal_timer(
    schedule: Arc<Mutex<ScheduleState>>,
    hook: Weak<dyn RenewalHook>,
    check_time: NaiveTime,
) -> JoinHandle<()> {
    let now = Local::now().naive_local();
    let mut next = now.date().and_time(check_time);
    if next <= now {
        next = next + Duration::days(1);
    }
    let delay = (next - now).to_std().unwrap_or(StdDuration::ZERO);
    info!(at = %next, "Scheduled next renewal check");

    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        info!("Renewal check starting");
        // free the timer slot so the renewal pass can reschedule
        schedule.lock().expect("lock poisoned").timer = None;
        let weak = hook.clone();
        let Some(hook) = hook.upgrade() else {
            return;
        };
        match hook.renewal_check().await {
            Ok(()) => info!("Renewal check completed successfully"),
            Err(e) => warn!(error = %e, "Renewal check failed"),
        }
        // the check reschedules through the reconciler; if it failed
        // before getting there, arm the next occurrence here
        let mut sched = schedule.lock().expect("lock poisoned");
        if sched.timer.is_none() {
            if let Some(check_time) = sched.check_time {
                sched.timer = Some(spawn_renewal_timer(schedule.clone(), weak, check_time));
            }
        }
    })
}
