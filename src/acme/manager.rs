//! Public controller of the certificate lifecycle engine.
//!
//! Owns the adopted configuration and a small lifecycle state machine:
//! `start` runs once from `NotStarted`, `reconfigure` and `check` run from
//! `Ok`, and every update ends in `Ok` or `Failed`. A call in any other
//! state fails instead of preempting the in-flight reconcile.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tracing::info;

use crate::acme::client::AcmeProvider;
use crate::acme::db::{CertDb, ACTIVE_CONF_FILE};
use crate::acme::keys::DEFAULT_KEY_BITS;
use crate::acme::reconcile::{ConfigReconciler, RenewalHook};
use crate::config::AcmeConfig;
use crate::error::{AcmeError, Result, ResultExt};
use crate::tls::store::CertStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    NotStarted,
    Updating,
    Ok,
    Failed,
}

struct Inner {
    state: State,
    cur: AcmeConfig,
}

/// The certificate lifecycle engine.
pub struct AcmeManager {
    db: CertDb,
    reconciler: ConfigReconciler,
    inner: Mutex<Inner>,
}

impl AcmeManager {
    /// Create an engine over the given store, database directory and CA
    /// client.
    pub fn new(
        store: Arc<CertStore>,
        db_path: impl Into<PathBuf>,
        provider: Arc<dyn AcmeProvider>,
    ) -> Arc<Self> {
        Self::with_key_bits(store, db_path, provider, DEFAULT_KEY_BITS)
    }

    /// As [`AcmeManager::new`], with a custom RSA key size for account,
    /// certificate and challenge keypairs.
    pub fn with_key_bits(
        store: Arc<CertStore>,
        db_path: impl Into<PathBuf>,
        provider: Arc<dyn AcmeProvider>,
        key_bits: u32,
    ) -> Arc<Self> {
        let db = CertDb::new(db_path);
        Arc::new_cyclic(|weak: &Weak<AcmeManager>| {
            let hook: Weak<dyn RenewalHook> = weak.clone();
            AcmeManager {
                db: db.clone(),
                reconciler: ConfigReconciler::new(db, store, provider, key_bits, hook),
                inner: Mutex::new(Inner {
                    state: State::NotStarted,
                    cur: AcmeConfig::empty(),
                }),
            }
        })
    }

    /// A valid configuration with no accounts, certificates or hostnames.
    pub fn empty_conf(&self) -> AcmeConfig {
        AcmeConfig::empty()
    }

    /// Start up with the previously persisted configuration, or an empty
    /// one if none exists.
    pub async fn start(&self) -> Result<()> {
        self.change_state(State::NotStarted, State::Updating)?;
        let result = self.startup(None).await;
        self.finish(result)
    }

    /// Start up with the given configuration, diffed against whatever was
    /// persisted before.
    pub async fn start_with(&self, conf: AcmeConfig) -> Result<()> {
        self.change_state(State::NotStarted, State::Updating)?;
        let result = self.startup(Some(conf)).await;
        self.finish(result)
    }

    /// Replace the adopted configuration.
    pub async fn reconfigure(&self, conf: AcmeConfig) -> Result<()> {
        self.change_state(State::Ok, State::Updating)?;
        let cur = self.current();
        let result = self.do_update(cur, conf).await;
        self.finish(result)
    }

    /// Force a renewal pass over the adopted configuration. Not normally
    /// needed; the scheduled daily check calls this.
    pub async fn check(&self) -> Result<()> {
        self.change_state(State::Ok, State::Updating)?;
        let cur = self.current();
        let result = self.do_update(cur.clone(), cur).await;
        self.finish(result)
    }

    async fn startup(&self, conf: Option<AcmeConfig>) -> Result<()> {
        self.db.init().await.describe("DB directory create")?;
        let saved = self.active_config().await?;
        let new = conf.unwrap_or_else(|| saved.clone());
        self.do_update(saved, new).await
    }

    async fn do_update(&self, old: AcmeConfig, new: AcmeConfig) -> Result<()> {
        let old_json = pretty(&old)?;
        let new_json = pretty(&new)?;
        if old == new {
            info!(config = %new_json, "Using config");
        } else {
            info!(from = %old_json, to = %new_json, "Updating config");
        }

        self.reconciler.update(&old, &new).await?;
        self.db
            .write_config(ACTIVE_CONF_FILE, "active", &new)
            .await?;
        self.inner.lock().expect("lock poisoned").cur = new;
        Ok(())
    }

    /// The persisted configuration, or an empty one when none was saved.
    async fn active_config(&self) -> Result<AcmeConfig> {
        if self
            .db
            .exists(ACTIVE_CONF_FILE)
            .await
            .describe("Error checking previous config")?
        {
            self.db.read_config(ACTIVE_CONF_FILE, "active").await
        } else {
            Ok(AcmeConfig::empty())
        }
    }

    fn current(&self) -> AcmeConfig {
        self.inner.lock().expect("lock poisoned").cur.clone()
    }

    fn change_state(&self, expected: State, new: State) -> Result<()> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        if inner.state != expected {
            return Err(AcmeError::IllegalState {
                state: format!("{:?}", inner.state),
            });
        }
        inner.state = new;
        Ok(())
    }

    fn finish(&self, result: Result<()>) -> Result<()> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.state = if result.is_ok() {
            State::Ok
        } else {
            State::Failed
        };
        result
    }
}

#[async_trait]
impl RenewalHook for AcmeManager {
    async fn renewal_check(&self) -> Result<()> {
        self.check().await
    }
}

fn pretty(conf: &AcmeConfig) -> Result<String> {
    serde_json::to_string_pretty(conf)
        .map_err(|e| AcmeError::Config(format!("cannot serialize config: {e}")))
}
