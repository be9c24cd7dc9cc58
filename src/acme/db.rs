//! Flat-directory persistence for account and certificate state.
//!
//! Every file belonging to an account is prefixed with its database id
//! (`accountId + "-" + urlencode(providerUrl)`), so changing the provider
//! URL gives the account a fresh on-disk identity.

use std::path::PathBuf;

use tracing::info;

use crate::config::AcmeConfig;
use crate::error::{AcmeError, Result};

pub(crate) const ACCOUNT_KEY_PAIR_FILE: &str = "account-keypair.pem";
pub(crate) const CERTIFICATE_KEY_PAIR_FILE: &str = "keypair.pem";
pub(crate) const CERTIFICATE_CHAIN_FILE: &str = "certchain.pem";
pub(crate) const CERTIFICATE_REQUEST_FILE: &str = "cert-request.csr";
pub(crate) const ACCOUNT_LOCATION_FILE: &str = "accountLocation.txt";
pub(crate) const ACCEPTED_TERMS_FILE: &str = "acceptedTermsLocation.txt";
pub(crate) const ACTIVE_CONF_FILE: &str = "active.json";

/// Handle to the database directory.
#[derive(Debug, Clone)]
pub(crate) struct CertDb {
    dir: PathBuf,
}

impl CertDb {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        CertDb { dir: dir.into() }
    }

    pub fn path(&self, file_name: &str) -> PathBuf {
        self.dir.join(file_name)
    }

    /// Create the database directory and any missing parents.
    pub async fn init(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| AcmeError::Io {
                path: self.dir.clone(),
                source,
            })
    }

    pub async fn exists(&self, file_name: &str) -> Result<bool> {
        let path = self.path(file_name);
        tokio::fs::try_exists(&path)
            .await
            .map_err(|source| AcmeError::Io { path, source })
    }

    pub async fn read_string(&self, file_name: &str) -> Result<String> {
        let path = self.path(file_name);
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| AcmeError::Io { path, source })
    }

    pub async fn write(&self, file_name: &str, contents: &[u8]) -> Result<()> {
        let path = self.path(file_name);
        tokio::fs::write(&path, contents)
            .await
            .map_err(|source| AcmeError::Io { path, source })
    }

    /// Read and parse a persisted configuration. A malformed file is fatal.
    pub async fn read_config(&self, file_name: &str, label: &str) -> Result<AcmeConfig> {
        let raw = self.read_string(file_name).await?;
        let conf: AcmeConfig = serde_json::from_str(&raw).map_err(|e| {
            AcmeError::Config(format!("{label} config file {file_name} broken: {e}"))
        })?;
        info!(file = file_name, "{label} config read");
        Ok(conf)
    }

    /// Serialize and persist a configuration.
    pub async fn write_config(
        &self,
        file_name: &str,
        label: &str,
        conf: &AcmeConfig,
    ) -> Result<()> {
        let raw = serde_json::to_vec_pretty(conf)
            .map_err(|e| AcmeError::Config(format!("cannot serialize {label} config: {e}")))?;
        self.write(file_name, &raw).await?;
        info!(file = file_name, "{label} config written");
        Ok(())
    }
}

/// On-disk identity of an account: changing the provider URL changes the
/// prefix and thereby deregisters the old state.
pub(crate) fn account_db_id(account_id: &str, provider_url: &str) -> String {
    format!("{}-{}", account_id, urlencoding::encode(provider_url))
}
