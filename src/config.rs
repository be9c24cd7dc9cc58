//! Declarative configuration for the certificate lifecycle engine.
//!
//! The configuration maps account ids to CA accounts, each of which maps
//! certificate ids to certificates. The whole structure is replaced on
//! reconfiguration and persisted as JSON after every successful reconcile.

use std::collections::BTreeMap;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use crate::error::{AcmeError, Result};

/// Wall-clock time of the daily renewal check when none is configured.
pub fn default_renewal_check_time() -> NaiveTime {
    NaiveTime::from_hms_opt(3, 30, 0).expect("static time")
}

/// Top-level configuration: one entry per CA account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcmeConfig {
    /// Time of day ("HH:MM:SS") at which the daily renewal check runs.
    #[serde(rename = "renewalCheckTime", default = "default_renewal_check_time")]
    pub renewal_check_time: NaiveTime,
    #[serde(default)]
    pub accounts: BTreeMap<String, Account>,
}

/// One account at a certificate authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub enabled: bool,
    /// Directory URI of the CA this account registers with.
    pub provider_url: String,
    /// Terms-of-service agreement URI accepted for this account.
    pub accepted_agreement_url: String,
    #[serde(rename = "contactURIs", default)]
    pub contact_uris: Vec<String>,
    /// Certificates are renewed when their leaf is valid for fewer days
    /// than this.
    pub minimum_validity_days: u32,
    #[serde(default)]
    pub certificates: BTreeMap<String, Certificate>,
}

/// One managed certificate within an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Certificate {
    pub enabled: bool,
    /// Whether this certificate is served to clients that send no SNI.
    #[serde(default)]
    pub default_cert: bool,
    pub organization: String,
    /// DNS names, authorized in declared order. The first becomes the CN.
    pub hostnames: Vec<String>,
}

impl AcmeConfig {
    /// A valid configuration with no accounts, certificates or hostnames.
    pub fn empty() -> Self {
        AcmeConfig {
            renewal_check_time: default_renewal_check_time(),
            accounts: BTreeMap::new(),
        }
    }

    /// Validate the configuration before it is adopted.
    ///
    /// Checks hostname presence and syntax for every certificate and that
    /// at most one enabled certificate across enabled accounts carries the
    /// default flag.
    pub fn validate(&self) -> Result<()> {
        let mut default_certs = 0usize;
        for (account_id, account) in &self.accounts {
            for (certificate_id, certificate) in &account.certificates {
                if certificate.hostnames.is_empty() {
                    return Err(AcmeError::Config(format!(
                        "certificate {account_id}/{certificate_id} has no hostnames"
                    )));
                }
                for hostname in &certificate.hostnames {
                    if !is_valid_hostname(hostname) {
                        return Err(AcmeError::Config(format!(
                            "certificate {account_id}/{certificate_id} has invalid hostname {hostname:?}"
                        )));
                    }
                }
                if account.enabled && certificate.enabled && certificate.default_cert {
                    default_certs += 1;
                }
            }
        }
        if default_certs > 1 {
            return Err(AcmeError::Config(format!(
                "{default_certs} certificates are marked as default, at most one is allowed"
            )));
        }
        Ok(())
    }
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self::empty()
    }
}

/// Syntactic DNS hostname check: dot-separated LDH labels, 253 chars max.
pub fn is_valid_hostname(name: &str) -> bool {
    if name.is_empty() || name.len() > 253 {
        return false;
    }
    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}
