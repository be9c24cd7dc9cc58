//! Shared test harness: an in-memory mock CA implementing the client seam,
//! plus fixtures for driving the whole engine against a temp directory.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::{X509Builder, X509NameBuilder, X509Req};
use tempfile::TempDir;
use x509_parser::prelude::{FromDer, GeneralName, ParsedExtension, X509CertificationRequest};

use dyncert::{
    AcmeAuthorization, AcmeCertificateOrder, AcmeChallenge, AcmeConfig, AcmeError, AcmeManager,
    AcmeProvider, AcmeRegistration, AcmeSession, AcmeStatus, Account, CertStore, Certificate,
    ChallengeKind, CreateRegistration, Result,
};

pub const PROVIDER_URL: &str = "acme://mock-ca/dir";
pub const AGREEMENT_URL: &str = "https://mock-ca/terms-v1";
/// `account_id + "-" + urlencode(PROVIDER_URL)` for account id "main".
pub const MAIN_DB_ID: &str = "main-acme%3A%2F%2Fmock-ca%2Fdir";

// ---------------------------------------------------------------------------
// recorded CA interactions

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connect { provider_url: String },
    CreateRegistration,
    BindRegistration { location: String },
    UpdateRegistration { agreement: String },
    AuthorizeDomain { domain: String },
    TriggerChallenge { domain: String },
    CsrRequested { hostnames: Vec<String> },
}

// ---------------------------------------------------------------------------
// mock CA

struct RegistrationState {
    location: String,
    contact_uris: Mutex<Vec<String>>,
    agreement: Mutex<Option<String>>,
    authorizations: Mutex<HashMap<String, Arc<MockAuthorization>>>,
}

pub struct MockCa {
    this: std::sync::Weak<MockCa>,
    ca_key: PKey<Private>,
    ca_cert_pem: String,
    pub leaf_validity_days: Mutex<u32>,
    pub leaf_not_before_days: Mutex<u32>,
    pub failing_domains: Mutex<HashSet<String>>,
    events: Mutex<Vec<Event>>,
    registrations: Mutex<HashMap<String, Arc<RegistrationState>>>,
    locations_by_key: Mutex<HashMap<String, String>>,
    next_location: AtomicU64,
}

impl MockCa {
    pub fn new() -> Arc<Self> {
        let ca_key = generate_key(2048);
        let ca_cert_pem = self_signed_ca(&ca_key);
        Arc::new_cyclic(|this| MockCa {
            this: this.clone(),
            ca_key,
            ca_cert_pem,
            leaf_validity_days: Mutex::new(90),
            leaf_not_before_days: Mutex::new(0),
            failing_domains: Mutex::new(HashSet::new()),
            events: Mutex::new(Vec::new()),
            registrations: Mutex::new(HashMap::new()),
            locations_by_key: Mutex::new(HashMap::new()),
            next_location: AtomicU64::new(1),
        })
    }

    fn arc(&self) -> Arc<MockCa> {
        self.this.upgrade().expect("mock CA dropped")
    }

    pub fn set_leaf_validity_days(&self, days: u32) {
        *self.leaf_validity_days.lock().unwrap() = days;
    }

    pub fn set_leaf_not_before_days(&self, days: u32) {
        *self.leaf_not_before_days.lock().unwrap() = days;
    }

    pub fn fail_domain(&self, domain: &str) {
        self.failing_domains.lock().unwrap().insert(domain.to_string());
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear_events(&self) {
        self.events.lock().unwrap().clear();
    }

    pub fn csr_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Event::CsrRequested { .. }))
            .count()
    }

    pub fn trigger_order(&self) -> Vec<String> {
        self.events()
            .iter()
            .filter_map(|e| match e {
                Event::TriggerChallenge { domain } => Some(domain.clone()),
                _ => None,
            })
            .collect()
    }

    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl AcmeProvider for MockCa {
    async fn connect(
        &self,
        provider_url: &str,
        account_key_pem: &str,
    ) -> Result<Arc<dyn AcmeSession>> {
        self.record(Event::Connect {
            provider_url: provider_url.to_string(),
        });
        Ok(Arc::new(MockSession {
            ca: self.arc(),
            account_key_pem: account_key_pem.to_string(),
        }))
    }
}

struct MockSession {
    ca: Arc<MockCa>,
    account_key_pem: String,
}

#[async_trait]
impl AcmeSession for MockSession {
    async fn create_registration(&self, contact_uris: &[String]) -> Result<CreateRegistration> {
        self.ca.record(Event::CreateRegistration);
        {
            let by_key = self.ca.locations_by_key.lock().unwrap();
            if let Some(location) = by_key.get(&self.account_key_pem) {
                return Ok(CreateRegistration::Conflict {
                    location: location.clone(),
                });
            }
        }
        let n = self.ca.next_location.fetch_add(1, Ordering::SeqCst);
        let location = format!("https://mock-ca/acct/{n}");
        let state = Arc::new(RegistrationState {
            location: location.clone(),
            contact_uris: Mutex::new(contact_uris.to_vec()),
            agreement: Mutex::new(None),
            authorizations: Mutex::new(HashMap::new()),
        });
        self.ca
            .registrations
            .lock()
            .unwrap()
            .insert(location.clone(), state.clone());
        self.ca
            .locations_by_key
            .lock()
            .unwrap()
            .insert(self.account_key_pem.clone(), location);
        Ok(CreateRegistration::Created(Arc::new(MockRegistration {
            ca: self.ca.clone(),
            state,
        })))
    }

    async fn bind_registration(&self, location: &str) -> Result<Arc<dyn AcmeRegistration>> {
        self.ca.record(Event::BindRegistration {
            location: location.to_string(),
        });
        let state = self
            .ca
            .registrations
            .lock()
            .unwrap()
            .get(location)
            .cloned()
            .ok_or_else(|| AcmeError::Protocol(format!("unknown registration {location}")))?;
        Ok(Arc::new(MockRegistration {
            ca: self.ca.clone(),
            state,
        }))
    }
}

struct MockRegistration {
    ca: Arc<MockCa>,
    state: Arc<RegistrationState>,
}

#[async_trait]
impl AcmeRegistration for MockRegistration {
    fn location(&self) -> String {
        self.state.location.clone()
    }

    async fn contact_uris(&self) -> Result<Vec<String>> {
        Ok(self.state.contact_uris.lock().unwrap().clone())
    }

    async fn update(&self, contact_uris: &[String], agreement_url: &str) -> Result<()> {
        self.ca.record(Event::UpdateRegistration {
            agreement: agreement_url.to_string(),
        });
        *self.state.contact_uris.lock().unwrap() = contact_uris.to_vec();
        *self.state.agreement.lock().unwrap() = Some(agreement_url.to_string());
        Ok(())
    }

    async fn authorizations(&self) -> Result<Vec<Arc<dyn AcmeAuthorization>>> {
        let authorizations = self.state.authorizations.lock().unwrap();
        Ok(authorizations
            .values()
            .map(|a| a.clone() as Arc<dyn AcmeAuthorization>)
            .collect())
    }

    async fn authorize_domain(&self, domain: &str) -> Result<Arc<dyn AcmeAuthorization>> {
        self.ca.record(Event::AuthorizeDomain {
            domain: domain.to_string(),
        });
        let status = Arc::new(Mutex::new(AcmeStatus::Pending));
        let challenge = Arc::new(MockChallenge {
            ca: self.ca.clone(),
            domain: domain.to_string(),
            subject: format!("{}.mock.acme.invalid", domain.replace('.', "-")),
            triggered: AtomicBool::new(false),
            status: status.clone(),
        });
        let authorization = Arc::new(MockAuthorization {
            domain: domain.to_string(),
            status,
            challenge,
        });
        self.state
            .authorizations
            .lock()
            .unwrap()
            .insert(domain.to_string(), authorization.clone());
        Ok(authorization)
    }

    async fn request_certificate(
        &self,
        csr_der: &[u8],
    ) -> Result<Option<Arc<dyn AcmeCertificateOrder>>> {
        let hostnames = csr_dns_names(csr_der);
        self.ca.record(Event::CsrRequested {
            hostnames: hostnames.clone(),
        });
        let days = *self.ca.leaf_validity_days.lock().unwrap();
        let not_before_days = *self.ca.leaf_not_before_days.lock().unwrap();
        let leaf_pem = issue_leaf(&self.ca.ca_key, csr_der, &hostnames, not_before_days, days);
        Ok(Some(Arc::new(MockOrder {
            leaf_pem,
            chain_pems: vec![self.ca.ca_cert_pem.clone()],
        })))
    }
}

struct MockAuthorization {
    domain: String,
    status: Arc<Mutex<AcmeStatus>>,
    challenge: Arc<MockChallenge>,
}

#[async_trait]
impl AcmeAuthorization for MockAuthorization {
    fn domain(&self) -> String {
        self.domain.clone()
    }

    async fn status(&self) -> Result<AcmeStatus> {
        Ok(*self.status.lock().unwrap())
    }

    async fn combinations(&self) -> Result<Vec<Vec<Arc<dyn AcmeChallenge>>>> {
        Ok(vec![vec![self.challenge.clone() as Arc<dyn AcmeChallenge>]])
    }
}

struct MockChallenge {
    ca: Arc<MockCa>,
    domain: String,
    subject: String,
    triggered: AtomicBool,
    status: Arc<Mutex<AcmeStatus>>,
}

#[async_trait]
impl AcmeChallenge for MockChallenge {
    fn kind(&self) -> ChallengeKind {
        ChallengeKind::TlsSni01 {
            subject: self.subject.clone(),
        }
    }

    async fn trigger(&self) -> Result<()> {
        self.ca.record(Event::TriggerChallenge {
            domain: self.domain.clone(),
        });
        self.triggered.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn poll(&self) -> Result<AcmeStatus> {
        if !self.triggered.load(Ordering::SeqCst) {
            return Ok(AcmeStatus::Pending);
        }
        let failing = self
            .ca
            .failing_domains
            .lock()
            .unwrap()
            .contains(&self.domain);
        let status = if failing {
            AcmeStatus::Invalid
        } else {
            AcmeStatus::Valid
        };
        *self.status.lock().unwrap() = status;
        Ok(status)
    }
}

struct MockOrder {
    leaf_pem: String,
    chain_pems: Vec<String>,
}

#[async_trait]
impl AcmeCertificateOrder for MockOrder {
    async fn download_certificate(&self) -> Result<Option<String>> {
        Ok(Some(self.leaf_pem.clone()))
    }

    async fn download_chain(&self) -> Result<Option<Vec<String>>> {
        Ok(Some(self.chain_pems.clone()))
    }
}

// ---------------------------------------------------------------------------
// certificate minting helpers

fn generate_key(bits: u32) -> PKey<Private> {
    PKey::from_rsa(Rsa::generate(bits).unwrap()).unwrap()
}

fn self_signed_ca(key: &PKey<Private>) -> String {
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_nid(Nid::COMMONNAME, "Mock CA Root").unwrap();
    let name = name.build();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    builder.set_serial_number(&random_serial()).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(3650).unwrap())
        .unwrap();
    builder.set_pubkey(key).unwrap();
    builder.sign(key, MessageDigest::sha256()).unwrap();
    String::from_utf8(builder.build().to_pem().unwrap()).unwrap()
}

fn random_serial() -> openssl::asn1::Asn1Integer {
    let mut serial = BigNum::new().unwrap();
    serial.rand(159, MsbOption::MAYBE_ZERO, false).unwrap();
    serial.to_asn1_integer().unwrap()
}

/// Sign the CSR's public key into a leaf carrying the CSR's DNS names.
fn issue_leaf(
    ca_key: &PKey<Private>,
    csr_der: &[u8],
    hostnames: &[String],
    not_before_days: u32,
    days: u32,
) -> String {
    let req = X509Req::from_der(csr_der).unwrap();
    let req_pubkey = req.public_key().unwrap();

    let mut issuer = X509NameBuilder::new().unwrap();
    issuer
        .append_entry_by_nid(Nid::COMMONNAME, "Mock CA Root")
        .unwrap();
    let issuer = issuer.build();

    let mut subject = X509NameBuilder::new().unwrap();
    subject
        .append_entry_by_nid(Nid::COMMONNAME, &hostnames[0])
        .unwrap();
    let subject = subject.build();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    builder.set_serial_number(&random_serial()).unwrap();
    builder.set_subject_name(&subject).unwrap();
    builder.set_issuer_name(&issuer).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(not_before_days).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(days).unwrap())
        .unwrap();
    builder.set_pubkey(&req_pubkey).unwrap();

    let mut san = SubjectAlternativeName::new();
    for hostname in hostnames {
        san.dns(hostname);
    }
    let san = san.build(&builder.x509v3_context(None, None)).unwrap();
    builder.append_extension(san).unwrap();

    builder.sign(ca_key, MessageDigest::sha256()).unwrap();
    String::from_utf8(builder.build().to_pem().unwrap()).unwrap()
}

/// A PKCS#8 PEM keypair unrelated to anything the engine generated.
pub fn fresh_keypair_pem() -> String {
    let key = generate_key(2048);
    String::from_utf8(key.private_key_to_pem_pkcs8().unwrap()).unwrap()
}

/// DNS names from a CSR's requested SAN extension.
pub fn csr_dns_names(der: &[u8]) -> Vec<String> {
    let (_, csr) = X509CertificationRequest::from_der(der).unwrap();
    let mut names = Vec::new();
    if let Some(extensions) = csr.requested_extensions() {
        for extension in extensions {
            if let ParsedExtension::SubjectAlternativeName(san) = extension {
                for name in &san.general_names {
                    if let GeneralName::DNSName(dns) = name {
                        names.push(dns.to_string());
                    }
                }
            }
        }
    }
    names
}

// ---------------------------------------------------------------------------
// engine fixture

pub struct TestEngine {
    pub dir: TempDir,
    pub store: Arc<CertStore>,
    pub ca: Arc<MockCa>,
    pub manager: Arc<AcmeManager>,
}

impl TestEngine {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CertStore::new());
        let ca = MockCa::new();
        let manager =
            AcmeManager::with_key_bits(store.clone(), dir.path().join("db"), ca.clone(), 2048);
        TestEngine {
            dir,
            store,
            ca,
            manager,
        }
    }

    /// A fresh store and manager over the same database directory and CA,
    /// as after a process restart.
    pub fn restart(&self) -> (Arc<CertStore>, Arc<AcmeManager>) {
        let store = Arc::new(CertStore::new());
        let manager = AcmeManager::with_key_bits(
            store.clone(),
            self.dir.path().join("db"),
            self.ca.clone(),
            2048,
        );
        (store, manager)
    }

    pub fn db_file(&self, name: &str) -> std::path::PathBuf {
        self.dir.path().join("db").join(name)
    }

    pub fn db_file_exists(&self, name: &str) -> bool {
        self.db_file(name).exists()
    }
}

/// One account ("main") with one default certificate ("api") for
/// api.example.org.
pub fn basic_conf() -> AcmeConfig {
    conf_with_certs(vec![(
        "api",
        Certificate {
            enabled: true,
            default_cert: true,
            organization: "Example Org".to_string(),
            hostnames: vec!["api.example.org".to_string()],
        },
    )])
}

pub fn conf_with_certs(certs: Vec<(&str, Certificate)>) -> AcmeConfig {
    let mut conf = AcmeConfig::empty();
    conf.accounts.insert(
        "main".to_string(),
        Account {
            enabled: true,
            provider_url: PROVIDER_URL.to_string(),
            accepted_agreement_url: AGREEMENT_URL.to_string(),
            contact_uris: vec!["mailto:admin@example.org".to_string()],
            minimum_validity_days: 30,
            certificates: certs
                .into_iter()
                .map(|(id, cert)| (id.to_string(), cert))
                .collect(),
        },
    );
    conf
}

/// Every error in an aggregate tree, attribution wrappers stripped.
pub fn flatten_failures(error: &AcmeError) -> Vec<&AcmeError> {
    match error.root() {
        AcmeError::Aggregate(failures) => {
            failures.iter().flat_map(flatten_failures).collect()
        }
        leaf => vec![leaf],
    }
}
