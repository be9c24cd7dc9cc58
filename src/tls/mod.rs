// Dynamic certificate store and the PEM/X.509 utilities it consumes

pub mod pem;
pub mod store;

pub use store::{CertEntry, CertStore, KeystoreSnapshot};
