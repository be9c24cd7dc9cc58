//! Error types for the certificate lifecycle engine.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors produced by the lifecycle engine and the certificate store.
#[derive(Debug, Error)]
pub enum AcmeError {
    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A filesystem operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The CA returned an error other than a retry hint.
    #[error("ACME protocol error: {0}")]
    Protocol(String),

    /// The CA asked us to come back later. Recovered by the retry loop.
    #[error("CA requested retry at {until}")]
    RetryAfter { until: DateTime<Utc> },

    /// A challenge reached a terminal non-valid status.
    #[error("challenge {challenge} for {domain} failed with status {status}")]
    ChallengeFailed {
        challenge: String,
        domain: String,
        status: String,
    },

    /// An installed leaf certificate is not yet valid, which indicates a
    /// clock problem or a CA error.
    #[error("certificate {id} has an unexpected validity period (not yet valid)")]
    InvalidValidityWindow { id: String },

    /// A lifecycle method was called in the wrong controller state.
    #[error("wrong state {state}")]
    IllegalState { state: String },

    /// A key, certificate or CSR could not be parsed or used.
    #[error("invalid key or certificate material: {0}")]
    Material(String),

    /// Attribution wrapper ("For account x", "For certificate y", ...).
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<AcmeError>,
    },

    /// Multiple independent failures collected from a fan-out.
    #[error("{} operation(s) failed: [{}]", .0.len(), .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
    Aggregate(Vec<AcmeError>),
}

impl AcmeError {
    /// Wrap this error with an attribution message.
    pub fn describe(self, context: impl Into<String>) -> Self {
        AcmeError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Strip attribution wrappers down to the underlying error.
    pub fn root(&self) -> &AcmeError {
        match self {
            AcmeError::Context { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Result type alias used across the crate.
pub type Result<T, E = AcmeError> = std::result::Result<T, E>;

pub(crate) trait ResultExt<T> {
    /// Attach an attribution message to the error, if any.
    fn describe(self, context: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn describe(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.describe(context))
    }
}

/// Collect fan-out results, wrapping any failures into an aggregate error.
pub(crate) fn collect_failures(results: Vec<Result<()>>) -> Result<()> {
    let failures: Vec<AcmeError> = results.into_iter().filter_map(Result::err).collect();
    if failures.is_empty() {
        Ok(())
    } else {
        Err(AcmeError::Aggregate(failures))
    }
}
