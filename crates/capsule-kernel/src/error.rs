use thiserror::Error;

/// Errors surfaced by the accounting kernel.
///
/// Every variant carries owned strings so a single publish outcome can be
/// cloned out to every caller awaiting `sync`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KernelError {
    /// Privacy or identity-field violation, or a write from outside the
    /// capsule's own methods. Never retried.
    #[error("capability error: {0}")]
    Capability(String),
    /// Poisoned capsule, or a read that needs a sync first.
    #[error("validity error: {0}")]
    Validity(String),
    /// Two versions of one identity met in a batch, or a read reference is stale.
    #[error("consistency error: {0}")]
    Consistency(String),
    #[error("state change not allowed: {0}")]
    StateChangeNotAllowed(String),
    /// Funding, signing or broadcast rejection.
    #[error("publish error: {0}")]
    Publish(String),
    #[error("internal invariant violated: {0}")]
    Invariant(String),
    #[error("ledger api error: {0}")]
    LedgerApi(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("encoding error: {0}")]
    Encoding(String),
    #[error("method '{method}' not found on '{code}'")]
    MethodNotFound { code: String, method: String },
    /// Raised by capsule method bodies.
    #[error("{0}")]
    User(String),
    #[error("{primary}; rollback also failed: {}", .errors.join("; "))]
    Rollback {
        primary: Box<KernelError>,
        errors: Vec<String>,
    },
}

impl KernelError {
    /// Convenience for method bodies that want to reject a call.
    pub fn user(msg: impl Into<String>) -> Self {
        KernelError::User(msg.into())
    }

    /// The error that caused a rollback, looking through the aggregate wrapper.
    pub fn primary(&self) -> &KernelError {
        match self {
            KernelError::Rollback { primary, .. } => primary.primary(),
            other => other,
        }
    }
}

impl From<capsule_store::StoreError> for KernelError {
    fn from(err: capsule_store::StoreError) -> Self {
        match err {
            capsule_store::StoreError::Conflict { .. } => KernelError::Invariant(err.to_string()),
            other => KernelError::Store(other.to_string()),
        }
    }
}

impl From<serde_cbor::Error> for KernelError {
    fn from(err: serde_cbor::Error) -> Self {
        KernelError::Encoding(err.to_string())
    }
}

impl From<crate::ledger::LedgerError> for KernelError {
    fn from(err: crate::ledger::LedgerError) -> Self {
        KernelError::LedgerApi(err.to_string())
    }
}
