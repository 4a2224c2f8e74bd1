//! Snapshot storage keyed by ledger version id, plus filesystem and in-memory backends.
//!
//! A snapshot stored under a final version id is immutable: writing the same
//! bytes again is a no-op, writing different bytes is a [`StoreError::Conflict`].

mod fs_store;
mod mem_store;

pub use fs_store::FsStateStore;
pub use mem_store::MemStateStore;

use capsule_cbor::{Hash, to_canonical_cbor};
use serde::{Serialize, de::DeserializeOwned};
use std::{io, path::PathBuf, sync::Arc};

pub type StoreResult<T> = Result<T, StoreError>;
pub type DynStateStore = Arc<dyn StateStore>;

/// Trait implemented by all snapshot stores. Keys are rendered version ids.
pub trait StateStore: Send + Sync {
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;
    fn set(&self, key: &str, bytes: &[u8]) -> StoreResult<()>;
}

/// Typed helpers layered over any [`StateStore`].
pub trait StateStoreExt: StateStore {
    /// Encode `value` canonically and store it, returning the content hash.
    fn put_state<T: Serialize>(&self, key: &str, value: &T) -> StoreResult<Hash> {
        let bytes = to_canonical_cbor(value)?;
        self.set(key, &bytes)?;
        Ok(Hash::of_bytes(&bytes))
    }

    fn get_state<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        match self.get(key)? {
            Some(bytes) => Ok(Some(serde_cbor::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

impl<S: StateStore + ?Sized> StateStoreExt for S {}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("CBOR serialization error: {0}")]
    Cbor(#[from] serde_cbor::Error),
    #[error("snapshot for '{key}' already stored with different content ({existing} != {incoming})")]
    Conflict {
        key: String,
        existing: Hash,
        incoming: Hash,
    },
    #[error("invalid store key '{0}'")]
    InvalidKey(String),
}

pub(crate) fn io_error(path: impl Into<PathBuf>, err: io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source: err,
    }
}

/// Compare existing bytes against an incoming write for the same key.
pub(crate) fn check_overwrite(key: &str, existing: &[u8], incoming: &[u8]) -> StoreResult<()> {
    if existing == incoming {
        return Ok(());
    }
    Err(StoreError::Conflict {
        key: key.to_string(),
        existing: Hash::of_bytes(existing),
        incoming: Hash::of_bytes(incoming),
    })
}

/// Keys become file names, so only the characters a version id uses are allowed.
pub(crate) fn validate_key(key: &str) -> StoreResult<()> {
    let ok = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == ':');
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}
