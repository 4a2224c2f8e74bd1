//! Ledger transaction shape and the collaborators that fund, sign and
//! broadcast it.

use async_trait::async_trait;
use capsule_cbor::Hash;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    ids::{BatchSeq, Credential, VersionId},
    record::CompiledBatch,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxIn {
    pub outpoint: VersionId,
    pub credential: Credential,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "serde_bytes")]
    pub witness: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOut {
    pub credential: Credential,
    pub units: u64,
}

/// A ledger transaction. Capsule inputs and outputs come first, in slot
/// order; funding inputs and change outputs follow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LedgerTx {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<CompiledBatch>,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
}

impl LedgerTx {
    pub fn txid(&self) -> Result<Hash, serde_cbor::Error> {
        Hash::of_cbor(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpendStatus {
    Unspent,
    SpentBy(Hash),
    /// The ledger could not say.
    Unknown,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("transport: {0}")]
    Transport(String),
}

#[async_trait]
pub trait Ledger: Send + Sync {
    async fn broadcast(&self, tx: &LedgerTx) -> Result<Hash, LedgerError>;
    async fn fetch(&self, txid: &Hash) -> Result<LedgerTx, LedgerError>;
    async fn utxos(&self, credential: &Credential) -> Result<Vec<VersionId>, LedgerError>;
    async fn spends(&self, outpoint: &VersionId) -> Result<SpendStatus, LedgerError>;
}

/// Adds funding inputs and change so the transaction can pay for itself.
#[async_trait]
pub trait Funding: Send + Sync {
    async fn pay(&self, tx: LedgerTx) -> Result<LedgerTx, LedgerError>;
}

/// Attaches witnesses for inputs locked by credentials it controls.
#[async_trait]
pub trait Authorization: Send + Sync {
    async fn sign(
        &self,
        tx: LedgerTx,
        parents: &[TxOut],
        credentials: &[Credential],
    ) -> Result<LedgerTx, LedgerError>;
}

/// Outcome of one successful publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedBatch {
    pub batch: BatchSeq,
    pub txid: Hash,
    pub outputs: Vec<VersionId>,
    pub deletes: Vec<VersionId>,
}

pub trait PublishObserver: Send + Sync {
    fn on_published(&self, event: &PublishedBatch);
}
