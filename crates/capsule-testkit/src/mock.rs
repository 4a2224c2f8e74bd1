//! In-memory stand-ins for the ledger, funding, signing and code hosting.
//!
//! - [`MockLedger`]: a single-chain UTXO ledger with spend tracking
//! - [`MockFunding`]: adds one funding input and a change output per transaction
//! - [`MockSigner`]: witnesses inputs locked by credentials in its keyring
//! - [`MockCodeHost`]: a registry of definitions shared across runtimes

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use capsule_cbor::Hash;
use capsule_kernel::{
    Authorization, CodeDefinition, CodeHandle, CodeHost, CodeKey, Credential, Funding,
    KernelError, Ledger, LedgerError, LedgerTx, SpendStatus, TxIn, TxOut, VersionId,
};
use indexmap::IndexMap;
use log::debug;
use sha2::{Digest, Sha256};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct LedgerState {
    txs: HashMap<Hash, LedgerTx>,
    unspent: IndexMap<VersionId, Credential>,
    spent: HashMap<VersionId, Hash>,
    fail_next: Option<String>,
    hide_spends: bool,
    minted: u64,
    fetches: usize,
}

/// Accepts a transaction only if every input is unspent and witnessed.
#[derive(Default)]
pub struct MockLedger {
    state: Mutex<LedgerState>,
}

impl MockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next broadcast with `reason`.
    pub fn fail_next_broadcast(&self, reason: impl Into<String>) {
        lock(&self.state).fail_next = Some(reason.into());
    }

    /// Answer every spend query with [`SpendStatus::Unknown`].
    pub fn hide_spends(&self, hide: bool) {
        lock(&self.state).hide_spends = hide;
    }

    /// How many times `fetch` has been called.
    pub fn fetch_count(&self) -> usize {
        lock(&self.state).fetches
    }

    pub fn tx_count(&self) -> usize {
        lock(&self.state).txs.len()
    }

    pub fn transaction(&self, txid: &Hash) -> Option<LedgerTx> {
        lock(&self.state).txs.get(txid).cloned()
    }

    /// Create a payload-free coin for `credential` and return its outpoint.
    pub fn mint(&self, credential: &Credential, units: u64) -> VersionId {
        let mut state = lock(&self.state);
        state.minted += 1;
        let tx = LedgerTx {
            payload: None,
            inputs: Vec::new(),
            outputs: vec![TxOut {
                credential: credential.clone(),
                units: units + state.minted,
            }],
        };
        let txid = Hash::of_bytes(format!("mint:{}:{credential}", state.minted).as_bytes());
        let outpoint = VersionId::output(txid, 0);
        state.unspent.insert(outpoint, credential.clone());
        state.txs.insert(txid, tx);
        outpoint
    }
}

#[async_trait]
impl Ledger for MockLedger {
    async fn broadcast(&self, tx: &LedgerTx) -> Result<Hash, LedgerError> {
        let mut state = lock(&self.state);
        if let Some(reason) = state.fail_next.take() {
            return Err(LedgerError::Rejected(reason));
        }
        let txid = tx
            .txid()
            .map_err(|e| LedgerError::Rejected(format!("undecodable transaction: {e}")))?;
        let mut seen = HashSet::new();
        for input in &tx.inputs {
            if !state.unspent.contains_key(&input.outpoint) || !seen.insert(input.outpoint) {
                return Err(LedgerError::Rejected(format!(
                    "{} is spent or unknown",
                    input.outpoint
                )));
            }
            if input.witness.is_none() {
                return Err(LedgerError::Rejected(format!(
                    "{} carries no witness",
                    input.outpoint
                )));
            }
        }
        for input in &tx.inputs {
            state.unspent.shift_remove(&input.outpoint);
            state.spent.insert(input.outpoint, txid);
        }
        for (index, output) in tx.outputs.iter().enumerate() {
            state
                .unspent
                .insert(VersionId::output(txid, index as u32), output.credential.clone());
        }
        state.txs.insert(txid, tx.clone());
        debug!("mock ledger accepted {}", txid.short());
        Ok(txid)
    }

    async fn fetch(&self, txid: &Hash) -> Result<LedgerTx, LedgerError> {
        let mut state = lock(&self.state);
        state.fetches += 1;
        state
            .txs
            .get(txid)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(txid.to_bare_hex()))
    }

    async fn utxos(&self, credential: &Credential) -> Result<Vec<VersionId>, LedgerError> {
        Ok(lock(&self.state)
            .unspent
            .iter()
            .filter(|(_, owner)| *owner == credential)
            .map(|(outpoint, _)| *outpoint)
            .collect())
    }

    async fn spends(&self, outpoint: &VersionId) -> Result<SpendStatus, LedgerError> {
        let state = lock(&self.state);
        if state.hide_spends {
            return Ok(SpendStatus::Unknown);
        }
        if let Some(txid) = state.spent.get(outpoint) {
            return Ok(SpendStatus::SpentBy(*txid));
        }
        if state.unspent.contains_key(outpoint) {
            return Ok(SpendStatus::Unspent);
        }
        Err(LedgerError::NotFound(outpoint.to_string()))
    }
}

/// Pays from freshly minted coins owned by `funder`.
pub struct MockFunding {
    ledger: Arc<MockLedger>,
    funder: Credential,
    fail_next: Mutex<Option<String>>,
}

impl MockFunding {
    pub fn new(ledger: Arc<MockLedger>, funder: Credential) -> Self {
        Self {
            ledger,
            funder,
            fail_next: Mutex::new(None),
        }
    }

    pub fn fail_next(&self, reason: impl Into<String>) {
        *lock(&self.fail_next) = Some(reason.into());
    }
}

#[async_trait]
impl Funding for MockFunding {
    async fn pay(&self, mut tx: LedgerTx) -> Result<LedgerTx, LedgerError> {
        if let Some(reason) = lock(&self.fail_next).take() {
            return Err(LedgerError::Rejected(reason));
        }
        let coin = self.ledger.mint(&self.funder, 1_000);
        tx.inputs.push(TxIn {
            outpoint: coin,
            credential: self.funder.clone(),
            witness: Some(b"funding".to_vec()),
        });
        tx.outputs.push(TxOut {
            credential: self.funder.clone(),
            units: 900,
        });
        Ok(tx)
    }
}

/// Signs every input whose credential is in the keyring.
pub struct MockSigner {
    keys: Mutex<HashSet<Credential>>,
}

impl MockSigner {
    pub fn new(keys: impl IntoIterator<Item = Credential>) -> Self {
        Self {
            keys: Mutex::new(keys.into_iter().collect()),
        }
    }

    pub fn add_key(&self, key: Credential) {
        lock(&self.keys).insert(key);
    }
}

#[async_trait]
impl Authorization for MockSigner {
    async fn sign(
        &self,
        mut tx: LedgerTx,
        _parents: &[TxOut],
        credentials: &[Credential],
    ) -> Result<LedgerTx, LedgerError> {
        let keys = lock(&self.keys);
        for input in tx.inputs.iter_mut() {
            if input.witness.is_some() || !keys.contains(&input.credential) {
                continue;
            }
            if !credentials.contains(&input.credential) {
                continue;
            }
            let mut hasher = Sha256::new();
            hasher.update(input.credential.to_string().as_bytes());
            hasher.update(input.outpoint.to_string().as_bytes());
            input.witness = Some(hasher.finalize().to_vec());
        }
        Ok(tx)
    }
}

#[derive(Default)]
struct HostState {
    definitions: HashMap<Hash, Arc<CodeDefinition>>,
    locations: HashMap<VersionId, Hash>,
    deploy_calls: usize,
}

/// Code registry shared by every runtime on a test network.
#[derive(Default)]
pub struct MockCodeHost {
    state: Mutex<HostState>,
}

impl MockCodeHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a definition available without a deploy call.
    pub fn install(&self, definition: CodeDefinition) -> Result<Hash, KernelError> {
        let digest = definition.digest()?;
        lock(&self.state)
            .definitions
            .insert(digest, Arc::new(definition));
        Ok(digest)
    }

    pub fn deploy_calls(&self) -> usize {
        lock(&self.state).deploy_calls
    }

    pub fn location_of(&self, digest: &Hash) -> Option<VersionId> {
        lock(&self.state)
            .locations
            .iter()
            .find(|(_, d)| *d == digest)
            .map(|(location, _)| *location)
    }
}

impl CodeHost for MockCodeHost {
    fn deploy(&self, definition: Arc<CodeDefinition>) -> Result<CodeHandle, KernelError> {
        let digest = definition.digest()?;
        let mut state = lock(&self.state);
        state.deploy_calls += 1;
        let definition = state
            .definitions
            .entry(digest)
            .or_insert(definition)
            .clone();
        Ok(CodeHandle { digest, definition })
    }

    fn installed(&self, key: &CodeKey) -> Option<CodeHandle> {
        let state = lock(&self.state);
        let digest = match key {
            CodeKey::Digest(digest) => *digest,
            CodeKey::Location(location) => *state.locations.get(location)?,
        };
        state.definitions.get(&digest).map(|definition| CodeHandle {
            digest,
            definition: definition.clone(),
        })
    }

    fn published(&self, handle: &CodeHandle, location: &VersionId) {
        lock(&self.state).locations.insert(*location, handle.digest);
    }
}
