//! Draining the batch queue onto the ledger.

use std::sync::atomic::Ordering;

use capsule_cbor::Hash;
use capsule_store::StateStoreExt;
use futures::FutureExt;
use indexmap::IndexSet;
use log::{info, warn};

use crate::{
    batch::{Batch, OutputRef},
    compile::compile,
    error::KernelError,
    ids::{BatchSeq, Credential, Slot, VersionId, VersionRef},
    kernel::Kernel,
    ledger::{LedgerTx, PublishedBatch, SpendStatus, TxIn, TxOut},
    record::{BuildPlan, CompiledBatch},
    runtime::{DrainFuture, Runtime, WaiterGuard},
};

impl Kernel {
    pub fn compile_pending(&self, seq: BatchSeq) -> Result<CompiledBatch, KernelError> {
        let batch = self
            .queue
            .iter()
            .find(|b| b.seq == seq)
            .ok_or_else(|| KernelError::Validity(format!("batch {seq} is not queued")))?;
        Ok(compile(batch, &self.arena, &self.config.app, self.config.protocol)?.payload)
    }

    /// Compile the batch still accumulating, as it would look if closed now.
    pub fn compile_open(&self) -> Result<Option<CompiledBatch>, KernelError> {
        if self.batch.is_empty() {
            return Ok(None);
        }
        let mut preview = self.batch.clone();
        preview.seal();
        Ok(Some(
            compile(&preview, &self.arena, &self.config.app, self.config.protocol)?.payload,
        ))
    }

    fn compile_head(&self) -> Option<Result<BuildPlan, KernelError>> {
        let batch = self.queue.front()?;
        Some(compile(batch, &self.arena, &self.config.app, self.config.protocol))
    }

    /// Give a batch's outputs their final ids and rewrite later references.
    pub(crate) fn finalize(&mut self, batch: &Batch, txid: Hash) -> Result<PublishedBatch, KernelError> {
        let sealed = batch.sealed()?;
        let mut event = PublishedBatch {
            batch: batch.seq,
            txid,
            outputs: Vec::new(),
            deletes: Vec::new(),
        };
        for (out, slot) in &sealed.slots {
            let version = VersionId::new(txid, *slot);
            match out {
                OutputRef::Capsule(id) => {
                    let capsule = self.arena.capsule_mut(*id)?;
                    capsule.origin.resolve(batch.seq, txid);
                    capsule.location.resolve(batch.seq, txid);
                }
                OutputRef::Code(id) => {
                    let artifact = self.arena.code_mut(*id)?;
                    artifact.origin.resolve(batch.seq, txid);
                    artifact.location.resolve(batch.seq, txid);
                    self.code_host.published(&artifact.handle, &version);
                }
            }
            match slot {
                Slot::Output(_) => event.outputs.push(version),
                Slot::Deleted(_) => event.deletes.push(version),
            }
        }
        for later in self.queue.iter_mut() {
            later.resolve_pending(batch.seq, txid);
        }
        self.batch.resolve_pending(batch.seq, txid);
        Ok(event)
    }

    /// Undo every queued batch, newest first.
    pub(crate) fn rollback_queue(&mut self, poison: bool, reason: &str) -> Vec<String> {
        let batches: Vec<Batch> = self.queue.drain(..).collect();
        let mut errors = Vec::new();
        for batch in batches.iter().rev() {
            errors.extend(self.rollback_batch(batch, poison, reason));
        }
        errors
    }
}

/// Ledger transaction for a plan, with the parents and credentials to sign.
fn build_tx(plan: &BuildPlan) -> Result<(LedgerTx, Vec<TxOut>, Vec<Credential>), KernelError> {
    let mut inputs = Vec::with_capacity(plan.spends.len());
    let mut parents = Vec::with_capacity(plan.spends.len());
    let mut credentials = IndexSet::new();
    for spend in &plan.spends {
        let outpoint = match spend.version {
            VersionRef::Final(id) => id,
            VersionRef::Pending(p) => {
                return Err(KernelError::Invariant(format!(
                    "input {p} was not published before its spender"
                )));
            }
        };
        inputs.push(TxIn {
            outpoint,
            credential: spend.owner.clone(),
            witness: None,
        });
        parents.push(TxOut {
            credential: spend.owner.clone(),
            units: spend.units,
        });
        credentials.insert(spend.owner.clone());
    }
    let outputs = plan
        .produces
        .iter()
        .map(|p| TxOut {
            credential: p.owner.clone(),
            units: p.units,
        })
        .collect();
    let tx = LedgerTx {
        payload: Some(plan.payload.clone()),
        inputs,
        outputs,
    };
    Ok((tx, parents, credentials.into_iter().collect()))
}

/// Capsule inputs must be signed and funding must leave capsule slots alone.
fn preflight(unsigned: &LedgerTx, signed: &LedgerTx) -> Result<(), KernelError> {
    let n_in = unsigned.inputs.len();
    let n_out = unsigned.outputs.len();
    if signed.inputs.len() < n_in
        || signed.outputs.len() < n_out
        || signed.payload != unsigned.payload
        || signed.outputs[..n_out] != unsigned.outputs[..]
        || signed.inputs[..n_in]
            .iter()
            .zip(&unsigned.inputs)
            .any(|(a, b)| a.outpoint != b.outpoint)
    {
        return Err(KernelError::Publish(
            "funding or signing altered the capsule inputs or outputs".into(),
        ));
    }
    for input in &signed.inputs[..n_in] {
        if input.witness.is_none() {
            return Err(KernelError::Publish(format!(
                "missing signature for {}; is the credential correct?",
                input.outpoint
            )));
        }
    }
    Ok(())
}

impl Runtime {
    /// Return the running drain or start a new one.
    pub(crate) fn start_drain(&self) -> DrainFuture {
        let mut slot = self
            .inner
            .drain
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(running) = slot.as_ref() {
            return running.clone();
        }
        let runtime = self.clone();
        let drain = async move { runtime.drain().await }.boxed().shared();
        *slot = Some(drain.clone());
        drain
    }

    /// Publish every queued batch. Resolves once the queue is empty.
    pub async fn sync(&self) -> Result<(), KernelError> {
        let _waiter = WaiterGuard::new(&self.inner.waiters);
        loop {
            self.start_drain().await?;
            if self.kernel().queue.is_empty() {
                return Ok(());
            }
        }
    }

    async fn drain(self) -> Result<(), KernelError> {
        loop {
            let plan = {
                let mut slot = self
                    .inner
                    .drain
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                let kernel = self.kernel();
                match kernel.compile_head() {
                    None => {
                        *slot = None;
                        return Ok(());
                    }
                    Some(plan) => plan,
                }
            };
            let outcome = match plan {
                Ok(plan) => self.publish(&plan).await.map(|txid| (plan, txid)),
                Err(err) => Err(err),
            };
            let result = match outcome {
                Ok((plan, txid)) => self.commit(&plan, txid),
                Err(err) => Err(self.abandon(err)),
            };
            if let Err(err) = result {
                self.clear_drain();
                return Err(err);
            }
        }
    }

    fn clear_drain(&self) {
        *self
            .inner
            .drain
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }

    async fn publish(&self, plan: &BuildPlan) -> Result<Hash, KernelError> {
        for reference in &plan.payload.refs {
            let VersionRef::Final(version) = reference else {
                return Err(KernelError::Invariant(format!(
                    "read reference {reference} was not published before its reader"
                )));
            };
            match self.inner.ledger.spends(version).await? {
                SpendStatus::Unspent => {}
                SpendStatus::SpentBy(txid) => {
                    return Err(KernelError::Consistency(format!(
                        "read reference {version} was spent by {}; must resync",
                        txid.short()
                    )));
                }
                SpendStatus::Unknown => {
                    return Err(KernelError::LedgerApi(format!(
                        "ledger gave no spend information for {version}"
                    )));
                }
            }
        }

        let (unsigned, parents, credentials) = build_tx(plan)?;
        let funded = self
            .inner
            .funding
            .pay(unsigned.clone())
            .await
            .map_err(|e| KernelError::Publish(format!("funding failed: {e}")))?;
        let signed = self
            .inner
            .signer
            .sign(funded, &parents, &credentials)
            .await
            .map_err(|e| KernelError::Publish(format!("signing failed: {e}")))?;
        preflight(&unsigned, &signed)?;
        self.inner
            .ledger
            .broadcast(&signed)
            .await
            .map_err(|e| KernelError::Publish(format!("broadcast failed: {e}")))
    }

    /// Record a successful broadcast: final ids, stored states, observers.
    fn commit(&self, plan: &BuildPlan, txid: Hash) -> Result<(), KernelError> {
        let event = {
            let mut kernel = self.kernel();
            let batch = match kernel.queue.pop_front() {
                Some(batch) if batch.seq == plan.batch => batch,
                other => {
                    if let Some(batch) = other {
                        kernel.queue.push_front(batch);
                    }
                    return Err(KernelError::Invariant(format!(
                        "queue head changed while batch {} was publishing",
                        plan.batch
                    )));
                }
            };
            kernel.finalize(&batch, txid)?
        };
        for (slot, record) in &plan.states {
            let key = VersionId::new(txid, *slot).to_string();
            self.inner.states.put_state(&key, record)?;
        }
        info!(
            "published batch {} as {} ({} outputs, {} deletes)",
            event.batch,
            txid.short(),
            event.outputs.len(),
            event.deletes.len()
        );
        for observer in &self.inner.observers {
            observer.on_published(&event);
        }
        Ok(())
    }

    /// Roll back the queue after a failed publish and shape the error.
    fn abandon(&self, err: KernelError) -> KernelError {
        let poison = self.inner.waiters.load(Ordering::SeqCst) == 0;
        let reason = err.to_string();
        let errors = self.kernel().rollback_queue(poison, &reason);
        if poison {
            warn!("publish failed with nobody waiting; touched capsules poisoned: {reason}");
        } else {
            warn!("publish failed; queued batches rolled back: {reason}");
        }
        if errors.is_empty() {
            err
        } else {
            KernelError::Rollback {
                primary: Box::new(err),
                errors,
            }
        }
    }
}
