use std::{
    collections::{HashMap, VecDeque},
    mem,
    sync::Arc,
};

use capsule_cbor::Hash;
use indexmap::IndexMap;
use log::{debug, warn};

use crate::{
    arena::{Arena, Capsule, CodeArtifact, Validity},
    batch::{Batch, OutputRef},
    code::{BUILTIN_METHODS, CodeDefinition, CodeHandle, CodeHost, CodeKey, Deployment},
    config::KernelConfig,
    control::{CallControl, CallOrigin},
    error::KernelError,
    ids::{BatchSeq, CapsuleId, CodeId, Credential, Provisional, Slot, Version},
    value::Value,
};

/// Read-only copy of a capsule for inspection.
#[derive(Debug, Clone, PartialEq)]
pub struct CapsuleView {
    pub id: CapsuleId,
    pub code: CodeId,
    pub code_name: String,
    pub origin: Version,
    pub location: Version,
    pub owner: Credential,
    pub units: u64,
    pub fields: IndexMap<String, Value>,
    pub validity: Validity,
}

/// Single-threaded core: arena, invocation bookkeeping, open batch and
/// the queue of closed batches awaiting publish.
pub struct Kernel {
    pub(crate) config: KernelConfig,
    pub(crate) arena: Arena,
    pub(crate) control: CallControl,
    pub(crate) batch: Batch,
    pub(crate) queue: VecDeque<Batch>,
    next_seq: BatchSeq,
    pub(crate) code_host: Arc<dyn CodeHost>,
    hosted: HashMap<Hash, CodeHandle>,
    /// Live deployment per definition digest.
    deployed: HashMap<Hash, CodeId>,
}

impl Kernel {
    pub fn new(config: KernelConfig, code_host: Arc<dyn CodeHost>) -> Self {
        Self {
            config,
            arena: Arena::default(),
            control: CallControl::new(CallOrigin::External),
            batch: Batch::new(0),
            queue: VecDeque::new(),
            next_seq: 1,
            code_host,
            hosted: HashMap::new(),
            deployed: HashMap::new(),
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub(crate) fn alloc_seq(&mut self) -> BatchSeq {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Install a definition with the code host, once per digest.
    pub(crate) fn host(&mut self, definition: Arc<CodeDefinition>) -> Result<CodeHandle, KernelError> {
        let digest = definition.digest()?;
        if let Some(handle) = self.hosted.get(&digest) {
            return Ok(handle.clone());
        }
        let handle = match self.code_host.installed(&CodeKey::Digest(digest)) {
            Some(handle) => handle,
            None => self.code_host.deploy(definition)?,
        };
        self.hosted.insert(digest, handle.clone());
        Ok(handle)
    }

    pub(crate) fn hosted(&self, key: &CodeKey) -> Option<CodeHandle> {
        if let CodeKey::Digest(digest) = key {
            if let Some(handle) = self.hosted.get(digest) {
                return Some(handle.clone());
            }
        }
        self.code_host.installed(key)
    }

    pub fn deploy(&mut self, deployment: Deployment) -> Result<CodeId, KernelError> {
        if !self.control.is_idle() {
            return Err(KernelError::Invariant(
                "code cannot be deployed from inside a method".into(),
            ));
        }
        let definition = deployment.definition;
        if let Some(name) = definition
            .method_names()
            .find(|m| BUILTIN_METHODS.contains(m))
        {
            return Err(KernelError::Capability(format!(
                "'{name}' is a built-in method and cannot be redefined"
            )));
        }
        let digest = definition.digest()?;
        if let Some(existing) = self.deployed.get(&digest) {
            return Ok(*existing);
        }
        for dep in deployment.parent.iter().chain(deployment.deps.values()) {
            self.check_code_usable(*dep)?;
        }
        let handle = self.host(definition)?;
        let id = self.insert_deployment(handle, deployment.parent, deployment.deps, self.config.owner.clone());
        self.deployed.insert(digest, id);
        self.store_code(id)?;
        debug!("deployed {} as {id}", self.arena.code(id)?.name());
        Ok(id)
    }

    pub(crate) fn insert_deployment(
        &mut self,
        handle: CodeHandle,
        parent: Option<CodeId>,
        deps: IndexMap<String, CodeId>,
        owner: Credential,
    ) -> CodeId {
        self.arena.insert_code(CodeArtifact {
            handle,
            origin: Version::Unbound,
            location: Version::Unbound,
            owner,
            parent,
            deps,
            validity: Validity::Live,
        })
    }

    pub(crate) fn check_code_usable(&self, code: CodeId) -> Result<(), KernelError> {
        let artifact = self.arena.code(code)?;
        if let Validity::Poisoned(reason) = &artifact.validity {
            return Err(KernelError::Validity(format!("{} is poisoned: {reason}", artifact.name())));
        }
        if artifact.origin.is_unbound() {
            return Err(KernelError::Validity(format!(
                "{} was never published; deploy it again",
                artifact.name()
            )));
        }
        Ok(())
    }

    pub fn begin(&mut self) {
        self.batch.begin();
    }

    /// Close one scope; returns the sequence number if a batch was queued.
    pub fn end(&mut self) -> Result<Option<BatchSeq>, KernelError> {
        let depth = self.batch.end()?;
        if depth > 0 || self.batch.is_empty() || self.batch.detached {
            return Ok(None);
        }
        Ok(Some(self.close_batch()))
    }

    pub(crate) fn store_code(&mut self, code: CodeId) -> Result<(), KernelError> {
        self.batch.begin();
        let provisional = self.batch.store_code(code);
        let artifact = self.arena.code_mut(code)?;
        artifact.origin = Version::Pending(provisional);
        artifact.location = Version::Pending(provisional);
        self.end().map(|_| ())
    }

    fn close_batch(&mut self) -> BatchSeq {
        let next = self.alloc_seq();
        let mut batch = mem::replace(&mut self.batch, Batch::new(next));
        let slots = batch.seal();
        self.stamp(batch.seq, &slots);
        let seq = batch.seq;
        debug!(
            "batch {seq} closed: {} steps, {} inputs, {} outputs",
            batch.steps.len(),
            batch.inputs.len(),
            batch.outputs.len()
        );
        self.queue.push_back(batch);
        seq
    }

    /// Point outputs still owned by batch `seq` at their pending slot.
    pub(crate) fn stamp(&mut self, seq: BatchSeq, slots: &[(OutputRef, Slot)]) {
        for (out, slot) in slots {
            let version = Version::Pending(Provisional { batch: seq, slot: *slot });
            let (origin, location) = match out {
                OutputRef::Capsule(id) => match self.arena.capsule_mut(*id) {
                    Ok(c) => (&mut c.origin, &mut c.location),
                    Err(_) => continue,
                },
                OutputRef::Code(id) => match self.arena.code_mut(*id) {
                    Ok(c) => (&mut c.origin, &mut c.location),
                    Err(_) => continue,
                },
            };
            if origin.pending_in(seq) {
                *origin = version;
            }
            if location.pending_in(seq) {
                *location = version;
            }
        }
    }

    /// Whether an unpublished batch holds the capsule.
    pub fn is_checked_out(&self, id: CapsuleId) -> bool {
        self.batch.involves(id) || self.queue.iter().any(|b| b.involves(id))
    }

    pub fn pending_batches(&self) -> Vec<BatchSeq> {
        self.queue.iter().map(|b| b.seq).collect()
    }

    pub fn view(&self, id: CapsuleId) -> Result<CapsuleView, KernelError> {
        let capsule = self.arena.capsule(id)?;
        Ok(CapsuleView {
            id,
            code: capsule.code,
            code_name: self.arena.code(capsule.code)?.name().to_string(),
            origin: capsule.origin,
            location: capsule.location,
            owner: capsule.owner.clone(),
            units: capsule.units,
            fields: capsule.fields.clone(),
            validity: capsule.validity.clone(),
        })
    }

    /// Undo a queued batch after a failed publish.
    ///
    /// With `poison` every touched capsule becomes unusable. Otherwise
    /// pre-batch state is restored and first-time outputs lose their
    /// identity so the application can redo the work.
    pub(crate) fn rollback_batch(&mut self, batch: &Batch, poison: bool, reason: &str) -> Vec<String> {
        let mut errors = Vec::new();
        for (id, before) in batch.before.iter().rev() {
            match self.arena.capsule_mut(*id) {
                Ok(capsule) if poison => capsule.validity = Validity::Poisoned(reason.to_string()),
                Ok(capsule) => before.restore_into(capsule),
                Err(err) => errors.push(err.to_string()),
            }
        }
        for id in &batch.created {
            match self.arena.capsule_mut(*id) {
                Ok(capsule) if poison => capsule.validity = Validity::Poisoned(reason.to_string()),
                Ok(capsule) => reset_unpublished(capsule),
                Err(err) => errors.push(err.to_string()),
            }
        }
        for code in &batch.deploys {
            match self.arena.code_mut(*code) {
                Ok(artifact) => {
                    artifact.origin = Version::Unbound;
                    artifact.location = Version::Unbound;
                    if poison {
                        artifact.validity = Validity::Poisoned(reason.to_string());
                    }
                    let digest = artifact.handle.digest;
                    if self.deployed.get(&digest) == Some(code) {
                        self.deployed.remove(&digest);
                    }
                }
                Err(err) => errors.push(err.to_string()),
            }
        }
        if !errors.is_empty() {
            warn!("rollback of batch {} incomplete: {}", batch.seq, errors.join("; "));
        }
        errors
    }
}

fn reset_unpublished(capsule: &mut Capsule) {
    capsule.origin = Version::Unbound;
    capsule.location = Version::Unbound;
    capsule.owner = Credential::Unset;
}
