//! Accumulation of recorded actions into one publishable unit.

use capsule_cbor::Hash;
use indexmap::{IndexMap, IndexSet};

use crate::{
    error::KernelError,
    ids::{BatchSeq, CapsuleId, CodeId, Credential, Provisional, Slot, Version},
    snapshot::Snapshot,
    value::{Ref, Value},
};

/// Something a batch produces a new version of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputRef {
    Capsule(CapsuleId),
    Code(CodeId),
}

#[derive(Debug, Clone)]
pub enum ActionKind {
    Call { target: CapsuleId, method: String },
    New { code: CodeId, owner: Credential, created: CapsuleId },
}

/// One recorded top-level invocation.
#[derive(Debug, Clone)]
pub struct Action {
    pub kind: ActionKind,
    pub args: Vec<Value>,
    pub inputs: Vec<CapsuleId>,
    pub outputs: Vec<CapsuleId>,
    pub reads: Vec<CapsuleId>,
    pub created: Vec<CapsuleId>,
    pub before: IndexMap<CapsuleId, Snapshot>,
    pub after: IndexMap<CapsuleId, Snapshot>,
    /// Versions of every capsule and code referenced by the args and
    /// after-states at record time.
    pub refs: IndexMap<Ref, Version>,
    /// Origin and location of each capsule in `refs`.
    pub ref_instances: IndexMap<CapsuleId, (Version, Version)>,
}

#[derive(Debug, Clone)]
pub enum Step {
    Deploy(CodeId),
    Action(Action),
}

/// Final slot numbering, fixed when the batch closes.
#[derive(Debug, Clone, Default)]
pub struct Sealed {
    pub slots: IndexMap<OutputRef, Slot>,
}

impl Sealed {
    pub fn output_count(&self) -> u32 {
        self.slots
            .values()
            .filter(|s| matches!(s, Slot::Output(_)))
            .count() as u32
    }
}

#[derive(Debug, Clone)]
pub struct Batch {
    pub seq: BatchSeq,
    depth: usize,
    /// Replay batches are closed by the replayer, never queued.
    pub(crate) detached: bool,
    pub steps: Vec<Step>,
    pub inputs: IndexSet<CapsuleId>,
    /// In-batch order; the index is the temporary id `_oN`.
    pub outputs: IndexSet<OutputRef>,
    pub created: IndexSet<CapsuleId>,
    pub deploys: IndexSet<CodeId>,
    /// Read-only references with the version observed first.
    pub reads: IndexMap<CapsuleId, Snapshot>,
    /// State before the batch touched each capsule.
    pub before: IndexMap<CapsuleId, Snapshot>,
    /// Latest recorded state.
    pub after: IndexMap<CapsuleId, Snapshot>,
    pub ref_versions: IndexMap<Ref, Version>,
    /// Capsules seen only as arguments or field values.
    pub ref_instances: IndexMap<CapsuleId, (Version, Version)>,
    sealed: Option<Sealed>,
}

impl Batch {
    pub fn new(seq: BatchSeq) -> Self {
        Self {
            seq,
            depth: 0,
            detached: false,
            steps: Vec::new(),
            inputs: IndexSet::new(),
            outputs: IndexSet::new(),
            created: IndexSet::new(),
            deploys: IndexSet::new(),
            reads: IndexMap::new(),
            before: IndexMap::new(),
            after: IndexMap::new(),
            ref_versions: IndexMap::new(),
            ref_instances: IndexMap::new(),
            sealed: None,
        }
    }

    pub fn detached(seq: BatchSeq) -> Self {
        Self {
            detached: true,
            ..Self::new(seq)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn begin(&mut self) {
        self.depth += 1;
    }

    /// Returns the depth after closing one scope.
    pub fn end(&mut self) -> Result<usize, KernelError> {
        if self.depth == 0 {
            return Err(KernelError::Invariant("end without matching begin".into()));
        }
        self.depth -= 1;
        Ok(self.depth)
    }

    pub fn sealed(&self) -> Result<&Sealed, KernelError> {
        self.sealed
            .as_ref()
            .ok_or_else(|| KernelError::Invariant(format!("batch {} is still open", self.seq)))
    }

    fn provisional(&self, output: OutputRef) -> Provisional {
        let index = self
            .outputs
            .get_index_of(&output)
            .unwrap_or(self.outputs.len());
        Provisional {
            batch: self.seq,
            slot: Slot::Output(index as u32),
        }
    }

    /// Whether any step of this batch involves the capsule.
    pub fn involves(&self, id: CapsuleId) -> bool {
        self.before.contains_key(&id)
            || self.reads.contains_key(&id)
            || self.created.contains(&id)
    }

    /// Every capsule instance this batch has seen, with the version it saw.
    fn first_seen(&self) -> impl Iterator<Item = Instance> + '_ {
        self.before
            .iter()
            .chain(self.reads.iter())
            .map(|(id, snap)| (*id, snap.origin, snap.location))
            .chain(
                self.ref_instances
                    .iter()
                    .map(|(id, (origin, location))| (*id, *origin, *location)),
            )
    }

    /// Merge one action. Returns the provisional version of every output.
    pub fn store_action(
        &mut self,
        action: Action,
    ) -> Result<Vec<(OutputRef, Provisional)>, KernelError> {
        let first_seen = |id: &CapsuleId| action.before.get(id).or_else(|| action.after.get(id));
        let mut incoming: Vec<Instance> = Vec::new();
        for id in action.inputs.iter().chain(&action.reads) {
            if self.involves(*id) {
                continue;
            }
            if let Some(snap) = first_seen(id) {
                incoming.push((*id, snap.origin, snap.location));
            }
        }
        for (id, (origin, location)) in &action.ref_instances {
            let known = self.involves(*id)
                || self.ref_instances.contains_key(id)
                || incoming.iter().any(|(seen, ..)| seen == id);
            if !known {
                incoming.push((*id, *origin, *location));
            }
        }
        for (i, instance) in incoming.iter().enumerate() {
            check_instance(self.first_seen().chain(incoming[..i].iter().copied()), *instance)?;
        }

        for id in &action.created {
            self.created.insert(*id);
        }
        for id in &action.inputs {
            if self.created.contains(id) {
                continue;
            }
            if !self.before.contains_key(id) {
                let first = match self.reads.get(id).or_else(|| first_seen(id)) {
                    Some(snap) => snap.clone(),
                    None => {
                        return Err(KernelError::Invariant(format!(
                            "input {id} has no recorded state"
                        )));
                    }
                };
                self.before.insert(*id, first);
            }
            self.inputs.insert(*id);
        }
        for id in &action.reads {
            if self.involves(*id) {
                continue;
            }
            if let Some(snap) = first_seen(id) {
                self.reads.insert(*id, snap.clone());
            }
        }
        for (id, snap) in &action.after {
            self.after.insert(*id, snap.clone());
        }
        for (r, version) in &action.refs {
            self.ref_versions.entry(*r).or_insert(*version);
        }
        for (id, instance) in &action.ref_instances {
            if !self.involves(*id) {
                self.ref_instances.entry(*id).or_insert(*instance);
            }
        }

        let mut stamps = Vec::with_capacity(action.outputs.len());
        for id in &action.outputs {
            let out = OutputRef::Capsule(*id);
            let provisional = self.provisional(out);
            self.outputs.insert(out);
            stamps.push((out, provisional));
        }
        self.steps.push(Step::Action(action));
        Ok(stamps)
    }

    pub fn store_code(&mut self, code: CodeId) -> Provisional {
        let out = OutputRef::Code(code);
        let provisional = self.provisional(out);
        self.outputs.insert(out);
        self.deploys.insert(code);
        self.steps.push(Step::Deploy(code));
        provisional
    }

    /// Fix final slots: destroyed capsules become deletes, everything else
    /// an output, each numbered from zero in batch order.
    pub fn seal(&mut self) -> Vec<(OutputRef, Slot)> {
        let mut sealed = Sealed::default();
        let (mut outputs, mut deletes) = (0u32, 0u32);
        for out in &self.outputs {
            let destroyed = match out {
                OutputRef::Capsule(id) => self.after.get(id).is_some_and(Snapshot::is_destroyed),
                OutputRef::Code(_) => false,
            };
            let slot = if destroyed {
                deletes += 1;
                Slot::Deleted(deletes - 1)
            } else {
                outputs += 1;
                Slot::Output(outputs - 1)
            };
            sealed.slots.insert(*out, slot);
        }
        let outputs = &self.outputs;
        let inputs = &self.inputs;
        self.reads
            .retain(|id, _| !inputs.contains(id) && !outputs.contains(&OutputRef::Capsule(*id)));
        let stamps = sealed.slots.iter().map(|(o, s)| (*o, *s)).collect();
        self.sealed = Some(sealed);
        stamps
    }

    /// Rewrite versions pointing at batch `seq` once it has been broadcast.
    pub fn resolve_pending(&mut self, seq: BatchSeq, txid: Hash) {
        let snapshots = self
            .before
            .values_mut()
            .chain(self.after.values_mut())
            .chain(self.reads.values_mut());
        for snap in snapshots {
            snap.origin.resolve(seq, txid);
            snap.location.resolve(seq, txid);
        }
        for version in self.ref_versions.values_mut() {
            version.resolve(seq, txid);
        }
        for (origin, location) in self.ref_instances.values_mut() {
            origin.resolve(seq, txid);
            location.resolve(seq, txid);
        }
    }
}

/// A capsule handle with the origin and location it had when recorded.
type Instance = (CapsuleId, Version, Version);

/// Two handles with one origin: different versions are a consistency error,
/// the same version is an internal invariant violation.
fn check_instance(
    known: impl IntoIterator<Item = Instance>,
    (id, origin, location): Instance,
) -> Result<(), KernelError> {
    if origin.is_unbound() {
        return Ok(());
    }
    for (other, known_origin, known_location) in known {
        if other == id || known_origin != origin {
            continue;
        }
        if known_location != location {
            return Err(KernelError::Consistency(format!(
                "two instances of capsule {origin} at {known_location} and {location}"
            )));
        }
        return Err(KernelError::Invariant(format!(
            "capsule {origin} recorded twice at version {location}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        arena::Capsule,
        ids::{CodeId, VersionId},
    };

    fn snap(origin: Version, location: Version) -> Snapshot {
        let mut capsule = Capsule::new(CodeId(0), Credential::address("a"));
        capsule.origin = origin;
        capsule.location = location;
        Snapshot::capture(&capsule)
    }

    fn call(target: CapsuleId) -> Action {
        Action {
            kind: ActionKind::Call {
                target,
                method: "poke".into(),
            },
            args: vec![],
            inputs: vec![],
            outputs: vec![],
            reads: vec![],
            created: vec![],
            before: IndexMap::new(),
            after: IndexMap::new(),
            refs: IndexMap::new(),
            ref_instances: IndexMap::new(),
        }
    }

    #[test]
    fn same_identity_at_two_versions_is_a_consistency_error() {
        let origin = VersionId::output(Hash::of_bytes(b"t0"), 0);
        let newer = VersionId::output(Hash::of_bytes(b"t1"), 0);
        let mut batch = Batch::new(0);

        let mut first = call(CapsuleId(0));
        first.reads.push(CapsuleId(0));
        first
            .after
            .insert(CapsuleId(0), snap(Version::Final(origin), Version::Final(origin)));
        batch.store_action(first).unwrap();

        let mut second = call(CapsuleId(1));
        second.inputs.push(CapsuleId(1));
        second
            .before
            .insert(CapsuleId(1), snap(Version::Final(origin), Version::Final(newer)));
        assert!(matches!(
            batch.store_action(second),
            Err(KernelError::Consistency(_))
        ));
    }

    #[test]
    fn capsules_held_only_in_arguments_are_checked_too() {
        let origin = VersionId::output(Hash::of_bytes(b"t0"), 0);
        let newer = VersionId::output(Hash::of_bytes(b"t1"), 0);
        let mut batch = Batch::new(0);

        let mut spend = call(CapsuleId(0));
        spend.inputs.push(CapsuleId(0));
        spend
            .before
            .insert(CapsuleId(0), snap(Version::Final(origin), Version::Final(newer)));
        batch.store_action(spend).unwrap();

        let mut pass_stale = call(CapsuleId(2));
        pass_stale.ref_instances.insert(
            CapsuleId(1),
            (Version::Final(origin), Version::Final(origin)),
        );
        assert!(matches!(
            batch.store_action(pass_stale),
            Err(KernelError::Consistency(_))
        ));

        // Both handles inside one action.
        let mut batch = Batch::new(1);
        let mut both = call(CapsuleId(2));
        both.ref_instances.insert(
            CapsuleId(0),
            (Version::Final(origin), Version::Final(newer)),
        );
        both.ref_instances.insert(
            CapsuleId(1),
            (Version::Final(origin), Version::Final(origin)),
        );
        assert!(matches!(
            batch.store_action(both),
            Err(KernelError::Consistency(_))
        ));
        assert!(batch.is_empty());
    }

    #[test]
    fn seal_numbers_outputs_and_deletes_separately() {
        let mut batch = Batch::new(3);
        let code = batch.store_code(CodeId(0));
        assert_eq!(code.slot, Slot::Output(0));

        let mut action = call(CapsuleId(0));
        action.created = vec![CapsuleId(0), CapsuleId(1)];
        action.outputs = vec![CapsuleId(0), CapsuleId(1)];
        action
            .after
            .insert(CapsuleId(0), snap(Version::Unbound, Version::Unbound));
        let mut gone = snap(Version::Unbound, Version::Unbound);
        gone.owner = Credential::Destroyed;
        action.after.insert(CapsuleId(1), gone);
        let stamps = batch.store_action(action).unwrap();
        assert_eq!(stamps[1].1.slot, Slot::Output(2));

        let sealed: IndexMap<_, _> = batch.seal().into_iter().collect();
        assert_eq!(sealed[&OutputRef::Code(CodeId(0))], Slot::Output(0));
        assert_eq!(sealed[&OutputRef::Capsule(CapsuleId(0))], Slot::Output(1));
        assert_eq!(sealed[&OutputRef::Capsule(CapsuleId(1))], Slot::Deleted(0));
        assert_eq!(batch.sealed().unwrap().output_count(), 2);
    }
}
