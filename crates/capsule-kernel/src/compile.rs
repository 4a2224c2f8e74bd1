//! Turning a sealed batch into a ledger payload plus a build plan.

use indexmap::IndexMap;

use crate::{
    arena::Arena,
    batch::{ActionKind, Batch, OutputRef, Sealed, Step},
    error::KernelError,
    ids::{CapsuleId, CodeId, Slot, Version, VersionRef},
    record::{
        BuildPlan, CapsuleState, CodeState, CompiledBatch, Encoded, ExecOp, Produce, Spend,
        StateRecord, Token,
    },
    value::{Ref, Value},
};

/// Tokens inside exec ops name objects during replay; tokens inside state
/// records name ledger slots of the record they live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Exec,
    State,
}

pub(crate) fn compile(
    batch: &Batch,
    arena: &Arena,
    app: &str,
    protocol: u32,
) -> Result<BuildPlan, KernelError> {
    let sealed = batch.sealed()?;
    let mut compiler = Compiler {
        batch,
        sealed,
        arena,
        refs: Vec::new(),
        ref_index: IndexMap::new(),
    };
    compiler.collect_refs()?;

    let mut spends = Vec::with_capacity(batch.inputs.len());
    for id in &batch.inputs {
        let before = batch
            .before
            .get(id)
            .ok_or_else(|| KernelError::Invariant(format!("input {id} has no prior state")))?;
        spends.push(Spend {
            version: compiler.version_ref(before.location, Ref::Capsule(*id))?,
            owner: before.owner.clone(),
            units: before.units,
        });
    }

    let mut exec = Vec::with_capacity(batch.steps.len());
    for step in &batch.steps {
        exec.push(match step {
            Step::Deploy(code) => ExecOp::Deploy {
                code: compiler.code_state(*code, Mode::Exec)?,
            },
            Step::Action(action) => match &action.kind {
                ActionKind::Call { target, method } => ExecOp::Call {
                    target: compiler.capsule_token(*target, Mode::Exec)?,
                    method: method.clone(),
                    args: compiler.encode_all(&action.args)?,
                },
                ActionKind::New { code, owner, .. } => ExecOp::New {
                    code: compiler.code_token(*code, Mode::Exec)?,
                    args: compiler.encode_all(&action.args)?,
                    owner: owner.clone(),
                },
            },
        });
    }

    let mut outputs = Vec::new();
    let mut deletes = Vec::new();
    let mut produces = Vec::new();
    let mut states = Vec::with_capacity(sealed.slots.len());
    for (out, slot) in &sealed.slots {
        let (record, produce) = match out {
            OutputRef::Capsule(id) => {
                let state = compiler.capsule_state(*id)?;
                let produce = Produce {
                    owner: state.owner.clone(),
                    units: state.units,
                };
                (StateRecord::Capsule(state), produce)
            }
            OutputRef::Code(id) => {
                let state = compiler.code_state(*id, Mode::State)?;
                let produce = Produce {
                    owner: state.owner.clone(),
                    units: 0,
                };
                (StateRecord::Code(state), produce)
            }
        };
        let hash = record.hash()?;
        match slot {
            Slot::Output(_) => {
                outputs.push(hash);
                produces.push(produce);
            }
            Slot::Deleted(_) => deletes.push(hash),
        }
        states.push((*slot, record));
    }

    Ok(BuildPlan {
        batch: batch.seq,
        payload: CompiledBatch {
            app: app.to_string(),
            protocol,
            inputs: batch.inputs.len() as u32,
            refs: compiler.refs,
            outputs,
            deletes,
            exec,
        },
        spends,
        produces,
        states,
    })
}

struct Compiler<'a> {
    batch: &'a Batch,
    sealed: &'a Sealed,
    arena: &'a Arena,
    refs: Vec<VersionRef>,
    ref_index: IndexMap<CapsuleId, u32>,
}

impl Compiler<'_> {
    /// Read references, one per identity.
    fn collect_refs(&mut self) -> Result<(), KernelError> {
        let mut by_identity: IndexMap<Version, (Version, u32)> = IndexMap::new();
        for (id, seen) in &self.batch.reads {
            if seen.origin.is_unbound() {
                return Err(KernelError::Validity(format!(
                    "read of {id} which was never published"
                )));
            }
            let index = match by_identity.get(&seen.origin) {
                Some((location, _)) if *location != seen.location => {
                    return Err(KernelError::Consistency(format!(
                        "capsule {} read at both {} and {}",
                        seen.origin, location, seen.location
                    )));
                }
                Some((_, index)) => *index,
                None => {
                    let index = self.refs.len() as u32;
                    self.refs.push(self.version_ref(seen.location, Ref::Capsule(*id))?);
                    by_identity.insert(seen.origin, (seen.location, index));
                    index
                }
            };
            self.ref_index.insert(*id, index);
        }
        Ok(())
    }

    fn version_ref(&self, version: Version, what: Ref) -> Result<VersionRef, KernelError> {
        match version {
            Version::Final(id) => Ok(VersionRef::Final(id)),
            Version::Pending(p) if p.batch != self.batch.seq => Ok(VersionRef::Pending(p)),
            Version::Pending(_) => Err(KernelError::Invariant(format!(
                "{what:?} points into its own batch"
            ))),
            Version::Unbound => Err(KernelError::Validity(format!(
                "{what:?} references an object that was never published"
            ))),
        }
    }

    /// Version of an object referenced from outside this batch.
    fn absolute(&self, r: Ref) -> Result<Token, KernelError> {
        let version = match self.batch.ref_versions.get(&r) {
            Some(version) => *version,
            None => match r {
                Ref::Capsule(id) => self.arena.capsule(id)?.location,
                Ref::Code(id) => self.arena.code(id)?.location,
            },
        };
        Ok(self.version_ref(version, r)?.into())
    }

    fn capsule_token(&self, id: CapsuleId, mode: Mode) -> Result<Token, KernelError> {
        let out = OutputRef::Capsule(id);
        match mode {
            Mode::Exec => {
                if let Some(i) = self.batch.inputs.get_index_of(&id) {
                    return Ok(Token::In(i as u32));
                }
                if let Some(i) = self.batch.outputs.get_index_of(&out) {
                    return Ok(Token::Out(i as u32));
                }
                if let Some(i) = self.ref_index.get(&id) {
                    return Ok(Token::Ref(*i));
                }
            }
            Mode::State => {
                if let Some(slot) = self.sealed.slots.get(&out) {
                    return Ok(Token::Own(*slot));
                }
                if let Some(seen) = self.batch.reads.get(&id) {
                    return Ok(self.version_ref(seen.location, Ref::Capsule(id))?.into());
                }
            }
        }
        self.absolute(Ref::Capsule(id))
    }

    fn code_token(&self, id: CodeId, mode: Mode) -> Result<Token, KernelError> {
        match mode {
            Mode::Exec => {
                if let Some(i) = self.batch.deploys.get_index_of(&id) {
                    return Ok(Token::Deploy(i as u32));
                }
            }
            Mode::State => {
                if let Some(slot) = self.sealed.slots.get(&OutputRef::Code(id)) {
                    return Ok(Token::Own(*slot));
                }
            }
        }
        self.absolute(Ref::Code(id))
    }

    fn encode(&self, value: &Value, mode: Mode) -> Result<Encoded, KernelError> {
        Ok(match value {
            Value::Null => Encoded::Null,
            Value::Bool(b) => Encoded::Bool(*b),
            Value::Int(i) => Encoded::Int(*i),
            Value::Nat(n) => Encoded::Nat(*n),
            Value::Text(s) => Encoded::Text(s.clone()),
            Value::Bytes(b) => Encoded::Bytes(b.clone()),
            Value::List(items) => Encoded::List(
                items
                    .iter()
                    .map(|v| self.encode(v, mode))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Record(fields) => Encoded::Record(self.encode_fields(fields, mode)?),
            Value::Capsule(id) => Encoded::Capsule(self.capsule_token(*id, mode)?),
            Value::Code(id) => Encoded::Code(self.code_token(*id, mode)?),
        })
    }

    /// Keys are sorted so equal states hash equally.
    fn encode_fields(
        &self,
        fields: &IndexMap<String, Value>,
        mode: Mode,
    ) -> Result<IndexMap<String, Encoded>, KernelError> {
        let mut keys: Vec<&String> = fields.keys().collect();
        keys.sort();
        let mut out = IndexMap::with_capacity(keys.len());
        for key in keys {
            out.insert(key.clone(), self.encode(&fields[key], mode)?);
        }
        Ok(out)
    }

    fn encode_all(&self, args: &[Value]) -> Result<Vec<Encoded>, KernelError> {
        args.iter().map(|v| self.encode(v, Mode::Exec)).collect()
    }

    fn capsule_state(&self, id: CapsuleId) -> Result<CapsuleState, KernelError> {
        let after = self
            .batch
            .after
            .get(&id)
            .ok_or_else(|| KernelError::Invariant(format!("output {id} has no recorded state")))?;
        let origin = if self.batch.created.contains(&id) {
            let slot = self
                .sealed
                .slots
                .get(&OutputRef::Capsule(id))
                .ok_or_else(|| KernelError::Invariant(format!("{id} has no slot")))?;
            Token::Own(*slot)
        } else {
            self.version_ref(after.origin, Ref::Capsule(id))?.into()
        };
        Ok(CapsuleState {
            code: self.code_token(after.code, Mode::State)?,
            origin,
            owner: after.owner.clone(),
            units: after.units,
            fields: self.encode_fields(&after.fields, Mode::State)?,
        })
    }

    fn code_state(&self, id: CodeId, mode: Mode) -> Result<CodeState, KernelError> {
        let artifact = self.arena.code(id)?;
        let definition = &artifact.handle.definition;
        let parent = artifact
            .parent
            .map(|p| self.code_token(p, mode))
            .transpose()?;
        let mut deps = IndexMap::with_capacity(artifact.deps.len());
        for (name, dep) in &artifact.deps {
            deps.insert(name.clone(), self.code_token(*dep, mode)?);
        }
        Ok(CodeState {
            name: definition.name.clone(),
            source: definition.source.clone(),
            parent,
            deps,
            owner: artifact.owner.clone(),
        })
    }
}
