//! Running methods against the arena and recording what they did.

use std::mem;

use indexmap::{IndexMap, IndexSet};
use log::debug;

use crate::{
    arena::Validity,
    batch::{Action, ActionKind, OutputRef},
    control::{CallControl, CallOrigin, Entry},
    error::KernelError,
    gate::Ctx,
    ids::{CapsuleId, CodeId, Credential, Version},
    kernel::Kernel,
    snapshot::{Snapshot, changed},
    value::{Ref, Value},
};

impl Kernel {
    fn start(&mut self, origin: CallOrigin, entry: Entry) -> Result<(), KernelError> {
        if !self.control.is_idle() {
            return Err(KernelError::Invariant(
                "a top-level call is already in progress".into(),
            ));
        }
        self.control = CallControl::new(origin);
        self.control.entry = Some(entry);
        Ok(())
    }

    /// Top-level method call.
    pub fn call(
        &mut self,
        target: CapsuleId,
        method: &str,
        args: Vec<Value>,
        origin: CallOrigin,
    ) -> Result<Value, KernelError> {
        if method == "init" {
            return Err(KernelError::Capability(
                "init only runs while a capsule is being created".into(),
            ));
        }
        self.start(
            origin,
            Entry::Call {
                target,
                method: method.to_string(),
                args: args.clone(),
            },
        )?;
        let result = self.invoke(target, method, &args);
        self.finish(result)
    }

    /// Top-level creation. `owner` defaults to the configured credential.
    pub fn create(
        &mut self,
        code: CodeId,
        args: Vec<Value>,
        owner: Option<Credential>,
    ) -> Result<CapsuleId, KernelError> {
        let owner = owner.unwrap_or_else(|| self.config.owner.clone());
        self.start(
            CallOrigin::External,
            Entry::New {
                code,
                args: args.clone(),
                owner: owner.clone(),
            },
        )?;
        let result = self.instantiate(code, &args, owner).map(Value::Capsule);
        match self.finish(result)? {
            Value::Capsule(id) => Ok(id),
            other => Err(KernelError::Invariant(format!(
                "creation returned a {}",
                other.kind()
            ))),
        }
    }

    /// Allocate a capsule of `code` and run its initializer.
    pub(crate) fn instantiate(
        &mut self,
        code: CodeId,
        args: &[Value],
        owner: Credential,
    ) -> Result<CapsuleId, KernelError> {
        let result = self.instantiate_inner(code, args, owner);
        if let Err(err) = &result {
            self.control.record_error(err);
        }
        result
    }

    fn instantiate_inner(
        &mut self,
        code: CodeId,
        args: &[Value],
        owner: Credential,
    ) -> Result<CapsuleId, KernelError> {
        self.check_code_usable(code)?;
        let id = self
            .arena
            .insert_capsule(crate::arena::Capsule::new(code, owner));
        self.control.created.insert(id);
        self.control.note_caller(id);
        self.control.touch(id, code);
        if self.arena.has_method(code, "init")? {
            self.invoke(id, "init", args)?;
        } else if !args.is_empty() {
            return Err(KernelError::MethodNotFound {
                code: self.arena.code(code)?.name().to_string(),
                method: "init".into(),
            });
        }
        Ok(id)
    }

    pub(crate) fn check_callable(&self, target: CapsuleId) -> Result<(), KernelError> {
        let capsule = self.arena.capsule(target)?;
        if let Validity::Poisoned(reason) = &capsule.validity {
            return Err(KernelError::Validity(format!("{target} is poisoned: {reason}")));
        }
        if capsule.is_destroyed() {
            return Err(KernelError::Validity(format!("{target} has been destroyed")));
        }
        if capsule.origin.is_unbound() && !self.control.created.contains(&target) {
            return Err(KernelError::Validity(format!(
                "{target} was never published and cannot be used"
            )));
        }
        Ok(())
    }

    /// Nested call; every error is remembered even if the caller handles it.
    pub(crate) fn invoke(
        &mut self,
        target: CapsuleId,
        method: &str,
        args: &[Value],
    ) -> Result<Value, KernelError> {
        let result = self.invoke_inner(target, method, args);
        if let Err(err) = &result {
            self.control.record_error(err);
        }
        result
    }

    fn invoke_inner(
        &mut self,
        target: CapsuleId,
        method: &str,
        args: &[Value],
    ) -> Result<Value, KernelError> {
        self.check_callable(target)?;
        let code = self.arena.capsule(target)?.code;
        if method == "init" && !self.control.created.contains(&target) {
            return Err(KernelError::Capability(format!(
                "init cannot run again on {target}"
            )));
        }
        let body = match method {
            "auth" | "destroy" => None,
            _ => Some(self.arena.find_method(code, method)?.ok_or_else(|| {
                KernelError::MethodNotFound {
                    code: self
                        .arena
                        .code(code)
                        .map(|c| c.name().to_string())
                        .unwrap_or_default(),
                    method: method.to_string(),
                }
            })?),
        };
        if method.starts_with('_') {
            self.check_private(target, method)?;
        }

        self.control.note_caller(target);
        self.control.touch(target, code);
        if !self.control.created.contains(&target) && !self.control.before.contains_key(&target) {
            let snapshot = Snapshot::capture(self.arena.capsule(target)?);
            self.control.before.insert(target, snapshot);
        }

        self.control.stack.push(target);
        let result = match body {
            Some(body) => {
                let mut ctx = Ctx::new(self);
                body(&mut ctx, args)
            }
            None if method == "auth" => self.builtin_auth(target),
            None => self.builtin_destroy(target),
        };
        self.control.stack.pop();

        match result {
            Ok(value) if method == "init" && !value.is_null() => Err(KernelError::Validity(format!(
                "init on {target} must not return a value"
            ))),
            other => other,
        }
    }

    fn builtin_auth(&mut self, target: CapsuleId) -> Result<Value, KernelError> {
        self.control.authed.insert(target);
        Ok(Value::Null)
    }

    fn builtin_destroy(&mut self, target: CapsuleId) -> Result<Value, KernelError> {
        let capsule = self.arena.capsule_mut(target)?;
        capsule.owner = Credential::Destroyed;
        capsule.units = 0;
        Ok(Value::Null)
    }

    /// `_`-prefixed names are reachable only from a frame whose type shares
    /// lineage with the target's type.
    pub(crate) fn check_private(&self, target: CapsuleId, name: &str) -> Result<(), KernelError> {
        let target_code = self.arena.capsule(target)?.code;
        let Some(frame) = self.control.current() else {
            return Err(KernelError::Capability(format!(
                "'{name}' on {target} is private"
            )));
        };
        let frame_code = match self.control.attribution.get(&frame) {
            Some(code) => *code,
            None => self.arena.capsule(frame)?.code,
        };
        if !self.arena.same_lineage(frame_code, target_code)? {
            return Err(KernelError::Capability(format!(
                "'{name}' on {target} is private to {}",
                self.arena.code(target_code)?.name()
            )));
        }
        Ok(())
    }

    /// Depth-zero close: undo on failure, otherwise record an action.
    fn finish(&mut self, result: Result<Value, KernelError>) -> Result<Value, KernelError> {
        let control = mem::replace(&mut self.control, CallControl::new(CallOrigin::External));
        let result = match (result, &control.error) {
            (Ok(_), Some(swallowed)) => Err(KernelError::Invariant(format!(
                "an error was caught inside a method and not re-raised: {swallowed}"
            ))),
            (result, _) => result,
        };
        let value = match result {
            Ok(value) => value,
            Err(err) => {
                self.undo(&control, &err.to_string());
                return Err(err);
            }
        };
        match self.record(&control) {
            Ok(()) => Ok(value),
            Err(err) => {
                self.undo(&control, &err.to_string());
                Err(err)
            }
        }
    }

    fn undo(&mut self, control: &CallControl, reason: &str) {
        for (id, before) in &control.before {
            if let Ok(capsule) = self.arena.capsule_mut(*id) {
                before.restore_into(capsule);
            }
        }
        for id in &control.created {
            if let Ok(capsule) = self.arena.capsule_mut(*id) {
                capsule.validity = Validity::Poisoned(format!("creation failed: {reason}"));
            }
        }
    }

    /// Diff the invocation and hand an action to the open batch.
    fn record(&mut self, control: &CallControl) -> Result<(), KernelError> {
        let mut changed_set = IndexSet::new();
        for (id, before) in &control.before {
            let after = Snapshot::capture(self.arena.capsule(*id)?);
            if changed(before, &after, &self.arena) {
                changed_set.insert(*id);
            }
        }
        if changed_set.is_empty() && control.created.is_empty() && control.authed.is_empty() {
            return Ok(());
        }
        if control.origin == CallOrigin::Internal {
            return Err(KernelError::StateChangeNotAllowed(
                "a read-only call modified, created or authorized capsules".into(),
            ));
        }
        let mut core: IndexSet<CapsuleId> = changed_set;
        core.extend(control.created.iter().copied());
        core.extend(control.authed.iter().copied());
        let mut involved = core.clone();
        involved.extend(control.callers_of(&core));

        let mut outputs: Vec<CapsuleId> = control
            .touched
            .iter()
            .copied()
            .filter(|id| involved.contains(id))
            .collect();
        for id in &involved {
            if !outputs.contains(id) {
                outputs.push(*id);
            }
        }
        let inputs: Vec<CapsuleId> = outputs
            .iter()
            .copied()
            .filter(|id| !control.created.contains(id))
            .collect();
        let reads: Vec<CapsuleId> = control
            .touched
            .iter()
            .copied()
            .filter(|id| {
                (control.read.contains(id) || control.before.contains_key(id))
                    && !involved.contains(id)
            })
            .collect();

        let mut after = IndexMap::new();
        for id in outputs.iter().chain(&reads) {
            after.insert(*id, Snapshot::capture(self.arena.capsule(*id)?));
        }
        let before: IndexMap<CapsuleId, Snapshot> = control
            .before
            .iter()
            .filter(|(id, _)| involved.contains(*id) || reads.contains(*id))
            .map(|(id, snap)| (*id, snap.clone()))
            .collect();

        let (kind, args) = match control.entry.clone() {
            Some(Entry::Call {
                target,
                method,
                args,
            }) => (ActionKind::Call { target, method }, args),
            Some(Entry::New { code, args, owner }) => {
                let created = control.created.first().copied().ok_or_else(|| {
                    KernelError::Invariant("creation recorded no capsule".into())
                })?;
                (ActionKind::New { code, owner, created }, args)
            }
            None => return Err(KernelError::Invariant("action without an entry".into())),
        };

        let mut refs = IndexMap::new();
        let mut note = |r: Ref, kernel: &Kernel| -> Result<(), KernelError> {
            if !refs.contains_key(&r) {
                refs.insert(r, kernel.version_of(r)?);
            }
            Ok(())
        };
        for r in args.iter().flat_map(Value::refs) {
            note(r, self)?;
        }
        if let ActionKind::New { code, .. } = &kind {
            note(Ref::Code(*code), self)?;
        }
        for snap in after.values() {
            for r in snap.refs() {
                note(r, self)?;
            }
        }

        let mut ref_instances = IndexMap::new();
        for r in refs.keys() {
            if let Ref::Capsule(id) = r {
                let capsule = self.arena.capsule(*id)?;
                ref_instances.insert(*id, (capsule.origin, capsule.location));
            }
        }

        let action = Action {
            kind,
            args,
            inputs,
            outputs,
            reads,
            created: control.created.iter().copied().collect(),
            before,
            after,
            refs,
            ref_instances,
        };
        self.store_action(action)
    }

    pub(crate) fn version_of(&self, r: Ref) -> Result<Version, KernelError> {
        Ok(match r {
            Ref::Capsule(id) => self.arena.capsule(id)?.location,
            Ref::Code(id) => self.arena.code(id)?.location,
        })
    }

    /// Add an action to the open batch, bracketing it as its own scope.
    pub(crate) fn store_action(&mut self, action: Action) -> Result<(), KernelError> {
        let created: Vec<CapsuleId> = action.created.clone();
        let summary = format!(
            "{} inputs, {} outputs, {} reads",
            action.inputs.len(),
            action.outputs.len(),
            action.reads.len()
        );
        self.batch.begin();
        let stored = self.batch.store_action(action);
        if let Ok(stamps) = &stored {
            for (out, provisional) in stamps {
                let OutputRef::Capsule(id) = out else {
                    continue;
                };
                if let Ok(capsule) = self.arena.capsule_mut(*id) {
                    capsule.location = Version::Pending(*provisional);
                    if created.contains(id) {
                        capsule.origin = Version::Pending(*provisional);
                    }
                }
            }
            debug!("recorded action in batch {}: {summary}", self.batch.seq);
        }
        let closed = self.end();
        stored?;
        closed.map(|_| ())
    }
}
