//! Gated access to capsule fields and methods.
//!
//! Method bodies receive a [`Ctx`]; every read, write and nested call goes
//! through it so the kernel can enforce privacy and write ownership and see
//! exactly which capsules an invocation depends on.

use indexmap::IndexMap;

use crate::{
    arena::Validity,
    code::BUILTIN_METHODS,
    error::KernelError,
    ids::{CapsuleId, CodeId, Credential, Version},
    kernel::Kernel,
    value::{Ref, Value},
};

/// Fields backed by capsule metadata rather than user state.
pub const IDENTITY_FIELDS: &[&str] = &["identity", "version"];
const META_FIELDS: &[&str] = &["owner", "units"];

/// Property access on capsules, as seen from running code.
pub trait Gate {
    type Error;

    fn get(&mut self, target: CapsuleId, field: &str) -> Result<Value, Self::Error>;
    fn get_path(&mut self, target: CapsuleId, path: &[&str]) -> Result<Value, Self::Error>;
    fn set(&mut self, target: CapsuleId, field: &str, value: Value) -> Result<(), Self::Error>;
    fn set_path(&mut self, target: CapsuleId, path: &[&str], value: Value) -> Result<(), Self::Error>;
    fn delete(&mut self, target: CapsuleId, field: &str) -> Result<(), Self::Error>;
    fn has(&mut self, target: CapsuleId, field: &str) -> Result<bool, Self::Error>;
    fn keys(&mut self, target: CapsuleId) -> Result<Vec<String>, Self::Error>;
    fn call(&mut self, target: CapsuleId, method: &str, args: Vec<Value>) -> Result<Value, Self::Error>;
}

pub struct Ctx<'a> {
    kernel: &'a mut Kernel,
}

impl<'a> Ctx<'a> {
    pub(crate) fn new(kernel: &'a mut Kernel) -> Self {
        Self { kernel }
    }

    /// The capsule whose method is running.
    pub fn this(&self) -> Result<CapsuleId, KernelError> {
        self.kernel
            .control
            .current()
            .ok_or_else(|| KernelError::Invariant("no method is running".into()))
    }

    /// The capsule that called the running method, if any.
    pub fn caller(&self) -> Option<CapsuleId> {
        self.kernel.control.caller()
    }

    pub fn field(&mut self, name: &str) -> Result<Value, KernelError> {
        let this = self.this()?;
        self.get(this, name)
    }

    pub fn set_field(&mut self, name: &str, value: impl Into<Value>) -> Result<(), KernelError> {
        let this = self.this()?;
        self.set(this, name, value.into())
    }

    /// Create a capsule owned by the same credential as the running one.
    pub fn create(&mut self, code: CodeId, args: Vec<Value>) -> Result<CapsuleId, KernelError> {
        let owner = match self.kernel.control.current() {
            Some(frame) => self.kernel.arena.capsule(frame)?.owner.clone(),
            None => self.kernel.config.owner.clone(),
        };
        self.kernel.instantiate(code, &args, owner)
    }

    /// Mark the running capsule destroyed; it becomes a delete on publish.
    pub fn destroy(&mut self) -> Result<(), KernelError> {
        let this = self.this()?;
        self.kernel.invoke(this, "destroy", &[]).map(|_| ())
    }

    /// Require the running capsule's owner to sign the batch.
    pub fn auth(&mut self) -> Result<(), KernelError> {
        let this = self.this()?;
        self.kernel.invoke(this, "auth", &[]).map(|_| ())
    }

    /// Dependency code bound under `name` in the running capsule's type.
    pub fn dep(&self, name: &str) -> Result<CodeId, KernelError> {
        let this = self.this()?;
        let code = self.kernel.arena.capsule(this)?.code;
        for id in self.kernel.arena.lineage(code)? {
            if let Some(dep) = self.kernel.arena.code(id)?.deps.get(name) {
                return Ok(*dep);
            }
        }
        Err(KernelError::Validity(format!("no dependency named '{name}'")))
    }

    fn check_access(&self, target: CapsuleId, name: &str, write: bool) -> Result<CodeId, KernelError> {
        let kernel = &*self.kernel;
        let capsule = kernel.arena.capsule(target)?;
        if let Validity::Poisoned(reason) = &capsule.validity {
            return Err(KernelError::Validity(format!("{target} is poisoned: {reason}")));
        }
        if name.starts_with('_') {
            kernel.check_private(target, name)?;
        }
        if write {
            if IDENTITY_FIELDS.contains(&name)
                || BUILTIN_METHODS.contains(&name)
                || kernel.arena.has_method(capsule.code, name)?
            {
                return Err(KernelError::Capability(format!(
                    "'{name}' on {target} cannot be changed"
                )));
            }
            if kernel.control.current() != Some(target) {
                return Err(KernelError::Capability(format!(
                    "{target} can only be changed by its own methods"
                )));
            }
            if capsule.is_destroyed() {
                return Err(KernelError::Validity(format!("{target} has been destroyed")));
            }
        }
        Ok(capsule.code)
    }

    fn note(&mut self, target: CapsuleId, code: CodeId, name: &str) {
        if IDENTITY_FIELDS.contains(&name) {
            self.kernel.control.touch(target, code);
        } else {
            self.kernel.control.note_read(target, code);
        }
    }

    fn check_refs(&self, value: &Value) -> Result<(), KernelError> {
        for r in value.refs() {
            match r {
                Ref::Capsule(id) => {
                    self.kernel.arena.capsule(id)?;
                }
                Ref::Code(id) => {
                    self.kernel.arena.code(id)?;
                }
            }
        }
        Ok(())
    }

    fn read_field(&self, target: CapsuleId, name: &str) -> Result<Value, KernelError> {
        let capsule = self.kernel.arena.capsule(target)?;
        let settled = |version: &Version, what: &str| match version {
            Version::Final(id) => Ok(Value::Text(id.to_string())),
            _ => Err(KernelError::Validity(format!(
                "{what} of {target} is not assigned until it is published; sync first"
            ))),
        };
        match name {
            "identity" => settled(&capsule.origin, "identity"),
            "version" => settled(&capsule.location, "version"),
            "owner" => Ok(match &capsule.owner {
                Credential::Address(addr) => Value::Text(addr.clone()),
                _ => Value::Null,
            }),
            "units" => Ok(Value::Nat(capsule.units)),
            _ => Ok(capsule.fields.get(name).cloned().unwrap_or_default()),
        }
    }

    fn write_meta(&mut self, target: CapsuleId, name: &str, value: Value) -> Result<(), KernelError> {
        let max_units = self.kernel.config.max_units;
        let capsule = self.kernel.arena.capsule_mut(target)?;
        match name {
            "owner" => match value {
                Value::Text(addr) if !addr.is_empty() => {
                    capsule.owner = Credential::Address(addr);
                    Ok(())
                }
                other => Err(KernelError::Validity(format!(
                    "owner must be a non-empty address, got {}",
                    other.kind()
                ))),
            },
            _ => match value.as_nat() {
                Some(units) if units <= max_units => {
                    capsule.units = units;
                    Ok(())
                }
                _ => Err(KernelError::Validity(format!(
                    "units must be a whole number no greater than {max_units}"
                ))),
            },
        }
    }
}

impl Gate for Ctx<'_> {
    type Error = KernelError;

    fn get(&mut self, target: CapsuleId, field: &str) -> Result<Value, KernelError> {
        let code = self.check_access(target, field, false)?;
        let value = self.read_field(target, field)?;
        self.note(target, code, field);
        Ok(value)
    }

    fn get_path(&mut self, target: CapsuleId, path: &[&str]) -> Result<Value, KernelError> {
        let Some((head, rest)) = path.split_first() else {
            return Err(KernelError::Validity("empty field path".into()));
        };
        let value = self.get(target, head)?;
        Ok(value.at_path(rest).cloned().unwrap_or_default())
    }

    fn set(&mut self, target: CapsuleId, field: &str, value: Value) -> Result<(), KernelError> {
        let code = self.check_access(target, field, true)?;
        self.check_refs(&value)?;
        if META_FIELDS.contains(&field) {
            self.write_meta(target, field, value)?;
        } else {
            let capsule = self.kernel.arena.capsule_mut(target)?;
            capsule.fields.insert(field.to_string(), value);
        }
        self.kernel.control.touch(target, code);
        Ok(())
    }

    fn set_path(&mut self, target: CapsuleId, path: &[&str], value: Value) -> Result<(), KernelError> {
        let Some((head, rest)) = path.split_first() else {
            return Err(KernelError::Validity("empty field path".into()));
        };
        if rest.is_empty() {
            return self.set(target, head, value);
        }
        if META_FIELDS.contains(head) {
            return Err(KernelError::Validity(format!("'{head}' has no nested fields")));
        }
        let code = self.check_access(target, head, true)?;
        self.check_refs(&value)?;
        let capsule = self.kernel.arena.capsule_mut(target)?;
        let root = capsule
            .fields
            .entry((*head).to_string())
            .or_insert_with(|| Value::Record(IndexMap::new()));
        match root.slot_at_path(rest) {
            Some(slot) => *slot = value,
            None => {
                return Err(KernelError::Validity(format!(
                    "path '{}' cannot be assigned on {target}",
                    path.join(".")
                )));
            }
        }
        self.kernel.control.touch(target, code);
        Ok(())
    }

    fn delete(&mut self, target: CapsuleId, field: &str) -> Result<(), KernelError> {
        let code = self.check_access(target, field, true)?;
        if META_FIELDS.contains(&field) {
            return Err(KernelError::Capability(format!("'{field}' cannot be deleted")));
        }
        self.kernel.arena.capsule_mut(target)?.fields.shift_remove(field);
        self.kernel.control.touch(target, code);
        Ok(())
    }

    fn has(&mut self, target: CapsuleId, field: &str) -> Result<bool, KernelError> {
        let code = self.check_access(target, field, false)?;
        let present = match field {
            "owner" | "units" => true,
            "identity" => self.kernel.arena.capsule(target)?.origin.is_final(),
            "version" => self.kernel.arena.capsule(target)?.location.is_final(),
            _ => self.kernel.arena.capsule(target)?.fields.contains_key(field),
        };
        self.note(target, code, field);
        Ok(present)
    }

    fn keys(&mut self, target: CapsuleId) -> Result<Vec<String>, KernelError> {
        let code = self.check_access(target, "", false)?;
        let names: Vec<String> = self.kernel.arena.capsule(target)?.fields.keys().cloned().collect();
        let mut visible = Vec::with_capacity(names.len());
        for name in names {
            if !name.starts_with('_') || self.kernel.check_private(target, &name).is_ok() {
                visible.push(name);
            }
        }
        self.kernel.control.note_read(target, code);
        Ok(visible)
    }

    fn call(&mut self, target: CapsuleId, method: &str, args: Vec<Value>) -> Result<Value, KernelError> {
        self.check_refs(&Value::List(args.clone()))?;
        self.kernel.invoke(target, method, &args)
    }
}
