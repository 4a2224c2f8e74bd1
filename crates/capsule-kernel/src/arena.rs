use indexmap::IndexMap;

use crate::{
    code::{CodeHandle, MethodFn},
    error::KernelError,
    ids::{CapsuleId, CodeId, Credential, Version, VersionId},
    value::Value,
};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Validity {
    #[default]
    Live,
    /// Unrecoverable; every further access fails with the stored reason.
    Poisoned(String),
}

/// One live capsule instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Capsule {
    pub code: CodeId,
    /// Identity: the version at which the capsule was first published.
    pub origin: Version,
    /// Current version.
    pub location: Version,
    pub owner: Credential,
    pub units: u64,
    pub fields: IndexMap<String, Value>,
    pub validity: Validity,
}

impl Capsule {
    pub fn new(code: CodeId, owner: Credential) -> Self {
        Self {
            code,
            origin: Version::Unbound,
            location: Version::Unbound,
            owner,
            units: 0,
            fields: IndexMap::new(),
            validity: Validity::Live,
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.owner == Credential::Destroyed
    }
}

/// A deployed definition with its ledger placement.
#[derive(Debug, Clone)]
pub struct CodeArtifact {
    pub handle: CodeHandle,
    pub origin: Version,
    pub location: Version,
    pub owner: Credential,
    pub parent: Option<CodeId>,
    pub deps: IndexMap<String, CodeId>,
    pub validity: Validity,
}

impl CodeArtifact {
    pub fn name(&self) -> &str {
        &self.handle.definition.name
    }
}

#[derive(Debug, Default)]
pub struct Arena {
    capsules: Vec<Capsule>,
    codes: Vec<CodeArtifact>,
}

impl Arena {
    pub fn insert_capsule(&mut self, capsule: Capsule) -> CapsuleId {
        self.capsules.push(capsule);
        CapsuleId((self.capsules.len() - 1) as u32)
    }

    pub fn insert_code(&mut self, code: CodeArtifact) -> CodeId {
        self.codes.push(code);
        CodeId((self.codes.len() - 1) as u32)
    }

    pub fn capsule(&self, id: CapsuleId) -> Result<&Capsule, KernelError> {
        self.capsules
            .get(id.0 as usize)
            .ok_or_else(|| KernelError::Invariant(format!("unknown {id}")))
    }

    pub fn capsule_mut(&mut self, id: CapsuleId) -> Result<&mut Capsule, KernelError> {
        self.capsules
            .get_mut(id.0 as usize)
            .ok_or_else(|| KernelError::Invariant(format!("unknown {id}")))
    }

    pub fn code(&self, id: CodeId) -> Result<&CodeArtifact, KernelError> {
        self.codes
            .get(id.0 as usize)
            .ok_or_else(|| KernelError::Invariant(format!("unknown {id}")))
    }

    pub fn code_mut(&mut self, id: CodeId) -> Result<&mut CodeArtifact, KernelError> {
        self.codes
            .get_mut(id.0 as usize)
            .ok_or_else(|| KernelError::Invariant(format!("unknown {id}")))
    }

    pub fn find_capsule_at(&self, location: &VersionId) -> Option<CapsuleId> {
        self.capsules
            .iter()
            .position(|c| c.location.final_id().as_ref() == Some(location))
            .map(|i| CapsuleId(i as u32))
    }

    pub fn find_code_at(&self, location: &VersionId) -> Option<CodeId> {
        self.codes
            .iter()
            .position(|c| c.location.final_id().as_ref() == Some(location))
            .map(|i| CodeId(i as u32))
    }

    /// Walk from `code` up through its parents, nearest first.
    pub fn lineage(&self, code: CodeId) -> Result<Vec<CodeId>, KernelError> {
        let mut out = vec![code];
        let mut cursor = self.code(code)?.parent;
        while let Some(parent) = cursor {
            if out.contains(&parent) {
                return Err(KernelError::Invariant(format!("{parent} extends itself")));
            }
            out.push(parent);
            cursor = self.code(parent)?.parent;
        }
        Ok(out)
    }

    /// Whether one type is an ancestor of the other.
    pub fn same_lineage(&self, a: CodeId, b: CodeId) -> Result<bool, KernelError> {
        Ok(self.lineage(a)?.contains(&b) || self.lineage(b)?.contains(&a))
    }

    pub fn find_method(&self, code: CodeId, name: &str) -> Result<Option<MethodFn>, KernelError> {
        for id in self.lineage(code)? {
            if let Some(method) = self.code(id)?.handle.definition.get_method(name) {
                return Ok(Some(method.clone()));
            }
        }
        Ok(None)
    }

    pub fn has_method(&self, code: CodeId, name: &str) -> Result<bool, KernelError> {
        Ok(self.find_method(code, name)?.is_some())
    }
}
