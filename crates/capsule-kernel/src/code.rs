//! Code artifacts: the type side of a capsule.
//!
//! A [`CodeDefinition`] is the hostable part (name, source text, method
//! bodies). Where it sits in a hierarchy and which other artifacts it
//! depends on is per-runtime and lives in a [`Deployment`].

use std::{fmt, sync::Arc};

use capsule_cbor::Hash;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{
    error::KernelError,
    gate::Ctx,
    ids::{CodeId, VersionId},
    value::Value,
};

/// Method names handled by the kernel itself.
pub const BUILTIN_METHODS: &[&str] = &["auth", "destroy"];

pub type MethodFn = Arc<dyn Fn(&mut Ctx<'_>, &[Value]) -> Result<Value, KernelError> + Send + Sync>;

#[derive(Clone)]
pub struct CodeDefinition {
    pub name: String,
    /// Source text; together with the name it identifies the artifact to hosts.
    pub source: String,
    methods: IndexMap<String, MethodFn>,
}

impl fmt::Debug for CodeDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeDefinition")
            .field("name", &self.name)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CodeDefinition {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            methods: IndexMap::new(),
        }
    }

    pub fn method<F>(mut self, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut Ctx<'_>, &[Value]) -> Result<Value, KernelError> + Send + Sync + 'static,
    {
        self.methods.insert(name.into(), Arc::new(body));
        self
    }

    pub fn get_method(&self, name: &str) -> Option<&MethodFn> {
        self.methods.get(name)
    }

    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    pub fn descriptor(&self) -> CodeDescriptor {
        CodeDescriptor {
            name: self.name.clone(),
            source: self.source.clone(),
        }
    }

    pub fn digest(&self) -> Result<Hash, KernelError> {
        Ok(Hash::of_cbor(&self.descriptor())?)
    }
}

/// Hashable, host-independent description of a definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeDescriptor {
    pub name: String,
    pub source: String,
}

/// A definition plus its placement in this runtime.
#[derive(Debug, Clone)]
pub struct Deployment {
    pub definition: Arc<CodeDefinition>,
    pub parent: Option<CodeId>,
    pub deps: IndexMap<String, CodeId>,
}

impl Deployment {
    pub fn new(definition: CodeDefinition) -> Self {
        Self {
            definition: Arc::new(definition),
            parent: None,
            deps: IndexMap::new(),
        }
    }

    pub fn extends(mut self, parent: CodeId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn dep(mut self, name: impl Into<String>, code: CodeId) -> Self {
        self.deps.insert(name.into(), code);
        self
    }
}

impl From<CodeDefinition> for Deployment {
    fn from(definition: CodeDefinition) -> Self {
        Deployment::new(definition)
    }
}

/// What a [`CodeHost`] returns for an installed definition.
#[derive(Debug, Clone)]
pub struct CodeHandle {
    pub digest: Hash,
    pub definition: Arc<CodeDefinition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CodeKey {
    Digest(Hash),
    Location(VersionId),
}

/// Installs definitions so their methods can run.
///
/// The kernel calls `deploy` at most once per digest and caches the handle.
pub trait CodeHost: Send + Sync {
    fn deploy(&self, definition: Arc<CodeDefinition>) -> Result<CodeHandle, KernelError>;

    fn installed(&self, key: &CodeKey) -> Option<CodeHandle>;

    /// Told when a deployment receives its final ledger location.
    fn published(&self, _handle: &CodeHandle, _location: &VersionId) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_ignores_method_bodies() {
        let a = CodeDefinition::new("Counter", "v1").method("inc", |_, _| Ok(Value::Null));
        let b = CodeDefinition::new("Counter", "v1");
        let c = CodeDefinition::new("Counter", "v2");
        assert_eq!(a.digest().unwrap(), b.digest().unwrap());
        assert_ne!(a.digest().unwrap(), c.digest().unwrap());
        assert_eq!(a.method_names().collect::<Vec<_>>(), vec!["inc"]);
    }
}
