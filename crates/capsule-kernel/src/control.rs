use indexmap::{IndexMap, IndexSet};

use crate::{
    error::KernelError,
    ids::{CapsuleId, CodeId, Credential},
    snapshot::Snapshot,
    value::Value,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOrigin {
    /// Application-initiated; may record an action.
    External,
    /// Helper or query; must not change state.
    Internal,
}

/// What started the current top-level invocation.
#[derive(Debug, Clone)]
pub(crate) enum Entry {
    Call {
        target: CapsuleId,
        method: String,
        args: Vec<Value>,
    },
    New {
        code: CodeId,
        args: Vec<Value>,
        owner: Credential,
    },
}

/// Bookkeeping for one top-level invocation and everything it calls.
#[derive(Debug)]
pub(crate) struct CallControl {
    pub origin: CallOrigin,
    pub entry: Option<Entry>,
    pub stack: Vec<CapsuleId>,
    pub created: IndexSet<CapsuleId>,
    pub read: IndexSet<CapsuleId>,
    pub before: IndexMap<CapsuleId, Snapshot>,
    /// callee -> callers that invoked it.
    pub callers: IndexMap<CapsuleId, IndexSet<CapsuleId>>,
    /// Last type observed per touched capsule.
    pub attribution: IndexMap<CapsuleId, CodeId>,
    pub authed: IndexSet<CapsuleId>,
    /// First-touch order; fixes the order of inputs and outputs.
    pub touched: IndexSet<CapsuleId>,
    /// First error raised anywhere in the invocation, caught or not.
    pub error: Option<KernelError>,
}

impl CallControl {
    pub fn new(origin: CallOrigin) -> Self {
        Self {
            origin,
            entry: None,
            stack: Vec::new(),
            created: IndexSet::new(),
            read: IndexSet::new(),
            before: IndexMap::new(),
            callers: IndexMap::new(),
            attribution: IndexMap::new(),
            authed: IndexSet::new(),
            touched: IndexSet::new(),
            error: None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.stack.is_empty() && self.entry.is_none()
    }

    pub fn current(&self) -> Option<CapsuleId> {
        self.stack.last().copied()
    }

    /// The frame below the current one.
    pub fn caller(&self) -> Option<CapsuleId> {
        self.stack.iter().rev().nth(1).copied()
    }

    pub fn touch(&mut self, id: CapsuleId, code: CodeId) {
        self.touched.insert(id);
        self.attribution.insert(id, code);
    }

    pub fn note_read(&mut self, id: CapsuleId, code: CodeId) {
        self.touch(id, code);
        if !self.stack.is_empty() {
            self.read.insert(id);
        }
    }

    pub fn note_caller(&mut self, callee: CapsuleId) {
        if let Some(caller) = self.current() {
            if caller != callee {
                self.callers.entry(callee).or_default().insert(caller);
            }
        }
    }

    pub fn record_error(&mut self, err: &KernelError) {
        if self.error.is_none() {
            self.error = Some(err.clone());
        }
    }

    /// Transitive callers of `ids`, not including `ids` themselves unless
    /// reached through a call chain.
    pub fn callers_of(&self, ids: &IndexSet<CapsuleId>) -> IndexSet<CapsuleId> {
        let mut out = IndexSet::new();
        let mut frontier: Vec<CapsuleId> = ids.iter().copied().collect();
        while let Some(id) = frontier.pop() {
            if let Some(callers) = self.callers.get(&id) {
                for caller in callers {
                    if out.insert(*caller) {
                        frontier.push(*caller);
                    }
                }
            }
        }
        out
    }
}
