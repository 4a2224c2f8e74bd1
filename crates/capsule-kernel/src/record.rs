//! Serialized forms written to the ledger and the state store.

use capsule_cbor::Hash;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::ids::{BatchSeq, Credential, Provisional, Slot, VersionId, VersionRef};

/// Reference to a capsule or code artifact inside a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Token {
    /// The n-th spent input.
    In(u32),
    /// The object produced n-th in execution order within this batch.
    Out(u32),
    /// The n-th read reference.
    Ref(u32),
    /// The n-th deployment of this batch.
    Deploy(u32),
    /// A slot of the record this token is stored in.
    Own(Slot),
    Abs(VersionId),
    /// Output of an earlier batch that is still queued.
    Pending(Provisional),
}

impl From<VersionRef> for Token {
    fn from(value: VersionRef) -> Self {
        match value {
            VersionRef::Final(id) => Token::Abs(id),
            VersionRef::Pending(p) => Token::Pending(p),
        }
    }
}

/// Wire form of a value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoded {
    Null,
    Bool(bool),
    Int(i64),
    Nat(u64),
    Text(String),
    Bytes(#[serde(with = "serde_bytes")] Vec<u8>),
    List(Vec<Encoded>),
    Record(IndexMap<String, Encoded>),
    Capsule(Token),
    Code(Token),
}

impl Encoded {
    pub fn visit_tokens(&self, f: &mut impl FnMut(TokenKind, &Token)) {
        match self {
            Encoded::Capsule(t) => f(TokenKind::Capsule, t),
            Encoded::Code(t) => f(TokenKind::Code, t),
            Encoded::List(items) => items.iter().for_each(|v| v.visit_tokens(f)),
            Encoded::Record(fields) => fields.values().for_each(|v| v.visit_tokens(f)),
            _ => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Capsule,
    Code,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapsuleState {
    pub code: Token,
    pub origin: Token,
    pub owner: Credential,
    pub units: u64,
    pub fields: IndexMap<String, Encoded>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeState {
    pub name: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Token>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub deps: IndexMap<String, Token>,
    pub owner: Credential,
}

impl CodeState {
    pub fn digest(&self) -> Result<Hash, serde_cbor::Error> {
        Hash::of_cbor(&crate::code::CodeDescriptor {
            name: self.name.clone(),
            source: self.source.clone(),
        })
    }
}

/// Persisted state of one output, keyed by its version id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StateRecord {
    Capsule(CapsuleState),
    Code(CodeState),
}

impl StateRecord {
    pub fn hash(&self) -> Result<Hash, serde_cbor::Error> {
        Hash::of_cbor(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ExecOp {
    Deploy {
        code: CodeState,
    },
    New {
        code: Token,
        args: Vec<Encoded>,
        owner: Credential,
    },
    Call {
        target: Token,
        method: String,
        args: Vec<Encoded>,
    },
}

/// Ledger payload describing one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledBatch {
    pub app: String,
    pub protocol: u32,
    /// Count of capsule inputs; they lead the transaction's input list.
    pub inputs: u32,
    pub refs: Vec<VersionRef>,
    /// State hash per output slot.
    pub outputs: Vec<Hash>,
    /// State hash per deleted slot.
    pub deletes: Vec<Hash>,
    pub exec: Vec<ExecOp>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spend {
    pub version: VersionRef,
    pub owner: Credential,
    pub units: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Produce {
    pub owner: Credential,
    pub units: u64,
}

/// Everything needed to turn a batch into a ledger transaction.
#[derive(Debug, Clone)]
pub struct BuildPlan {
    pub batch: BatchSeq,
    pub payload: CompiledBatch,
    pub spends: Vec<Spend>,
    /// One entry per `Slot::Output`, in slot order.
    pub produces: Vec<Produce>,
    pub states: Vec<(Slot, StateRecord)>,
}
