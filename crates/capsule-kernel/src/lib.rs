//! Capsule kernel: intercepts every read, write and call on capsule objects,
//! records what changed into batches, and publishes those batches as ledger
//! transactions that any runtime can replay.

pub mod arena;
pub mod batch;
pub mod code;
pub mod config;
pub mod control;
pub mod error;
pub mod gate;
pub mod ids;
pub mod kernel;
pub mod ledger;
pub mod record;
pub mod runtime;
pub mod snapshot;
pub mod value;

mod compile;
mod invoke;
mod publish;
mod sync;

pub use arena::Validity;
pub use code::{CodeDefinition, CodeHandle, CodeHost, CodeKey, Deployment, MethodFn};
pub use config::{DEFAULT_MAX_UNITS, KernelConfig, PROTOCOL_VERSION};
pub use control::CallOrigin;
pub use error::KernelError;
pub use gate::{Ctx, Gate};
pub use ids::{
    BatchSeq, CapsuleId, CodeId, Credential, Provisional, Slot, Version, VersionId, VersionRef,
};
pub use kernel::{CapsuleView, Kernel};
pub use ledger::{
    Authorization, Funding, Ledger, LedgerError, LedgerTx, PublishObserver, PublishedBatch,
    SpendStatus, TxIn, TxOut,
};
pub use record::{CapsuleState, CodeState, CompiledBatch, Encoded, ExecOp, StateRecord, Token};
pub use runtime::{Runtime, RuntimeBuilder};
pub use value::{Ref, Value};
