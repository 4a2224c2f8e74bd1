//! Loading published capsules and catching up with the ledger.
//!
//! A capsule version is materialized from the state store when its record is
//! there, otherwise by fetching the transaction that produced it and
//! re-executing that transaction's recorded operations. Fast-forward follows
//! the spend chain from a capsule's current version, replaying each spender.

use std::{
    collections::{HashMap, HashSet},
    mem,
};

use capsule_cbor::Hash;
use capsule_store::StateStoreExt;
use futures::{FutureExt, future::BoxFuture};
use indexmap::IndexMap;
use log::{debug, warn};

use crate::{
    arena::{Capsule, Validity},
    batch::{Batch, OutputRef},
    code::CodeKey,
    compile::compile,
    control::CallOrigin,
    error::KernelError,
    ids::{CapsuleId, CodeId, Credential, Slot, Version, VersionId, VersionRef},
    kernel::Kernel,
    ledger::SpendStatus,
    record::{CapsuleState, CodeState, CompiledBatch, Encoded, ExecOp, StateRecord, Token, TokenKind},
    runtime::Runtime,
    value::{Ref, Value},
};

/// Objects loaded ahead of a replay, indexed the way the payload names them.
#[derive(Debug, Default)]
pub(crate) struct Preloaded {
    pub inputs: Vec<CapsuleId>,
    pub refs: Vec<CapsuleId>,
    pub absolute: HashMap<VersionId, Ref>,
}

/// Resolve a token stored in a state record relative to its own transaction.
fn relative(token: &Token, txid: Hash) -> Result<VersionId, KernelError> {
    match token {
        Token::Own(slot) => Ok(VersionId::new(txid, *slot)),
        Token::Abs(id) => Ok(*id),
        other => Err(KernelError::LedgerApi(format!(
            "state record holds a batch-relative token {other:?}"
        ))),
    }
}

fn decode(value: &Encoded, resolve: &mut impl FnMut(TokenKind, &Token) -> Result<Value, KernelError>) -> Result<Value, KernelError> {
    Ok(match value {
        Encoded::Null => Value::Null,
        Encoded::Bool(b) => Value::Bool(*b),
        Encoded::Int(i) => Value::Int(*i),
        Encoded::Nat(n) => Value::Nat(*n),
        Encoded::Text(s) => Value::Text(s.clone()),
        Encoded::Bytes(b) => Value::Bytes(b.clone()),
        Encoded::List(items) => Value::List(
            items
                .iter()
                .map(|v| decode(v, resolve))
                .collect::<Result<_, _>>()?,
        ),
        Encoded::Record(fields) => {
            let mut out = IndexMap::with_capacity(fields.len());
            for (k, v) in fields {
                out.insert(k.clone(), decode(v, resolve)?);
            }
            Value::Record(out)
        }
        Encoded::Capsule(t) => resolve(TokenKind::Capsule, t)?,
        Encoded::Code(t) => resolve(TokenKind::Code, t)?,
    })
}

/// Absolute versions an exec list refers to, with what kind of object each is.
fn absolute_tokens(payload: &CompiledBatch) -> Vec<(TokenKind, VersionId)> {
    let mut out = Vec::new();
    let mut note = |kind: TokenKind, token: &Token| {
        if let Token::Abs(id) = token {
            if !out.contains(&(kind, *id)) {
                out.push((kind, *id));
            }
        }
    };
    for op in &payload.exec {
        match op {
            ExecOp::Deploy { code } => {
                for token in code.parent.iter().chain(code.deps.values()) {
                    note(TokenKind::Code, token);
                }
            }
            ExecOp::New { code, args, .. } => {
                note(TokenKind::Code, code);
                for arg in args {
                    arg.visit_tokens(&mut |kind, token| note(kind, token));
                }
            }
            ExecOp::Call { target, args, .. } => {
                note(TokenKind::Capsule, target);
                for arg in args {
                    arg.visit_tokens(&mut |kind, token| note(kind, token));
                }
            }
        }
    }
    out
}

impl Kernel {
    /// Re-execute a fetched transaction and check it reproduces the recorded
    /// outputs. Returns the states to persist.
    pub(crate) fn replay(
        &mut self,
        txid: Hash,
        payload: &CompiledBatch,
        loaded: &Preloaded,
    ) -> Result<Vec<(Slot, StateRecord)>, KernelError> {
        if !self.control.is_idle() {
            return Err(KernelError::Invariant("replay during a method call".into()));
        }
        let seq = self.alloc_seq();
        let saved = mem::replace(&mut self.batch, Batch::detached(seq));
        let result = self.replay_ops(txid, payload, loaded);
        let replayed = mem::replace(&mut self.batch, saved);
        match result {
            Ok(states) => {
                self.finalize(&replayed, txid)?;
                debug!("replayed {} ({} steps)", txid.short(), replayed.steps.len());
                Ok(states)
            }
            Err(err) => {
                self.rollback_batch(&replayed, false, &err.to_string());
                Err(err)
            }
        }
    }

    fn replay_ops(
        &mut self,
        txid: Hash,
        payload: &CompiledBatch,
        loaded: &Preloaded,
    ) -> Result<Vec<(Slot, StateRecord)>, KernelError> {
        self.batch.begin();
        let mut deployed: Vec<CodeId> = Vec::new();
        for op in &payload.exec {
            match op {
                ExecOp::Deploy { code } => {
                    let id = self.replay_deploy(code, &deployed, loaded)?;
                    deployed.push(id);
                }
                ExecOp::New { code, args, owner } => {
                    let code = self.replay_code(code, &deployed, loaded)?;
                    let args = self.replay_args(args, &deployed, loaded)?;
                    self.create(code, args, Some(owner.clone()))?;
                }
                ExecOp::Call {
                    target,
                    method,
                    args,
                } => {
                    let target = self.replay_capsule(target, loaded)?;
                    let args = self.replay_args(args, &deployed, loaded)?;
                    self.call(target, method, args, CallOrigin::External)?;
                }
            }
        }
        self.batch.end()?;
        let slots = self.batch.seal();
        self.stamp(self.batch.seq, &slots);

        let plan = compile(&self.batch, &self.arena, &payload.app, payload.protocol)?;
        if plan.payload != *payload {
            warn!("replay of {} diverged from its recorded payload", txid.short());
            return Err(KernelError::Consistency(format!(
                "replay of {} does not reproduce its recorded outputs",
                txid.short()
            )));
        }
        Ok(plan.states)
    }

    fn replay_deploy(
        &mut self,
        code: &CodeState,
        deployed: &[CodeId],
        loaded: &Preloaded,
    ) -> Result<CodeId, KernelError> {
        let handle = self
            .hosted(&CodeKey::Digest(code.digest()?))
            .ok_or_else(|| {
                KernelError::Validity(format!("code '{}' is not installed on this host", code.name))
            })?;
        let parent = code
            .parent
            .as_ref()
            .map(|t| self.replay_code(t, deployed, loaded))
            .transpose()?;
        let mut deps = IndexMap::with_capacity(code.deps.len());
        for (name, token) in &code.deps {
            deps.insert(name.clone(), self.replay_code(token, deployed, loaded)?);
        }
        let id = self.insert_deployment(handle, parent, deps, code.owner.clone());
        self.store_code(id)?;
        Ok(id)
    }

    fn replay_capsule(&self, token: &Token, loaded: &Preloaded) -> Result<CapsuleId, KernelError> {
        let found = match token {
            Token::In(i) => loaded.inputs.get(*i as usize).copied(),
            Token::Ref(i) => loaded.refs.get(*i as usize).copied(),
            Token::Out(i) => match self.batch.outputs.get_index(*i as usize) {
                Some(OutputRef::Capsule(id)) => Some(*id),
                _ => None,
            },
            Token::Abs(v) => match loaded.absolute.get(v) {
                Some(Ref::Capsule(id)) => Some(*id),
                _ => None,
            },
            _ => None,
        };
        found.ok_or_else(|| KernelError::LedgerApi(format!("cannot resolve capsule token {token:?}")))
    }

    fn replay_code(&self, token: &Token, deployed: &[CodeId], loaded: &Preloaded) -> Result<CodeId, KernelError> {
        let found = match token {
            Token::Deploy(i) => deployed.get(*i as usize).copied(),
            Token::Out(i) => match self.batch.outputs.get_index(*i as usize) {
                Some(OutputRef::Code(id)) => Some(*id),
                _ => None,
            },
            Token::Abs(v) => match loaded.absolute.get(v) {
                Some(Ref::Code(id)) => Some(*id),
                _ => None,
            },
            _ => None,
        };
        found.ok_or_else(|| KernelError::LedgerApi(format!("cannot resolve code token {token:?}")))
    }

    fn replay_args(&self, args: &[Encoded], deployed: &[CodeId], loaded: &Preloaded) -> Result<Vec<Value>, KernelError> {
        let mut resolve = |kind: TokenKind, token: &Token| -> Result<Value, KernelError> {
            Ok(match kind {
                TokenKind::Capsule => Value::Capsule(self.replay_capsule(token, loaded)?),
                TokenKind::Code => Value::Code(self.replay_code(token, deployed, loaded)?),
            })
        };
        args.iter().map(|a| decode(a, &mut resolve)).collect()
    }
}

impl Runtime {
    /// Materialize the capsule published at `version`.
    pub async fn load(&self, version: VersionId) -> Result<CapsuleId, KernelError> {
        self.load_capsule(version).await
    }

    pub async fn load_code(&self, version: VersionId) -> Result<CodeId, KernelError> {
        self.load_code_at(version).await
    }

    fn stored(&self, version: &VersionId) -> Result<Option<StateRecord>, KernelError> {
        Ok(self.inner.states.get_state(&version.to_string())?)
    }

    fn load_capsule(&self, version: VersionId) -> BoxFuture<'_, Result<CapsuleId, KernelError>> {
        async move {
            if let Some(id) = self.kernel().arena.find_capsule_at(&version) {
                return Ok(id);
            }
            match self.stored(&version)? {
                Some(StateRecord::Capsule(state)) => self.materialize(version, state).await,
                Some(StateRecord::Code(_)) => Err(KernelError::Validity(format!(
                    "{version} holds code, not a capsule"
                ))),
                None => {
                    self.replay_tx(version.txid).await?;
                    let found = self.kernel().arena.find_capsule_at(&version);
                    found.ok_or_else(|| {
                        KernelError::LedgerApi(format!("{version} is not a capsule output"))
                    })
                }
            }
        }
        .boxed()
    }

    async fn materialize(&self, version: VersionId, state: CapsuleState) -> Result<CapsuleId, KernelError> {
        let code = self.load_code_at(relative(&state.code, version.txid)?).await?;
        let origin = relative(&state.origin, version.txid)?;
        let id = {
            let mut kernel = self.kernel();
            if let Some(id) = kernel.arena.find_capsule_at(&version) {
                return Ok(id);
            }
            let mut capsule = Capsule::new(code, state.owner.clone());
            capsule.origin = Version::Final(origin);
            capsule.location = Version::Final(version);
            capsule.units = state.units;
            kernel.arena.insert_capsule(capsule)
        };

        let mut tokens = Vec::new();
        for value in state.fields.values() {
            value.visit_tokens(&mut |kind, token| tokens.push((kind, *token)));
        }
        let mut resolved: HashMap<Token, Value> = HashMap::new();
        for (kind, token) in tokens {
            if resolved.contains_key(&token) {
                continue;
            }
            let target = relative(&token, version.txid)?;
            let value = match kind {
                TokenKind::Capsule => Value::Capsule(self.load_capsule(target).await?),
                TokenKind::Code => Value::Code(self.load_code_at(target).await?),
            };
            resolved.insert(token, value);
        }

        let mut fields = IndexMap::with_capacity(state.fields.len());
        for (name, value) in &state.fields {
            let decoded = decode(value, &mut |_, token| {
                resolved
                    .get(token)
                    .cloned()
                    .ok_or_else(|| KernelError::Invariant(format!("unresolved token {token:?}")))
            })?;
            fields.insert(name.clone(), decoded);
        }
        self.kernel().arena.capsule_mut(id)?.fields = fields;
        debug!("loaded {id} at {version}");
        Ok(id)
    }

    fn load_code_at(&self, version: VersionId) -> BoxFuture<'_, Result<CodeId, KernelError>> {
        async move {
            if let Some(id) = self.kernel().arena.find_code_at(&version) {
                return Ok(id);
            }
            let record = match self.stored(&version)? {
                Some(StateRecord::Code(record)) => record,
                Some(StateRecord::Capsule(_)) => {
                    return Err(KernelError::Validity(format!(
                        "{version} holds a capsule, not code"
                    )));
                }
                None => {
                    self.replay_tx(version.txid).await?;
                    let found = self.kernel().arena.find_code_at(&version);
                    return found.ok_or_else(|| {
                        KernelError::LedgerApi(format!("{version} is not a code output"))
                    });
                }
            };
            let parent = match &record.parent {
                Some(token) => Some(self.load_code_at(relative(token, version.txid)?).await?),
                None => None,
            };
            let mut deps = IndexMap::with_capacity(record.deps.len());
            for (name, token) in &record.deps {
                deps.insert(name.clone(), self.load_code_at(relative(token, version.txid)?).await?);
            }

            let mut kernel = self.kernel();
            if let Some(id) = kernel.arena.find_code_at(&version) {
                return Ok(id);
            }
            let handle = kernel
                .hosted(&CodeKey::Location(version))
                .or_else(|| {
                    record
                        .digest()
                        .ok()
                        .and_then(|digest| kernel.hosted(&CodeKey::Digest(digest)))
                })
                .ok_or_else(|| {
                    KernelError::Validity(format!(
                        "code '{}' at {version} is not installed on this host",
                        record.name
                    ))
                })?;
            let id = kernel.insert_deployment(handle, parent, deps, record.owner.clone());
            let artifact = kernel.arena.code_mut(id)?;
            artifact.origin = Version::Final(version);
            artifact.location = Version::Final(version);
            Ok(id)
        }
        .boxed()
    }

    /// Fetch a transaction, load what it consumed, and re-execute it.
    fn replay_tx(&self, txid: Hash) -> BoxFuture<'_, Result<(), KernelError>> {
        async move {
            let tx = self.inner.ledger.fetch(&txid).await?;
            let payload = tx.payload.ok_or_else(|| {
                KernelError::LedgerApi(format!("{} carries no capsule record", txid.short()))
            })?;
            let n_inputs = payload.inputs as usize;
            if tx.inputs.len() < n_inputs {
                return Err(KernelError::LedgerApi(format!(
                    "{} declares {n_inputs} capsule inputs but has {}",
                    txid.short(),
                    tx.inputs.len()
                )));
            }

            let mut loaded = Preloaded::default();
            for input in &tx.inputs[..n_inputs] {
                loaded.inputs.push(self.load_capsule(input.outpoint).await?);
            }
            for reference in &payload.refs {
                let VersionRef::Final(version) = reference else {
                    return Err(KernelError::LedgerApi(format!(
                        "{} references unpublished {reference}",
                        txid.short()
                    )));
                };
                loaded.refs.push(self.load_capsule(*version).await?);
            }
            for (kind, version) in absolute_tokens(&payload) {
                let r = match kind {
                    TokenKind::Capsule => Ref::Capsule(self.load_capsule(version).await?),
                    TokenKind::Code => Ref::Code(self.load_code_at(version).await?),
                };
                loaded.absolute.insert(version, r);
            }

            let states = self.kernel().replay(txid, &payload, &loaded)?;
            for (slot, record) in &states {
                self.inner
                    .states
                    .put_state(&VersionId::new(txid, *slot).to_string(), record)?;
            }
            Ok(())
        }
        .boxed()
    }

    /// Publish pending work, then bring `id` and everything it references up
    /// to the latest ledger state.
    pub async fn sync_capsule(&self, id: CapsuleId) -> Result<(), KernelError> {
        self.sync().await?;
        let mut visited = HashSet::new();
        self.fast_forward(id, &mut visited).await
    }

    fn fast_forward<'a>(
        &'a self,
        id: CapsuleId,
        visited: &'a mut HashSet<VersionId>,
    ) -> BoxFuture<'a, Result<(), KernelError>> {
        async move {
            let origin = {
                let kernel = self.kernel();
                let capsule = kernel.arena.capsule(id)?;
                if let Validity::Poisoned(reason) = &capsule.validity {
                    return Err(KernelError::Validity(format!("{id} is poisoned: {reason}")));
                }
                if kernel.is_checked_out(id) {
                    return Err(KernelError::Validity(format!(
                        "{id} is part of an unpublished batch; sync first"
                    )));
                }
                capsule.origin.final_id().ok_or_else(|| {
                    KernelError::Validity(format!("{id} has not been published"))
                })?
            };
            if !visited.insert(origin) {
                return Ok(());
            }

            loop {
                let location = {
                    let kernel = self.kernel();
                    kernel.arena.capsule(id)?.location.final_id()
                };
                let Some(location) = location else {
                    return Err(KernelError::Invariant(format!("{id} lost its location")));
                };
                if location.is_deleted() {
                    break;
                }
                match self.inner.ledger.spends(&location).await? {
                    SpendStatus::Unspent => break,
                    SpendStatus::SpentBy(txid) => {
                        self.replay_tx(txid).await?;
                        let now = self.kernel().arena.capsule(id)?.location;
                        if now == Version::Final(location) {
                            return Err(KernelError::LedgerApi(format!(
                                "{} spends {location} but does not update it",
                                txid.short()
                            )));
                        }
                    }
                    SpendStatus::Unknown => {
                        return Err(KernelError::LedgerApi(format!(
                            "ledger gave no spend information for {location}"
                        )));
                    }
                }
            }

            let referenced: Vec<CapsuleId> = {
                let kernel = self.kernel();
                let capsule = kernel.arena.capsule(id)?;
                let mut out = Vec::new();
                for value in capsule.fields.values() {
                    value.visit_refs(&mut |r| {
                        if let Ref::Capsule(c) = r {
                            if !out.contains(&c) {
                                out.push(c);
                            }
                        }
                    });
                }
                out
            };
            for child in referenced {
                self.fast_forward(child, visited).await?;
            }
            Ok(())
        }
        .boxed()
    }

    /// Capsules currently held by `owner` on the ledger.
    pub async fn inventory(&self, owner: &Credential) -> Result<Vec<CapsuleId>, KernelError> {
        let unspent = self.inner.ledger.utxos(owner).await?;
        let mut found = Vec::new();
        for version in unspent {
            if !self.is_capsule_output(&version).await? {
                continue;
            }
            let id = self.load_capsule(version).await?;
            if !found.contains(&id) {
                found.push(id);
            }
        }
        Ok(found)
    }

    async fn is_capsule_output(&self, version: &VersionId) -> Result<bool, KernelError> {
        if let Some(record) = self.stored(version)? {
            return Ok(matches!(record, StateRecord::Capsule(_)));
        }
        let tx = self.inner.ledger.fetch(&version.txid).await?;
        let Some(payload) = tx.payload else {
            return Ok(false);
        };
        let Slot::Output(index) = version.slot else {
            return Ok(false);
        };
        if index as usize >= payload.outputs.len() {
            return Ok(false);
        }
        self.replay_tx(version.txid).await?;
        Ok(matches!(self.stored(version)?, Some(StateRecord::Capsule(_))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txid(tag: &str) -> Hash {
        Hash::of_bytes(tag.as_bytes())
    }

    #[test]
    fn own_tokens_resolve_against_their_transaction() {
        let tx = txid("tx");
        assert_eq!(
            relative(&Token::Own(Slot::Output(2)), tx).unwrap(),
            VersionId::output(tx, 2)
        );
        let elsewhere = VersionId::output(txid("other"), 0);
        assert_eq!(relative(&Token::Abs(elsewhere), tx).unwrap(), elsewhere);
        assert!(matches!(
            relative(&Token::In(0), tx),
            Err(KernelError::LedgerApi(_))
        ));
    }

    #[test]
    fn absolute_tokens_are_collected_once_with_their_kind() {
        let code = VersionId::output(txid("code"), 0);
        let friend = VersionId::output(txid("friend"), 1);
        let payload = CompiledBatch {
            app: "test".into(),
            protocol: 1,
            inputs: 1,
            refs: Vec::new(),
            outputs: Vec::new(),
            deletes: Vec::new(),
            exec: vec![
                ExecOp::New {
                    code: Token::Abs(code),
                    args: vec![Encoded::Capsule(Token::Abs(friend))],
                    owner: Credential::address("alice"),
                },
                ExecOp::Call {
                    target: Token::In(0),
                    method: "greet".into(),
                    args: vec![Encoded::List(vec![
                        Encoded::Capsule(Token::Abs(friend)),
                        Encoded::Code(Token::Abs(code)),
                    ])],
                },
            ],
        };
        assert_eq!(
            absolute_tokens(&payload),
            vec![(TokenKind::Code, code), (TokenKind::Capsule, friend)]
        );
    }

    #[test]
    fn decode_routes_tokens_through_the_resolver() {
        let encoded = Encoded::Record(IndexMap::from([
            ("n".to_string(), Encoded::Nat(3)),
            ("peer".to_string(), Encoded::Capsule(Token::Own(Slot::Output(0)))),
        ]));
        let mut seen = Vec::new();
        let value = decode(&encoded, &mut |kind, token| {
            seen.push((kind, *token));
            Ok(Value::Null)
        })
        .unwrap();
        assert_eq!(seen, vec![(TokenKind::Capsule, Token::Own(Slot::Output(0)))]);
        assert_eq!(value.at_path(&["n"]), Some(&Value::Nat(3)));
        assert_eq!(value.at_path(&["peer"]), Some(&Value::Null));
    }
}
