//! Local handles, ledger version ids and credentials.

use std::{fmt, str::FromStr};

use capsule_cbor::Hash;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Arena index of a capsule in one runtime. Not meaningful across runtimes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CapsuleId(pub(crate) u32);

/// Arena index of a deployed code artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodeId(pub(crate) u32);

impl fmt::Display for CapsuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "capsule#{}", self.0)
    }
}

impl fmt::Display for CodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code#{}", self.0)
    }
}

/// Sequence number of a batch within one runtime.
pub type BatchSeq = u64;

/// Position of a produced artifact inside a ledger record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    Output(u32),
    Deleted(u32),
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Output(n) => write!(f, "_o{n}"),
            Slot::Deleted(n) => write!(f, "_d{n}"),
        }
    }
}

/// Final ledger address of one capsule or code version: `<txid hex>_o<n>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VersionId {
    pub txid: Hash,
    pub slot: Slot,
}

impl VersionId {
    pub fn new(txid: Hash, slot: Slot) -> Self {
        Self { txid, slot }
    }

    pub fn output(txid: Hash, index: u32) -> Self {
        Self::new(txid, Slot::Output(index))
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self.slot, Slot::Deleted(_))
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.txid.to_bare_hex(), self.slot)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid version id '{0}'")]
pub struct VersionParseError(pub String);

impl FromStr for VersionId {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || VersionParseError(s.to_string());
        let (hex, rest) = s.rsplit_once('_').ok_or_else(bad)?;
        let txid = Hash::from_bare_hex(hex).map_err(|_| bad())?;
        let parse = |index: &str| index.parse::<u32>().map_err(|_| bad());
        let slot = if let Some(index) = rest.strip_prefix('o') {
            Slot::Output(parse(index)?)
        } else if let Some(index) = rest.strip_prefix('d') {
            Slot::Deleted(parse(index)?)
        } else {
            return Err(bad());
        };
        Ok(VersionId { txid, slot })
    }
}

impl Serialize for VersionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for VersionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// In-flight output of a queued (not yet broadcast) batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Provisional {
    pub batch: BatchSeq,
    pub slot: Slot,
}

impl fmt::Display for Provisional {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "batch{}{}", self.batch, self.slot)
    }
}

/// Identity or version of a capsule as far as this runtime knows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Version {
    /// Never recorded in any batch (fresh, or reset after a rollback).
    #[default]
    Unbound,
    /// Recorded in a batch that has not been broadcast yet.
    Pending(Provisional),
    Final(VersionId),
}

impl Version {
    pub fn final_id(&self) -> Option<VersionId> {
        match self {
            Version::Final(id) => Some(*id),
            _ => None,
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, Version::Final(_))
    }

    pub fn is_unbound(&self) -> bool {
        matches!(self, Version::Unbound)
    }

    pub fn pending_in(&self, batch: BatchSeq) -> bool {
        matches!(self, Version::Pending(p) if p.batch == batch)
    }

    /// Rewrite a pending version of `batch` to its final id once `txid` is known.
    pub fn resolve(&mut self, batch: BatchSeq, txid: Hash) {
        if let Version::Pending(p) = *self {
            if p.batch == batch {
                *self = Version::Final(VersionId::new(txid, p.slot));
            }
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Version::Unbound => f.write_str("unbound"),
            Version::Pending(p) => write!(f, "pending:{p}"),
            Version::Final(id) => write!(f, "{id}"),
        }
    }
}

/// A version that can appear in a compiled batch: final, or pending in an
/// earlier queued batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionRef {
    Final(VersionId),
    Pending(Provisional),
}

impl fmt::Display for VersionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionRef::Final(id) => write!(f, "{id}"),
            VersionRef::Pending(p) => write!(f, "pending:{p}"),
        }
    }
}

/// Lock/address controlling who may authorize a capsule's next mutation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Credential {
    /// Cleared after a rolled-back first publish.
    #[default]
    Unset,
    Address(String),
    /// Terminal sentinel assigned by `destroy`.
    Destroyed,
}

impl Credential {
    pub fn address(value: impl Into<String>) -> Self {
        Credential::Address(value.into())
    }

    pub fn as_address(&self) -> Option<&str> {
        match self {
            Credential::Address(addr) => Some(addr),
            _ => None,
        }
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Unset => f.write_str("<unset>"),
            Credential::Address(addr) => f.write_str(addr),
            Credential::Destroyed => f.write_str("<destroyed>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_id_parses_its_own_rendering() {
        let txid = Hash::of_bytes(b"tx");
        for slot in [Slot::Output(0), Slot::Output(12), Slot::Deleted(3)] {
            let id = VersionId::new(txid, slot);
            let text = id.to_string();
            assert_eq!(text.parse::<VersionId>().unwrap(), id);
        }
        assert!("nope".parse::<VersionId>().is_err());
        assert!(format!("{}_x1", txid.to_bare_hex()).parse::<VersionId>().is_err());
    }

    #[test]
    fn malformed_slot_suffixes_are_errors() {
        let hex = Hash::of_bytes(b"tx").to_bare_hex();
        for suffix in ["é0", "o", "d-1", "", "ö1"] {
            let text = format!("{hex}_{suffix}");
            assert_eq!(
                text.parse::<VersionId>(),
                Err(VersionParseError(text.clone()))
            );
        }
    }

    #[test]
    fn resolve_only_touches_matching_batch() {
        let txid = Hash::of_bytes(b"tx");
        let mut pending = Version::Pending(Provisional {
            batch: 4,
            slot: Slot::Output(1),
        });
        pending.resolve(3, txid);
        assert!(pending.pending_in(4));
        pending.resolve(4, txid);
        assert_eq!(pending, Version::Final(VersionId::output(txid, 1)));
    }
}
