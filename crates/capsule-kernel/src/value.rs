use indexmap::IndexMap;

use crate::ids::{CapsuleId, CodeId};

/// Field value held by a capsule or passed to a method.
///
/// `Capsule` and `Code` point into the runtime's arena; they are turned into
/// ledger tokens when a batch is compiled.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Nat(u64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Record(IndexMap<String, Value>),
    Capsule(CapsuleId),
    Code(CodeId),
}

/// An arena reference found inside a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Ref {
    Capsule(CapsuleId),
    Code(CodeId),
}

impl Value {
    /// Human-readable kind string used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Nat(_) => "nat",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Record(_) => "record",
            Value::Capsule(_) => "capsule",
            Value::Code(_) => "code",
        }
    }

    /// Convenience helper to build a record from field/value pairs.
    pub fn record(fields: impl IntoIterator<Item = (impl Into<String>, Value)>) -> Self {
        let mut map = IndexMap::new();
        for (key, value) in fields.into_iter() {
            map.insert(key.into(), value);
        }
        Value::Record(map)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_nat(&self) -> Option<u64> {
        match self {
            Value::Nat(n) => Some(*n),
            Value::Int(i) if *i >= 0 => Some(*i as u64),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Nat(n) => i64::try_from(*n).ok(),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_capsule(&self) -> Option<CapsuleId> {
        match self {
            Value::Capsule(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_code(&self) -> Option<CodeId> {
        match self {
            Value::Code(id) => Some(*id),
            _ => None,
        }
    }

    /// Visit every arena reference, depth first, in field order.
    pub fn visit_refs(&self, f: &mut impl FnMut(Ref)) {
        match self {
            Value::Capsule(id) => f(Ref::Capsule(*id)),
            Value::Code(id) => f(Ref::Code(*id)),
            Value::List(items) => items.iter().for_each(|v| v.visit_refs(f)),
            Value::Record(fields) => fields.values().for_each(|v| v.visit_refs(f)),
            _ => {}
        }
    }

    pub fn refs(&self) -> Vec<Ref> {
        let mut out = Vec::new();
        self.visit_refs(&mut |r| out.push(r));
        out
    }

    /// Fallible structural map over arena references.
    pub fn try_map_refs<E>(&self, f: &mut impl FnMut(Ref) -> Result<Value, E>) -> Result<Value, E> {
        Ok(match self {
            Value::Capsule(id) => f(Ref::Capsule(*id))?,
            Value::Code(id) => f(Ref::Code(*id))?,
            Value::List(items) => Value::List(
                items
                    .iter()
                    .map(|v| v.try_map_refs(f))
                    .collect::<Result<_, E>>()?,
            ),
            Value::Record(fields) => {
                let mut out = IndexMap::with_capacity(fields.len());
                for (k, v) in fields {
                    out.insert(k.clone(), v.try_map_refs(f)?);
                }
                Value::Record(out)
            }
            other => other.clone(),
        })
    }

    /// Follow a dotted path of record keys and list indices.
    pub fn at_path(&self, path: &[&str]) -> Option<&Value> {
        let Some((head, rest)) = path.split_first() else {
            return Some(self);
        };
        let next = match self {
            Value::Record(fields) => fields.get(*head)?,
            Value::List(items) => items.get(head.parse::<usize>().ok()?)?,
            _ => return None,
        };
        next.at_path(rest)
    }

    /// Mutable lookup of a nested slot; record keys are created on demand.
    pub(crate) fn slot_at_path(&mut self, path: &[&str]) -> Option<&mut Value> {
        let Some((head, rest)) = path.split_first() else {
            return Some(self);
        };
        let next = match self {
            Value::Record(fields) => fields.entry((*head).to_string()).or_default(),
            Value::List(items) => items.get_mut(head.parse::<usize>().ok()?)?,
            _ => return None,
        };
        next.slot_at_path(rest)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Value::Nat(value)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_owned())
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::List(value)
    }
}

impl From<CapsuleId> for Value {
    fn from(value: CapsuleId) -> Self {
        Value::Capsule(value)
    }
}

impl From<CodeId> for Value {
    fn from(value: CodeId) -> Self {
        Value::Code(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refs_are_collected_in_field_order() {
        let value = Value::record([
            ("a", Value::Capsule(CapsuleId(2))),
            (
                "b",
                Value::List(vec![Value::Nat(1), Value::Code(CodeId(0)), Value::Capsule(CapsuleId(1))]),
            ),
        ]);
        assert_eq!(
            value.refs(),
            vec![
                Ref::Capsule(CapsuleId(2)),
                Ref::Code(CodeId(0)),
                Ref::Capsule(CapsuleId(1))
            ]
        );
    }

    #[test]
    fn path_lookup_and_creation() {
        let mut value = Value::record([("inner", Value::List(vec![Value::Nat(5)]))]);
        assert_eq!(value.at_path(&["inner", "0"]), Some(&Value::Nat(5)));
        assert_eq!(value.at_path(&["inner", "7"]), None);

        *value.slot_at_path(&["extra"]).unwrap() = Value::from("x");
        assert_eq!(value.at_path(&["extra"]), Some(&Value::from("x")));
        assert!(value.slot_at_path(&["inner", "0", "deeper"]).is_none());
    }
}
