//! Point-in-time copies of capsules and the change test between two copies.

use indexmap::IndexMap;

use crate::{
    arena::{Arena, Capsule, Validity},
    ids::{CapsuleId, CodeId, Credential, Version},
    value::Value,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub code: CodeId,
    pub origin: Version,
    pub location: Version,
    pub owner: Credential,
    pub units: u64,
    pub fields: IndexMap<String, Value>,
    pub validity: Validity,
}

impl Snapshot {
    pub fn capture(capsule: &Capsule) -> Self {
        Self {
            code: capsule.code,
            origin: capsule.origin,
            location: capsule.location,
            owner: capsule.owner.clone(),
            units: capsule.units,
            fields: capsule.fields.clone(),
            validity: capsule.validity.clone(),
        }
    }

    pub fn restore_into(&self, capsule: &mut Capsule) {
        capsule.code = self.code;
        capsule.origin = self.origin;
        capsule.location = self.location;
        capsule.owner = self.owner.clone();
        capsule.units = self.units;
        capsule.fields = self.fields.clone();
        capsule.validity = self.validity.clone();
    }

    pub fn is_destroyed(&self) -> bool {
        self.owner == Credential::Destroyed
    }

    pub fn refs(&self) -> Vec<crate::value::Ref> {
        let mut out = vec![crate::value::Ref::Code(self.code)];
        for value in self.fields.values() {
            value.visit_refs(&mut |r| out.push(r));
        }
        out
    }
}

/// Whether a capsule's observable state differs between two snapshots.
///
/// Capsule references compare by identity; everything else compares by value.
pub fn changed(before: &Snapshot, after: &Snapshot, arena: &Arena) -> bool {
    if before.code != after.code || before.owner != after.owner || before.units != after.units {
        return true;
    }
    !fields_equal(&before.fields, &after.fields, arena)
}

fn fields_equal(a: &IndexMap<String, Value>, b: &IndexMap<String, Value>, arena: &Arena) -> bool {
    a.len() == b.len()
        && a.iter()
            .all(|(k, va)| b.get(k).is_some_and(|vb| values_equal(va, vb, arena)))
}

pub fn values_equal(a: &Value, b: &Value, arena: &Arena) -> bool {
    match (a, b) {
        (Value::Capsule(x), Value::Capsule(y)) => same_capsule(*x, *y, arena),
        (Value::List(xs), Value::List(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_equal(x, y, arena))
        }
        (Value::Record(xs), Value::Record(ys)) => fields_equal(xs, ys, arena),
        _ => a == b,
    }
}

/// Two handles name the same capsule when they are the same instance or
/// share a final identity.
pub fn same_capsule(a: CapsuleId, b: CapsuleId, arena: &Arena) -> bool {
    if a == b {
        return true;
    }
    match (arena.capsule(a), arena.capsule(b)) {
        (Ok(x), Ok(y)) => x.origin.is_final() && x.origin == y.origin,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::VersionId;
    use capsule_cbor::Hash;

    fn published(arena: &mut Arena, origin: VersionId, location: VersionId) -> CapsuleId {
        let mut capsule = Capsule::new(CodeId(0), Credential::address("a"));
        capsule.origin = Version::Final(origin);
        capsule.location = Version::Final(location);
        arena.insert_capsule(capsule)
    }

    #[test]
    fn references_compare_by_identity_not_contents() {
        let mut arena = Arena::default();
        let origin = VersionId::output(Hash::of_bytes(b"t0"), 0);
        let old = published(&mut arena, origin, origin);
        let newer = published(&mut arena, origin, VersionId::output(Hash::of_bytes(b"t1"), 0));
        let other = published(
            &mut arena,
            VersionId::output(Hash::of_bytes(b"t2"), 0),
            VersionId::output(Hash::of_bytes(b"t2"), 0),
        );
        let fresh = arena.insert_capsule(Capsule::new(CodeId(0), Credential::address("a")));
        let fresh_twin = arena.insert_capsule(Capsule::new(CodeId(0), Credential::address("a")));

        assert!(values_equal(&Value::Capsule(old), &Value::Capsule(newer), &arena));
        assert!(!values_equal(&Value::Capsule(old), &Value::Capsule(other), &arena));
        assert!(!values_equal(
            &Value::Capsule(fresh),
            &Value::Capsule(fresh_twin),
            &arena
        ));
    }

    #[test]
    fn record_order_does_not_count_as_change() {
        let arena = Arena::default();
        let mut capsule = Capsule::new(CodeId(0), Credential::address("a"));
        capsule.fields.insert("x".into(), Value::Nat(1));
        capsule.fields.insert("y".into(), Value::Nat(2));
        let before = Snapshot::capture(&capsule);
        capsule.fields.clear();
        capsule.fields.insert("y".into(), Value::Nat(2));
        capsule.fields.insert("x".into(), Value::Nat(1));
        assert!(!changed(&before, &Snapshot::capture(&capsule), &arena));
        capsule.units = 5;
        assert!(changed(&before, &Snapshot::capture(&capsule), &arena));
    }
}
