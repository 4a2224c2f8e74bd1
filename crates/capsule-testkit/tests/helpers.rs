//! Shared test helpers for integration tests.
//!
//! Each integration test compiles this module separately, so some functions
//! may appear unused in certain test contexts but are used by others.

#![allow(dead_code)]

use capsule_kernel::{CapsuleId, CodeId, Deployment, Runtime, Value, VersionId};
use capsule_testkit::fixtures;

pub struct Codes {
    pub counter: CodeId,
    pub holder: CodeId,
}

/// Deploy Counter and Holder on `rt`. Nothing is published.
pub fn deploy_basics(rt: &Runtime) -> Codes {
    Codes {
        counter: rt.deploy(fixtures::counter()).unwrap(),
        holder: rt.deploy(fixtures::holder()).unwrap(),
    }
}

pub fn deploy_factory(rt: &Runtime, counter: CodeId) -> CodeId {
    rt.deploy(Deployment::new(fixtures::factory()).dep("counter", counter))
        .unwrap()
}

pub fn counter_at(rt: &Runtime, codes: &Codes, start: u64) -> CapsuleId {
    rt.create(codes.counter, vec![Value::Nat(start)]).unwrap()
}

pub fn count(rt: &Runtime, id: CapsuleId) -> u64 {
    rt.get(id, "count").unwrap().as_nat().expect("count is a number")
}

/// The published version of `id`, read through its `version` field.
pub fn version_of(rt: &Runtime, id: CapsuleId) -> VersionId {
    let text = rt.get(id, "version").unwrap();
    text.as_text()
        .expect("version is text")
        .parse()
        .expect("version parses")
}

pub fn capsule_field(rt: &Runtime, id: CapsuleId, field: &str) -> CapsuleId {
    rt.get(id, field)
        .unwrap()
        .as_capsule()
        .expect("field holds a capsule")
}
