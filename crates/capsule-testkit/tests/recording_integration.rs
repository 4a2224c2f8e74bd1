use capsule_kernel::{
    Credential, DEFAULT_MAX_UNITS, Deployment, ExecOp, KernelError, Token, Value,
};
use capsule_testkit::{TestNetwork, fixtures};

mod helpers;
use helpers::{count, counter_at, deploy_basics, deploy_factory};

/// Writing a field back with its current value is not a state change.
#[test]
fn unchanged_state_records_nothing() {
    let net = TestNetwork::new();
    let rt = net.runtime("alice").unwrap();
    let codes = deploy_basics(&rt);
    let c = counter_at(&rt, &codes, 3);
    let queued = rt.pending_batches().len();

    rt.call(c, "rewrite", vec![]).unwrap();
    assert_eq!(rt.call(c, "get", vec![]).unwrap(), Value::Nat(3));

    assert_eq!(rt.pending_batches().len(), queued);
    assert!(rt.compile_open().unwrap().is_none());
}

/// A caller of a changed capsule is an input and output of the action.
#[test]
fn callers_of_changed_capsules_are_recorded() {
    let net = TestNetwork::new();
    let rt = net.runtime("alice").unwrap();
    let codes = deploy_basics(&rt);
    let c = counter_at(&rt, &codes, 0);
    let h = rt.create(codes.holder, vec![Value::Capsule(c)]).unwrap();

    rt.call(h, "bump", vec![]).unwrap();
    let seq = *rt.pending_batches().last().unwrap();
    let compiled = rt.compile_pending(seq).unwrap();

    assert_eq!(compiled.inputs, 2);
    assert_eq!(compiled.outputs.len(), 2);
    assert!(compiled.refs.is_empty());
    match &compiled.exec[..] {
        [ExecOp::Call { target, method, args }] => {
            assert_eq!(*target, Token::In(0));
            assert_eq!(method, "bump");
            assert!(args.is_empty());
        }
        other => panic!("unexpected exec ops: {other:?}"),
    }
    assert_eq!(count(&rt, c), 1);
}

/// Reading another capsule makes it a reference, not an input.
#[test]
fn reads_become_references() {
    let net = TestNetwork::new();
    let rt = net.runtime("alice").unwrap();
    let codes = deploy_basics(&rt);
    let c = counter_at(&rt, &codes, 4);
    let h = rt.create(codes.holder, vec![Value::Capsule(c)]).unwrap();

    assert_eq!(rt.call(h, "peek", vec![]).unwrap(), Value::Nat(4));
    let seq = *rt.pending_batches().last().unwrap();
    let compiled = rt.compile_pending(seq).unwrap();
    assert_eq!(compiled.inputs, 1);
    assert_eq!(compiled.outputs.len(), 1);
    assert_eq!(compiled.refs.len(), 1);

    // A pure read changes nothing and records nothing.
    let queued = rt.pending_batches().len();
    rt.call(h, "look", vec![]).unwrap();
    assert_eq!(rt.pending_batches().len(), queued);
}

#[test]
fn queries_must_not_change_state() {
    let net = TestNetwork::new();
    let rt = net.runtime("alice").unwrap();
    let codes = deploy_basics(&rt);
    let c = counter_at(&rt, &codes, 2);
    let queued = rt.pending_batches().len();

    let err = rt.query(c, "inc", vec![]).unwrap_err();
    assert!(matches!(err, KernelError::StateChangeNotAllowed(_)), "{err:?}");
    assert_eq!(count(&rt, c), 2);
    assert_eq!(rt.pending_batches().len(), queued);

    assert_eq!(rt.query(c, "get", vec![]).unwrap(), Value::Nat(2));
}

#[tokio::test]
async fn failed_calls_restore_prior_state() {
    let net = TestNetwork::new();
    let rt = net.runtime("alice").unwrap();
    let codes = deploy_basics(&rt);
    let c = counter_at(&rt, &codes, 7);
    rt.sync().await.unwrap();
    let before = rt.view(c).unwrap();
    assert!(before.location.is_final());

    let err = rt.call(c, "fail_after_write", vec![]).unwrap_err();
    assert_eq!(err, KernelError::user("refusing to finish"));
    assert_eq!(count(&rt, c), 7);
    assert!(rt.pending_batches().is_empty());

    let after = rt.view(c).unwrap();
    assert_eq!(after.location, before.location);
    assert_eq!(after.origin, before.origin);
    assert_eq!(after.validity, before.validity);
}

/// An error caught inside a method still aborts the whole call.
#[test]
fn swallowed_errors_abort_the_call() {
    let net = TestNetwork::new();
    let rt = net.runtime("alice").unwrap();
    let codes = deploy_basics(&rt);
    let c = counter_at(&rt, &codes, 1);
    let h = rt.create(codes.holder, vec![Value::Capsule(c)]).unwrap();
    let queued = rt.pending_batches().len();

    let err = rt.call(h, "swallow", vec![]).unwrap_err();
    assert!(matches!(err, KernelError::Invariant(_)), "{err:?}");
    assert_eq!(count(&rt, c), 1);
    assert_eq!(rt.pending_batches().len(), queued);
}

#[test]
fn fields_change_only_through_own_methods() {
    let net = TestNetwork::new();
    let rt = net.runtime("alice").unwrap();
    let codes = deploy_basics(&rt);
    let c = counter_at(&rt, &codes, 1);
    let h = rt.create(codes.holder, vec![Value::Capsule(c)]).unwrap();

    let outside = rt.set(c, "count", Value::Nat(50)).unwrap_err();
    assert!(matches!(outside, KernelError::Capability(_)), "{outside:?}");

    let foreign = rt.call(h, "poke", vec![]).unwrap_err();
    assert!(matches!(foreign, KernelError::Capability(_)), "{foreign:?}");

    let identity = rt.call(h, "overwrite_identity", vec![]).unwrap_err();
    assert!(matches!(identity, KernelError::Capability(_)), "{identity:?}");

    assert_eq!(count(&rt, c), 1);
}

#[test]
fn private_members_are_visible_to_the_same_lineage_only() {
    let net = TestNetwork::new();
    let rt = net.runtime("alice").unwrap();
    let codes = deploy_basics(&rt);
    let special = rt
        .deploy(Deployment::new(fixtures::special_counter()).extends(codes.counter))
        .unwrap();
    let c = counter_at(&rt, &codes, 5);
    let other = counter_at(&rt, &codes, 6);
    let h = rt.create(codes.holder, vec![Value::Capsule(c)]).unwrap();
    let s = rt.create(special, vec![Value::Nat(2)]).unwrap();

    assert!(matches!(rt.get(c, "_secret"), Err(KernelError::Capability(_))));
    assert!(matches!(
        rt.call(c, "_zero", vec![]),
        Err(KernelError::Capability(_))
    ));
    assert!(matches!(
        rt.call(h, "peek_secret", vec![]),
        Err(KernelError::Capability(_))
    ));

    assert_eq!(
        rt.call(c, "reveal", vec![Value::Capsule(other)]).unwrap(),
        Value::Text("hidden".into())
    );
    rt.call(c, "reset", vec![]).unwrap();
    assert_eq!(count(&rt, c), 0);

    assert_eq!(
        rt.call(s, "peek_own_secret", vec![]).unwrap(),
        Value::Text("hidden".into())
    );
    assert_eq!(rt.call(s, "double", vec![]).unwrap(), Value::Nat(4));
}

#[test]
fn init_and_unknown_methods_are_rejected() {
    let net = TestNetwork::new();
    let rt = net.runtime("alice").unwrap();
    let codes = deploy_basics(&rt);
    let c = counter_at(&rt, &codes, 0);

    assert!(matches!(
        rt.call(c, "init", vec![]),
        Err(KernelError::Capability(_))
    ));
    let missing = rt.call(c, "fly", vec![]).unwrap_err();
    assert_eq!(
        missing,
        KernelError::MethodNotFound {
            code: "Counter".into(),
            method: "fly".into(),
        }
    );
}

#[test]
fn identity_is_unavailable_until_published() {
    let net = TestNetwork::new();
    let rt = net.runtime("alice").unwrap();
    let codes = deploy_basics(&rt);
    let c = counter_at(&rt, &codes, 0);

    assert!(matches!(rt.get(c, "identity"), Err(KernelError::Validity(_))));
    assert!(matches!(rt.get(c, "version"), Err(KernelError::Validity(_))));
    assert_eq!(rt.get(c, "owner").unwrap(), Value::Text("alice".into()));
}

#[test]
fn units_are_bounded() {
    let net = TestNetwork::new();
    let rt = net.runtime("alice").unwrap();
    let codes = deploy_basics(&rt);
    let c = counter_at(&rt, &codes, 0);

    let err = rt
        .call(c, "set_units", vec![Value::Nat(DEFAULT_MAX_UNITS + 1)])
        .unwrap_err();
    assert!(matches!(err, KernelError::Validity(_)), "{err:?}");

    rt.call(c, "set_units", vec![Value::Nat(10)]).unwrap();
    assert_eq!(rt.get(c, "units").unwrap(), Value::Nat(10));
}

#[test]
fn explicit_scopes_group_actions_into_one_batch() {
    let net = TestNetwork::new();
    let rt = net.runtime("alice").unwrap();
    let codes = deploy_basics(&rt);
    let c = counter_at(&rt, &codes, 0);
    let h = rt.create(codes.holder, vec![Value::Capsule(c)]).unwrap();
    let queued = rt.pending_batches().len();

    rt.begin();
    rt.call(c, "inc", vec![]).unwrap();
    rt.call(c, "inc", vec![]).unwrap();
    rt.call(h, "bump", vec![]).unwrap();
    assert_eq!(rt.pending_batches().len(), queued);
    assert_eq!(rt.compile_open().unwrap().unwrap().exec.len(), 3);
    let seq = rt.end().unwrap().expect("scope closes a batch");

    let compiled = rt.compile_pending(seq).unwrap();
    assert_eq!(compiled.exec.len(), 3);
    assert_eq!(compiled.inputs, 2);
    assert_eq!(rt.pending_batches().len(), queued + 1);
    assert_eq!(count(&rt, c), 3);
}

#[test]
fn destroyed_capsules_become_deletes() {
    let net = TestNetwork::new();
    let rt = net.runtime("alice").unwrap();
    let codes = deploy_basics(&rt);
    let c = counter_at(&rt, &codes, 0);

    rt.call(c, "burn", vec![]).unwrap();
    let seq = *rt.pending_batches().last().unwrap();
    let compiled = rt.compile_pending(seq).unwrap();
    assert_eq!(compiled.outputs.len(), 0);
    assert_eq!(compiled.deletes.len(), 1);

    assert_eq!(rt.view(c).unwrap().owner, Credential::Destroyed);
    assert!(matches!(
        rt.call(c, "inc", vec![]),
        Err(KernelError::Validity(_))
    ));
}

#[test]
fn capsules_created_inside_methods_inherit_the_owner() {
    let net = TestNetwork::new();
    let rt = net.runtime("alice").unwrap();
    let codes = deploy_basics(&rt);
    let factory = deploy_factory(&rt, codes.counter);
    let f = rt.create(factory, vec![]).unwrap();

    let made = rt
        .call(f, "make", vec![Value::Nat(9)])
        .unwrap()
        .as_capsule()
        .unwrap();
    assert_eq!(count(&rt, made), 9);
    assert_eq!(rt.view(made).unwrap().owner, Credential::address("alice"));
    assert_eq!(rt.view(made).unwrap().code_name, "Counter");

    let seq = *rt.pending_batches().last().unwrap();
    let compiled = rt.compile_pending(seq).unwrap();
    assert_eq!(compiled.inputs, 1);
    assert_eq!(compiled.outputs.len(), 2);
}
