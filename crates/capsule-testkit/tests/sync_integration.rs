use std::sync::Arc;

use capsule_kernel::{KernelError, Value};
use capsule_store::{DynStateStore, FsStateStore};
use capsule_testkit::{MockCodeHost, TestNetwork};

mod helpers;
use helpers::{capsule_field, count, counter_at, deploy_basics, deploy_factory, version_of};

/// A runtime with no local state rebuilds capsules by replaying the ledger.
#[tokio::test]
async fn fresh_runtime_replays_history() {
    let net = TestNetwork::new();
    let alice = net.runtime("alice").unwrap();
    let codes = deploy_basics(&alice);
    let factory = deploy_factory(&alice, codes.counter);
    let c = counter_at(&alice, &codes, 2);
    let h = alice.create(codes.holder, vec![Value::Capsule(c)]).unwrap();
    let f = alice.create(factory, vec![]).unwrap();
    alice.call(f, "make", vec![Value::Nat(4)]).unwrap();
    alice.call(h, "bump", vec![]).unwrap();
    alice.sync().await.unwrap();

    let other = net.runtime("carol").unwrap();
    let h2 = other.load(version_of(&alice, h)).await.unwrap();
    let c2 = capsule_field(&other, h2, "item");
    assert_eq!(count(&other, c2), 3);
    assert_eq!(version_of(&other, c2), version_of(&alice, c));
    assert_eq!(
        other.get(h2, "identity").unwrap(),
        alice.get(h, "identity").unwrap()
    );

    let f2 = other.load(version_of(&alice, f)).await.unwrap();
    let Value::List(made) = other.get(f2, "made").unwrap() else {
        panic!("made is a list");
    };
    let m2 = made[0].as_capsule().unwrap();
    assert_eq!(count(&other, m2), 4);
    assert_eq!(other.view(m2).unwrap().code_name, "Counter");

    // Loading the same version twice yields the same object.
    assert_eq!(other.load(version_of(&alice, c)).await.unwrap(), c2);
}

#[tokio::test]
async fn fast_forward_follows_the_spend_chain() {
    let net = TestNetwork::new();
    let alice = net.runtime("alice").unwrap();
    let codes = deploy_basics(&alice);
    let c = counter_at(&alice, &codes, 1);
    alice.sync().await.unwrap();

    let other = net.runtime("alice").unwrap();
    let c2 = other.load(version_of(&alice, c)).await.unwrap();

    alice.call(c, "inc", vec![]).unwrap();
    alice.call(c, "add", vec![Value::Nat(10)]).unwrap();
    alice.sync().await.unwrap();
    assert_eq!(count(&other, c2), 1);

    other.sync_capsule(c2).await.unwrap();
    assert_eq!(count(&other, c2), 12);
    assert_eq!(version_of(&other, c2), version_of(&alice, c));

    // Caught up; a second pass is a no-op.
    other.sync_capsule(c2).await.unwrap();
    assert_eq!(count(&other, c2), 12);
}

#[tokio::test]
async fn fast_forward_reaches_referenced_capsules() {
    let net = TestNetwork::new();
    let alice = net.runtime("alice").unwrap();
    let codes = deploy_basics(&alice);
    let c = counter_at(&alice, &codes, 0);
    let h = alice.create(codes.holder, vec![Value::Capsule(c)]).unwrap();
    alice.sync().await.unwrap();

    let other = net.runtime("alice").unwrap();
    let h2 = other.load(version_of(&alice, h)).await.unwrap();
    let c2 = capsule_field(&other, h2, "item");

    alice.call(c, "inc", vec![]).unwrap();
    alice.sync().await.unwrap();

    other.sync_capsule(h2).await.unwrap();
    assert_eq!(count(&other, c2), 1);
}

/// Publishing a read of a version someone else already spent must fail.
#[tokio::test]
async fn stale_reads_are_rejected_until_resynced() {
    let net = TestNetwork::new();
    let alice = net.runtime("alice").unwrap();
    let codes = deploy_basics(&alice);
    let c = counter_at(&alice, &codes, 5);
    let h = alice.create(codes.holder, vec![Value::Capsule(c)]).unwrap();
    alice.sync().await.unwrap();

    let other = net.runtime("alice").unwrap();
    let h2 = other.load(version_of(&alice, h)).await.unwrap();
    let c2 = capsule_field(&other, h2, "item");

    alice.call(c, "inc", vec![]).unwrap();
    alice.sync().await.unwrap();

    assert_eq!(other.call(h2, "peek", vec![]).unwrap(), Value::Nat(5));
    let err = other.sync().await.unwrap_err();
    assert!(
        matches!(err.primary(), KernelError::Consistency(_)),
        "{err:?}"
    );
    assert_eq!(other.get(h2, "seen").unwrap(), Value::Null);

    other.sync_capsule(c2).await.unwrap();
    assert_eq!(other.call(h2, "peek", vec![]).unwrap(), Value::Nat(6));
    other.sync().await.unwrap();
}

/// An older handle on a capsule cannot share a batch with the current one,
/// whichever of the two the batch sees first.
#[tokio::test]
async fn stale_handles_cannot_join_a_batch_with_the_current_version() {
    let net = TestNetwork::new();
    let alice = net.runtime("alice").unwrap();
    let codes = deploy_basics(&alice);
    let c = counter_at(&alice, &codes, 0);
    let h = alice.create(codes.holder, vec![Value::Capsule(c)]).unwrap();
    alice.sync().await.unwrap();
    let first = version_of(&alice, c);
    alice.call(c, "inc", vec![]).unwrap();
    alice.sync().await.unwrap();

    let old = alice.load(first).await.unwrap();
    assert_ne!(old, c);
    assert_eq!(count(&alice, old), 0);

    alice.begin();
    alice.call(c, "inc", vec![]).unwrap();
    let err = alice
        .call(h, "swap", vec![Value::Capsule(old)])
        .unwrap_err();
    assert!(matches!(err, KernelError::Consistency(_)), "{err:?}");
    assert_eq!(capsule_field(&alice, h, "item"), c);
    alice.end().unwrap();
    alice.sync().await.unwrap();
    assert_eq!(count(&alice, c), 2);

    alice.begin();
    alice.call(h, "swap", vec![Value::Capsule(old)]).unwrap();
    let err = alice.call(c, "inc", vec![]).unwrap_err();
    assert!(matches!(err, KernelError::Consistency(_)), "{err:?}");
    alice.end().unwrap();
    alice.sync().await.unwrap();
    assert_eq!(count(&alice, c), 2);
}

#[tokio::test]
async fn missing_spend_information_is_a_ledger_error() {
    let net = TestNetwork::new();
    let alice = net.runtime("alice").unwrap();
    let codes = deploy_basics(&alice);
    let c = counter_at(&alice, &codes, 0);
    alice.sync().await.unwrap();

    net.ledger.hide_spends(true);
    let err = alice.sync_capsule(c).await.unwrap_err();
    let KernelError::LedgerApi(message) = err else {
        panic!("expected a ledger error, got {err:?}");
    };
    assert!(message.contains("no spend information"), "{message}");
}

#[tokio::test]
async fn checked_out_capsules_cannot_be_synced() {
    let net = TestNetwork::new();
    let alice = net.runtime("alice").unwrap();
    let codes = deploy_basics(&alice);
    let c = counter_at(&alice, &codes, 0);
    alice.sync().await.unwrap();

    alice.begin();
    alice.call(c, "inc", vec![]).unwrap();
    let err = alice.sync_capsule(c).await.unwrap_err();
    assert!(matches!(err, KernelError::Validity(_)), "{err:?}");
    alice.end().unwrap();
    alice.sync().await.unwrap();
    alice.sync_capsule(c).await.unwrap();
}

/// Stored states let a runtime load without touching the ledger.
#[tokio::test]
async fn stored_states_skip_replay() {
    let dir = tempfile::tempdir().unwrap();
    let net = TestNetwork::new();
    let states = || -> DynStateStore { Arc::new(FsStateStore::open(dir.path()).unwrap()) };

    let alice = net
        .runtime_with(TestNetwork::config("alice"), Some(states()))
        .unwrap();
    let codes = deploy_basics(&alice);
    let c = counter_at(&alice, &codes, 8);
    alice.sync().await.unwrap();

    let other = net
        .runtime_with(TestNetwork::config("alice"), Some(states()))
        .unwrap();
    let fetches = net.ledger.fetch_count();
    let c2 = other.load(version_of(&alice, c)).await.unwrap();
    assert_eq!(net.ledger.fetch_count(), fetches);
    assert_eq!(count(&other, c2), 8);
    assert!(matches!(other.get(c2, "_secret"), Err(KernelError::Capability(_))));
}

#[tokio::test]
async fn loading_needs_the_code_installed() {
    let net = TestNetwork::new();
    let alice = net.runtime("alice").unwrap();
    let codes = deploy_basics(&alice);
    let c = counter_at(&alice, &codes, 0);
    alice.sync().await.unwrap();

    let isolated = TestNetwork {
        ledger: net.ledger.clone(),
        code_host: Arc::new(MockCodeHost::new()),
    };
    let other = isolated.runtime("alice").unwrap();
    let err = other.load(version_of(&alice, c)).await.unwrap_err();
    assert!(matches!(err, KernelError::Validity(_)), "{err:?}");
}

#[tokio::test]
async fn inventory_lists_live_capsules() {
    let net = TestNetwork::new();
    let alice = net.runtime("alice").unwrap();
    let codes = deploy_basics(&alice);
    let first = counter_at(&alice, &codes, 1);
    let second = counter_at(&alice, &codes, 2);
    alice.sync().await.unwrap();

    let mine = alice
        .inventory(&capsule_kernel::Credential::address("alice"))
        .await
        .unwrap();
    assert_eq!(mine.len(), 2);
    assert!(mine.contains(&first) && mine.contains(&second));

    alice.call(first, "burn", vec![]).unwrap();
    alice.sync().await.unwrap();

    let other = net.runtime("alice").unwrap();
    let found = other
        .inventory(&capsule_kernel::Credential::address("alice"))
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(count(&other, found[0]), 2);
}
