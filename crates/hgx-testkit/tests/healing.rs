//! Gap buffering, retransmission and desynchronization

use std::time::Duration;

use assert_matches::assert_matches;
use hgx_core::{ApiId, HgxError};
use hgx_dynamic::{EventKind, NewObject, RegistrationKey};
use hgx_testkit::{identities, test_config, MemoryHub, Recorder};

fn notes() -> ApiId {
    ApiId::from_schema("test.notes")
}

#[tokio::test]
async fn test_out_of_order_frames_apply_in_order() {
    let hub = MemoryHub::new();
    let [alice, bob] = identities::<2>();
    let mut patient = test_config();
    patient.healing.retry_interval_ms = 60_000;
    let alice = hub.connect(alice, test_config()).unwrap();
    let bob = hub.connect(bob, patient).unwrap();
    let a = alice.session().await.unwrap();
    let b = bob.session().await.unwrap();

    let object = a
        .new_object(NewObject::dynamic(notes(), b"u0"))
        .await
        .unwrap();
    a.share(object.address, bob.address()).await.unwrap();
    bob.handle.quiesce().await.unwrap();

    let recorder = Recorder::new();
    b.append_callback(
        RegistrationKey::Object(object.address),
        recorder.non_blocking("bob"),
    )
    .await
    .unwrap();

    hub.refuse_retransmission(true);
    hub.withhold(object.address, 2);
    for payload in [&b"u1"[..], b"u2", b"u3"] {
        a.update(object.address, payload).await.unwrap();
    }
    bob.handle.quiesce().await.unwrap();

    let stalled = b.get(object.address).await.unwrap();
    assert_eq!(stalled.index, Some(1));
    assert_eq!(recorder.payloads(), vec![b"u1".to_vec()]);

    assert_eq!(hub.release(&object.address), 1);
    assert_eq!(b.await_healed(object.address).await.unwrap(), 3);
    bob.handle.quiesce().await.unwrap();

    assert_eq!(
        recorder.payloads(),
        vec![b"u1".to_vec(), b"u2".to_vec(), b"u3".to_vec()]
    );
    assert_eq!(b.get(object.address).await.unwrap().payload, b"u3");
}

#[tokio::test]
async fn test_gap_healed_by_retransmission() {
    let hub = MemoryHub::new();
    let [alice, bob] = identities::<2>();
    let alice = hub.connect(alice, test_config()).unwrap();
    let bob = hub.connect(bob, test_config()).unwrap();
    let a = alice.session().await.unwrap();
    let b = bob.session().await.unwrap();

    let object = a
        .new_object(NewObject::dynamic(notes(), b"u0"))
        .await
        .unwrap();
    a.share(object.address, bob.address()).await.unwrap();

    hub.withhold(object.address, 1);
    hub.withhold(object.address, 2);
    for payload in [&b"u1"[..], b"u2", b"u3", b"u4"] {
        a.update(object.address, payload).await.unwrap();
    }

    let head = tokio::time::timeout(Duration::from_secs(5), b.await_healed(object.address))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(head, 4);
    assert!(hub.stats().retransmission_requests >= 1);
    assert_eq!(b.get(object.address).await.unwrap().payload, b"u4");
}

#[tokio::test]
async fn test_unhealed_gap_desynchronizes_object() {
    let hub = MemoryHub::new();
    let [alice, bob] = identities::<2>();
    let mut impatient = test_config();
    impatient.healing.retry_interval_ms = 10;
    impatient.healing.retry_budget = 2;
    let alice = hub.connect(alice, test_config()).unwrap();
    let bob = hub.connect(bob, impatient).unwrap();
    let a = alice.session().await.unwrap();
    let b = bob.session().await.unwrap();

    let object = a
        .new_object(NewObject::dynamic(notes(), b"u0"))
        .await
        .unwrap();
    a.share(object.address, bob.address()).await.unwrap();
    bob.handle.quiesce().await.unwrap();

    let recorder = Recorder::new();
    b.append_callback(
        RegistrationKey::Object(object.address),
        recorder.non_blocking("bob"),
    )
    .await
    .unwrap();

    hub.refuse_retransmission(true);
    hub.withhold(object.address, 1);
    a.update(object.address, b"u1").await.unwrap();
    a.update(object.address, b"u2").await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), b.await_healed(object.address))
        .await
        .unwrap();
    assert_matches!(outcome, Err(HgxError::ChainDesynchronized { attempts: 2, .. }));
    bob.handle.quiesce().await.unwrap();

    let view = b.get(object.address).await.unwrap();
    assert!(view.desynchronized);
    assert_eq!(view.payload, b"u0");
    let kinds: Vec<EventKind> = recorder.entries().into_iter().map(|r| r.kind).collect();
    assert_eq!(kinds, vec![EventKind::Desynchronized]);
    assert!(hub.stats().retransmission_requests >= 2);
}

#[tokio::test]
async fn test_duplicate_frames_are_ignored() {
    let hub = MemoryHub::new();
    let [alice, bob] = identities::<2>();
    let alice = hub.connect(alice, test_config()).unwrap();
    let bob = hub.connect(bob, test_config()).unwrap();
    let a = alice.session().await.unwrap();
    let b = bob.session().await.unwrap();

    let object = a
        .new_object(NewObject::dynamic(notes(), b"u0"))
        .await
        .unwrap();
    a.share(object.address, bob.address()).await.unwrap();
    a.update(object.address, b"u1").await.unwrap();
    bob.handle.quiesce().await.unwrap();

    let recorder = Recorder::new();
    b.append_callback(
        RegistrationKey::Object(object.address),
        recorder.non_blocking("bob"),
    )
    .await
    .unwrap();

    for frame in hub.stored_frames(&object.address) {
        hub.inject(&bob.address(), frame);
    }
    bob.handle.quiesce().await.unwrap();

    assert!(recorder.is_empty());
    assert_eq!(b.get(object.address).await.unwrap().index, Some(1));
}
