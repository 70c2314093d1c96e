//! End-to-end behavior of dynamic and static objects between two peers

use std::time::Duration;

use assert_matches::assert_matches;
use hgx_core::{ApiId, HgxError, TransportError};
use hgx_dynamic::{LifecycleState, NewObject, ObjectKind};
use hgx_testkit::{identities, test_config, MemoryHub};

fn notes() -> ApiId {
    ApiId::from_schema("test.notes")
}

#[tokio::test]
async fn test_updates_extend_chain_with_increasing_indices() {
    let hub = MemoryHub::new();
    let [alice, bob] = identities::<2>();
    let alice = hub.connect(alice, test_config()).unwrap();
    let bob = hub.connect(bob, test_config()).unwrap();
    let a = alice.session().await.unwrap();
    let b = bob.session().await.unwrap();

    let created = a
        .new_object(NewObject::dynamic(notes(), b"v0").with_legroom(2))
        .await
        .unwrap();
    assert_eq!(created.lifecycle, LifecycleState::Live);
    assert_eq!(created.index, Some(0));
    a.share(created.address, bob.address()).await.unwrap();

    for i in 1..=6 {
        let view = a
            .update(created.address, format!("v{i}").into_bytes())
            .await
            .unwrap();
        assert_eq!(view.index, Some(i));
    }

    let frames = hub.stored_frames(&created.address);
    let indices: Vec<u64> = frames.iter().map(|f| f.index).collect();
    assert_eq!(indices, (0..=6).collect::<Vec<_>>());
    for pair in frames.windows(2) {
        assert_eq!(pair[1].previous, pair[0].address());
    }

    bob.handle.quiesce().await.unwrap();
    let seen = b.get(created.address).await.unwrap();
    assert_eq!(seen.payload, b"v6");
    assert_eq!(seen.index, Some(6));
    assert!(!seen.owned);
}

#[tokio::test]
async fn test_legroom_two_rekeys_on_third_update() {
    let hub = MemoryHub::new();
    let [alice, bob] = identities::<2>();
    let alice = hub.connect(alice, test_config()).unwrap();
    let bob = hub.connect(bob, test_config()).unwrap();
    let a = alice.session().await.unwrap();
    let b = bob.session().await.unwrap();

    let object = a
        .new_object(NewObject::dynamic(notes(), b"genesis").with_legroom(2))
        .await
        .unwrap();
    a.share(object.address, bob.address()).await.unwrap();
    for payload in [&b"u1"[..], b"u2", b"u3"] {
        a.update(object.address, payload).await.unwrap();
    }

    let frames = hub.stored_frames(&object.address);
    let carries: Vec<bool> = frames.iter().map(|f| f.keyshare.is_some()).collect();
    assert_eq!(carries, vec![true, false, false, true]);
    let epochs: Vec<u64> = frames.iter().map(|f| f.epoch).collect();
    assert_eq!(epochs, vec![0, 0, 0, 1]);

    bob.handle.quiesce().await.unwrap();
    assert_eq!(b.get(object.address).await.unwrap().payload, b"u3");
}

#[tokio::test]
async fn test_late_subscriber_accepts_rekey_frame() {
    let hub = MemoryHub::new();
    let [alice, bob] = identities::<2>();
    let alice = hub.connect(alice, test_config()).unwrap();
    let bob = hub.connect(bob, test_config()).unwrap();
    let a = alice.session().await.unwrap();
    let b = bob.session().await.unwrap();

    let object = a
        .new_object(NewObject::dynamic(notes(), b"genesis").with_legroom(2))
        .await
        .unwrap();
    a.update(object.address, b"u1").await.unwrap();
    a.update(object.address, b"u2").await.unwrap();
    a.share(object.address, bob.address()).await.unwrap();
    bob.handle.quiesce().await.unwrap();
    assert_eq!(b.get(object.address).await.unwrap().payload, b"u2");

    let rekeyed = a.update(object.address, b"u3").await.unwrap();
    assert_eq!(rekeyed.index, Some(3));
    assert!(hub.stored_frames(&object.address)[3].keyshare.is_some());

    bob.handle.quiesce().await.unwrap();
    let seen = b.get(object.address).await.unwrap();
    assert_eq!(seen.index, Some(3));
    assert_eq!(seen.payload, b"u3");
}

#[tokio::test]
async fn test_revoked_recipient_loses_access_after_keyshare() {
    let hub = MemoryHub::new();
    let [alice, bob, carol] = identities::<3>();
    let alice = hub.connect(alice, test_config()).unwrap();
    let bob = hub.connect(bob, test_config()).unwrap();
    let carol = hub.connect(carol, test_config()).unwrap();
    let a = alice.session().await.unwrap();
    let b = bob.session().await.unwrap();
    let c = carol.session().await.unwrap();

    let object = a
        .new_object(NewObject::dynamic(notes(), b"shared"))
        .await
        .unwrap();
    a.share(object.address, bob.address()).await.unwrap();
    a.share(object.address, carol.address()).await.unwrap();
    a.update(object.address, b"everyone").await.unwrap();

    a.unshare(object.address, carol.address()).await.unwrap();
    a.update(object.address, b"bob only").await.unwrap();

    let frames = hub.stored_frames(&object.address);
    let last = frames.last().unwrap();
    let keyshare = last.keyshare.as_ref().unwrap();
    assert!(keyshare.for_recipient(&bob.address()).is_some());
    assert!(keyshare.for_recipient(&carol.address()).is_none());

    bob.handle.quiesce().await.unwrap();
    carol.handle.quiesce().await.unwrap();
    assert_eq!(b.get(object.address).await.unwrap().payload, b"bob only");
    assert_eq!(c.get(object.address).await.unwrap().payload, b"everyone");

    assert_matches!(
        a.unshare(object.address, carol.address()).await,
        Err(HgxError::NotFound { .. })
    );
}

#[tokio::test]
async fn test_failed_publish_leaves_object_unchanged() {
    let hub = MemoryHub::new();
    let [alice, bob] = identities::<2>();
    let alice = hub.connect(alice, test_config()).unwrap();
    let bob = hub.connect(bob, test_config()).unwrap();
    let a = alice.session().await.unwrap();
    let b = bob.session().await.unwrap();

    let object = a
        .new_object(NewObject::dynamic(notes(), b"before"))
        .await
        .unwrap();
    a.share(object.address, bob.address()).await.unwrap();
    bob.handle.quiesce().await.unwrap();

    hub.fail_next(TransportError::Unreachable {
        reason: "link down".into(),
    });
    let error = a.update(object.address, b"lost").await.unwrap_err();
    assert_matches!(error, HgxError::Transport { .. });
    assert!(error.is_retryable());
    let unchanged = a.get(object.address).await.unwrap();
    assert_eq!(unchanged.payload, b"before");
    assert_eq!(unchanged.index, Some(0));

    let retried = a.update(object.address, b"after").await.unwrap();
    assert_eq!(retried.index, Some(1));
    bob.handle.quiesce().await.unwrap();
    assert_eq!(b.get(object.address).await.unwrap().payload, b"after");
}

#[tokio::test]
async fn test_abandoned_update_is_committed_whole_or_not_at_all() {
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
    bob.handle.quiesce().await.unwrap();

    hub.pause_publishing();
    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        a.update(object.address, b"u1"),
    )
    .await;
    assert!(abandoned.is_err());
    hub.resume_publishing();

    let settled = a.get(object.address).await.unwrap();
    match settled.index {
        Some(1) => assert_eq!(settled.payload, b"u1"),
        Some(0) => assert_eq!(settled.payload, b"u0"),
        other => panic!("unexpected head {other:?}"),
    }
    let stored = hub.stored_frames(&object.address).len() as u64;
    assert_eq!(settled.index, Some(stored - 1));

    let next = a.update(object.address, b"u2").await.unwrap();
    assert_eq!(next.index, settled.index.map(|i| i + 1));
    bob.handle.quiesce().await.unwrap();
    let seen = b.get(object.address).await.unwrap();
    assert_eq!(seen.index, next.index);
    assert_eq!(seen.payload, b"u2");
}

#[tokio::test]
async fn test_freeze_snapshots_current_state() {
    let hub = MemoryHub::new();
    let [alice] = identities::<1>();
    let alice = hub.connect(alice, test_config()).unwrap();
    let a = alice.session().await.unwrap();

    let object = a
        .new_object(NewObject::dynamic(notes(), b"draft"))
        .await
        .unwrap();
    a.update(object.address, b"final").await.unwrap();
    let frozen = a.freeze(object.address).await.unwrap();

    assert_eq!(frozen.kind, ObjectKind::Static);
    assert_eq!(frozen.payload, b"final");
    assert!(frozen.held);
    assert_ne!(frozen.address, object.address);
    assert!(hub.has_static(&frozen.address));
    assert!(hub.is_held(&alice.address(), &frozen.address));

    a.update(object.address, b"revised").await.unwrap();
    assert_eq!(a.get(frozen.address).await.unwrap().payload, b"final");
    assert_matches!(
        a.update(frozen.address, b"nope").await,
        Err(HgxError::NotMutable { .. })
    );
    assert_matches!(
        a.freeze(frozen.address).await,
        Err(HgxError::NotMutable { .. })
    );
}

#[tokio::test]
async fn test_static_object_shared_and_fetched_on_get() {
    let hub = MemoryHub::new();
    let [alice, bob] = identities::<2>();
    let alice = hub.connect(alice, test_config()).unwrap();
    let bob = hub.connect(bob, test_config()).unwrap();
    let a = alice.session().await.unwrap();
    let b = bob.session().await.unwrap();

    let sealed = a
        .new_object(NewObject::sealed(notes(), b"constant"))
        .await
        .unwrap();
    assert_eq!(sealed.kind, ObjectKind::Static);

    // Grant stored while bob is offline; GET fetches it.
    hub.detach(&bob.address());
    a.share(sealed.address, bob.address()).await.unwrap();
    hub.attach(bob.handle.clone());

    let fetched = b.get(sealed.address).await.unwrap();
    assert_eq!(fetched.payload, b"constant");
    assert_eq!(fetched.author, alice.address());
    assert_matches!(
        b.discard(sealed.address).await,
        Err(HgxError::NotMutable { .. })
    );
}

#[tokio::test]
async fn test_delete_twice_reports_object_gone() {
    let hub = MemoryHub::new();
    let [alice, bob] = identities::<2>();
    let alice = hub.connect(alice, test_config()).unwrap();
    let bob = hub.connect(bob, test_config()).unwrap();
    let a = alice.session().await.unwrap();
    let b = bob.session().await.unwrap();

    let object = a
        .new_object(NewObject::dynamic(notes(), b"short lived"))
        .await
        .unwrap();
    a.share(object.address, bob.address()).await.unwrap();
    bob.handle.quiesce().await.unwrap();

    let deleted = a.delete(object.address).await.unwrap();
    assert_eq!(deleted.lifecycle, LifecycleState::Deleted);
    assert!(deleted.payload.is_empty());
    assert_matches!(
        a.delete(object.address).await,
        Err(HgxError::ObjectGone { .. })
    );
    assert_matches!(
        a.update(object.address, b"late").await,
        Err(HgxError::ObjectGone { .. })
    );

    bob.handle.quiesce().await.unwrap();
    assert_matches!(b.get(object.address).await, Err(HgxError::ObjectGone { .. }));
}

#[tokio::test]
async fn test_discard_then_collect() {
    let hub = MemoryHub::new();
    let [alice, bob] = identities::<2>();
    let alice = hub.connect(alice, test_config()).unwrap();
    let bob = hub.connect(bob, test_config()).unwrap();
    let a = alice.session().await.unwrap();
    let b = bob.session().await.unwrap();

    let kept = a
        .new_object(NewObject::dynamic(notes(), b"kept"))
        .await
        .unwrap();
    let dropped = a
        .new_object(NewObject::dynamic(notes(), b"dropped"))
        .await
        .unwrap();
    a.share(kept.address, bob.address()).await.unwrap();
    a.share(dropped.address, bob.address()).await.unwrap();
    bob.handle.quiesce().await.unwrap();

    b.hold(kept.address).await.unwrap();
    b.discard(kept.address).await.unwrap();
    let view = b.discard(dropped.address).await.unwrap();
    assert_eq!(view.lifecycle, LifecycleState::Discarded);
    assert!(!hub.is_subscribed(&bob.address(), &dropped.address));

    assert_eq!(b.collect().await.unwrap(), 1);
    assert_matches!(b.get(dropped.address).await, Err(HgxError::NotFound { .. }));
    assert_eq!(
        b.get(kept.address).await.unwrap().lifecycle,
        LifecycleState::Discarded
    );
}

#[tokio::test]
async fn test_history_bounded_by_legroom() {
    let hub = MemoryHub::new();
    let [alice] = identities::<1>();
    let alice = hub.connect(alice, test_config()).unwrap();
    let a = alice.session().await.unwrap();

    let object = a
        .new_object(NewObject::dynamic(notes(), b"0").with_legroom(2))
        .await
        .unwrap();
    for i in 1..=5u8 {
        a.update(object.address, vec![b'0' + i]).await.unwrap();
    }
    let history = a.history(object.address).await.unwrap();
    let indices: Vec<u64> = history.iter().map(|(i, _)| *i).collect();
    assert_eq!(indices, vec![3, 4, 5]);
    assert_eq!(history.last().unwrap().1, b"5");
}

#[tokio::test]
async fn test_new_object_scope_requirements() {
    let hub = MemoryHub::new();
    let [alice] = identities::<1>();
    let alice = hub.connect(alice, test_config()).unwrap();
    let a = alice.session().await.unwrap();

    assert_matches!(
        a.new_object(NewObject::private(b"secret")).await,
        Err(HgxError::Invalid { .. })
    );
    let mut unnamed = NewObject::dynamic(notes(), b"x");
    unnamed.api_id = None;
    assert_matches!(a.new_object(unnamed).await, Err(HgxError::Invalid { .. }));
    assert_eq!(a.whoami().await.unwrap(), alice.address());
}

#[tokio::test]
async fn test_recipient_delete_keeps_author_copy() {
    let hub = MemoryHub::new();
    let [alice, bob] = identities::<2>();
    let alice = hub.connect(alice, test_config()).unwrap();
    let bob = hub.connect(bob, test_config()).unwrap();
    let a = alice.session().await.unwrap();
    let b = bob.session().await.unwrap();

    let object = a
        .new_object(NewObject::dynamic(notes(), b"shared"))
        .await
        .unwrap();
    a.share(object.address, bob.address()).await.unwrap();
    bob.handle.quiesce().await.unwrap();
    assert!(hub.is_subscribed(&bob.address(), &object.address));

    let deleted = b.delete(object.address).await.unwrap();
    assert_eq!(deleted.lifecycle, LifecycleState::Deleted);
    assert!(!hub.is_subscribed(&bob.address(), &object.address));
    assert_matches!(
        b.delete(object.address).await,
        Err(HgxError::ObjectGone { .. })
    );

    let updated = a.update(object.address, b"still here").await.unwrap();
    assert_eq!(updated.index, Some(1));
    assert_eq!(hub.stored_frames(&object.address).len(), 2);
}
