use super::*;
use crate::error::{set_unhandled_rejection_hook, unset_unhandled_rejection_hook, Error};
use crate::queue::Queue;
use crate::test_utils::{settle_of, Rig, Tracker, SETTLE_TIMEOUT};
use std::sync::mpsc;
use std::time::Duration;
use static_assertions::assert_impl_all;

assert_impl_all!(Promise<(i32, String)>: Send, Sync);
assert_impl_all!(Deferred<(i32,)>: Send);
assert_impl_all!(SharedPromise<(i32,)>: Send, Sync, Clone);

#[test]
fn values_to_value() {
    let rig = Rig::new();
    let tracker = Tracker::new();

    let (t1, t2) = (tracker.clone(), tracker.clone());
    let chain = with(&rig.queue, (17, "hello".to_string()))
        .then(move |i: i32, s: String| -> i64 {
            t1.hit("first");
            ((s.as_bytes()[0] - s.as_bytes()[1]) as i64) * i as i64
        })
        .then(move |value: i64| {
            t2.hit("second");
            assert_eq!(3 * 17, value);
            value
        });

    let out = settle_of(chain).expect("chain rejected");
    assert_eq!(out.0, 51);
    tracker.expect_calls("first", 1);
    tracker.expect_calls("second", 1);

    rig.shutdown();
}

#[test]
fn tuple_to_value() {
    let rig = Rig::new();
    let tracker = Tracker::new();

    let t1 = tracker.clone();
    let chain = with(&rig.queue, (17, "hello".to_string()))
        .then(move |values: (i32, String)| -> i64 {
            t1.hit("first");
            let (i, s) = values;
            ((s.as_bytes()[0] - s.as_bytes()[1]) as i64) * i as i64
        })
        .then(|value: i64| {
            assert_eq!(3 * 17, value);
            value
        });

    let out = settle_of(chain).expect("chain rejected");
    assert_eq!(out.0, 51);
    tracker.expect_calls("first", 1);

    rig.shutdown();
}

#[test]
fn values_to_promise_flattens() {
    let rig = Rig::new();
    let queue = rig.queue.clone();

    let chain = with(&rig.queue, (17, "hello".to_string()))
        .and_then(move |i: i32, s: String| {
            let value = ((s.as_bytes()[0] - s.as_bytes()[1]) as i64) * i as i64;
            with(&queue, (value,))
        })
        .then(|value: i64| {
            assert_eq!(3 * 17, value);
            value
        });

    let out = settle_of(chain).expect("chain rejected");
    assert_eq!(out.0, 51);

    rig.shutdown();
}

#[test]
fn tuple_to_promise_flattens() {
    let rig = Rig::new();
    let queue = rig.queue.clone();

    let chain = with(&rig.queue, (17, "hello".to_string()))
        .and_then(move |values: (i32, String)| {
            let (i, s) = values;
            let value = ((s.as_bytes()[0] - s.as_bytes()[1]) as i64) * i as i64;
            with(&queue, (value,))
        })
        .then(|value: i64| {
            assert_eq!(3 * 17, value);
            value
        });

    let out = settle_of(chain).expect("chain rejected");
    assert_eq!(out.0, 51);

    rig.shutdown();
}

#[test]
fn continuation_is_never_run_synchronously() {
    // A queue no worker services: if `then` invoked inline, the tracker
    // would record the hit before we drain by hand.
    let queue = Queue::new();
    let tracker = Tracker::new();

    let t = tracker.clone();
    let _chain = with(&queue, (1,)).then(move |_: i32| t.hit("ran"));

    tracker.expect_calls("ran", 0);

    queue.drain_one().expect("delivery task not posted").run();
    tracker.expect_calls("ran", 1);
    assert!(queue.drain_one().is_none());
}

#[test]
fn deferred_resolves_waiters_registered_before_and_after() {
    let rig = Rig::new();

    // Waiter attached before resolution.
    let (deferred, promise) = make_promise::<(u32,)>(&rig.queue);
    let (tx, rx) = mpsc::channel();
    promise.then(move |v: u32| tx.send(v).unwrap());
    deferred.resolve((7,));
    assert_eq!(rx.recv_timeout(SETTLE_TIMEOUT).unwrap(), 7);

    // Waiter attached after resolution.
    let (deferred, promise) = make_promise::<(u32,)>(&rig.queue);
    deferred.resolve((9,));
    let (tx, rx) = mpsc::channel();
    promise.then(move |v: u32| tx.send(v).unwrap());
    assert_eq!(rx.recv_timeout(SETTLE_TIMEOUT).unwrap(), 9);

    rig.shutdown();
}

#[test]
fn rejection_skips_value_handlers_until_fail() {
    let rig = Rig::new();
    let tracker = Tracker::new();

    let (skipped, caught) = (tracker.clone(), tracker.clone());
    let chain = rejected::<(i32,)>(&rig.queue, Error::Canceled)
        .then(move |v: i32| {
            skipped.hit("skipped");
            v
        })
        .fail(move |rejection| {
            caught.hit("caught");
            assert!(matches!(
                rejection.downcast_ref::<Error>(),
                Some(Error::Canceled)
            ));
            Ok((-1,))
        });

    let out = settle_of(chain).expect("fail handler should have recovered");
    assert_eq!(out.0, -1);
    tracker.expect_calls("skipped", 0);
    tracker.expect_calls("caught", 1);

    rig.shutdown();
}

#[test]
fn finally_runs_on_both_outcomes_and_forwards() {
    let rig = Rig::new();
    let tracker = Tracker::new();

    let t = tracker.clone();
    let ok = with(&rig.queue, (5,)).finally(move || t.hit("finally"));
    assert_eq!(settle_of(ok).expect("value path").0, 5);

    let t = tracker.clone();
    let err = rejected::<(i32,)>(&rig.queue, Error::Canceled).finally(move || t.hit("finally"));
    assert!(settle_of(err).is_err());

    tracker.expect_calls("finally", 2);
    rig.shutdown();
}

#[test]
fn tap_observes_without_changing_outcome() {
    let rig = Rig::new();
    let tracker = Tracker::new();

    let t = tracker.clone();
    let chain = with(&rig.queue, (11, "x".to_string())).tap(move |values: &(i32, String)| {
        assert_eq!(values.0, 11);
        t.hit("tap");
    });

    let out = settle_of(chain).expect("tap must forward the value");
    assert_eq!(out.0, 11);
    tracker.expect_calls("tap", 1);

    rig.shutdown();
}

#[test]
fn panicking_continuation_rejects_downstream() {
    let rig = Rig::new();

    let chain = with(&rig.queue, (1,)).then(|_: i32| -> i32 { panic!("deliberate") });

    let rejection = settle_of(chain).expect_err("panic must reject");
    match rejection.downcast_ref::<Error>() {
        Some(Error::ContinuationPanicked(msg)) => assert!(msg.contains("deliberate")),
        other => panic!("unexpected rejection: {other:?}"),
    }

    rig.shutdown();
}

#[test]
fn dropping_deferred_breaks_the_promise() {
    let rig = Rig::new();

    let (deferred, promise) = make_promise::<(i32,)>(&rig.queue);
    drop(deferred);

    let rejection = settle_of(promise).expect_err("broken promise expected");
    assert!(matches!(
        rejection.downcast_ref::<Error>(),
        Some(Error::BrokenPromise)
    ));

    rig.shutdown();
}

#[test]
fn then_on_posts_continuation_to_the_other_queue() {
    // `other` is attached to no scheduler, so the continuation can only run
    // if it truly lands there.
    let queue = Queue::new();
    let other = Queue::new();
    let tracker = Tracker::new();

    let t = tracker.clone();
    let _chain = with(&queue, (1,)).then_on(&other, move |_: i32| t.hit("ran"));

    assert!(queue.is_empty(), "continuation must not land on the source queue");
    tracker.expect_calls("ran", 0);

    other.drain_one().expect("continuation not posted").run();
    tracker.expect_calls("ran", 1);
}

#[test]
fn shared_promise_delivers_to_every_subscriber() {
    let rig = Rig::new();

    let (deferred, promise) = make_promise::<(String,)>(&rig.queue);
    let shared = promise.share();

    let early = shared.subscribe();
    deferred.resolve(("value".to_string(),));
    let late = shared.subscribe();

    assert_eq!(settle_of(early).unwrap().0, "value");
    assert_eq!(settle_of(late).unwrap().0, "value");

    rig.shutdown();
}

#[test]
fn unhandled_rejection_reaches_the_sink() {
    let _guard = crate::test_utils::unhandled_hook_guard();
    let rig = Rig::new();

    // Other tests may produce legitimate unhandled rejections concurrently,
    // so only count reports carrying this test's sentinel.
    let (tx, rx) = mpsc::channel();
    set_unhandled_rejection_hook(move |rejection| {
        let text = rejection.to_string();
        if text.contains("sentinel-unhandled") {
            let _ = tx.send(text);
        }
    });

    {
        let (deferred, promise) = make_promise::<(i32,)>(&rig.queue);
        deferred.reject(crate::error::Rejection::msg("sentinel-unhandled"));
        drop(promise);
    }

    rx.recv_timeout(SETTLE_TIMEOUT).expect("no unhandled report");
    assert!(
        rx.recv_timeout(Duration::from_millis(100)).is_err(),
        "reported more than once"
    );

    unset_unhandled_rejection_hook();
    rig.shutdown();
}

#[test]
fn observed_rejection_is_not_reported_unhandled() {
    let _guard = crate::test_utils::unhandled_hook_guard();
    let rig = Rig::new();

    let (tx, rx) = mpsc::channel();
    set_unhandled_rejection_hook(move |rejection| {
        let text = rejection.to_string();
        if text.contains("sentinel-observed") {
            let _ = tx.send(text);
        }
    });

    let chain = rejected::<(i32,)>(&rig.queue, crate::error::Rejection::msg("sentinel-observed"))
        .fail(|_| Ok((0,)));
    assert_eq!(settle_of(chain).unwrap().0, 0);

    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    unset_unhandled_rejection_hook();
    rig.shutdown();
}
