use super::*;
use crate::error::Error;
use crate::test_utils::{settle_of, Rig, Tracker};
use rstest::rstest;
use static_assertions::assert_impl_all;

assert_impl_all!(Writable<Vec<u8>>: Send, Sync, Clone);
assert_impl_all!(Readable<Vec<u8>>: Send, Sync);

#[test]
fn write_then_receive_round_trip() {
    let rig = Rig::new();
    let (writable, readable) = Channel::<u32>::new(&rig.queue, 4).split();

    assert!(writable.write(7).unwrap());
    let out = settle_of(readable.receive()).unwrap();
    assert_eq!(out.0, 7);

    rig.shutdown();
}

#[test]
fn write_hands_off_to_waiting_reader() {
    let rig = Rig::new();
    let (writable, readable) = Channel::<u32>::new(&rig.queue, 4).split();

    // Park the reader first, then write.
    let pending = readable.receive();
    assert_eq!(readable.buffered(), 0);
    assert!(writable.write(42).unwrap());
    assert_eq!(readable.buffered(), 0, "hand-off must bypass the buffer");

    assert_eq!(settle_of(pending).unwrap().0, 42);
    rig.shutdown();
}

#[rstest]
#[case::tight(2, 1)]
#[case::wide(8, 4)]
fn should_write_goes_false_at_high_water(#[case] high: usize, #[case] low: usize) {
    let rig = Rig::new();
    let (writable, readable) = Channel::<u32>::with_watermarks(&rig.queue, high, low).split();

    for i in 0..high {
        assert!(writable.should_write());
        assert!(writable.write(i as u32).unwrap());
    }

    // Buffer is at high-water now: back-pressure, but writes still land.
    assert!(!writable.should_write());
    assert!(!writable.write(99).unwrap());
    assert_eq!(readable.buffered(), high + 1);

    rig.shutdown();
}

#[test]
fn one_shot_resume_notification_fires_exactly_once() {
    let rig = Rig::new();
    let (writable, readable) = Channel::<u32>::with_watermarks(&rig.queue, 2, 1).split();
    let tracker = Tracker::new();

    writable.write(1).unwrap();
    writable.write(2).unwrap();
    assert!(!writable.should_write());

    let t = tracker.clone();
    writable.set_resume_notification(move || t.hit("resume"), true);

    // 2 -> 1 is not yet below the low-water mark of 1.
    settle_of(readable.receive()).unwrap();
    tracker.expect_calls("resume", 0);

    // 1 -> 0 crosses below low-water: fires, once.
    settle_of(readable.receive()).unwrap();
    tracker.expect_calls("resume", 1);

    writable.write(3).unwrap();
    writable.write(4).unwrap();
    settle_of(readable.receive()).unwrap();
    settle_of(readable.receive()).unwrap();
    tracker.expect_calls("resume", 1);

    rig.shutdown();
}

#[test]
fn repeating_resume_notification_fires_on_each_crossing() {
    let rig = Rig::new();
    let (writable, readable) = Channel::<u32>::with_watermarks(&rig.queue, 2, 1).split();
    let tracker = Tracker::new();

    // Register while the buffer sits at the low-water mark, as a paused
    // producer would.
    writable.write(0).unwrap();
    let t = tracker.clone();
    writable.set_resume_notification(move || t.hit("resume"), false);
    tracker.expect_calls("resume", 0);

    settle_of(readable.receive()).unwrap();
    tracker.expect_calls("resume", 1);

    for round in 2..=3 {
        writable.write(1).unwrap();
        settle_of(readable.receive()).unwrap();
        tracker.expect_calls("resume", round);
    }

    writable.unset_resume_notification();
    writable.write(1).unwrap();
    settle_of(readable.receive()).unwrap();
    tracker.expect_calls("resume", 3);

    rig.shutdown();
}

#[test]
fn resume_registration_below_low_water_fires_immediately() {
    let rig = Rig::new();
    let (writable, _readable) = Channel::<u32>::with_watermarks(&rig.queue, 2, 1).split();
    let tracker = Tracker::new();

    // The consumer already drained past the threshold: the crossing this
    // producer is waiting for will never come, so it fires now.
    let t = tracker.clone();
    writable.set_resume_notification(move || t.hit("resume"), true);
    tracker.expect_calls("resume", 1);

    rig.shutdown();
}

#[test]
fn close_drains_buffer_before_reporting_closed() {
    let rig = Rig::new();
    let (writable, readable) = Channel::<u32>::new(&rig.queue, 4).split();

    writable.write(1).unwrap();
    writable.write(2).unwrap();
    writable.close();

    assert!(matches!(writable.write(3), Err(Error::ChannelClosed)));
    assert_eq!(settle_of(readable.receive()).unwrap().0, 1);
    assert_eq!(settle_of(readable.receive()).unwrap().0, 2);

    let rejection = settle_of(readable.receive()).expect_err("buffer is dry");
    assert!(matches!(
        rejection.downcast_ref::<Error>(),
        Some(Error::ChannelClosed)
    ));

    rig.shutdown();
}

#[test]
fn close_with_error_reaches_readers_after_drain() {
    let rig = Rig::new();
    let (writable, readable) = Channel::<u32>::new(&rig.queue, 4).split();

    writable.write(1).unwrap();
    writable.close_with(Error::Canceled);

    assert_eq!(settle_of(readable.receive()).unwrap().0, 1);
    let rejection = settle_of(readable.receive()).expect_err("closed with error");
    assert!(matches!(
        rejection.downcast_ref::<Error>(),
        Some(Error::Canceled)
    ));

    rig.shutdown();
}

#[test]
fn close_rejects_parked_readers() {
    let rig = Rig::new();
    let (writable, readable) = Channel::<u32>::new(&rig.queue, 4).split();

    let pending = readable.receive();
    writable.close();

    let rejection = settle_of(pending).expect_err("parked reader must observe close");
    assert!(matches!(
        rejection.downcast_ref::<Error>(),
        Some(Error::ChannelClosed)
    ));

    rig.shutdown();
}

#[test]
fn dropping_last_writer_closes_cleanly() {
    let rig = Rig::new();
    let (writable, readable) = Channel::<u32>::new(&rig.queue, 4).split();

    let second = writable.clone();
    writable.write(5).unwrap();
    drop(writable);
    assert!(!readable.is_closed(), "one writer still alive");

    drop(second);
    assert!(readable.is_closed());
    assert_eq!(settle_of(readable.receive()).unwrap().0, 5);
    assert!(settle_of(readable.receive()).is_err());

    rig.shutdown();
}

#[test]
fn dropping_reader_fails_subsequent_writes() {
    let rig = Rig::new();
    let (writable, readable) = Channel::<u32>::new(&rig.queue, 4).split();

    drop(readable);
    assert!(matches!(writable.write(1), Err(Error::ChannelClosed)));

    rig.shutdown();
}

#[test]
fn multiple_writers_feed_one_reader() {
    let rig = Rig::new();
    let (writable, readable) = Channel::<u32>::new(&rig.queue, 64).split();

    let writers: Vec<_> = (0..4).map(|_| writable.clone()).collect();
    drop(writable);

    let handles: Vec<_> = writers
        .into_iter()
        .enumerate()
        .map(|(i, w)| {
            std::thread::spawn(move || {
                for j in 0..8 {
                    w.write((i * 8 + j) as u32).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let mut seen = Vec::new();
    for _ in 0..32 {
        seen.push(settle_of(readable.receive()).unwrap().0);
    }
    seen.sort_unstable();
    assert_eq!(seen, (0..32).collect::<Vec<u32>>());

    rig.shutdown();
}
