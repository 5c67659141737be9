//! In-process integration tests: every registry maps its own view of the
//! shared object, so several registries in one process behave like several
//! processes for everything but pid-based bookkeeping.

use basalt_bus::{
    BusError, BusOptions, Lifetime, Liveness, Message, Mode, PollOutcome, StartPosition,
    TopicRegistry, header_len,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

const SHORT: Duration = Duration::from_millis(50);

fn options() -> BusOptions {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    let ns = format!(
        "basalt-it-{}-{}",
        std::process::id(),
        NEXT.fetch_add(1, Ordering::Relaxed)
    );
    BusOptions::default().namespace(ns).capacity(header_len() + 4096)
}

fn payloads(outcome: PollOutcome) -> Vec<Vec<u8>> {
    match outcome {
        PollOutcome::Messages(msgs) => msgs.into_iter().map(|m| m.payload).collect(),
        other => panic!("expected messages, got {other:?}"),
    }
}

#[test]
fn replay_and_latest_subscribers_see_the_right_messages() {
    let registry = TopicRegistry::new(options());

    registry.publish("events", b"a").unwrap();
    let mut replay = registry.subscribe("events", StartPosition::Sequence(0)).unwrap();
    registry.publish("events", b"bb").unwrap();
    registry.publish("events", b"ccc").unwrap();

    let got = payloads(replay.poll(SHORT).unwrap());
    assert_eq!(got, vec![b"a".to_vec(), b"bb".to_vec(), b"ccc".to_vec()]);

    let mut latest = registry.subscribe("events", StartPosition::Latest).unwrap();
    assert_eq!(latest.poll(SHORT).unwrap(), PollOutcome::TimedOut);

    registry.publish("events", b"dddd").unwrap();
    assert_eq!(payloads(latest.poll(SHORT).unwrap()), vec![b"dddd".to_vec()]);
    assert_eq!(payloads(replay.poll(SHORT).unwrap()), vec![b"dddd".to_vec()]);
}

#[test]
fn subscriber_observes_every_message_in_order() {
    let registry = TopicRegistry::new(options());
    let mut publisher = registry.publisher("ordered").unwrap();
    let mut subscriber = registry.subscribe("ordered", StartPosition::Latest).unwrap();

    for i in 0..50u64 {
        assert_eq!(publisher.publish(&i.to_le_bytes()).unwrap(), i);
    }

    let mut seen: Vec<Message> = Vec::new();
    while seen.len() < 50 {
        match subscriber.poll(SHORT).unwrap() {
            PollOutcome::Messages(msgs) => seen.extend(msgs),
            other => panic!("unexpected {other:?}"),
        }
    }
    for (i, msg) in seen.iter().enumerate() {
        assert_eq!(msg.seq, i as u64);
        assert_eq!(msg.payload, (i as u64).to_le_bytes());
    }
    assert_eq!(subscriber.overruns(), 0);
}

#[test]
fn wrapping_past_a_slow_subscriber_reports_a_gap_then_intact_payloads() {
    let registry = TopicRegistry::new(options());
    let mut publisher = registry.publisher("lossy").unwrap();
    let mut subscriber = registry.subscribe("lossy", StartPosition::Latest).unwrap();

    for i in 0..500u64 {
        publisher.publish(&[i as u8; 40]).unwrap();
    }

    let (missed, resync) = match subscriber.poll(SHORT).unwrap() {
        PollOutcome::Gap { missed, resync } => (missed, resync),
        other => panic!("expected a gap, got {other:?}"),
    };
    assert_eq!(missed, resync);
    assert_eq!(subscriber.overruns(), missed);

    let msgs = match subscriber.poll(SHORT).unwrap() {
        PollOutcome::Messages(msgs) => msgs,
        other => panic!("expected messages, got {other:?}"),
    };
    assert_eq!(msgs[0].seq, resync);
    assert_eq!(msgs.last().unwrap().seq, 499);
    for msg in &msgs {
        assert_eq!(msg.payload, vec![msg.seq as u8; 40]);
    }
}

#[test]
fn payload_at_usable_capacity_fits_and_one_byte_more_does_not() {
    let registry = TopicRegistry::new(options());
    let mut publisher = registry.publisher("big").unwrap();
    let max = publisher.max_payload();
    assert_eq!(max, 4096 - basalt_bus::FRAME_HEADER_LEN);

    publisher.publish(&vec![1u8; max]).unwrap();
    match publisher.publish(&vec![1u8; max + 1]) {
        Err(BusError::BufferTooSmall { len, max: m }) => {
            assert_eq!(len, max + 1);
            assert_eq!(m, max);
        }
        other => panic!("expected BufferTooSmall, got {other:?}"),
    }
}

#[test]
fn idle_poll_times_out_after_the_requested_duration() {
    let registry = TopicRegistry::new(options());
    let _publisher = registry.publisher("idle").unwrap();
    let mut subscriber = registry.subscribe("idle", StartPosition::Latest).unwrap();

    let started = Instant::now();
    assert_eq!(subscriber.poll(Duration::from_millis(150)).unwrap(), PollOutcome::TimedOut);
    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(150), "returned after {waited:?}");
    assert!(waited < Duration::from_secs(2), "returned after {waited:?}");
}

#[test]
fn blocked_poll_wakes_on_publish_from_another_thread() {
    let registry = Arc::new(TopicRegistry::new(options()));
    let _topic = registry.resolve("wake", Mode::Publish).unwrap();
    let mut subscriber = registry.subscribe("wake", StartPosition::Latest).unwrap();

    let publisher_registry = Arc::clone(&registry);
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        publisher_registry.publish("wake", b"ping").unwrap();
    });

    let started = Instant::now();
    let got = payloads(subscriber.poll(Duration::from_secs(5)).unwrap());
    assert_eq!(got, vec![b"ping".to_vec()]);
    assert!(started.elapsed() < Duration::from_secs(5));
    handle.join().unwrap();
}

#[test]
fn cancel_handle_interrupts_a_blocked_poll() {
    let registry = TopicRegistry::new(options());
    let _publisher = registry.publisher("cancel").unwrap();
    let mut subscriber = registry.subscribe("cancel", StartPosition::Latest).unwrap();
    let cancel = subscriber.cancel_handle();

    let handle = thread::spawn(move || {
        let started = Instant::now();
        let outcome = subscriber.poll(Duration::from_secs(10)).unwrap();
        (outcome, started.elapsed(), subscriber)
    });
    thread::sleep(Duration::from_millis(50));
    cancel.cancel();

    let (outcome, waited, mut subscriber) = handle.join().unwrap();
    assert_eq!(outcome, PollOutcome::Cancelled);
    assert!(waited < Duration::from_secs(5));
    assert!(cancel.is_cancelled());
    assert_eq!(subscriber.poll(SHORT).unwrap(), PollOutcome::Cancelled);
}

#[test]
fn subscribing_to_an_unknown_topic_fails_unless_auto_create_is_on() {
    let registry = TopicRegistry::new(options());
    match registry.subscribe("nobody", StartPosition::Latest) {
        Err(BusError::TopicNotFound { topic }) => assert_eq!(topic, "nobody"),
        other => panic!("expected TopicNotFound, got {other:?}"),
    }

    let auto = TopicRegistry::new(options().auto_create_on_subscribe(true));
    let subscriber = auto.subscribe("somebody", StartPosition::Latest).unwrap();
    assert!(subscriber.topic().created_here());
}

#[test]
fn publishing_with_a_different_capacity_is_a_mismatch() {
    let opts = options();
    let first = TopicRegistry::new(opts.clone());
    let _p = first.publisher("sized").unwrap();

    let second = TopicRegistry::new(opts.capacity(header_len() + 8192).exclusive_publisher(false));
    match second.publisher("sized") {
        Err(BusError::CapacityMismatch { requested, actual, .. }) => {
            assert_eq!(requested, (header_len() + 8192) as u64);
            assert_eq!(actual, (header_len() + 4096) as u64);
        }
        other => panic!("expected CapacityMismatch, got {other:?}"),
    }
    // subscribers take whatever capacity the region has
    second.subscribe("sized", StartPosition::Latest).unwrap();
}

#[test]
fn invalid_names_and_capacities_are_rejected() {
    let registry = TopicRegistry::new(options());
    assert!(matches!(
        registry.publisher(""),
        Err(BusError::InvalidTopic { .. })
    ));
    let odd = TopicRegistry::new(options().capacity(header_len() + 17));
    assert!(matches!(
        odd.publisher("odd"),
        Err(BusError::InvalidCapacity { .. })
    ));
}

#[test]
fn concurrent_creators_converge_on_one_region() {
    const CREATORS: usize = 8;
    let opts = options();
    let barrier = Arc::new(Barrier::new(CREATORS));

    let handles: Vec<_> = (0..CREATORS)
        .map(|_| {
            let opts = opts.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let registry = TopicRegistry::new(opts);
                barrier.wait();
                let topic = registry.resolve("race", Mode::Publish).unwrap();
                barrier.wait();
                let result = (topic.created_here(), topic.capacity(), topic.refcount());
                barrier.wait();
                result
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(results.iter().filter(|(created, _, _)| *created).count(), 1);
    assert!(results.iter().all(|(_, cap, _)| *cap == opts.capacity));
    assert!(results.iter().all(|(_, _, refs)| *refs == CREATORS as u32));
}

#[test]
fn lock_holder_dying_is_recovered_by_the_next_publisher() {
    let registry = TopicRegistry::new(options());
    let mut publisher = registry.publisher("crash").unwrap();
    let mut subscriber = registry.subscribe("crash", StartPosition::Latest).unwrap();
    publisher.publish(b"before").unwrap();

    let topic = Arc::clone(publisher.topic());
    thread::spawn(move || {
        let guard = topic.acquire_writer().unwrap();
        // the owning thread exits with the robust mutex held
        std::mem::forget(guard);
    })
    .join()
    .unwrap();

    assert_eq!(publisher.publish(b"after").unwrap(), 1);
    assert_eq!(publisher.topic().recoveries(), 1);
    assert_eq!(
        payloads(subscriber.poll(SHORT).unwrap()),
        vec![b"before".to_vec(), b"after".to_vec()]
    );
}

#[test]
fn last_detach_removes_the_topic_by_default() {
    let opts = options();
    let registry = TopicRegistry::new(opts.clone());
    {
        let mut publisher = registry.publisher("fleeting").unwrap();
        publisher.publish(b"x").unwrap();
    }
    let other = TopicRegistry::new(opts);
    assert!(matches!(
        other.subscribe("fleeting", StartPosition::Oldest),
        Err(BusError::TopicNotFound { .. })
    ));
}

#[test]
fn persistent_topics_outlive_their_handles_until_removed() {
    let opts = options().lifetime(Lifetime::Persistent);
    {
        let registry = TopicRegistry::new(opts.clone());
        registry.publish("kept", b"one").unwrap();
        registry.publish("kept", b"two").unwrap();
    }

    let registry = TopicRegistry::new(opts);
    let mut subscriber = registry.subscribe("kept", StartPosition::Oldest).unwrap();
    assert_eq!(
        payloads(subscriber.poll(SHORT).unwrap()),
        vec![b"one".to_vec(), b"two".to_vec()]
    );

    assert!(registry.remove("kept").unwrap());
    assert!(subscriber.topic().is_retired());
    assert!(!registry.remove("kept").unwrap());
    drop(subscriber);
    assert!(matches!(
        registry.subscribe("kept", StartPosition::Latest),
        Err(BusError::TopicNotFound { .. })
    ));
}

#[test]
fn exclusive_publisher_liveness_and_claims() {
    let registry = TopicRegistry::new(options());
    let subscriber = {
        let publisher = registry.publisher("claimed").unwrap();
        let second = registry.publisher("claimed").unwrap();
        let subscriber = registry.subscribe("claimed", StartPosition::Latest).unwrap();
        assert_eq!(
            subscriber.publisher_liveness(),
            Liveness::Alive { pid: std::process::id() }
        );
        drop(second);
        assert!(matches!(subscriber.publisher_liveness(), Liveness::Alive { .. }));
        drop(publisher);
        subscriber
    };
    assert_eq!(subscriber.publisher_liveness(), Liveness::NoPublisher);
    assert!(subscriber.last_publish().is_none());
}

#[test]
fn shared_publishers_are_serialized() {
    let opts = options().exclusive_publisher(false);
    let keeper = TopicRegistry::new(opts.clone());
    let _topic = keeper.resolve("shared", Mode::Publish).unwrap();
    let writers: Vec<_> = (0..4)
        .map(|w| {
            let opts = opts.clone();
            thread::spawn(move || {
                let registry = TopicRegistry::new(opts);
                let mut publisher = registry.publisher("shared").unwrap();
                (0..25).map(|_| publisher.publish(&[w]).unwrap()).collect::<Vec<_>>()
            })
        })
        .collect();
    let mut seqs: Vec<u64> = writers.into_iter().flat_map(|h| h.join().unwrap()).collect();
    seqs.sort_unstable();
    assert_eq!(seqs, (0..100).collect::<Vec<_>>());
}

#[test]
fn unbounded_poll_returns_available_data_and_waits_for_more() {
    let registry = Arc::new(TopicRegistry::new(options()));
    registry.publish("forever", b"x").unwrap();
    let mut subscriber = registry.subscribe("forever", StartPosition::Oldest).unwrap();
    assert_eq!(payloads(subscriber.poll(Duration::MAX).unwrap()), vec![b"x".to_vec()]);

    let late = {
        let registry = Arc::clone(&registry);
        thread::spawn(move || {
            thread::sleep(SHORT);
            registry.publish("forever", b"y").unwrap()
        })
    };
    assert_eq!(payloads(subscriber.poll(Duration::MAX).unwrap()), vec![b"y".to_vec()]);
    assert_eq!(late.join().unwrap(), 1);
}

#[test]
fn close_detaches_while_a_cancel_handle_is_alive() {
    let opts = options();
    let registry = TopicRegistry::new(opts.clone());
    let publisher = registry.publisher("closing").unwrap();
    let other = TopicRegistry::new(opts);
    let subscriber = other.subscribe("closing", StartPosition::Latest).unwrap();
    let cancel = subscriber.cancel_handle();
    assert_eq!(publisher.topic().refcount(), 2);

    subscriber.close();
    assert_eq!(publisher.topic().refcount(), 1);
    cancel.cancel();
    assert!(cancel.is_cancelled());
}

#[test]
fn spawned_subscription_delivers_in_order_and_hands_back_the_subscriber() {
    let registry = TopicRegistry::new(options());
    let mut publisher = registry.publisher("callback").unwrap();
    let subscriber = registry.subscribe("callback", StartPosition::Latest).unwrap();
    let (tx, rx) = std::sync::mpsc::channel();
    let subscription = subscriber
        .spawn(move |outcome| {
            let _ = tx.send(outcome);
        })
        .unwrap();

    for i in 0..3u8 {
        publisher.publish(&[i]).unwrap();
    }
    let mut got = Vec::new();
    while got.len() < 3 {
        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            PollOutcome::Messages(msgs) => got.extend(msgs.into_iter().map(|m| m.payload)),
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(got, vec![vec![0], vec![1], vec![2]]);
    assert!(!subscription.is_finished());

    let started = Instant::now();
    let mut subscriber = subscription.stop().unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(subscriber.position(), 3);
    publisher.publish(b"after").unwrap();
    assert_eq!(payloads(subscriber.poll(SHORT).unwrap()), vec![b"after".to_vec()]);
}

#[test]
fn dropping_a_subscription_joins_its_thread_and_detaches() {
    let opts = options();
    let registry = TopicRegistry::new(opts.clone());
    let mut publisher = registry.publisher("dropped").unwrap();
    let other = TopicRegistry::new(opts);
    let delivered = Arc::new(AtomicUsize::new(0));
    let subscription = {
        let delivered = Arc::clone(&delivered);
        other
            .subscribe("dropped", StartPosition::Latest)
            .unwrap()
            .spawn(move |_| {
                delivered.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap()
    };
    assert_eq!(publisher.topic().refcount(), 2);

    publisher.publish(b"x").unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while delivered.load(Ordering::Relaxed) == 0 {
        assert!(Instant::now() < deadline, "callback never ran");
        thread::sleep(Duration::from_millis(1));
    }

    let started = Instant::now();
    drop(subscription);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(publisher.topic().refcount(), 1);
}

#[test]
fn publishing_to_one_topic_does_not_wait_on_another() {
    let registry = Arc::new(TopicRegistry::new(options()));
    registry.publish("slow", b"0").unwrap();
    registry.publish("fast", b"0").unwrap();

    let slow = registry.resolve("slow", Mode::Publish).unwrap();
    let guard = slow.acquire_writer().unwrap();
    let blocked = {
        let registry = Arc::clone(&registry);
        thread::spawn(move || registry.publish("slow", b"1").unwrap())
    };
    thread::sleep(SHORT);

    assert_eq!(registry.publish("fast", b"1").unwrap(), 1);
    assert!(!blocked.is_finished());
    drop(guard);
    assert_eq!(blocked.join().unwrap(), 1);
}
