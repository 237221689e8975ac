use std::sync::Arc;
use std::time::{Duration, Instant};

use spillway::{
    BackendQueue, Channel, ChannelConfig, Clock, DelayedMeta, DelayedQueue, MemLog, Message,
    MessageId, SystemClock,
};

fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

#[test]
fn due_delayed_messages_flow_in_and_counter_converges() {
    let log: Arc<MemLog> = MemLog::new();
    let dq = Arc::new(DelayedQueue::new());
    let config = ChannelConfig {
        msg_timeout: Duration::from_secs(5),
        scan_interval: Duration::from_millis(20),
        ..Default::default()
    };
    let channel = Channel::open("orders", "ch", config, log.clone(), Some(dq.clone()));

    let now_ns = SystemClock.now_ns();
    for i in 0..20u64 {
        let mut msg = Message::new(MessageId::default(), format!("d{i}").into_bytes());
        msg.delayed = Some(DelayedMeta {
            channel: "ch".to_string(),
            due_ns: now_ns + i * 2_000_000,
            orig_id: MessageId(i + 1),
            orig_offset: 0,
        });
        dq.put_delay_message(msg).expect("park");
    }
    assert_eq!(channel.delayed_consumed_state().0, 20);

    let rx = channel.message_receiver();
    for _ in 0..20 {
        let msg = rx.recv_timeout(Duration::from_secs(10)).expect("receive");
        assert!(msg.delayed.is_some());
        channel
            .start_in_flight_timeout(msg.clone(), 0, "", config.msg_timeout)
            .expect("start in-flight");
        assert!(channel.deferred_from_delay() >= 1);
        channel.finish_message(0, "", msg.id).expect("finish");
        assert!(channel.deferred_from_delay() >= 0);
    }

    assert!(
        wait_until(Duration::from_secs(5), || channel.delayed_consumed_state()
            == (0, 0)),
        "deferred counter never converged: {:?}",
        channel.delayed_consumed_state()
    );
    assert_eq!(channel.depth(), 0);
}

#[test]
fn requeue_with_delay_diverts_and_redelivers() {
    let log: Arc<MemLog> = MemLog::new();
    let dq = Arc::new(DelayedQueue::new());
    let config = ChannelConfig {
        msg_timeout: Duration::from_secs(5),
        scan_interval: Duration::from_millis(20),
        ..Default::default()
    };
    let channel = Channel::open("orders", "ch", config, log.clone(), Some(dq.clone()));
    log.put_message(Message::new(MessageId::default(), b"retry-me".to_vec()))
        .expect("put");

    let rx = channel.message_receiver();
    let msg = rx.recv_timeout(Duration::from_secs(10)).expect("receive");
    let orig_id = msg.id;
    channel
        .start_in_flight_timeout(msg, 0, "", config.msg_timeout)
        .expect("start in-flight");
    channel
        .requeue_message(0, "", orig_id, Duration::from_millis(50), false)
        .expect("requeue with delay");

    // The origin range is confirmed at divert time; the obligation now
    // lives in the delayed store.
    assert!(wait_until(Duration::from_secs(2), || channel.depth() == 0));
    assert_eq!(channel.in_flight_sizes(), (0, 0));

    let again = rx.recv_timeout(Duration::from_secs(10)).expect("redeliver");
    assert_eq!(again.body, b"retry-me");
    assert_eq!(again.attempts, 1);
    let meta = again.delayed.clone().expect("delayed metadata");
    assert_eq!(meta.orig_id, orig_id);
    assert_eq!(channel.deferred_from_delay(), 1);

    channel
        .start_in_flight_timeout(again.clone(), 0, "", config.msg_timeout)
        .expect("start in-flight");
    channel.finish_message(0, "", again.id).expect("finish");
    assert!(wait_until(Duration::from_secs(2), || channel
        .delayed_consumed_state()
        == (0, 0)));
    assert_eq!(channel.depth(), 0);
}

#[test]
fn deferred_counter_survives_concurrent_skip_to_end() {
    let log: Arc<MemLog> = MemLog::new();
    let dq = Arc::new(DelayedQueue::new());
    let config = ChannelConfig {
        msg_timeout: Duration::from_millis(200),
        scan_interval: Duration::from_millis(10),
        ..Default::default()
    };
    let channel = Arc::new(Channel::open(
        "orders",
        "ch",
        config,
        log.clone(),
        Some(dq.clone()),
    ));

    let now_ns = SystemClock.now_ns();
    for i in 0..100u64 {
        let mut msg = Message::new(MessageId::default(), b"test".to_vec());
        msg.delayed = Some(DelayedMeta {
            channel: "ch".to_string(),
            due_ns: now_ns + i * 1_000_000,
            orig_id: MessageId(i + 1),
            orig_offset: 0,
        });
        dq.put_delay_message(msg).expect("park");
    }

    let rx = channel.message_receiver();
    let worker = {
        let channel = Arc::clone(&channel);
        std::thread::spawn(move || {
            while let Ok(msg) = rx.recv_timeout(Duration::from_millis(500)) {
                let _ = channel.start_in_flight_timeout(msg.clone(), 0, "", Duration::from_secs(1));
                let _ = channel.finish_message_force(0, "", msg.id);
                std::thread::sleep(Duration::from_millis(1));
            }
        })
    };

    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        assert!(channel.deferred_from_delay() >= 0);
        let _ = channel.skip_to_end();
        let (pending, deferred) = channel.delayed_consumed_state();
        if pending == 0 && deferred == 0 && channel.depth() == 0 {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "delayed state never converged: {:?}",
            channel.delayed_consumed_state()
        );
        std::thread::sleep(Duration::from_millis(10));
    }
    worker.join().expect("worker");
    assert_eq!(channel.deferred_from_delay(), 0);
}
