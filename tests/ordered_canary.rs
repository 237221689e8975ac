use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use spillway::{
    BackendQueue, Channel, ChannelConfig, ClientStats, Consumer, Error, ExtHeader, MemLog,
    Message, MessageId,
};

#[derive(Default)]
struct FakeConsumer {
    id: i64,
    timeouts: AtomicU64,
    skips: AtomicU64,
}

impl Consumer for FakeConsumer {
    fn get_id(&self) -> i64 {
        self.id
    }
    fn pause(&self) {}
    fn unpause(&self) {}
    fn timed_out_message(&self) {
        self.timeouts.fetch_add(1, Ordering::AcqRel);
    }
    fn requeued_message(&self) {}
    fn finished_message(&self) {}
    fn empty(&self) {}
    fn exit(&self) {}
    fn skip_canary(&self) {
        self.skips.fetch_add(1, Ordering::AcqRel);
    }
    fn unskip_canary(&self) {}
    fn stats(&self) -> ClientStats {
        ClientStats {
            client_id: self.id,
            ..Default::default()
        }
    }
    fn label(&self) -> String {
        format!("fake-{}", self.id)
    }
}

fn put(log: &MemLog, body: &str) {
    log.put_message(Message::new(MessageId::default(), body.as_bytes().to_vec()))
        .expect("put");
}

fn put_canary(log: &MemLog) {
    // The canary marker travels in the JSON ext header, exactly as the
    // wire encodes it.
    let ext = ExtHeader::from_bytes(br#"{"canary":true}"#).expect("ext");
    log.put_message(Message::with_ext(
        MessageId::default(),
        b"canary".to_vec(),
        ext,
    ))
    .expect("put canary");
}

#[test]
fn skip_policy_mid_stream_unblocks_ordered_consumption() {
    let log: Arc<MemLog> = MemLog::new();
    let config = ChannelConfig {
        msg_timeout: Duration::from_millis(300),
        scan_interval: Duration::from_millis(20),
        allow_canary_skip: true,
        ..Default::default()
    };
    let channel = Channel::open("ordered-topic", "order_channel", config, log.clone(), None);
    channel.set_ordered(true).expect("set ordered");
    let consumer = Arc::new(FakeConsumer::default());
    channel.add_client(consumer.clone()).expect("add client");

    for i in 0..3 {
        put(&log, &i.to_string());
    }
    for _ in 0..3 {
        put_canary(&log);
    }
    for i in 11..14 {
        put(&log, &i.to_string());
    }

    let rx = channel.message_receiver();
    for _ in 0..3 {
        let msg = rx.recv_timeout(Duration::from_secs(10)).expect("receive");
        assert!(!msg.is_canary());
        channel
            .start_in_flight_timeout(msg.clone(), 0, "", config.msg_timeout)
            .expect("start in-flight");
        channel.finish_message_force(0, "", msg.id).expect("finish");
        channel.continue_consume_for_order();
    }

    // The first canary is delivered (policy still off) and left to time
    // out while ordered delivery is gated on it.
    let canary = rx.recv_timeout(Duration::from_secs(10)).expect("receive");
    assert!(canary.is_canary());
    channel
        .start_in_flight_timeout(canary, 0, "", config.msg_timeout)
        .expect("start in-flight");

    // Enabling the policy while the canary is outstanding must not wedge
    // the pipeline: the timeout resolves it and the remaining canaries
    // are confirmed without delivery.
    channel.set_skip_canary(true).expect("skip canary");
    assert_eq!(consumer.skips.load(Ordering::Acquire), 1);

    let unblock_started = Instant::now();
    for i in 11..14 {
        let msg = rx
            .recv_timeout(Duration::from_secs(30))
            .expect("consumption stayed blocked behind the canary");
        assert!(!msg.is_canary());
        assert_eq!(msg.body, i.to_string().as_bytes());
        channel
            .start_in_flight_timeout(msg.clone(), 0, "", config.msg_timeout)
            .expect("start in-flight");
        channel.finish_message_force(0, "", msg.id).expect("finish");
        channel.continue_consume_for_order();
    }
    assert!(unblock_started.elapsed() < Duration::from_secs(20));
    assert!(consumer.timeouts.load(Ordering::Acquire) >= 1);

    let drained = Instant::now();
    while channel.depth() != 0 {
        assert!(drained.elapsed() < Duration::from_secs(10), "depth never drained");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn skip_policy_requires_channel_opt_in() {
    let log: Arc<MemLog> = MemLog::new();
    let channel = Channel::open(
        "ordered-topic",
        "order_channel",
        ChannelConfig::default(),
        log,
        None,
    );
    assert!(matches!(
        channel.set_skip_canary(true),
        Err(Error::Unsupported(_))
    ));
    assert!(!channel.is_skipping_canary());
}

#[test]
fn ordered_timeout_redelivers_the_same_message_first() {
    let log: Arc<MemLog> = MemLog::new();
    let config = ChannelConfig {
        msg_timeout: Duration::from_millis(200),
        scan_interval: Duration::from_millis(20),
        ..Default::default()
    };
    let channel = Channel::open("ordered-topic", "order_channel", config, log.clone(), None);
    channel.set_ordered(true).expect("set ordered");

    put(&log, "first");
    put(&log, "second");

    let rx = channel.message_receiver();
    let msg = rx.recv_timeout(Duration::from_secs(10)).expect("receive");
    assert_eq!(msg.body, b"first");
    channel
        .start_in_flight_timeout(msg, 0, "", config.msg_timeout)
        .expect("start in-flight");

    // No ack: the timeout must hand the same message out again before
    // anything newer.
    let again = rx.recv_timeout(Duration::from_secs(10)).expect("redeliver");
    assert_eq!(again.body, b"first");
    assert_eq!(again.attempts, 1);
    channel
        .start_in_flight_timeout(again.clone(), 0, "", config.msg_timeout)
        .expect("start in-flight");
    channel.finish_message(0, "", again.id).expect("finish");
    channel.continue_consume_for_order();

    let second = rx.recv_timeout(Duration::from_secs(10)).expect("receive");
    assert_eq!(second.body, b"second");
}
