use std::sync::Arc;
use std::time::Duration;

use spillway::{BackendQueue, Channel, ChannelConfig, Error, MemLog, Message, MessageId};

#[test]
fn confirmation_advances_only_through_the_contiguous_prefix() {
    let log: Arc<MemLog> = MemLog::new();
    let config = ChannelConfig {
        msg_timeout: Duration::from_secs(30),
        ..Default::default()
    };
    let channel = Channel::open("orders", "ch", config, log.clone(), None);
    let rx = channel.message_receiver();

    for i in 0..5 {
        log.put_message(Message::new(
            MessageId::default(),
            format!("{i}").into_bytes(),
        ))
        .expect("put");
    }

    let mut messages = Vec::new();
    for _ in 0..5 {
        let msg = rx.recv_timeout(Duration::from_secs(10)).expect("receive");
        channel
            .start_in_flight_timeout(msg.clone(), 0, "", config.msg_timeout)
            .expect("start in-flight");
        messages.push(msg);
    }
    let base = channel.confirmed();
    assert_eq!(channel.depth(), 5);

    // Ack the second message: a gap remains, confirmation stalls.
    channel
        .finish_message(0, "", messages[1].id)
        .expect("finish 1");
    assert_eq!(channel.confirmed(), base);
    assert_eq!(channel.depth(), 5);

    // Ack the fourth: still stalled.
    channel
        .finish_message(0, "", messages[3].id)
        .expect("finish 3");
    assert_eq!(channel.confirmed(), base);

    // Ack the first: the prefix now covers messages 0 and 1.
    channel
        .finish_message(0, "", messages[0].id)
        .expect("finish 0");
    let confirmed = channel.confirmed();
    assert_eq!(confirmed.offset, messages[1].end_offset());
    assert_eq!(confirmed.count, 2);
    assert_eq!(channel.depth(), 3);

    // Ack the third: merges through the stored fourth, prefix reaches 4.
    channel
        .finish_message(0, "", messages[2].id)
        .expect("finish 2");
    let confirmed = channel.confirmed();
    assert_eq!(confirmed.offset, messages[3].end_offset());
    assert_eq!(confirmed.count, 4);
    assert_eq!(channel.depth(), 1);

    // Ack the last: fully drained.
    channel
        .finish_message(0, "", messages[4].id)
        .expect("finish 4");
    assert_eq!(channel.confirmed(), channel.channel_end());
    assert_eq!(channel.depth(), 0);
}

#[test]
fn unknown_and_duplicate_acks_are_observable() {
    let log: Arc<MemLog> = MemLog::new();
    let config = ChannelConfig {
        msg_timeout: Duration::from_secs(30),
        ..Default::default()
    };
    let channel = Channel::open("orders", "ch", config, log.clone(), None);
    let rx = channel.message_receiver();

    log.put_message(Message::new(MessageId::default(), b"solo".to_vec()))
        .expect("put");
    let msg = rx.recv_timeout(Duration::from_secs(10)).expect("receive");

    // Not in flight yet: plain finish fails, force succeeds silently but
    // resolves nothing.
    match channel.finish_message(0, "", msg.id) {
        Err(Error::UnknownMessage(id)) => assert_eq!(id, msg.id),
        other => panic!("expected UnknownMessage, got {other:?}"),
    }
    assert_eq!(channel.depth(), 1);

    channel
        .start_in_flight_timeout(msg.clone(), 0, "", config.msg_timeout)
        .expect("start in-flight");
    channel.finish_message(0, "", msg.id).expect("finish");
    assert_eq!(channel.depth(), 0);

    // Double finish: the record is gone.
    assert!(matches!(
        channel.finish_message(0, "", msg.id),
        Err(Error::UnknownMessage(_))
    ));
    channel
        .finish_message_force(0, "", msg.id)
        .expect("forced finish is silent");

    // A duplicate ack of the same range changes nothing.
    let (confirmed, advanced) = channel.confirm_backend_queue(&msg).expect("confirm");
    assert!(!advanced);
    assert_eq!(confirmed, channel.channel_end());
}
