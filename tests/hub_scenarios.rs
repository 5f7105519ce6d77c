//! End-to-end hub behaviour against the scripted loopback transport.
//!
//! Each test wires a hub with real handlers, scripts peer activity, and
//! checks what reached the handlers, what was written back, and what the
//! event loop was told to watch.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use homescreen_hub::handlers::{CommandChannel, CommandOutcome, SessionChannel};
use homescreen_hub::hub::{HANDSHAKE_REPLY, HANDSHAKE_REQUEST};
use homescreen_hub::transport::loopback::{LoopbackTransport, RecordingLoop, WatchCall};
use homescreen_hub::{
    handler_fn, ChannelTag, ConnectionInfo, ConnectionState, Hub, HubBuilder, Interest, SendError,
};

type TestHub = Hub<LoopbackTransport, RecordingLoop>;
type Log = Rc<RefCell<Vec<(ChannelTag, Vec<u8>)>>>;

/// Hub with a recording command executor and recording status, dialog and
/// application handlers.
fn recording_hub(reject_duplicates: bool) -> (TestHub, Log) {
    let log: Log = Rc::default();

    let commands = Rc::clone(&log);
    let mut builder = HubBuilder::new().channel(
        ChannelTag::COMMAND,
        "command",
        Box::new(CommandChannel::new(move |info: &ConnectionInfo, payload: &[u8]| {
            commands.borrow_mut().push((info.channel, payload.to_vec()));
            CommandOutcome::Done
        })),
    );
    for (tag, name) in [
        (ChannelTag::STATUS, "status"),
        (ChannelTag::DIALOG, "dialog"),
        (ChannelTag::APPLICATION, "application"),
    ] {
        let sink = Rc::clone(&log);
        builder = builder.channel(
            tag,
            name,
            handler_fn(move |ctx, payload| {
                sink.borrow_mut().push((ctx.channel(), payload.to_vec()));
            }),
        );
    }

    let hub = builder
        .reject_duplicates(reject_duplicates)
        .build(LoopbackTransport::new(), RecordingLoop::default())
        .unwrap();
    (hub, log)
}

fn step(hub: &mut TestHub) {
    hub.service_once(Duration::ZERO).unwrap();
}

/// The event loop must always see exactly the registry's watch set.
fn assert_mirrored(hub: &TestHub) {
    for entry in hub.readiness().entries() {
        assert_eq!(hub.event_loop().interest(entry.fd), Some(entry.interest));
    }
    assert_eq!(hub.event_loop().watched(), hub.readiness().len());
}

#[test]
fn test_command_channel_greets_before_accepting_commands() {
    let (mut hub, log) = recording_hub(false);
    hub.transport_mut().connect(10, "command");
    step(&mut hub);

    assert_eq!(hub.transport().writes_to(10), vec![HANDSHAKE_REQUEST.to_vec()]);
    assert_eq!(
        hub.connection_state(ChannelTag::COMMAND),
        Some(ConnectionState::AwaitingHandshake)
    );

    hub.transport_mut().receive(10, HANDSHAKE_REPLY);
    hub.transport_mut().receive(10, b"{\"command\":\"show\"}");
    step(&mut hub);
    step(&mut hub);

    assert_eq!(
        log.borrow().as_slice(),
        &[(ChannelTag::COMMAND, b"{\"command\":\"show\"}".to_vec())]
    );
    assert_eq!(
        hub.transport().writes_to(10),
        vec![
            HANDSHAKE_REQUEST.to_vec(),
            b"ANS {\"command\":\"show\"} OK".to_vec(),
        ]
    );
    assert_mirrored(&hub);
}

#[test]
fn test_command_before_handshake_reply_is_never_executed() {
    let (mut hub, log) = recording_hub(false);
    hub.transport_mut().connect(11, "command");
    hub.transport_mut().receive(11, b"{\"command\":\"reboot\"}");
    step(&mut hub);

    assert!(log.borrow().is_empty());
    assert_eq!(
        hub.connection_state(ChannelTag::COMMAND),
        Some(ConnectionState::Established)
    );
    // Only the greeting went out; no acknowledgement for the swallowed command.
    step(&mut hub);
    assert_eq!(hub.transport().writes_to(11), vec![HANDSHAKE_REQUEST.to_vec()]);
}

#[test]
fn test_send_on_idle_status_channel_writes_once_and_clears_writable() {
    let (mut hub, _log) = recording_hub(false);
    hub.transport_mut().connect(20, "status");
    step(&mut hub);
    assert_eq!(hub.event_loop().interest(20), Some(Interest::READABLE));

    hub.send("status", b"RECEIVE OK").unwrap();
    assert!(hub.readiness().interest(20).contains(Interest::WRITABLE));

    let report = hub.service_once(Duration::ZERO).unwrap();
    assert_eq!(report.written, 1);
    assert_eq!(hub.transport().writes_to(20), vec![b"RECEIVE OK".to_vec()]);
    assert_eq!(hub.event_loop().interest(20), Some(Interest::READABLE));

    // Nothing left: later steps write nothing.
    let report = hub.service_once(Duration::ZERO).unwrap();
    assert_eq!(report.written, 0);
    assert_mirrored(&hub);
}

#[test]
fn test_close_with_queued_messages_releases_them_and_frees_slot() {
    let (mut hub, _log) = recording_hub(false);
    hub.transport_mut().connect(30, "status");
    step(&mut hub);
    let old = hub.connection(ChannelTag::STATUS).unwrap();

    hub.transport_mut().stall(30, true);
    hub.send("status", b"one").unwrap();
    hub.send("status", b"two").unwrap();
    step(&mut hub);
    assert_eq!(hub.outbound_len(ChannelTag::STATUS), 2);

    hub.transport_mut().disconnect(30);
    step(&mut hub);

    let stats = hub.stats();
    assert_eq!(stats.messages_live, 0);
    assert_eq!(stats.messages_free, 2);
    assert_eq!(stats.dropped_outbound, 2);
    assert_eq!(stats.live_connections, 0);
    assert!(hub.readiness().entry(30).is_none());

    hub.transport_mut().connect(31, "status");
    step(&mut hub);
    let new = hub.connection(ChannelTag::STATUS).unwrap();
    assert_eq!(new.index(), old.index());
    assert_ne!(new.generation(), old.generation());
    assert_mirrored(&hub);
}

#[test]
fn test_interleaved_arrivals_are_routed_in_arrival_order() {
    let (mut hub, log) = recording_hub(false);
    hub.transport_mut().connect(40, "status");
    hub.transport_mut().connect(41, "dialog");
    step(&mut hub);

    hub.transport_mut().receive(40, b"A1");
    hub.transport_mut().receive(41, b"B1");
    hub.transport_mut().receive(40, b"A2");
    let report = hub.service_once(Duration::ZERO).unwrap();

    assert_eq!(report.routed, 3);
    assert_eq!(
        log.borrow().as_slice(),
        &[
            (ChannelTag::STATUS, b"A1".to_vec()),
            (ChannelTag::DIALOG, b"B1".to_vec()),
            (ChannelTag::STATUS, b"A2".to_vec()),
        ]
    );
}

#[test]
fn test_outbound_messages_are_written_in_enqueue_order() {
    let (mut hub, _log) = recording_hub(false);
    hub.transport_mut().connect(50, "dialog");
    step(&mut hub);

    let sent: Vec<Vec<u8>> = (0..8).map(|i| format!("MSG {i}").into_bytes()).collect();
    for payload in &sent {
        hub.send_to(ChannelTag::DIALOG, payload).unwrap();
    }
    for _ in 0..sent.len() {
        let report = hub.service_once(Duration::ZERO).unwrap();
        assert_eq!(report.written, 1, "one write per connection per step");
    }

    assert_eq!(hub.transport().writes_to(50), sent);
    assert!(!hub.readiness().interest(50).contains(Interest::WRITABLE));
}

#[test]
fn test_send_without_connection_is_unavailable() {
    let (mut hub, _log) = recording_hub(false);
    for _ in 0..3 {
        assert_eq!(
            hub.send("application", b"x"),
            Err(SendError::ChannelUnavailable(ChannelTag::APPLICATION))
        );
    }
    let stats = hub.stats();
    assert_eq!(stats.messages_live, 0);
    assert_eq!(stats.dropped_outbound, 3);
    assert_eq!(
        hub.send_to(ChannelTag(99), b"x"),
        Err(SendError::UnknownChannel("#99".to_string()))
    );
}

#[test]
fn test_second_connection_on_bound_channel_is_orphaned() {
    let (mut hub, log) = recording_hub(false);
    hub.transport_mut().connect(60, "status");
    hub.transport_mut().connect(61, "status");
    hub.transport_mut().receive(61, b"ignored");
    hub.transport_mut().receive(60, b"routed");
    step(&mut hub);

    assert_eq!(log.borrow().as_slice(), &[(ChannelTag::STATUS, b"routed".to_vec())]);
    let stats = hub.stats();
    assert_eq!(stats.live_connections, 1);
    assert_eq!(stats.orphaned_connections, 1);
    assert_eq!(stats.dropped_inbound, 1);
    assert!(hub.transport().rejected().is_empty());

    hub.transport_mut().disconnect(61);
    step(&mut hub);
    assert_eq!(hub.stats().orphaned_connections, 0);
    assert_eq!(hub.connection(ChannelTag::STATUS).map(|id| id.index()), Some(0));
    assert_mirrored(&hub);
}

#[test]
fn test_second_connection_rejected_when_configured() {
    let (mut hub, _log) = recording_hub(true);
    hub.transport_mut().connect(62, "status");
    hub.transport_mut().connect(63, "status");
    step(&mut hub);

    assert_eq!(hub.transport().rejected(), &[63]);
    assert_eq!(hub.stats().orphaned_connections, 0);
    assert!(hub.readiness().entry(63).is_none());
    assert_mirrored(&hub);
}

#[test]
fn test_message_from_connection_closed_in_same_round_is_dropped() {
    let (mut hub, log) = recording_hub(false);
    hub.transport_mut().connect(70, "dialog");
    hub.transport_mut().receive(70, b"late");
    hub.transport_mut().disconnect(70);
    let report = hub.service_once(Duration::ZERO).unwrap();

    assert_eq!(report.routed, 0);
    assert!(log.borrow().is_empty());
    let stats = hub.stats();
    assert_eq!(stats.dropped_inbound, 1);
    assert_eq!(stats.messages_live, 0);
}

#[test]
fn test_session_channel_hello_and_close() {
    let closed = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&closed);

    struct CloseRecorder(Rc<RefCell<Vec<Option<String>>>>);
    impl homescreen_hub::ChannelHandler for CloseRecorder {
        fn on_message(&mut self, _ctx: &mut homescreen_hub::HandlerContext<'_>, _payload: &[u8]) {}
        fn on_close(&mut self, _channel: ChannelTag, session_id: Option<&str>) {
            self.0.borrow_mut().push(session_id.map(str::to_string));
        }
    }

    let mut hub = HubBuilder::new()
        .channel(
            ChannelTag::APPLICATION,
            "application",
            SessionChannel::new("application")
                .forward_to(Box::new(CloseRecorder(sink)))
                .boxed(),
        )
        .build(LoopbackTransport::new(), RecordingLoop::default())
        .unwrap();

    hub.transport_mut().connect(80, "application");
    hub.transport_mut().receive(80, b"HELLO org.example.radio");
    step(&mut hub);
    assert_eq!(hub.session_id(ChannelTag::APPLICATION), Some("org.example.radio"));

    hub.transport_mut().receive(80, b"CLOSE");
    step(&mut hub);
    // The HELLO answer goes out, the CLOSE answer is still queued.
    assert!(hub.connection(ChannelTag::APPLICATION).is_some());
    step(&mut hub);

    assert_eq!(
        hub.transport().writes_to(80),
        vec![b"ANS HELLO OK".to_vec(), b"ANS CLOSE OK".to_vec()]
    );
    assert!(hub.connection(ChannelTag::APPLICATION).is_none());
    assert_eq!(hub.transport().closed_by_hub(), &[80]);
    assert_eq!(closed.borrow().as_slice(), &[Some("org.example.radio".to_string())]);
    assert_mirrored(&hub);
}

#[test]
fn test_handler_can_send_to_another_channel() {
    let mut hub = HubBuilder::new()
        .channel(
            ChannelTag::STATUS,
            "status",
            handler_fn(|ctx, payload| {
                ctx.send(ChannelTag::DIALOG, [b"FWD ".as_slice(), payload].concat());
                ctx.send(ChannelTag::APPLICATION, "nobody home");
            }),
        )
        .channel(ChannelTag::DIALOG, "dialog", handler_fn(|_, _| {}))
        .channel(ChannelTag::APPLICATION, "application", handler_fn(|_, _| {}))
        .build(LoopbackTransport::new(), RecordingLoop::default())
        .unwrap();

    hub.transport_mut().connect(90, "status");
    hub.transport_mut().connect(91, "dialog");
    hub.transport_mut().receive(90, b"LOW BATTERY");
    step(&mut hub);
    step(&mut hub);

    assert_eq!(hub.transport().writes_to(91), vec![b"FWD LOW BATTERY".to_vec()]);
    assert!(hub.transport().writes_to(90).is_empty());
    assert_eq!(hub.stats().dropped_outbound, 1);
}

#[test]
fn test_pool_recycles_slots_under_steady_traffic() {
    let (mut hub, log) = recording_hub(false);
    hub.transport_mut().connect(100, "status");
    step(&mut hub);

    for round in 0..50 {
        hub.transport_mut().receive(100, format!("tick {round}").as_bytes());
        hub.send("status", b"ack").unwrap();
        step(&mut hub);
    }

    assert_eq!(log.borrow().len(), 50);
    let stats = hub.stats();
    assert_eq!(stats.messages_live, 0);
    assert!(stats.messages_free <= 2, "pool grew to {} slots", stats.messages_free);
}

#[test]
fn test_shutdown_closes_connections_and_orphans() {
    let (mut hub, _log) = recording_hub(false);
    hub.transport_mut().connect(110, "status");
    hub.transport_mut().connect(111, "status");
    hub.transport_mut().connect(112, "command");
    step(&mut hub);

    hub.shutdown();

    let stats = hub.stats();
    assert_eq!(stats.live_connections, 0);
    assert_eq!(stats.orphaned_connections, 0);
    assert_eq!(stats.messages_live, 0);
    let mut closed = hub.transport().closed_by_hub().to_vec();
    closed.sort_unstable();
    assert_eq!(closed, vec![110, 111, 112]);
    assert!(hub.readiness().is_empty());
    assert_eq!(hub.event_loop().watched(), 0);
}

#[test]
fn test_transport_backlog_keeps_writable_until_drained() {
    let (mut hub, _log) = recording_hub(false);
    hub.transport_mut().connect(120, "status");
    step(&mut hub);
    hub.transport_mut().backlog(120, true);

    hub.send("status", b"first").unwrap();
    step(&mut hub);
    // Handed to the transport but not on the wire yet.
    assert_eq!(hub.outbound_len(ChannelTag::STATUS), 0);
    assert_eq!(hub.transport().held(120), 1);
    assert_eq!(
        hub.event_loop().interest(120),
        Some(Interest::READABLE | Interest::WRITABLE)
    );
    assert_mirrored(&hub);

    step(&mut hub);
    hub.send("status", b"second").unwrap();
    step(&mut hub);
    assert_eq!(hub.outbound_len(ChannelTag::STATUS), 1);
    assert!(hub.transport().writes_to(120).is_empty());

    hub.transport_mut().backlog(120, false);
    step(&mut hub);
    assert_eq!(
        hub.transport().writes_to(120),
        vec![b"first".to_vec(), b"second".to_vec()]
    );
    assert_eq!(hub.outbound_len(ChannelTag::STATUS), 0);
    assert_eq!(hub.event_loop().interest(120), Some(Interest::READABLE));
    assert_mirrored(&hub);
}

#[test]
fn test_close_request_under_backlog_still_delivers_reply() {
    let mut hub = HubBuilder::new()
        .channel(ChannelTag::STATUS, "status", SessionChannel::new("status").boxed())
        .build(LoopbackTransport::new(), RecordingLoop::default())
        .unwrap();
    hub.transport_mut().connect(130, "status");
    step(&mut hub);
    hub.transport_mut().backlog(130, true);

    hub.transport_mut().receive(130, b"CLOSE");
    step(&mut hub);
    step(&mut hub);

    // The hub is done with the connection; the transport still owes the reply.
    assert!(hub.connection(ChannelTag::STATUS).is_none());
    assert_eq!(hub.transport().closed_by_hub(), &[130]);
    assert_eq!(hub.transport().held(130), 1);
    assert_eq!(hub.readiness().interest(130), Interest::WRITABLE);
    assert_mirrored(&hub);

    hub.transport_mut().backlog(130, false);
    step(&mut hub);
    assert_eq!(hub.transport().writes_to(130), vec![b"ANS CLOSE OK".to_vec()]);
    assert!(hub.readiness().entry(130).is_none());
    assert_eq!(hub.event_loop().interest(130), None);
    assert_mirrored(&hub);
}

#[test]
fn test_transport_watch_changes_are_mirrored() {
    let (mut hub, _log) = recording_hub(false);
    hub.transport_mut().connect(140, "status");
    step(&mut hub);

    hub.transport_mut().change_watch(140, Interest::WRITABLE, Interest::NONE);
    hub.transport_mut().change_watch(999, Interest::WRITABLE, Interest::NONE);
    step(&mut hub);
    // Writable with an empty queue: the transport's request is kept.
    assert_eq!(
        hub.readiness().interest(140),
        Interest::READABLE | Interest::WRITABLE
    );
    assert!(hub.readiness().entry(999).is_none());
    assert_mirrored(&hub);

    hub.transport_mut().change_watch(140, Interest::NONE, Interest::WRITABLE);
    hub.transport_mut().change_watch(999, Interest::NONE, Interest::READABLE);
    step(&mut hub);
    assert_eq!(hub.readiness().interest(140), Interest::READABLE);
    assert_mirrored(&hub);

    let calls = &hub.event_loop().calls;
    assert!(calls.contains(&WatchCall::Modify(140, Interest::READABLE | Interest::WRITABLE)));
    assert!(calls.contains(&WatchCall::Modify(140, Interest::READABLE)));
    assert!(!calls.iter().any(|call| matches!(
        call,
        WatchCall::Watch(999, _) | WatchCall::Modify(999, _) | WatchCall::Unwatch(999)
    )));
    assert!(hub.transport().writes_to(140).is_empty());
}
