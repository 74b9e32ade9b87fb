use std::time::Duration;

use pretty_assertions::assert_eq;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::*;
use crate::port::MessageChannel;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "arguments", rename_all = "camelCase")]
enum Msg {
	Ping(u32),
	Add { a: i64, b: i64 },
	Fail,
}

type TestChannel = Channel<Msg, Msg>;

async fn next_event(events: &mut ChannelEvents<Msg>) -> Option<ChannelEvent<Msg>> {
	tokio::time::timeout(Duration::from_millis(500), events.recv()).await.ok().flatten()
}

async fn next_message(events: &mut ChannelEvents<Msg>) -> (Msg, Option<Responder>) {
	loop {
		match next_event(events).await {
			Some(ChannelEvent::Event { event, reply }) => return (event, reply),
			Some(ChannelEvent::Connected) => continue,
			other => panic!("expected event, got {other:?}"),
		}
	}
}

fn linked() -> ((TestChannel, ChannelEvents<Msg>), (TestChannel, ChannelEvents<Msg>)) {
	let (port1, port2) = MessageChannel::new();
	let a = TestChannel::new();
	let b = TestChannel::new();
	a.0.connect(port1).unwrap();
	b.0.connect(port2).unwrap();
	(a, b)
}

#[tokio::test(flavor = "current_thread")]
async fn call_resolves_with_peer_reply() {
	let ((a, _a_events), (_b, mut b_events)) = linked();

	let server = tokio::spawn(async move {
		let (event, reply) = next_message(&mut b_events).await;
		let Msg::Add { a, b } = event else {
			panic!("unexpected {event:?}");
		};
		reply.unwrap().ok(&(a + b)).unwrap();
	});

	let sum: i64 = a.call(&Msg::Add { a: 2, b: 3 }).await.unwrap();
	assert_eq!(sum, 5);
	server.await.unwrap();
}

#[tokio::test(flavor = "current_thread")]
async fn remote_failure_reaches_only_the_caller() {
	let ((a, _a_events), (_b, mut b_events)) = linked();

	let server = tokio::spawn(async move {
		let (_, reply) = next_message(&mut b_events).await;
		reply.unwrap().err("not allowed");
		let (event, reply) = next_message(&mut b_events).await;
		assert_eq!(event, Msg::Ping(1));
		assert!(reply.is_none());
	});

	let res = a.call::<()>(&Msg::Fail).await;
	assert!(matches!(res, Err(Error::Remote(ref msg)) if msg == "not allowed"));
	a.notify(&Msg::Ping(1)).unwrap();
	server.await.unwrap();
}

#[tokio::test(flavor = "current_thread")]
async fn messages_sent_before_connect_are_queued_in_order() {
	let (a, _a_events) = TestChannel::new();
	let (b, mut b_events) = TestChannel::new();
	a.notify(&Msg::Ping(1)).unwrap();
	a.notify(&Msg::Ping(2)).unwrap();
	assert!(!a.is_connected());

	let (port1, port2) = MessageChannel::new();
	b.connect(port2).unwrap();
	a.connect(port1).unwrap();

	assert!(matches!(next_event(&mut b_events).await, Some(ChannelEvent::Connected)));
	assert_eq!(next_message(&mut b_events).await.0, Msg::Ping(1));
	assert_eq!(next_message(&mut b_events).await.0, Msg::Ping(2));
}

#[tokio::test(flavor = "current_thread")]
async fn connect_twice_is_rejected() {
	let (a, _events) = TestChannel::new();
	let (port1, _port2) = MessageChannel::new();
	let (port3, _port4) = MessageChannel::new();
	a.connect(port1).unwrap();
	assert!(matches!(a.connect(port3), Err(Error::AlreadyConnected)));
}

#[tokio::test(flavor = "current_thread")]
async fn destroy_fails_pending_calls_and_closes_peer_once() {
	let ((a, _a_events), (_b, mut b_events)) = linked();

	let pending = tokio::spawn({
		let a = a.clone();
		async move { a.call::<i64>(&Msg::Ping(9)).await }
	});
	let (event, _reply) = next_message(&mut b_events).await;
	assert_eq!(event, Msg::Ping(9));

	a.destroy();
	a.destroy();
	assert!(a.is_destroyed());
	assert!(matches!(pending.await.unwrap(), Err(Error::Closed)));
	assert!(matches!(a.notify(&Msg::Ping(1)), Err(Error::Closed)));

	// Explicit close followed by the port being dropped yields a single event.
	assert!(matches!(next_event(&mut b_events).await, Some(ChannelEvent::Closed)));
	assert!(next_event(&mut b_events).await.is_none());
}

#[tokio::test(flavor = "current_thread")]
async fn dropped_peer_port_counts_as_close() {
	let (port1, port2) = MessageChannel::new();
	let (a, mut events) = TestChannel::new();
	a.connect(port1).unwrap();
	drop(port2);
	assert!(matches!(next_event(&mut events).await, Some(ChannelEvent::Closed)));
}

#[tokio::test(flavor = "current_thread")]
async fn malformed_messages_do_not_break_the_loop() {
	let (port1, port2) = MessageChannel::new();
	let (a, mut events) = TestChannel::new();
	a.connect(port1).unwrap();

	port2.post(json!({"protocol": "frame-rpc", "version": "1.0.0", "method": "eval", "arguments": []}));
	port2.post(json!({"protocol": "frame-rpc", "version": "1.0.0", "method": "ping", "arguments": "x"}));
	port2.post(json!({"protocol": "frame-rpc", "version": "9"}));
	port2.post(RpcFrame::Call { sequence: None, body: json!({"method": "ping", "arguments": 4}) }.encode());

	assert_eq!(next_message(&mut events).await.0, Msg::Ping(4));
}

#[tokio::test(flavor = "current_thread")]
async fn foreign_messages_are_surfaced() {
	let (port1, port2) = MessageChannel::new();
	let (a, mut events) = TestChannel::new();
	a.connect(port1).unwrap();

	let (extra, _keep) = MessageChannel::new();
	port2.post_with_ports(json!({"type": "offer"}), vec![extra]);
	match next_event(&mut events).await {
		Some(ChannelEvent::Foreign(msg)) => {
			assert_eq!(msg.data, json!({"type": "offer"}));
			assert_eq!(msg.ports.len(), 1);
		}
		other => panic!("expected foreign message, got {other:?}"),
	}
}

#[tokio::test(flavor = "current_thread")]
async fn subscribers_see_every_event() {
	let ((a, _a_events), (b, mut b_events)) = linked();
	let mut first = b.subscribe();
	let mut second = b.subscribe();

	a.notify(&Msg::Ping(7)).unwrap();
	assert_eq!(next_message(&mut b_events).await.0, Msg::Ping(7));
	assert_eq!(first.recv().await.unwrap(), Msg::Ping(7));
	assert_eq!(second.recv().await.unwrap(), Msg::Ping(7));
}

#[tokio::test(flavor = "current_thread")]
async fn dropping_last_handle_closes_the_link() {
	let ((a, _a_events), (_b, mut b_events)) = linked();
	drop(a);
	loop {
		match next_event(&mut b_events).await {
			Some(ChannelEvent::Connected) => continue,
			Some(ChannelEvent::Closed) => break,
			other => panic!("expected close, got {other:?}"),
		}
	}
}
