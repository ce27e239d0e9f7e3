#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use parley_domain::{CallRoomId, CallState, MediaKind, RejectReason};
use parley_protocol::{ClientEvent, ServerEvent};
use serde_json::json;

use super::Hub;
use super::test_support::{TestConn, connect, hub, hub_with, rid, uid};
use crate::config::HubSettings;
use crate::store::InMemoryMessageStore;

fn request(to: &str) -> ClientEvent {
	ClientEvent::CallRequest {
		to: uid(to),
		media: MediaKind::Video,
		from: None,
	}
}

fn accept(caller: &str) -> ClientEvent {
	ClientEvent::CallAccept {
		caller: uid(caller),
		from: None,
	}
}

async fn expect_rejected(conn: &mut TestConn, from: &str, reason: RejectReason) {
	match conn.next().await {
		ServerEvent::CallRejected { from: f, reason: r, message } => {
			assert_eq!(f, uid(from));
			assert_eq!(r, reason);
			assert_eq!(message, reason.describe());
		}
		other => panic!("unexpected: {other:?}"),
	}
}

/// Connect alice and bob and put them in an accepted call.
async fn in_call(hub: &Hub) -> (TestConn, TestConn, CallRoomId) {
	let mut alice = connect(hub, "alice").await;
	let mut bob = connect(hub, "bob").await;
	alice.drain();

	alice.send(hub, request("bob")).await;
	assert!(matches!(bob.next().await, ServerEvent::CallRequest { caller_id, .. } if caller_id == uid("alice")));
	bob.send(hub, accept("alice")).await;

	let id = match alice.next().await {
		ServerEvent::CallAccepted { from, call_room_id } => {
			assert_eq!(from, uid("bob"));
			call_room_id
		}
		other => panic!("unexpected: {other:?}"),
	};
	(alice, bob, id)
}

#[tokio::test]
async fn accepted_call_gets_a_fresh_call_room() {
	let hub = hub();
	let (mut alice, mut bob, id) = in_call(&hub).await;

	assert!(id.as_str().starts_with("call_alice_bob_"));
	assert!(!id.is_group());
	assert_eq!(hub.stats().call_sessions, 1);
	assert_eq!(hub.stats().pending_calls, 0);
	alice.assert_quiet();
	bob.assert_quiet();
}

#[tokio::test]
async fn busy_callee_rejects_without_creating_a_room() {
	let hub = hub();
	let (_alice, _bob, _) = in_call(&hub).await;
	let mut carol = connect(&hub, "carol").await;

	carol.send(&hub, request("alice")).await;
	expect_rejected(&mut carol, "alice", RejectReason::Busy).await;
	assert_eq!(hub.stats().call_sessions, 1);
	assert_eq!(hub.stats().pending_calls, 0);
}

#[tokio::test]
async fn offline_callee_rejects_only_to_requester() {
	let hub = hub();
	let mut alice = connect(&hub, "alice").await;
	alice.send(&hub, request("ghost")).await;
	expect_rejected(&mut alice, "ghost", RejectReason::Offline).await;
	alice.assert_quiet();
}

#[tokio::test]
async fn busy_caller_gets_an_error() {
	let hub = hub();
	let (mut alice, _bob, _) = in_call(&hub).await;
	let _carol = connect(&hub, "carol").await;
	alice.drain();

	alice.send(&hub, request("carol")).await;
	assert!(matches!(alice.next().await, ServerEvent::Error { code, .. } if code == "busy"));
}

#[tokio::test]
async fn calling_yourself_is_invalid() {
	let hub = hub();
	let mut alice = connect(&hub, "alice").await;
	alice.send(&hub, request("alice")).await;
	assert!(matches!(alice.next().await, ServerEvent::Error { code, .. } if code == "validation"));
}

#[tokio::test]
async fn spoofed_sender_is_refused() {
	let hub = hub();
	let mut alice = connect(&hub, "alice").await;
	let mut bob = connect(&hub, "bob").await;
	alice.drain();

	alice
		.send(
			&hub,
			ClientEvent::CallRequest {
				to: uid("bob"),
				media: MediaKind::Audio,
				from: Some(uid("mallory")),
			},
		)
		.await;
	assert!(matches!(alice.next().await, ServerEvent::Error { code, .. } if code == "unauthorized"));
	bob.assert_quiet();
}

#[tokio::test]
async fn only_first_accepting_tab_joins() {
	let hub = hub();
	let mut alice = connect(&hub, "alice").await;
	let mut bob1 = connect(&hub, "bob").await;
	let mut bob2 = connect(&hub, "bob").await;
	alice.drain();

	alice.send(&hub, request("bob")).await;
	assert!(matches!(bob1.next().await, ServerEvent::CallRequest { .. }));
	assert!(matches!(bob2.next().await, ServerEvent::CallRequest { .. }));

	bob1.send(&hub, accept("alice")).await;
	assert!(matches!(alice.next().await, ServerEvent::CallAccepted { .. }));
	assert_eq!(bob2.next().await, ServerEvent::CallEnded { from: uid("alice") });

	bob2.send(&hub, accept("alice")).await;
	assert_eq!(bob2.next().await, ServerEvent::CallAcceptIgnored { caller: uid("alice") });
	alice.assert_quiet();
	assert_eq!(hub.stats().call_sessions, 1);
}

#[tokio::test]
async fn reject_defaults_to_declined() {
	let hub = hub();
	let mut alice = connect(&hub, "alice").await;
	let mut bob = connect(&hub, "bob").await;
	alice.drain();

	alice.send(&hub, request("bob")).await;
	bob.drain();
	bob.send(
		&hub,
		ClientEvent::CallReject {
			caller: uid("alice"),
			reason: None,
			from: None,
		},
	)
	.await;
	expect_rejected(&mut alice, "bob", RejectReason::Declined).await;
	assert_eq!(hub.stats().pending_calls, 0);
}

#[tokio::test(start_paused = true)]
async fn unanswered_request_times_out() {
	let settings = HubSettings {
		ring_timeout: Duration::from_secs(30),
		..HubSettings::default()
	};
	let hub = hub_with(settings, Arc::new(InMemoryMessageStore::new()));
	let mut alice = connect(&hub, "alice").await;
	let mut bob = connect(&hub, "bob").await;
	alice.drain();

	alice.send(&hub, request("bob")).await;
	bob.drain();

	tokio::time::sleep(Duration::from_secs(31)).await;
	expect_rejected(&mut alice, "bob", RejectReason::TimedOut).await;
	assert_eq!(bob.next().await, ServerEvent::CallEnded { from: uid("alice") });
	assert_eq!(hub.stats().pending_calls, 0);

	// A late accept after the timeout is ignored.
	bob.send(&hub, accept("alice")).await;
	assert_eq!(bob.next().await, ServerEvent::CallAcceptIgnored { caller: uid("alice") });
}

#[tokio::test(start_paused = true)]
async fn accepted_call_is_not_timed_out_later() {
	let hub = hub();
	let (mut alice, mut bob, _) = in_call(&hub).await;
	tokio::time::sleep(Duration::from_secs(60)).await;
	alice.assert_quiet();
	bob.assert_quiet();
	assert_eq!(hub.stats().call_sessions, 1);
}

#[tokio::test]
async fn signals_relay_and_activate_the_call() {
	let hub = hub();
	let (mut alice, mut bob, id) = in_call(&hub).await;

	let offer = json!({"type": "offer", "sdp": "v=0"});
	alice
		.send(
			&hub,
			ClientEvent::CallSignal {
				to: uid("bob"),
				payload: offer.clone(),
				from: Some(uid("alice")),
			},
		)
		.await;
	assert_eq!(
		bob.next().await,
		ServerEvent::CallSignal {
			from: uid("alice"),
			payload: offer,
		}
	);

	bob.send(&hub, ClientEvent::CalleeReady { to: uid("alice") }).await;
	assert_eq!(alice.next().await, ServerEvent::CalleeReady { from: uid("bob") });

	let calls = super::locks::lock(&hub.inner.calls);
	assert_eq!(calls.session(&id).map(|s| s.state), Some(CallState::Active));
}

#[tokio::test]
async fn signal_to_offline_user_is_dropped_silently() {
	let hub = hub();
	let mut alice = connect(&hub, "alice").await;
	alice
		.send(
			&hub,
			ClientEvent::CallSignal {
				to: uid("ghost"),
				payload: json!({"type": "candidate"}),
				from: None,
			},
		)
		.await;
	alice.assert_quiet();
}

#[tokio::test]
async fn end_notifies_peer_and_frees_both() {
	let hub = hub();
	let (mut alice, mut bob, _) = in_call(&hub).await;

	alice
		.send(
			&hub,
			ClientEvent::CallEnd {
				peer: uid("bob"),
				from: None,
			},
		)
		.await;
	assert_eq!(bob.next().await, ServerEvent::CallEnded { from: uid("alice") });
	bob.assert_quiet();
	assert_eq!(hub.stats().call_sessions, 0);

	// Both are free again.
	bob.send(&hub, request("alice")).await;
	assert!(matches!(alice.next().await, ServerEvent::CallRequest { .. }));
}

#[tokio::test]
async fn caller_cancel_stops_ringing() {
	let hub = hub();
	let mut alice = connect(&hub, "alice").await;
	let mut bob = connect(&hub, "bob").await;
	alice.drain();

	alice.send(&hub, request("bob")).await;
	bob.drain();
	alice
		.send(
			&hub,
			ClientEvent::CallEnd {
				peer: uid("bob"),
				from: None,
			},
		)
		.await;
	assert_eq!(bob.next().await, ServerEvent::CallEnded { from: uid("alice") });
	assert_eq!(hub.stats().pending_calls, 0);
}

#[tokio::test]
async fn disconnect_mid_call_ends_it_for_the_peer() {
	let hub = hub();
	let (alice, mut bob, _) = in_call(&hub).await;

	hub.disconnect(alice.conn_id).await;
	let events = bob.drain();
	assert!(events.contains(&ServerEvent::CallEnded { from: uid("alice") }), "{events:?}");
	assert_eq!(hub.stats().call_sessions, 0);
}

#[tokio::test]
async fn callee_disconnect_answers_caller_with_offline() {
	let hub = hub();
	let mut alice = connect(&hub, "alice").await;
	let bob = connect(&hub, "bob").await;
	alice.drain();

	alice.send(&hub, request("bob")).await;
	hub.disconnect(bob.conn_id).await;

	expect_rejected(&mut alice, "bob", RejectReason::Offline).await;
	assert!(matches!(alice.next().await, ServerEvent::UserOffline { .. }));
	assert_eq!(hub.stats().pending_calls, 0);
}

async fn three_in_room(hub: &Hub) -> (TestConn, TestConn, TestConn) {
	let mut conns = Vec::new();
	for user in ["alice", "bob", "carol"] {
		let conn = connect(hub, user).await;
		conn.send(hub, ClientEvent::JoinRoom { room_id: rid("r") }).await;
		conns.push(conn);
	}
	for conn in conns.iter_mut() {
		conn.drain();
	}
	let mut it = conns.into_iter();
	match (it.next(), it.next(), it.next()) {
		(Some(a), Some(b), Some(c)) => (a, b, c),
		_ => unreachable!(),
	}
}

#[tokio::test]
async fn group_call_request_reaches_room_except_requester() {
	let hub = hub();
	let (mut alice, mut bob, mut carol) = three_in_room(&hub).await;

	alice
		.send(
			&hub,
			ClientEvent::GroupCallRequest {
				room_id: rid("r"),
				media: MediaKind::Audio,
			},
		)
		.await;

	for conn in [&mut bob, &mut carol] {
		assert_eq!(
			conn.next().await,
			ServerEvent::GroupCallRequest {
				room_id: rid("r"),
				caller_id: uid("alice"),
				caller_name: "ALICE".into(),
				media: MediaKind::Audio,
			}
		);
	}
	alice.assert_quiet();

	bob.send(
		&hub,
		ClientEvent::GroupCallAccept {
			room_id: rid("r"),
			to: uid("alice"),
		},
	)
	.await;
	assert_eq!(
		alice.next().await,
		ServerEvent::GroupCallAccepted {
			room_id: rid("r"),
			from: uid("bob"),
			call_room_id: CallRoomId::group(&rid("r")),
		}
	);

	carol
		.send(
			&hub,
			ClientEvent::GroupCallReject {
				room_id: rid("r"),
				to: uid("alice"),
			},
		)
		.await;
	assert_eq!(
		alice.next().await,
		ServerEvent::GroupCallRejected {
			room_id: rid("r"),
			from: uid("carol"),
		}
	);
	assert_eq!(hub.stats().call_sessions, 1);
}

#[tokio::test]
async fn group_call_end_is_broadcast_and_room_dissolves() {
	let hub = hub();
	let (alice, bob, mut carol) = three_in_room(&hub).await;
	alice
		.send(
			&hub,
			ClientEvent::GroupCallRequest {
				room_id: rid("r"),
				media: MediaKind::Video,
			},
		)
		.await;
	bob.send(
		&hub,
		ClientEvent::GroupCallAccept {
			room_id: rid("r"),
			to: uid("alice"),
		},
	)
	.await;
	carol.drain();

	alice.send(&hub, ClientEvent::GroupCallEnd { room_id: rid("r") }).await;
	assert_eq!(
		carol.next().await,
		ServerEvent::GroupCallEnded {
			room_id: rid("r"),
			from: uid("alice"),
		}
	);
	assert_eq!(hub.stats().call_sessions, 1);

	bob.send(&hub, ClientEvent::GroupCallEnd { room_id: rid("r") }).await;
	assert_eq!(hub.stats().call_sessions, 0);
}

#[tokio::test]
async fn group_call_requires_room_membership() {
	let hub = hub();
	let mut alice = connect(&hub, "alice").await;
	alice
		.send(
			&hub,
			ClientEvent::GroupCallRequest {
				room_id: rid("r"),
				media: MediaKind::Video,
			},
		)
		.await;
	assert!(matches!(alice.next().await, ServerEvent::Error { code, .. } if code == "unauthorized"));
}

#[tokio::test]
async fn group_accept_from_outside_the_room_is_refused() {
	let hub = hub();
	let (mut alice, _bob, _carol) = three_in_room(&hub).await;
	let mut dave = connect(&hub, "dave").await;
	alice
		.send(
			&hub,
			ClientEvent::GroupCallRequest {
				room_id: rid("r"),
				media: MediaKind::Audio,
			},
		)
		.await;
	alice.drain();

	dave.send(
		&hub,
		ClientEvent::GroupCallAccept {
			room_id: rid("r"),
			to: uid("alice"),
		},
	)
	.await;
	assert!(matches!(dave.next().await, ServerEvent::Error { code, .. } if code == "unauthorized"));
	alice.assert_quiet();

	let calls = super::locks::lock(&hub.inner.calls);
	assert!(!calls.is_busy(&uid("dave")));
	let session = calls.session(&CallRoomId::group(&rid("r"))).expect("group session open");
	assert!(!session.has_user(&uid("dave")));
	assert_eq!(session.participants().count(), 1);
}

#[tokio::test]
async fn group_signal_goes_to_one_participant() {
	let hub = hub();
	let (alice, mut bob, mut carol) = three_in_room(&hub).await;
	alice
		.send(
			&hub,
			ClientEvent::GroupCallSignal {
				room_id: rid("r"),
				to: uid("bob"),
				payload: json!({"type": "answer"}),
			},
		)
		.await;
	assert!(matches!(bob.next().await, ServerEvent::GroupCallSignal { from, .. } if from == uid("alice")));
	carol.assert_quiet();
}

#[tokio::test]
async fn pending_request_does_not_make_anyone_busy() {
	let hub = hub();
	let mut alice = connect(&hub, "alice").await;
	let mut bob = connect(&hub, "bob").await;
	let mut carol = connect(&hub, "carol").await;
	alice.drain();
	bob.drain();

	alice.send(&hub, request("bob")).await;
	carol.send(&hub, request("bob")).await;
	bob.drain();

	// Accepting alice cancels carol's ring.
	bob.send(&hub, accept("alice")).await;
	assert!(matches!(alice.next().await, ServerEvent::CallAccepted { .. }));
	expect_rejected(&mut carol, "bob", RejectReason::Busy).await;

	let calls = super::locks::lock(&hub.inner.calls);
	assert!(calls.pending(&uid("carol"), &uid("bob")).is_none());
}
